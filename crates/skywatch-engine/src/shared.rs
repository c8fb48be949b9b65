//! Shared domain types: alerts, dispatch records, classification results, and
//! the engine event hook.
//!
//! Alerts and dispatch records serialize as JSON into the audit store and out
//! through the gateway, so field names follow the wire conventions the
//! dashboard already consumes (`call_status` lowercase, severity/category
//! uppercase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity, ordered so that `Severity::Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Coarse classification bucket. `Alert` is the generic fallback category for
/// transcripts that match no known keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Emergency,
    Warning,
    Report,
    Alert,
}

/// Alert lifecycle status. `Resolved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Dispatched,
    Resolved,
}

impl AlertStatus {
    /// Case-insensitive parse for query parameters (`?status=ACTIVE`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "DISPATCHED" => Some(Self::Dispatched),
            "RESOLVED" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Call lifecycle status on a dispatch record. `Completed` and `Failed` are
/// terminal; a record is never mutated after reaching either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Calling,
    Completed,
    Failed,
}

impl CallStatus {
    /// Pending and calling records block further dispatch for the same alert.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Calling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Where a transcript came from. Operator-entered input is manually confirmed
/// and classifies with confidence 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    Automated,
    Operator,
}

impl Default for InputSource {
    fn default() -> Self {
        Self::Automated
    }
}

/// Structured fields the upstream NLP pipeline extracted alongside the raw
/// transcript. All optional; the keyword ladder works from the transcript
/// alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredHints {
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub runway: Option<String>,
    #[serde(default)]
    pub souls: Option<u32>,
    /// Upstream urgency flag (e.g. the transcriber heard a distress cadence).
    #[serde(default)]
    pub urgent: bool,
}

/// One incoming transcript plus hints, as produced by the transcription
/// pipeline or entered by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptInput {
    pub transcript: String,
    #[serde(default)]
    pub hints: Option<StructuredHints>,
    #[serde(default)]
    pub source: InputSource,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TranscriptInput {
    pub fn hints(&self) -> StructuredHints {
        self.hints.clone().unwrap_or_default()
    }
}

/// Which path produced the classification. The keyword ladder is ground
/// truth; an external override is recorded as such so confidence drift is
/// auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationOrigin {
    KeywordLadder,
    ExternalOverride,
}

/// Result of classifying one transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub emergency_type: String,
    pub severity: Severity,
    pub category: Category,
    /// In [0, 1]. 1.0 for operator-entered input; otherwise a monotonic
    /// function of keyword-match strength (see `classifier`).
    pub confidence: f64,
    pub description: String,
    pub matched_keywords: Vec<String>,
    pub origin: ClassificationOrigin,
}

/// A classified, persisted record of a possible emergency derived from one
/// transcript. Owned by the dispatch state machine once created; external
/// callers request transitions, never write fields directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub id: String,
    #[serde(default)]
    pub source_message_id: Option<String>,
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub callsign: Option<String>,
    pub emergency_type: String,
    pub severity: Severity,
    pub category: Category,
    pub description: String,
    pub original_message: String,
    pub confidence: f64,
    pub status: AlertStatus,
    pub acknowledged: bool,
    pub escalated: bool,
    /// Souls on board, from hints or extracted from the transcript. Feeds the
    /// `{souls}` placeholder in call scripts.
    #[serde(default)]
    pub souls: Option<u32>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to place a real phone call for an alert. An alert accumulates
/// multiple records when earlier attempts failed, but at most one record is
/// ever pending/calling at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: String,
    pub alert_id: String,
    pub recipient_role: String,
    pub recipient_number: String,
    pub call_status: CallStatus,
    #[serde(default)]
    pub call_provider_id: Option<String>,
    /// Call-placement attempts consumed (bounded by the configured retry
    /// limit).
    pub attempts: u32,
    /// True when the call went through the simulation provider rather than a
    /// live one. Simulated calls are never indistinguishable from real ones.
    pub simulated: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub script: String,
    pub initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
}

/// Engine state-change notifications. The gateway fans these out over SSE so
/// push vs. poll stays a presentation choice.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    AlertCreated(EmergencyAlert),
    AlertUpdated(EmergencyAlert),
    DispatchUpdated(DispatchRecord),
}

fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Alert ids sort lexicographically by creation time: zero-padded millisecond
/// prefix plus a random suffix.
pub fn new_alert_id(now: DateTime<Utc>) -> String {
    format!("emrg_{:013}_{}", now.timestamp_millis(), short_suffix())
}

/// Dispatch ids, same ordering scheme as alert ids.
pub fn new_dispatch_id(now: DateTime<Utc>) -> String {
    format!("dsp_{:013}_{}", now.timestamp_millis(), short_suffix())
}
