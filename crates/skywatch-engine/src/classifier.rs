//! Transcript classifier: deterministic keyword-priority ladder with an
//! optional external-LLM override.
//!
//! The ladder is ground truth. Buckets are evaluated highest-priority first
//! (EMERGENCY > WARNING > REPORT); within a bucket, rules are tried in the
//! order declared below and the first rule with any keyword hit wins. The
//! same transcript therefore always classifies identically.
//!
//! The external classifier may override the ladder only when it answers
//! inside the configured deadline with a self-reported confidence at or above
//! the override floor. On error or timeout the ladder result stands —
//! classification never blocks indefinitely and never returns an error.

use crate::error::{EngineError, EngineResult};
use crate::shared::{
    Category, ClassificationOrigin, ClassificationResult, InputSource, Severity, StructuredHints,
    TranscriptInput,
};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

struct KeywordRule {
    emergency_type: &'static str,
    severity: Severity,
    keywords: &'static [&'static str],
}

/// EMERGENCY bucket. Specific failure modes come before the bare distress
/// calls so "MAYDAY ... engine failure" classifies as engine_failure, not
/// general_emergency.
const EMERGENCY_RULES: &[KeywordRule] = &[
    KeywordRule {
        emergency_type: "engine_failure",
        severity: Severity::Critical,
        keywords: &[
            "engine failure",
            "engine fire",
            "engine out",
            "lost an engine",
            "power loss",
        ],
    },
    KeywordRule {
        emergency_type: "fire_smoke",
        severity: Severity::Critical,
        keywords: &["fire", "smoke in the cockpit", "smoke in the cabin"],
    },
    KeywordRule {
        emergency_type: "hijack",
        severity: Severity::Critical,
        keywords: &["hijack", "squawking 7500", "unlawful interference"],
    },
    KeywordRule {
        emergency_type: "medical_emergency",
        severity: Severity::High,
        keywords: &[
            "medical emergency",
            "passenger unconscious",
            "heart attack",
            "medical assistance",
        ],
    },
    KeywordRule {
        emergency_type: "fuel_emergency",
        severity: Severity::High,
        keywords: &["fuel emergency", "minimum fuel", "low fuel", "fuel leak"],
    },
    KeywordRule {
        emergency_type: "bird_strike",
        severity: Severity::High,
        keywords: &["bird strike", "struck a bird", "multiple bird strikes"],
    },
    KeywordRule {
        emergency_type: "general_emergency",
        severity: Severity::Critical,
        keywords: &["mayday", "pan-pan", "pan pan", "declaring emergency", "emergency"],
    },
];

/// WARNING bucket.
const WARNING_RULES: &[KeywordRule] = &[
    KeywordRule {
        emergency_type: "collision_risk",
        severity: Severity::Medium,
        keywords: &[
            "tcas",
            "resolution advisory",
            "traffic alert",
            "near miss",
            "loss of separation",
        ],
    },
    KeywordRule {
        emergency_type: "wind_shear",
        severity: Severity::Medium,
        keywords: &["wind shear", "windshear", "microburst"],
    },
    KeywordRule {
        emergency_type: "go_around",
        severity: Severity::Medium,
        keywords: &["go around", "going around", "missed approach"],
    },
    KeywordRule {
        emergency_type: "turbulence",
        severity: Severity::Low,
        keywords: &["severe turbulence", "moderate turbulence", "turbulence"],
    },
];

/// REPORT bucket.
const REPORT_RULES: &[KeywordRule] = &[KeywordRule {
    emergency_type: "pilot_report",
    severity: Severity::Low,
    keywords: &["pilot report", "pirep", "light chop", "ride report", "smooth ride"],
}];

const LADDER: &[(&[KeywordRule], Category)] = &[
    (EMERGENCY_RULES, Category::Emergency),
    (WARNING_RULES, Category::Warning),
    (REPORT_RULES, Category::Report),
];

/// Word-boundary matcher per ladder keyword, compiled once. Plain substring
/// matching would light up on "misfire" or "fireworks".
fn keyword_patterns() -> &'static HashMap<&'static str, Regex> {
    static PATTERNS: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let mut map = HashMap::new();
        for (rules, _) in LADDER {
            for rule in *rules {
                for kw in rule.keywords {
                    map.entry(*kw).or_insert_with(|| {
                        Regex::new(&format!(r"\b{}\b", regex::escape(kw)))
                            .expect("static keyword pattern")
                    });
                }
            }
        }
        map
    })
}

fn keyword_matches(text: &str, keyword: &str) -> bool {
    keyword_patterns()
        .get(keyword)
        .map_or(false, |re| re.is_match(text))
}

/// Seam for an external (LLM-backed) classifier.
#[async_trait]
pub trait ExternalClassifier: Send + Sync {
    async fn classify(
        &self,
        transcript: &str,
        hints: &StructuredHints,
    ) -> EngineResult<ClassificationResult>;
}

/// Classifier front end: ladder plus optional external override.
pub struct Classifier {
    external: Option<Arc<dyn ExternalClassifier>>,
    timeout: Duration,
    override_min_confidence: f64,
}

impl Classifier {
    pub fn new(
        external: Option<Arc<dyn ExternalClassifier>>,
        timeout_ms: u64,
        override_min_confidence: f64,
    ) -> Self {
        Self {
            external,
            timeout: Duration::from_millis(timeout_ms),
            override_min_confidence,
        }
    }

    /// Ladder-only classifier (no external dependency).
    pub fn keyword_only() -> Self {
        Self::new(None, 0, 1.0)
    }

    /// Classify one transcript. Infallible: the ladder always produces a
    /// result and the external path can only replace it, never fail it.
    pub async fn classify(&self, input: &TranscriptInput) -> ClassificationResult {
        let ladder = self.classify_with_ladder(input);
        let Some(external) = &self.external else {
            return ladder;
        };
        let hints = input.hints();
        match tokio::time::timeout(self.timeout, external.classify(&input.transcript, &hints))
            .await
        {
            Ok(Ok(ext)) if ext.confidence >= self.override_min_confidence => {
                debug!(
                    emergency_type = %ext.emergency_type,
                    confidence = ext.confidence,
                    "external classifier override applied"
                );
                ClassificationResult {
                    origin: ClassificationOrigin::ExternalOverride,
                    ..ext
                }
            }
            Ok(Ok(ext)) => {
                debug!(
                    confidence = ext.confidence,
                    floor = self.override_min_confidence,
                    "external result below override floor, keeping keyword ladder"
                );
                ladder
            }
            Ok(Err(e)) => {
                warn!(error = %e, "external classifier failed, keeping keyword ladder");
                ladder
            }
            Err(_) => {
                let e = EngineError::ClassificationTimeout(self.timeout.as_millis() as u64);
                warn!(error = %e, "keeping keyword ladder");
                ladder
            }
        }
    }

    /// Pure, deterministic keyword ladder. Exposed for tests and for callers
    /// that need re-classification to be exactly reproducible.
    pub fn classify_with_ladder(&self, input: &TranscriptInput) -> ClassificationResult {
        let hints = input.hints();
        let mut text = input.transcript.to_lowercase();
        if !hints.keywords.is_empty() {
            text.push(' ');
            text.push_str(&hints.keywords.join(" ").to_lowercase());
        }

        for (rules, category) in LADDER {
            for rule in *rules {
                let matched: Vec<String> = rule
                    .keywords
                    .iter()
                    .filter(|kw| keyword_matches(&text, kw))
                    .map(|kw| kw.to_string())
                    .collect();
                if matched.is_empty() {
                    continue;
                }
                let confidence = calibrate_confidence(
                    rule.severity,
                    matched.len(),
                    hints.urgent,
                    input.source,
                );
                return ClassificationResult {
                    emergency_type: rule.emergency_type.to_string(),
                    severity: rule.severity,
                    category: *category,
                    confidence,
                    description: describe(rule.emergency_type, &text),
                    matched_keywords: matched,
                    origin: ClassificationOrigin::KeywordLadder,
                };
            }
        }

        // No keyword matched: generic ALERT fallback, never an error.
        let severity = if hints.urgent { Severity::Medium } else { Severity::Low };
        let confidence = if input.source == InputSource::Operator {
            1.0
        } else if hints.urgent {
            0.4
        } else {
            0.1
        };
        ClassificationResult {
            emergency_type: "general_emergency".to_string(),
            severity,
            category: Category::Alert,
            confidence,
            description: "Unclassified transmission".to_string(),
            matched_keywords: Vec::new(),
            origin: ClassificationOrigin::KeywordLadder,
        }
    }
}

/// Alert-creation policy: EMERGENCY and WARNING always create an alert;
/// REPORT only when actionable (urgent hint or severity at least MEDIUM); the
/// generic ALERT fallback only when the upstream flagged urgency.
pub fn creates_alert(result: &ClassificationResult, hints: &StructuredHints) -> bool {
    match result.category {
        Category::Emergency | Category::Warning => true,
        Category::Report => hints.urgent || result.severity >= Severity::Medium,
        Category::Alert => hints.urgent,
    }
}

/// Calibrated, monotonic confidence for automated input: a severity-tier base
/// plus a small bump per extra keyword hit, then the upstream urgency bonus.
/// Operator-entered input is manually confirmed and always scores 1.0.
fn calibrate_confidence(
    severity: Severity,
    matched: usize,
    urgent: bool,
    source: InputSource,
) -> f64 {
    if source == InputSource::Operator {
        return 1.0;
    }
    let base = match severity {
        Severity::Critical => 0.9,
        Severity::High => 0.8,
        Severity::Medium => 0.6,
        Severity::Low => 0.4,
    };
    let mut confidence = (base + 0.05 * (matched.saturating_sub(1)) as f64).min(0.95);
    if urgent {
        confidence = (confidence + 0.3).min(1.0);
    }
    confidence
}

fn describe(emergency_type: &str, text: &str) -> String {
    let mut description = format!(
        "{} detected",
        title_case(&emergency_type.replace('_', " "))
    );
    if text.contains("mayday") {
        description.push_str(" - MAYDAY call");
    } else if text.contains("emergency") {
        description.push_str(" - declared emergency");
    }
    description
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// External LLM classifier (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

const DEFAULT_LLM_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_LLM_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

const CLASSIFY_SYSTEM_PROMPT: &str = "You are an emergency detection agent for air traffic \
control communications. Analyze the provided ATC transcript and respond with JSON only: \
{\"emergency_type\": \"engine_failure/fire_smoke/hijack/medical_emergency/fuel_emergency/\
bird_strike/collision_risk/wind_shear/go_around/turbulence/pilot_report/general_emergency\", \
\"severity\": \"CRITICAL/HIGH/MEDIUM/LOW\", \"category\": \"EMERGENCY/WARNING/REPORT/ALERT\", \
\"description\": \"brief description\", \"confidence\": 0.0-1.0}";

#[derive(serde::Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(serde::Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: String,
}

#[derive(Deserialize)]
struct LlmVerdict {
    emergency_type: String,
    severity: Severity,
    category: Category,
    #[serde(default)]
    description: String,
    confidence: f64,
}

/// LLM override client. Absent credentials mean no override, never an error.
pub struct LlmClassifier {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmClassifier {
    /// Build from `SKYWATCH_LLM_API_KEY` (+ optional `SKYWATCH_LLM_MODEL`,
    /// `SKYWATCH_LLM_BASE_URL`). Returns `None` when no key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SKYWATCH_LLM_API_KEY").ok()?;
        let key = api_key.trim().to_string();
        if key.is_empty() {
            return None;
        }
        let model =
            std::env::var("SKYWATCH_LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string());
        let base_url = std::env::var("SKYWATCH_LLM_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_LLM_BASE.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Some(Self {
            api_key: key,
            model,
            base_url,
            client,
        })
    }
}

#[async_trait]
impl ExternalClassifier for LlmClassifier {
    async fn classify(
        &self,
        transcript: &str,
        hints: &StructuredHints,
    ) -> EngineResult<ClassificationResult> {
        let mut user_text = format!("Transcript: {}", transcript);
        if let Some(callsign) = &hints.callsign {
            user_text.push_str(&format!("\nCallsign: {}", callsign));
        }
        if hints.urgent {
            user_text.push_str("\nUpstream urgency flag: set");
        }

        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: CLASSIFY_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_text,
                },
            ],
            temperature: 0.1,
            max_tokens: 400,
        };

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ProviderFailure(format!("classifier request: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::ProviderFailure(format!(
                "classifier API error {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| EngineError::ProviderFailure(format!("classifier parse: {}", e)))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        let verdict: LlmVerdict = serde_json::from_str(strip_code_fences(content))?;

        Ok(ClassificationResult {
            emergency_type: verdict.emergency_type,
            severity: verdict.severity,
            category: verdict.category,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            description: verdict.description,
            matched_keywords: Vec::new(),
            origin: ClassificationOrigin::ExternalOverride,
        })
    }
}

fn strip_code_fences(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix("```json").or_else(|| s.strip_prefix("```")).unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(transcript: &str) -> TranscriptInput {
        TranscriptInput {
            transcript: transcript.to_string(),
            hints: None,
            source: InputSource::Automated,
            message_id: None,
            timestamp: None,
        }
    }

    #[test]
    fn mayday_engine_failure_is_critical_emergency() {
        let c = Classifier::keyword_only();
        let r = c.classify_with_ladder(&input(
            "MAYDAY MAYDAY UAL123 engine failure requesting immediate landing",
        ));
        assert_eq!(r.emergency_type, "engine_failure");
        assert_eq!(r.severity, Severity::Critical);
        assert_eq!(r.category, Category::Emergency);
        assert!(r.confidence >= 0.9);
    }

    #[test]
    fn emergency_bucket_beats_warning_bucket() {
        let c = Classifier::keyword_only();
        let r = c.classify_with_ladder(&input(
            "severe turbulence then fire warning light, declaring emergency",
        ));
        assert_eq!(r.category, Category::Emergency);
        assert_eq!(r.emergency_type, "fire_smoke");
    }

    #[test]
    fn classification_is_deterministic() {
        let c = Classifier::keyword_only();
        let i = input("Delta 567 medical emergency passenger unconscious");
        let a = c.classify_with_ladder(&i);
        let b = c.classify_with_ladder(&i);
        assert_eq!(a.emergency_type, b.emergency_type);
        assert_eq!(a.severity, b.severity);
        assert_eq!(a.category, b.category);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let c = Classifier::keyword_only();
        // "misfire" and "fireworks" contain "fire" as a substring but are not
        // fire reports.
        let r = c.classify_with_ladder(&input(
            "ground crew reports a misfire from the fireworks display nearby",
        ));
        assert_eq!(r.category, Category::Alert);
        assert!(r.matched_keywords.is_empty());

        let r = c.classify_with_ladder(&input("fire warning light on, declaring emergency"));
        assert_eq!(r.emergency_type, "fire_smoke");
    }

    #[test]
    fn unmatched_transcript_falls_back_without_error() {
        let c = Classifier::keyword_only();
        let r = c.classify_with_ladder(&input("ground point niner taxi via alpha"));
        assert_eq!(r.emergency_type, "general_emergency");
        assert_eq!(r.category, Category::Alert);
        assert!(r.confidence <= 0.2);
    }

    #[test]
    fn operator_input_classifies_with_full_confidence() {
        let c = Classifier::keyword_only();
        let mut i = input("bird strike on departure");
        i.source = InputSource::Operator;
        let r = c.classify_with_ladder(&i);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.emergency_type, "bird_strike");
    }

    #[test]
    fn urgent_hint_raises_confidence_monotonically() {
        let c = Classifier::keyword_only();
        let base = c.classify_with_ladder(&input("reporting moderate turbulence"));
        let mut urgent = input("reporting moderate turbulence");
        urgent.hints = Some(StructuredHints {
            urgent: true,
            ..Default::default()
        });
        let bumped = c.classify_with_ladder(&urgent);
        assert!(bumped.confidence > base.confidence);
    }

    #[test]
    fn report_without_urgency_is_not_actionable() {
        let c = Classifier::keyword_only();
        let r = c.classify_with_ladder(&input("pilot report light chop at one two thousand"));
        assert_eq!(r.category, Category::Report);
        assert!(!creates_alert(&r, &StructuredHints::default()));
        let urgent = StructuredHints {
            urgent: true,
            ..Default::default()
        };
        assert!(creates_alert(&r, &urgent));
    }

    #[test]
    fn warning_always_creates_alert() {
        let c = Classifier::keyword_only();
        let r = c.classify_with_ladder(&input("TCAS resolution advisory, climbing"));
        assert_eq!(r.category, Category::Warning);
        assert!(creates_alert(&r, &StructuredHints::default()));
    }

    struct SlowClassifier;

    #[async_trait]
    impl ExternalClassifier for SlowClassifier {
        async fn classify(
            &self,
            _transcript: &str,
            _hints: &StructuredHints,
        ) -> EngineResult<ClassificationResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("timeout fires first")
        }
    }

    struct ConfidentClassifier;

    #[async_trait]
    impl ExternalClassifier for ConfidentClassifier {
        async fn classify(
            &self,
            _transcript: &str,
            _hints: &StructuredHints,
        ) -> EngineResult<ClassificationResult> {
            Ok(ClassificationResult {
                emergency_type: "fuel_emergency".to_string(),
                severity: Severity::High,
                category: Category::Emergency,
                confidence: 0.92,
                description: "Fuel state critical".to_string(),
                matched_keywords: Vec::new(),
                origin: ClassificationOrigin::ExternalOverride,
            })
        }
    }

    #[tokio::test]
    async fn external_timeout_falls_back_to_ladder() {
        let c = Classifier::new(Some(Arc::new(SlowClassifier)), 20, 0.75);
        let r = c.classify(&input("mayday mayday fuel emergency")).await;
        assert_eq!(r.origin, ClassificationOrigin::KeywordLadder);
        assert_eq!(r.emergency_type, "fuel_emergency");
    }

    #[tokio::test]
    async fn confident_external_result_overrides_ladder() {
        let c = Classifier::new(Some(Arc::new(ConfidentClassifier)), 1000, 0.75);
        let r = c.classify(&input("uh we are getting low on gas here")).await;
        assert_eq!(r.origin, ClassificationOrigin::ExternalOverride);
        assert_eq!(r.emergency_type, "fuel_emergency");
    }
}
