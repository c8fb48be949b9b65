//! Engine error taxonomy.
//!
//! Two variants are recovered internally and should never reach an operator:
//! `ClassificationTimeout` (keyword ladder takes over) and `UnknownProtocol`
//! (the `general_emergency` catalog entry takes over). Everything else is
//! surfaced — a failed dispatch must stay visible in the audit trail.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// External classifier unreachable or over deadline. The caller falls
    /// back to the keyword ladder; classification never blocks on this.
    #[error("external classifier timed out after {0} ms")]
    ClassificationTimeout(u64),

    /// No catalog entry for the emergency type. Resolved via the
    /// `general_emergency` fallback entry, never returned to callers.
    #[error("no protocol entry for emergency type '{0}'")]
    UnknownProtocol(String),

    /// A protocol references a recipient role with no phone number. Fatal for
    /// the dispatch attempt — the engine fails closed rather than guessing a
    /// call target.
    #[error("recipient role '{0}' has no phone number configured")]
    RecipientNotConfigured(String),

    /// A dispatch record for this alert is already pending or calling.
    #[error("dispatch already outstanding for alert '{0}'")]
    DispatchConflict(String),

    /// Alert id unknown to the store.
    #[error("alert '{0}' not found")]
    AlertNotFound(String),

    /// Alert is RESOLVED; the lifecycle is monotonic and no further dispatch
    /// or acknowledgement is accepted.
    #[error("alert '{0}' is resolved; no further transitions accepted")]
    AlertResolved(String),

    /// Call provider rejected the request or the network failed.
    #[error("call provider failure: {0}")]
    ProviderFailure(String),

    /// Per-recipient rate limit hit; the same number was called too recently.
    #[error("rate limited: {number} was called {elapsed_secs}s ago (minimum interval {min_interval_secs}s)")]
    RateLimited {
        number: String,
        elapsed_secs: u64,
        min_interval_secs: u64,
    },

    /// Durable write failed. The corresponding state-machine transition is
    /// rolled back; in-memory state never diverges from the log.
    #[error("persistence failure: {0}")]
    Persistence(#[from] sled::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protocol catalog or recipient directory failed to parse or validate.
    /// Reported at startup/reload; the previous catalog stays in effect.
    #[error("catalog load failure: {0}")]
    CatalogLoad(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
