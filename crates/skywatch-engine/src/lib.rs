//! skywatch-engine: emergency classification and dispatch escalation for ATC
//! transcript streams.
//!
//! Layers, bottom up: a deterministic keyword classifier (with an optional
//! external override), the protocol catalog and recipient directory, the
//! escalation resolver that renders call scripts, the sled-backed audit
//! store, the call dispatcher (live provider or logged simulation), and the
//! dispatch state machine that ties them together.

pub mod caller;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod protocol;
pub mod shared;
pub mod store;

pub use caller::{CallDispatcher, CallPlacement, CallProvider, ProviderCallStatus, SimulatedProvider, VapiProvider};
pub use classifier::{Classifier, ExternalClassifier, LlmClassifier};
pub use config::EngineConfig;
pub use dispatch::{DispatchEngine, IngestOutcome};
pub use error::{EngineError, EngineResult};
pub use escalation::{extract_souls, EscalationPlan};
pub use protocol::{ProtocolCatalog, ProtocolEntry, RecipientDirectory, FALLBACK_PROTOCOL};
pub use shared::{
    new_alert_id, new_dispatch_id, AlertStatus, CallStatus, Category, ClassificationOrigin,
    ClassificationResult, DispatchRecord, EmergencyAlert, EngineEvent, InputSource, Severity,
    StructuredHints, TranscriptInput,
};
pub use store::AuditStore;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
