//! Engine configuration.
//!
//! Precedence: env `SKYWATCH_CONFIG` path > `config/engine.toml` > defaults,
//! with `SKYWATCH_`-prefixed environment variables overriding either. Call
//! provider credentials (`VAPI_TOKEN` etc.) are read separately by the
//! dispatcher so their absence degrades to simulation mode instead of failing
//! config load.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application identity used in logs and health output.
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the sled audit store.
    pub storage_path: String,
    /// Protocol catalog TOML (compiled-in defaults when missing).
    pub protocols_path: String,
    /// Recipient directory TOML (compiled-in defaults when missing).
    pub recipients_path: String,

    /// Call-placement attempts per dispatch record before the record is
    /// marked failed.
    pub max_call_retries: u32,
    /// Base backoff between placement retries; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Minimum interval between calls to the same recipient number.
    pub call_rate_limit_secs: u64,
    /// Watchdog window: a calling record with no terminal provider status
    /// inside this window is marked failed (the real call, if any, is an
    /// external side effect and is not cancelled).
    pub call_confirm_timeout_secs: u64,
    /// Provider status poll cadence while a call is in flight.
    pub call_poll_interval_secs: u64,

    /// Retention count per store collection; older terminal records are
    /// pruned, pending/calling records never.
    pub retention: usize,

    /// Auto-dispatch on ingest for EMERGENCY-category alerts at or above the
    /// confidence floor. Off by default; operators are the primary trigger.
    pub auto_dispatch_enabled: bool,
    pub auto_dispatch_min_confidence: f64,

    /// Deadline for the optional external classifier round trip.
    pub classifier_timeout_ms: u64,
    /// External result only overrides the keyword ladder at or above this
    /// self-reported confidence.
    pub override_min_confidence: f64,
}

impl EngineConfig {
    /// Load config from file and environment. Precedence: env
    /// `SKYWATCH_CONFIG` path > `config/engine.toml` > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("SKYWATCH_CONFIG").unwrap_or_else(|_| "config/engine".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Skywatch Dispatch Engine")?
            .set_default("port", 8010_i64)?
            .set_default("storage_path", "./data/skywatch_audit")?
            .set_default("protocols_path", "config/protocols.toml")?
            .set_default("recipients_path", "config/recipients.toml")?
            .set_default("max_call_retries", 3_i64)?
            .set_default("retry_backoff_ms", 500_i64)?
            .set_default("call_rate_limit_secs", 60_i64)?
            .set_default("call_confirm_timeout_secs", 120_i64)?
            .set_default("call_poll_interval_secs", 5_i64)?
            .set_default("retention", 500_i64)?
            .set_default("auto_dispatch_enabled", false)?
            .set_default("auto_dispatch_min_confidence", 0.85_f64)?
            .set_default("classifier_timeout_ms", 3000_i64)?
            .set_default("override_min_confidence", 0.75_f64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("SKYWATCH").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Mirrors the `set_default` values in `load()`.
        Self {
            app_name: "Skywatch Dispatch Engine".to_string(),
            port: 8010,
            storage_path: "./data/skywatch_audit".to_string(),
            protocols_path: "config/protocols.toml".to_string(),
            recipients_path: "config/recipients.toml".to_string(),
            max_call_retries: 3,
            retry_backoff_ms: 500,
            call_rate_limit_secs: 60,
            call_confirm_timeout_secs: 120,
            call_poll_interval_secs: 5,
            retention: 500,
            auto_dispatch_enabled: false,
            auto_dispatch_min_confidence: 0.85,
            classifier_timeout_ms: 3000,
            override_min_confidence: 0.75,
        }
    }
}
