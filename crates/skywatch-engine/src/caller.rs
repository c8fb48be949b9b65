//! Call dispatcher: provider seam, live Vapi client, simulation fallback, and
//! the per-recipient rate limit.
//!
//! When provider credentials are absent the dispatcher runs a clearly logged
//! simulation that exercises the full state machine. Simulated placements
//! carry a `sim_` provider-id prefix and the dispatch record's `simulated`
//! flag, so the audit trail can never pass one off as a live call.

use crate::error::{EngineError, EngineResult};
use crate::shared::CallStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Provider acknowledgement of a placed call.
#[derive(Debug, Clone)]
pub struct CallPlacement {
    pub provider_id: String,
    pub simulated: bool,
}

/// Provider-reported status for an in-flight call.
#[derive(Debug, Clone)]
pub struct ProviderCallStatus {
    pub status: CallStatus,
    pub duration_seconds: Option<u32>,
}

/// Seam for the outbound voice-call provider.
#[async_trait]
pub trait CallProvider: Send + Sync {
    async fn place_call(
        &self,
        recipient_number: &str,
        script: &str,
        metadata: serde_json::Value,
    ) -> EngineResult<CallPlacement>;

    async fn call_status(&self, provider_id: &str) -> EngineResult<ProviderCallStatus>;
}

// ---------------------------------------------------------------------------
// Vapi provider
// ---------------------------------------------------------------------------

const DEFAULT_VAPI_BASE: &str = "https://api.vapi.ai";

#[derive(Deserialize)]
struct VapiCallResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VapiStatusResponse {
    status: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
}

/// Live voice-call provider client.
pub struct VapiProvider {
    token: String,
    assistant_id: String,
    phone_number_id: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl VapiProvider {
    /// Build from `VAPI_TOKEN`, `VAPI_ASSISTANT_ID` (+ optional
    /// `VAPI_PHONE_NUMBER_ID`, `VAPI_BASE_URL`). Returns `None` when the
    /// credentials are missing or look like placeholders, which switches the
    /// dispatcher to simulation mode.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("VAPI_TOKEN").ok()?.trim().to_string();
        if token.is_empty() || token == "test_token" || token.len() < 10 {
            return None;
        }
        let assistant_id = std::env::var("VAPI_ASSISTANT_ID").ok()?.trim().to_string();
        if assistant_id.is_empty() {
            return None;
        }
        let phone_number_id = std::env::var("VAPI_PHONE_NUMBER_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let base_url =
            std::env::var("VAPI_BASE_URL").unwrap_or_else(|_| DEFAULT_VAPI_BASE.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Some(Self {
            token,
            assistant_id,
            phone_number_id,
            base_url,
            client,
        })
    }

    fn map_status(raw: &str) -> CallStatus {
        match raw {
            "queued" | "scheduled" => CallStatus::Pending,
            "ringing" | "in-progress" | "forwarding" => CallStatus::Calling,
            "ended" | "completed" => CallStatus::Completed,
            _ => CallStatus::Failed,
        }
    }
}

#[async_trait]
impl CallProvider for VapiProvider {
    async fn place_call(
        &self,
        recipient_number: &str,
        script: &str,
        metadata: serde_json::Value,
    ) -> EngineResult<CallPlacement> {
        let mut payload = serde_json::json!({
            "assistantId": self.assistant_id,
            "customer": { "number": recipient_number },
            "assistantOverrides": {
                "firstMessage": format!(
                    "This is an automated emergency dispatch from the air traffic control \
                     monitoring system. {}",
                    script
                ),
                "variableValues": metadata,
            },
        });
        if let Some(phone_number_id) = &self.phone_number_id {
            payload["phoneNumberId"] = serde_json::json!(phone_number_id);
        }

        let res = self
            .client
            .post(format!("{}/call", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::ProviderFailure(format!("call request: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::ProviderFailure(format!(
                "call API error {}: {}",
                status, body
            )));
        }

        let parsed: VapiCallResponse = res
            .json()
            .await
            .map_err(|e| EngineError::ProviderFailure(format!("call response parse: {}", e)))?;
        info!(provider_id = %parsed.id, "provider accepted call");
        Ok(CallPlacement {
            provider_id: parsed.id,
            simulated: false,
        })
    }

    async fn call_status(&self, provider_id: &str) -> EngineResult<ProviderCallStatus> {
        let res = self
            .client
            .get(format!("{}/call/{}", self.base_url, provider_id))
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| EngineError::ProviderFailure(format!("status request: {}", e)))?;

        if !res.status().is_success() {
            return Err(EngineError::ProviderFailure(format!(
                "status API error {}",
                res.status()
            )));
        }

        let parsed: VapiStatusResponse = res
            .json()
            .await
            .map_err(|e| EngineError::ProviderFailure(format!("status parse: {}", e)))?;
        let duration_seconds = match (parsed.started_at, parsed.ended_at) {
            (Some(start), Some(end)) => u32::try_from((end - start).num_seconds().max(0)).ok(),
            _ => None,
        };
        Ok(ProviderCallStatus {
            status: Self::map_status(&parsed.status),
            duration_seconds,
        })
    }
}

// ---------------------------------------------------------------------------
// Simulation provider
// ---------------------------------------------------------------------------

/// No-credentials fallback. Accepts every call and reports it completed, but
/// only ever under a `sim_` provider id so the audit trail stays honest.
pub struct SimulatedProvider;

#[async_trait]
impl CallProvider for SimulatedProvider {
    async fn place_call(
        &self,
        recipient_number: &str,
        script: &str,
        _metadata: serde_json::Value,
    ) -> EngineResult<CallPlacement> {
        info!(recipient = %recipient_number, %script, "SIMULATED call placed (no provider credentials)");
        Ok(CallPlacement {
            provider_id: format!("sim_{}", Utc::now().timestamp_millis()),
            simulated: true,
        })
    }

    async fn call_status(&self, _provider_id: &str) -> EngineResult<ProviderCallStatus> {
        Ok(ProviderCallStatus {
            status: CallStatus::Completed,
            duration_seconds: Some(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Provider front end with the per-recipient rate limit.
pub struct CallDispatcher {
    provider: Arc<dyn CallProvider>,
    last_call: DashMap<String, Instant>,
    min_interval: Duration,
    simulated: bool,
}

impl CallDispatcher {
    pub fn new(provider: Arc<dyn CallProvider>, min_interval: Duration, simulated: bool) -> Self {
        Self {
            provider,
            last_call: DashMap::new(),
            min_interval,
            simulated,
        }
    }

    /// Live provider when credentials are present, otherwise the logged
    /// simulation.
    pub fn from_env(min_interval: Duration) -> Self {
        match VapiProvider::from_env() {
            Some(provider) => Self::new(Arc::new(provider), min_interval, false),
            None => {
                warn!("VAPI credentials absent: call dispatcher running in SIMULATION mode");
                Self::new(Arc::new(SimulatedProvider), min_interval, true)
            }
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Rate-limit check without reserving the slot. Used by the state machine
    /// to reject a dispatch request synchronously before a record is created.
    pub fn check_rate(&self, recipient_number: &str) -> EngineResult<()> {
        if self.min_interval.is_zero() {
            return Ok(());
        }
        if let Some(stamp) = self.last_call.get(recipient_number) {
            let elapsed = stamp.elapsed();
            if elapsed < self.min_interval {
                return Err(EngineError::RateLimited {
                    number: recipient_number.to_string(),
                    elapsed_secs: elapsed.as_secs(),
                    min_interval_secs: self.min_interval.as_secs(),
                });
            }
        }
        Ok(())
    }

    /// Place one call. The rate-limit stamp is set only after the provider
    /// accepts, so placement retries after a rejected attempt are not
    /// throttled by their own failures.
    pub async fn place_call(
        &self,
        recipient_number: &str,
        script: &str,
        alert_id: &str,
        dispatch_id: &str,
    ) -> EngineResult<CallPlacement> {
        self.check_rate(recipient_number)?;
        let metadata = serde_json::json!({
            "alert_id": alert_id,
            "dispatch_id": dispatch_id,
            "priority": "emergency",
        });
        let placement = self
            .provider
            .place_call(recipient_number, script, metadata)
            .await?;
        self.last_call
            .insert(recipient_number.to_string(), Instant::now());
        Ok(placement)
    }

    pub async fn call_status(&self, provider_id: &str) -> EngineResult<ProviderCallStatus> {
        self.provider.call_status(provider_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_placement_is_tagged() {
        let dispatcher =
            CallDispatcher::new(Arc::new(SimulatedProvider), Duration::from_secs(0), true);
        let placement = dispatcher
            .place_call("+15550001111", "test script", "emrg_x", "dsp_x")
            .await
            .unwrap();
        assert!(placement.simulated);
        assert!(placement.provider_id.starts_with("sim_"));
    }

    #[tokio::test]
    async fn second_call_to_same_number_is_rate_limited() {
        let dispatcher =
            CallDispatcher::new(Arc::new(SimulatedProvider), Duration::from_secs(60), true);
        dispatcher
            .place_call("+15550001111", "s", "a", "d1")
            .await
            .unwrap();
        let err = dispatcher
            .place_call("+15550001111", "s", "a", "d2")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
        // A different number is unaffected.
        dispatcher
            .place_call("+15550002222", "s", "a", "d3")
            .await
            .unwrap();
    }

    #[test]
    fn vapi_status_mapping_covers_terminal_states() {
        assert_eq!(VapiProvider::map_status("ended"), CallStatus::Completed);
        assert_eq!(VapiProvider::map_status("in-progress"), CallStatus::Calling);
        assert_eq!(VapiProvider::map_status("queued"), CallStatus::Pending);
        assert_eq!(VapiProvider::map_status("no-answer"), CallStatus::Failed);
    }
}
