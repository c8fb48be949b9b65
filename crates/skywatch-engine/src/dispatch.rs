//! Dispatch state machine.
//!
//! Owns the alert lifecycle (`ACTIVE → ACKNOWLEDGED/DISPATCHED → RESOLVED`)
//! and the at-most-one-concurrent-call guarantee. Per-alert operations are
//! serialized under a per-alert async lock; cross-alert operations run fully
//! parallel. The durable store is the single source of truth: every
//! transition is persisted (and flushed) before it is considered committed,
//! and a failed persist rolls the transition back instead of applying it
//! optimistically.
//!
//! Provider calls are the only network-blocking operation and run in a
//! spawned task, off the critical path: `dispatch()` returns as soon as the
//! pending record is durable. The call task retries placement up to the
//! configured bound with exponential backoff, then watches the provider for
//! confirmation under a watchdog deadline. A watchdog expiry marks the record
//! failed and frees the alert for retry or manual intervention — it cannot
//! cancel the underlying real call, which is an external side effect.

use crate::caller::{CallDispatcher, CallPlacement};
use crate::classifier::{creates_alert, Classifier};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::escalation;
use crate::protocol::{ProtocolCatalog, RecipientDirectory};
use crate::shared::{
    new_alert_id, new_dispatch_id, AlertStatus, CallStatus, Category, ClassificationResult,
    DispatchRecord, EmergencyAlert, EngineEvent, InputSource, TranscriptInput,
};
use crate::store::AuditStore;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Bounded retries for background-path audit writes before the divergence is
/// surfaced to the operator.
const PERSIST_ATTEMPTS: u32 = 3;

/// Result of ingesting one transcript: the classification, plus the alert it
/// created (None when the category carried no actionable content).
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub classification: ClassificationResult,
    pub alert: Option<EmergencyAlert>,
}

pub struct DispatchEngine {
    config: EngineConfig,
    catalog: Arc<ProtocolCatalog>,
    directory: Arc<RecipientDirectory>,
    classifier: Classifier,
    store: Arc<AuditStore>,
    caller: Arc<CallDispatcher>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl DispatchEngine {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<ProtocolCatalog>,
        directory: Arc<RecipientDirectory>,
        classifier: Classifier,
        store: Arc<AuditStore>,
        caller: Arc<CallDispatcher>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            catalog,
            directory,
            classifier,
            store,
            caller,
            locks: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    pub fn catalog(&self) -> &ProtocolCatalog {
        &self.catalog
    }

    pub fn directory(&self) -> &RecipientDirectory {
        &self.directory
    }

    pub fn caller(&self) -> &CallDispatcher {
        &self.caller
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_for(&self, alert_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(alert_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; events are a hook, not a dependency.
        let _ = self.events.send(event);
    }

    /// Classify one transcript and, when the category warrants action,
    /// durably record an ACTIVE alert. Classification itself never fails;
    /// only persistence can error here.
    pub async fn ingest(self: &Arc<Self>, input: TranscriptInput) -> EngineResult<IngestOutcome> {
        let classification = self.classifier.classify(&input).await;
        let hints = input.hints();
        if !creates_alert(&classification, &hints) {
            debug!(
                emergency_type = %classification.emergency_type,
                category = ?classification.category,
                "no actionable content, alert suppressed"
            );
            return Ok(IngestOutcome {
                classification,
                alert: None,
            });
        }

        let now = Utc::now();
        let alert = EmergencyAlert {
            id: new_alert_id(now),
            source_message_id: input.message_id.clone(),
            source_timestamp: input.timestamp,
            callsign: hints.callsign.clone(),
            emergency_type: classification.emergency_type.clone(),
            severity: classification.severity,
            category: classification.category,
            description: classification.description.clone(),
            original_message: input.transcript.clone(),
            confidence: classification.confidence,
            status: AlertStatus::Active,
            acknowledged: false,
            escalated: false,
            souls: hints
                .souls
                .or_else(|| escalation::extract_souls(&input.transcript)),
            created_by: match input.source {
                InputSource::Operator => "operator".to_string(),
                InputSource::Automated => "classifier".to_string(),
            },
            created_at: now,
            updated_at: now,
        };
        self.store.insert_alert(&alert)?;
        info!(
            alert_id = %alert.id,
            emergency_type = %alert.emergency_type,
            severity = ?alert.severity,
            confidence = alert.confidence,
            "alert recorded"
        );
        self.emit(EngineEvent::AlertCreated(alert.clone()));

        if self.config.auto_dispatch_enabled
            && alert.category == Category::Emergency
            && alert.confidence >= self.config.auto_dispatch_min_confidence
        {
            if let Err(e) = self.dispatch(&alert.id, None).await {
                warn!(alert_id = %alert.id, error = %e, "auto-dispatch rejected");
            }
        }

        // Re-read so the outcome reflects any auto-dispatch transition.
        let alert = self.store.get_alert(&alert.id)?.unwrap_or(alert);
        Ok(IngestOutcome {
            classification,
            alert: Some(alert),
        })
    }

    /// Operator acknowledgement. Legal from any non-RESOLVED state; promotes
    /// status only when the alert was still ACTIVE.
    pub async fn acknowledge(&self, alert_id: &str) -> EngineResult<EmergencyAlert> {
        let lock = self.lock_for(alert_id);
        let _guard = lock.lock().await;

        let mut alert = self
            .store
            .get_alert(alert_id)?
            .ok_or_else(|| EngineError::AlertNotFound(alert_id.to_string()))?;
        if alert.status == AlertStatus::Resolved {
            return Err(EngineError::AlertResolved(alert_id.to_string()));
        }
        alert.acknowledged = true;
        if alert.status == AlertStatus::Active {
            alert.status = AlertStatus::Acknowledged;
        }
        alert.updated_at = Utc::now();
        self.store.update_alert(&alert)?;
        self.emit(EngineEvent::AlertUpdated(alert.clone()));
        Ok(alert)
    }

    /// Terminal transition. Idempotent: resolving a resolved alert is a
    /// no-op. Any outstanding call is left to complete naturally, but no new
    /// dispatch is accepted afterwards.
    pub async fn resolve_alert(&self, alert_id: &str) -> EngineResult<EmergencyAlert> {
        let lock = self.lock_for(alert_id);
        let _guard = lock.lock().await;

        let mut alert = self
            .store
            .get_alert(alert_id)?
            .ok_or_else(|| EngineError::AlertNotFound(alert_id.to_string()))?;
        if alert.status == AlertStatus::Resolved {
            return Ok(alert);
        }
        alert.status = AlertStatus::Resolved;
        alert.updated_at = Utc::now();
        self.store.update_alert(&alert)?;
        info!(alert_id = %alert.id, "alert resolved");
        self.emit(EngineEvent::AlertUpdated(alert.clone()));
        Ok(alert)
    }

    /// Place exactly one call for this alert. Rejected with
    /// `DispatchConflict` while a record is pending/calling. The pending
    /// record is durable before this returns; placement and confirmation run
    /// in a background task.
    pub async fn dispatch(
        self: &Arc<Self>,
        alert_id: &str,
        recipient_override: Option<String>,
    ) -> EngineResult<DispatchRecord> {
        let lock = self.lock_for(alert_id);
        let _guard = lock.lock().await;

        let mut alert = self
            .store
            .get_alert(alert_id)?
            .ok_or_else(|| EngineError::AlertNotFound(alert_id.to_string()))?;
        if alert.status == AlertStatus::Resolved {
            return Err(EngineError::AlertResolved(alert_id.to_string()));
        }
        if let Some(outstanding) = self.store.outstanding_dispatch(alert_id)? {
            return Err(EngineError::DispatchConflict(format!(
                "{} (record {})",
                alert_id, outstanding.id
            )));
        }

        let plan = escalation::resolve(&self.catalog, &alert)?;
        let recipient_role = match recipient_override {
            Some(role) => role,
            None => {
                // Walk the protocol ladder: one failed record advances to the
                // next recipient, clamped at the last.
                let failed = self.store.failed_dispatch_count(alert_id)?;
                plan.recipients[failed.min(plan.recipients.len() - 1)].clone()
            }
        };
        let recipient_number = self.directory.number_for(&recipient_role)?;
        self.caller.check_rate(&recipient_number)?;

        let now = Utc::now();
        let record = DispatchRecord {
            id: new_dispatch_id(now),
            alert_id: alert.id.clone(),
            recipient_role,
            recipient_number,
            call_status: CallStatus::Pending,
            call_provider_id: None,
            attempts: 0,
            simulated: self.caller.is_simulated(),
            error: None,
            script: plan.script,
            initiated_at: now,
            completed_at: None,
            duration_seconds: None,
        };
        self.store.insert_dispatch(&record)?;

        alert.status = AlertStatus::Dispatched;
        alert.escalated = true;
        alert.updated_at = now;
        if let Err(e) = self.store.update_alert(&alert) {
            // Roll back: a half-applied transition must not leave a pending
            // record that would block future dispatches.
            if let Err(cleanup) = self.store.remove_dispatch(&record) {
                error!(
                    dispatch_id = %record.id,
                    error = %cleanup,
                    "rollback of pending dispatch record failed"
                );
            }
            return Err(e);
        }

        info!(
            alert_id = %alert.id,
            dispatch_id = %record.id,
            recipient = %record.recipient_role,
            protocol = %plan.protocol_key,
            simulated = record.simulated,
            "dispatch accepted"
        );
        self.emit(EngineEvent::AlertUpdated(alert));
        self.emit(EngineEvent::DispatchUpdated(record.clone()));

        let engine = Arc::clone(self);
        let task_record = record.clone();
        tokio::spawn(async move {
            engine.run_call(task_record).await;
        });
        Ok(record)
    }

    /// Sweep outstanding records left behind by an earlier process. Their
    /// call tasks died with it, so nothing would ever finalize them and the
    /// per-alert slot would stay blocked forever. Each is marked failed with
    /// an explanatory error; the alert stays DISPATCHED and becomes eligible
    /// for re-dispatch. Call once at startup, before serving requests.
    pub fn recover(&self) -> EngineResult<usize> {
        let orphans = self.store.outstanding_dispatches()?;
        let count = orphans.len();
        for mut record in orphans {
            record.call_status = CallStatus::Failed;
            record.completed_at = Some(Utc::now());
            record.error = Some(
                "engine restarted while the call was outstanding; outcome unknown".to_string(),
            );
            self.store.update_dispatch(&record)?;
            warn!(
                alert_id = %record.alert_id,
                dispatch_id = %record.id,
                provider_id = record.call_provider_id.as_deref().unwrap_or("none"),
                "orphaned dispatch record swept after restart"
            );
            self.emit(EngineEvent::DispatchUpdated(record));
        }
        Ok(count)
    }

    /// Reload the recipient directory and protocol catalog. Both swaps are
    /// atomic; the catalog validates against the fresh directory before
    /// swapping.
    pub fn reload_catalogs(&self) -> EngineResult<(usize, usize)> {
        let roles = self.directory.reload()?;
        let protocols = self.catalog.reload(&self.directory)?;
        Ok((protocols, roles))
    }

    /// Background half of a dispatch: bounded placement retries, then
    /// provider confirmation under the watchdog.
    async fn run_call(self: Arc<Self>, mut record: DispatchRecord) {
        let max_attempts = self.config.max_call_retries.max(1);
        let mut last_error: Option<String> = None;
        let mut placement: Option<CallPlacement> = None;

        for attempt in 1..=max_attempts {
            record.attempts = attempt;
            match self
                .caller
                .place_call(
                    &record.recipient_number,
                    &record.script,
                    &record.alert_id,
                    &record.id,
                )
                .await
            {
                Ok(p) => {
                    placement = Some(p);
                    break;
                }
                Err(e @ EngineError::RateLimited { .. }) => {
                    // Backing off won't clear a rate window; fail the attempt
                    // and leave the alert eligible for a later dispatch.
                    last_error = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    warn!(
                        dispatch_id = %record.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "call placement failed"
                    );
                    last_error = Some(e.to_string());
                    if attempt < max_attempts {
                        let backoff = self
                            .config
                            .retry_backoff_ms
                            .saturating_mul(1u64 << (attempt - 1));
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        let Some(placement) = placement else {
            self.finalize_dispatch(record, CallStatus::Failed, None, last_error)
                .await;
            return;
        };

        record.call_provider_id = Some(placement.provider_id.clone());
        record.simulated = placement.simulated;
        record.call_status = CallStatus::Calling;
        if self.persist_record(&record).await {
            self.emit(EngineEvent::DispatchUpdated(record.clone()));
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.call_confirm_timeout_secs);
        loop {
            tokio::time::sleep(Duration::from_secs(self.config.call_poll_interval_secs)).await;
            match self.caller.call_status(&placement.provider_id).await {
                Ok(status) => match status.status {
                    CallStatus::Completed => {
                        self.finalize_dispatch(
                            record,
                            CallStatus::Completed,
                            status.duration_seconds,
                            None,
                        )
                        .await;
                        return;
                    }
                    CallStatus::Failed => {
                        self.finalize_dispatch(
                            record,
                            CallStatus::Failed,
                            status.duration_seconds,
                            Some("provider reported call failure".to_string()),
                        )
                        .await;
                        return;
                    }
                    CallStatus::Pending | CallStatus::Calling => {}
                },
                Err(e) => {
                    warn!(dispatch_id = %record.id, error = %e, "call status poll failed");
                }
            }
            if Instant::now() >= deadline {
                // The real call (if any) is not cancelled; the record is
                // failed so the per-alert slot frees for retry or manual
                // intervention.
                self.finalize_dispatch(
                    record,
                    CallStatus::Failed,
                    None,
                    Some("no provider confirmation within watchdog window".to_string()),
                )
                .await;
                return;
            }
        }
    }

    /// Persist a background-path record update. Retries transient store
    /// failures with backoff; returns false when the write never landed, in
    /// which case the caller must not advertise the state change — the
    /// durable log, not memory, is what happened.
    async fn persist_record(&self, record: &DispatchRecord) -> bool {
        for attempt in 1..=PERSIST_ATTEMPTS {
            let result = {
                let lock = self.lock_for(&record.alert_id);
                let _guard = lock.lock().await;
                self.store.update_dispatch(record)
            };
            match result {
                Ok(()) => return true,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        dispatch_id = %record.id,
                        attempt,
                        error = %e,
                        "dispatch record persist failed, retrying"
                    );
                    let backoff = self
                        .config
                        .retry_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    error!(
                        alert_id = %record.alert_id,
                        dispatch_id = %record.id,
                        status = ?record.call_status,
                        error = %e,
                        "dispatch record persist failed after retries; audit log diverges from call state, operator intervention required"
                    );
                }
            }
        }
        false
    }

    async fn finalize_dispatch(
        &self,
        mut record: DispatchRecord,
        status: CallStatus,
        duration_seconds: Option<u32>,
        error_msg: Option<String>,
    ) {
        record.call_status = status;
        record.completed_at = Some(Utc::now());
        record.duration_seconds = duration_seconds;
        record.error = error_msg;
        let persisted = self.persist_record(&record).await;
        match status {
            CallStatus::Failed => {
                // Report, never hide: the failed record stays queryable and
                // the alert remains DISPATCHED for operator escalation.
                error!(
                    alert_id = %record.alert_id,
                    dispatch_id = %record.id,
                    attempts = record.attempts,
                    error = record.error.as_deref().unwrap_or("unknown"),
                    "dispatch failed; operator escalation required"
                );
            }
            _ => {
                info!(
                    alert_id = %record.alert_id,
                    dispatch_id = %record.id,
                    simulated = record.simulated,
                    duration_seconds = record.duration_seconds,
                    "dispatch completed"
                );
            }
        }
        if persisted {
            self.emit(EngineEvent::DispatchUpdated(record));
        }
    }
}
