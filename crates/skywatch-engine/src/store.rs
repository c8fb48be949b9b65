//! Sled-backed audit store: one tree per collection plus a per-alert dispatch
//! index.
//!
//! Writes flush before returning so a state-machine transition is durable
//! before it is considered committed — a crash between "call placed" and
//! "record persisted" cannot silently lose the fact that a real call was
//! made. Keys are the time-ordered ids from `shared`, so recency queries are
//! reverse tree scans.

use crate::error::EngineResult;
use crate::shared::{AlertStatus, DispatchRecord, EmergencyAlert};
use sled::Db;
use std::path::Path;

const ALERTS_TREE: &str = "alerts";
const DISPATCH_TREE: &str = "dispatch_records";
const DISPATCH_INDEX_TREE: &str = "dispatch_by_alert";

pub struct AuditStore {
    db: Db,
    alerts: sled::Tree,
    dispatches: sled::Tree,
    dispatch_index: sled::Tree,
    retention: usize,
}

impl AuditStore {
    pub fn open_path<P: AsRef<Path>>(path: P, retention: usize) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        let alerts = db.open_tree(ALERTS_TREE)?;
        let dispatches = db.open_tree(DISPATCH_TREE)?;
        let dispatch_index = db.open_tree(DISPATCH_INDEX_TREE)?;
        Ok(Self {
            db,
            alerts,
            dispatches,
            dispatch_index,
            retention,
        })
    }

    fn flush(&self) -> Result<(), sled::Error> {
        self.db.flush()?;
        Ok(())
    }

    // -- alerts --------------------------------------------------------

    pub fn insert_alert(&self, alert: &EmergencyAlert) -> EngineResult<()> {
        let bytes = serde_json::to_vec(alert)?;
        self.alerts.insert(alert.id.as_bytes(), bytes)?;
        self.flush()?;
        self.prune_alerts()?;
        Ok(())
    }

    pub fn update_alert(&self, alert: &EmergencyAlert) -> EngineResult<()> {
        let bytes = serde_json::to_vec(alert)?;
        self.alerts.insert(alert.id.as_bytes(), bytes)?;
        self.flush()?;
        Ok(())
    }

    pub fn get_alert(&self, id: &str) -> EngineResult<Option<EmergencyAlert>> {
        match self.alerts.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Most recent alerts, newest first, optionally filtered by status.
    pub fn list_recent_alerts(
        &self,
        limit: usize,
        status: Option<AlertStatus>,
    ) -> EngineResult<Vec<EmergencyAlert>> {
        let mut out = Vec::new();
        for item in self.alerts.iter().rev() {
            let (_, bytes) = item?;
            let alert: EmergencyAlert = serde_json::from_slice(&bytes)?;
            if let Some(wanted) = status {
                if alert.status != wanted {
                    continue;
                }
            }
            out.push(alert);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }

    // -- dispatch records ----------------------------------------------

    pub fn insert_dispatch(&self, record: &DispatchRecord) -> EngineResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.dispatches.insert(record.id.as_bytes(), bytes)?;
        self.dispatch_index.insert(
            index_key(&record.alert_id, &record.id).as_bytes(),
            record.id.as_bytes(),
        )?;
        self.flush()?;
        self.prune_dispatches()?;
        Ok(())
    }

    pub fn update_dispatch(&self, record: &DispatchRecord) -> EngineResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.dispatches.insert(record.id.as_bytes(), bytes)?;
        self.flush()?;
        Ok(())
    }

    pub fn remove_dispatch(&self, record: &DispatchRecord) -> EngineResult<()> {
        self.dispatches.remove(record.id.as_bytes())?;
        self.dispatch_index
            .remove(index_key(&record.alert_id, &record.id).as_bytes())?;
        self.flush()?;
        Ok(())
    }

    pub fn get_dispatch(&self, id: &str) -> EngineResult<Option<DispatchRecord>> {
        match self.dispatches.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Most recent dispatch records, newest first.
    pub fn list_recent_dispatches(&self, limit: usize) -> EngineResult<Vec<DispatchRecord>> {
        let mut out = Vec::new();
        for item in self.dispatches.iter().rev() {
            let (_, bytes) = item?;
            out.push(serde_json::from_slice(&bytes)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// All dispatch records for an alert, oldest first.
    pub fn dispatches_for_alert(&self, alert_id: &str) -> EngineResult<Vec<DispatchRecord>> {
        let mut out = Vec::new();
        for item in self.dispatch_index.scan_prefix(prefix_key(alert_id)) {
            let (_, id_bytes) = item?;
            if let Some(bytes) = self.dispatches.get(&id_bytes)? {
                out.push(serde_json::from_slice::<DispatchRecord>(&bytes)?);
            }
        }
        Ok(out)
    }

    /// The pending/calling record for an alert, if one exists. This query
    /// backs the at-most-one-concurrent-call guarantee.
    pub fn outstanding_dispatch(&self, alert_id: &str) -> EngineResult<Option<DispatchRecord>> {
        Ok(self
            .dispatches_for_alert(alert_id)?
            .into_iter()
            .find(|r| r.call_status.is_outstanding()))
    }

    /// All pending/calling records across every alert. Startup recovery uses
    /// this to sweep records orphaned by a previous process.
    pub fn outstanding_dispatches(&self) -> EngineResult<Vec<DispatchRecord>> {
        let mut out = Vec::new();
        for item in self.dispatches.iter() {
            let (_, bytes) = item?;
            let record: DispatchRecord = serde_json::from_slice(&bytes)?;
            if record.call_status.is_outstanding() {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Failed attempts so far, used to walk the recipient escalation ladder.
    pub fn failed_dispatch_count(&self, alert_id: &str) -> EngineResult<usize> {
        Ok(self
            .dispatches_for_alert(alert_id)?
            .iter()
            .filter(|r| r.call_status == crate::shared::CallStatus::Failed)
            .count())
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.len()
    }

    // -- retention ------------------------------------------------------

    /// Prune oldest alerts beyond the retention count. Only RESOLVED alerts
    /// are eligible; live alerts are never dropped.
    fn prune_alerts(&self) -> EngineResult<()> {
        let mut excess = self.alerts.len().saturating_sub(self.retention);
        if excess == 0 {
            return Ok(());
        }
        for item in self.alerts.iter() {
            if excess == 0 {
                break;
            }
            let (key, bytes) = item?;
            let alert: EmergencyAlert = serde_json::from_slice(&bytes)?;
            if alert.status == AlertStatus::Resolved {
                self.alerts.remove(&key)?;
                excess -= 1;
            }
        }
        Ok(())
    }

    /// Prune oldest terminal dispatch records beyond the retention count.
    /// Pending/calling records are never pruned.
    fn prune_dispatches(&self) -> EngineResult<()> {
        let mut excess = self.dispatches.len().saturating_sub(self.retention);
        if excess == 0 {
            return Ok(());
        }
        for item in self.dispatches.iter() {
            if excess == 0 {
                break;
            }
            let (key, bytes) = item?;
            let record: DispatchRecord = serde_json::from_slice(&bytes)?;
            if record.call_status.is_terminal() {
                self.dispatches.remove(&key)?;
                self.dispatch_index
                    .remove(index_key(&record.alert_id, &record.id).as_bytes())?;
                excess -= 1;
            }
        }
        Ok(())
    }
}

fn prefix_key(alert_id: &str) -> String {
    format!("{}/", alert_id)
}

fn index_key(alert_id: &str, dispatch_id: &str) -> String {
    format!("{}/{}", alert_id, dispatch_id)
}
