//! Protocol catalog and recipient directory.
//!
//! Both are read-mostly maps loaded from TOML at startup, with compiled-in
//! defaults when the file is absent. Reload parses and validates a complete
//! replacement map before a single write-lock swap, so in-flight
//! classification never observes a half-updated catalog.
//!
//! An emergency type with no catalog entry resolves to the
//! `general_emergency` entry — an unrecognized keyword combination still
//! reaches a human. A recipient role with no phone number fails closed
//! (`RecipientNotConfigured`); a call target is never silently dropped.

use crate::error::{EngineError, EngineResult};
use crate::shared::{Category, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Catalog key every load must contain; the fallback for unknown types.
pub const FALLBACK_PROTOCOL: &str = "general_emergency";

/// Per-emergency-type response configuration: declared priority, category,
/// ordered recipient roles, and the call-script template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub severity: Severity,
    pub category: Category,
    /// Recipient roles in escalation order. Dispatch targets the first role
    /// first and walks down only on confirmed failure.
    pub recipients: Vec<String>,
    /// Template with `{callsign}`, `{description}`, `{souls}`, `{timestamp}`
    /// placeholders.
    pub script: String,
}

/// Static, atomically-swappable emergency-type → protocol mapping.
pub struct ProtocolCatalog {
    entries: RwLock<Arc<HashMap<String, ProtocolEntry>>>,
    path: PathBuf,
}

impl ProtocolCatalog {
    /// Load from `path`, falling back to compiled-in defaults when the file
    /// does not exist.
    pub fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let map = Self::load_map(&path)?;
        info!(entries = map.len(), path = %path.display(), "protocol catalog loaded");
        Ok(Self {
            entries: RwLock::new(Arc::new(map)),
            path,
        })
    }

    fn load_map(path: &Path) -> EngineResult<HashMap<String, ProtocolEntry>> {
        let map = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| EngineError::CatalogLoad(format!("{}: {}", path.display(), e)))?;
            toml::from_str(&raw)
                .map_err(|e| EngineError::CatalogLoad(format!("{}: {}", path.display(), e)))?
        } else {
            warn!(path = %path.display(), "protocol file missing, using built-in defaults");
            builtin_protocols()
        };
        Self::validate_entries(&map)?;
        Ok(map)
    }

    fn validate_entries(map: &HashMap<String, ProtocolEntry>) -> EngineResult<()> {
        if !map.contains_key(FALLBACK_PROTOCOL) {
            return Err(EngineError::CatalogLoad(format!(
                "catalog must define the '{}' fallback entry",
                FALLBACK_PROTOCOL
            )));
        }
        for (key, entry) in map {
            if entry.recipients.is_empty() {
                return Err(EngineError::CatalogLoad(format!(
                    "protocol '{}' declares no recipients",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Exact lookup, no fallback.
    pub fn lookup(&self, emergency_type: &str) -> Option<ProtocolEntry> {
        self.entries.read().unwrap().get(emergency_type).cloned()
    }

    /// Resolve an emergency type to its protocol, falling back to
    /// `general_emergency` for unknown types. Returns the key actually used
    /// so the fallback is visible in logs and audit records.
    pub fn resolve(&self, emergency_type: &str) -> (String, ProtocolEntry) {
        let entries = self.entries.read().unwrap();
        if let Some(entry) = entries.get(emergency_type) {
            return (emergency_type.to_string(), entry.clone());
        }
        warn!(emergency_type, "no protocol entry, falling back to general_emergency");
        let entry = entries
            .get(FALLBACK_PROTOCOL)
            .cloned()
            .unwrap_or_else(default_general_emergency);
        (FALLBACK_PROTOCOL.to_string(), entry)
    }

    /// Re-read the catalog file, validate the full replacement (including
    /// recipient roles against `directory`), then swap in one write.
    pub fn reload(&self, directory: &RecipientDirectory) -> EngineResult<usize> {
        let map = Self::load_map(&self.path)?;
        validate_recipients(&map, directory)?;
        let count = map.len();
        *self.entries.write().unwrap() = Arc::new(map);
        info!(entries = count, "protocol catalog reloaded");
        Ok(count)
    }

    /// Startup cross-check against the recipient directory.
    pub fn validate_against(&self, directory: &RecipientDirectory) -> EngineResult<()> {
        validate_recipients(&self.entries.read().unwrap(), directory)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only snapshot for listing endpoints.
    pub fn snapshot(&self) -> Arc<HashMap<String, ProtocolEntry>> {
        Arc::clone(&self.entries.read().unwrap())
    }
}

fn validate_recipients(
    map: &HashMap<String, ProtocolEntry>,
    directory: &RecipientDirectory,
) -> EngineResult<()> {
    for (key, entry) in map {
        for role in &entry.recipients {
            if !directory.contains(role) {
                return Err(EngineError::CatalogLoad(format!(
                    "protocol '{}' references recipient role '{}' with no directory entry",
                    key, role
                )));
            }
        }
    }
    Ok(())
}

/// Recipient-role → E.164 phone number directory, same swap discipline as the
/// catalog.
pub struct RecipientDirectory {
    numbers: RwLock<Arc<HashMap<String, String>>>,
    path: PathBuf,
}

impl RecipientDirectory {
    pub fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let map = Self::load_map(&path)?;
        info!(roles = map.len(), path = %path.display(), "recipient directory loaded");
        Ok(Self {
            numbers: RwLock::new(Arc::new(map)),
            path,
        })
    }

    fn load_map(path: &Path) -> EngineResult<HashMap<String, String>> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| EngineError::CatalogLoad(format!("{}: {}", path.display(), e)))?;
            toml::from_str(&raw)
                .map_err(|e| EngineError::CatalogLoad(format!("{}: {}", path.display(), e)))
        } else {
            warn!(path = %path.display(), "recipient file missing, using built-in defaults");
            Ok(builtin_recipients())
        }
    }

    /// Fail-closed number lookup.
    pub fn number_for(&self, role: &str) -> EngineResult<String> {
        self.numbers
            .read()
            .unwrap()
            .get(role)
            .cloned()
            .ok_or_else(|| EngineError::RecipientNotConfigured(role.to_string()))
    }

    pub fn contains(&self, role: &str) -> bool {
        self.numbers.read().unwrap().contains_key(role)
    }

    pub fn reload(&self) -> EngineResult<usize> {
        let map = Self::load_map(&self.path)?;
        let count = map.len();
        *self.numbers.write().unwrap() = Arc::new(map);
        info!(roles = count, "recipient directory reloaded");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.numbers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn default_general_emergency() -> ProtocolEntry {
    ProtocolEntry {
        severity: Severity::High,
        category: Category::Emergency,
        recipients: vec!["airport_ops".to_string()],
        script: "General emergency declared by {callsign}. Nature: {description}. \
                 Requesting appropriate emergency response coordination."
            .to_string(),
    }
}

/// Built-in catalog used when no protocols file is present.
pub fn builtin_protocols() -> HashMap<String, ProtocolEntry> {
    let mut map = HashMap::new();
    map.insert(
        "engine_failure".to_string(),
        ProtocolEntry {
            severity: Severity::Critical,
            category: Category::Emergency,
            recipients: vec![
                "fire_rescue".to_string(),
                "medical".to_string(),
                "airport_ops".to_string(),
            ],
            script: "Critical emergency for {callsign}. Engine failure reported. Aircraft \
                     attempting emergency landing with {souls} souls on board. Request full \
                     emergency response including fire rescue and medical teams."
                .to_string(),
        },
    );
    map.insert(
        "fire_smoke".to_string(),
        ProtocolEntry {
            severity: Severity::Critical,
            category: Category::Emergency,
            recipients: vec![
                "fire_rescue".to_string(),
                "medical".to_string(),
                "airport_ops".to_string(),
            ],
            script: "Critical emergency for {callsign}. Fire or smoke reported on board with \
                     {souls} souls on board. Request full fire rescue response and medical \
                     standby."
                .to_string(),
        },
    );
    map.insert(
        "hijack".to_string(),
        ProtocolEntry {
            severity: Severity::Critical,
            category: Category::Emergency,
            recipients: vec!["faa_tower".to_string(), "airport_ops".to_string()],
            script: "Security emergency involving {callsign}. Possible unlawful interference \
                     reported at {timestamp}. Notify federal authorities and hold all ground \
                     movement."
                .to_string(),
        },
    );
    map.insert(
        "medical_emergency".to_string(),
        ProtocolEntry {
            severity: Severity::Critical,
            category: Category::Emergency,
            recipients: vec!["medical".to_string(), "airport_ops".to_string()],
            script: "Medical emergency aboard {callsign}. {description}. Immediate medical \
                     response required upon landing. Prepare ambulance and medical personnel."
                .to_string(),
        },
    );
    map.insert(
        "fuel_emergency".to_string(),
        ProtocolEntry {
            severity: Severity::High,
            category: Category::Emergency,
            recipients: vec!["airport_ops".to_string(), "fire_rescue".to_string()],
            script: "Fuel emergency declared by {callsign}. Aircraft requesting priority \
                     handling. Emergency vehicles should be on standby."
                .to_string(),
        },
    );
    map.insert(
        "bird_strike".to_string(),
        ProtocolEntry {
            severity: Severity::High,
            category: Category::Emergency,
            recipients: vec!["airport_ops".to_string(), "fire_rescue".to_string()],
            script: "Emergency alert for {callsign}. Bird strike reported on departure. \
                     Aircraft returning to field with {souls} souls on board. Requesting \
                     immediate runway preparation and emergency vehicles."
                .to_string(),
        },
    );
    map.insert(
        "collision_risk".to_string(),
        ProtocolEntry {
            severity: Severity::Medium,
            category: Category::Warning,
            recipients: vec!["faa_tower".to_string(), "airport_ops".to_string()],
            script: "Traffic conflict alert involving {callsign}. {description}. Requesting \
                     coordination and radar monitoring."
                .to_string(),
        },
    );
    map.insert(
        "wind_shear".to_string(),
        ProtocolEntry {
            severity: Severity::Medium,
            category: Category::Warning,
            recipients: vec!["airport_ops".to_string()],
            script: "Weather hazard report from {callsign}. Wind shear reported at {timestamp}. \
                     Advise arriving and departing traffic."
                .to_string(),
        },
    );
    map.insert(
        "pilot_report".to_string(),
        ProtocolEntry {
            severity: Severity::Low,
            category: Category::Report,
            recipients: vec!["airport_ops".to_string()],
            script: "Pilot report from {callsign} at {timestamp}. {description}.".to_string(),
        },
    );
    map.insert(FALLBACK_PROTOCOL.to_string(), default_general_emergency());
    map
}

/// Built-in recipient directory used when no recipients file is present.
pub fn builtin_recipients() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("fire_rescue".to_string(), "+16505991378".to_string());
    map.insert("medical".to_string(), "+16508215151".to_string());
    map.insert("airport_ops".to_string(), "+16508217014".to_string());
    map.insert("faa_tower".to_string(), "+16508762778".to_string());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin_catalog() -> ProtocolCatalog {
        ProtocolCatalog::load("/nonexistent/protocols.toml").unwrap()
    }

    #[test]
    fn unknown_type_resolves_to_general_emergency() {
        let catalog = builtin_catalog();
        let (key, entry) = catalog.resolve("bespoke_type");
        assert_eq!(key, FALLBACK_PROTOCOL);
        assert!(!entry.recipients.is_empty());
    }

    #[test]
    fn known_type_resolves_to_itself() {
        let catalog = builtin_catalog();
        let (key, entry) = catalog.resolve("engine_failure");
        assert_eq!(key, "engine_failure");
        assert_eq!(entry.recipients[0], "fire_rescue");
        assert_eq!(entry.severity, Severity::Critical);
    }

    #[test]
    fn builtin_catalog_roles_all_resolve() {
        let catalog = builtin_catalog();
        let directory = RecipientDirectory::load("/nonexistent/recipients.toml").unwrap();
        catalog.validate_against(&directory).unwrap();
    }

    #[test]
    fn missing_fallback_entry_is_rejected() {
        let mut map = builtin_protocols();
        map.remove(FALLBACK_PROTOCOL);
        assert!(ProtocolCatalog::validate_entries(&map).is_err());
    }

    #[test]
    fn empty_recipient_list_is_rejected() {
        let mut map = builtin_protocols();
        map.get_mut("pilot_report").unwrap().recipients.clear();
        assert!(ProtocolCatalog::validate_entries(&map).is_err());
    }

    #[test]
    fn unconfigured_role_fails_closed() {
        let directory = RecipientDirectory::load("/nonexistent/recipients.toml").unwrap();
        let err = directory.number_for("coast_guard").unwrap_err();
        assert!(matches!(err, EngineError::RecipientNotConfigured(_)));
    }

    #[test]
    fn reload_from_file_swaps_whole_map() {
        let dir = tempfile::tempdir().unwrap();
        let proto_path = dir.path().join("protocols.toml");
        let rcpt_path = dir.path().join("recipients.toml");
        std::fs::write(
            &rcpt_path,
            "airport_ops = \"+15550001111\"\nfire_rescue = \"+15550002222\"\n",
        )
        .unwrap();
        std::fs::write(
            &proto_path,
            r#"
[general_emergency]
severity = "HIGH"
category = "EMERGENCY"
recipients = ["airport_ops"]
script = "General emergency declared by {callsign}."

[runway_incursion]
severity = "CRITICAL"
category = "EMERGENCY"
recipients = ["airport_ops", "fire_rescue"]
script = "Runway incursion involving {callsign} at {timestamp}."
"#,
        )
        .unwrap();

        let catalog = ProtocolCatalog::load(&proto_path).unwrap();
        let directory = RecipientDirectory::load(&rcpt_path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.lookup("runway_incursion").is_some());

        // A reload that fails validation leaves the old map in effect.
        std::fs::write(&proto_path, "[no_fallback]\nseverity = \"LOW\"\ncategory = \"REPORT\"\nrecipients = [\"airport_ops\"]\nscript = \"x\"\n").unwrap();
        assert!(catalog.reload(&directory).is_err());
        assert_eq!(catalog.len(), 2);
    }
}
