//! Escalation resolver: protocol lookup plus call-script rendering.
//!
//! Rendering is literal placeholder substitution. A placeholder with no
//! available value becomes the explicit `unknown` marker; the rendered script
//! never contains a raw `{...}` token. Recipients come back in
//! protocol-declared priority order — the state machine walks them one at a
//! time, never fanning out.

use crate::error::EngineResult;
use crate::protocol::ProtocolCatalog;
use crate::shared::EmergencyAlert;
use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;

/// Marker substituted for any placeholder with no available value.
pub const UNKNOWN_MARKER: &str = "unknown";

/// Resolved escalation for one alert: who to call, in order, and what to say.
#[derive(Debug, Clone)]
pub struct EscalationPlan {
    /// Recipient roles in protocol priority order. Never empty.
    pub recipients: Vec<String>,
    pub script: String,
    /// Catalog key actually used (the fallback key when the alert's type had
    /// no entry).
    pub protocol_key: String,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").expect("static regex"))
}

fn souls_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*souls").expect("static regex"))
}

/// Extract a souls-on-board count from free text ("180 souls on board").
pub fn extract_souls(text: &str) -> Option<u32> {
    souls_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Resolve the alert's protocol and render its call script.
pub fn resolve(catalog: &ProtocolCatalog, alert: &EmergencyAlert) -> EngineResult<EscalationPlan> {
    let (protocol_key, entry) = catalog.resolve(&alert.emergency_type);
    let script = render_script(&entry.script, alert);
    Ok(EscalationPlan {
        recipients: entry.recipients,
        script,
        protocol_key,
    })
}

/// Literal substitution of `{callsign}`, `{description}`, `{souls}`, and
/// `{timestamp}`; anything else in braces becomes `unknown`. The original ATC
/// transmission is appended for the call recipient's context.
pub fn render_script(template: &str, alert: &EmergencyAlert) -> String {
    let souls = alert
        .souls
        .or_else(|| extract_souls(&alert.original_message));
    let timestamp = Utc::now().format("%H:%M UTC").to_string();

    let mut script = placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = caps[0].trim_start_matches('{').trim_end_matches('}').trim();
            match token {
                "callsign" => alert
                    .callsign
                    .clone()
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| UNKNOWN_MARKER.to_string()),
                "description" => {
                    if alert.description.is_empty() {
                        UNKNOWN_MARKER.to_string()
                    } else {
                        alert.description.clone()
                    }
                }
                "souls" => souls
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| UNKNOWN_MARKER.to_string()),
                "timestamp" => timestamp.clone(),
                _ => UNKNOWN_MARKER.to_string(),
            }
        })
        .into_owned();

    if !alert.original_message.is_empty() {
        script.push_str(" Original ATC communication: ");
        script.push_str(&alert.original_message);
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{AlertStatus, Category, Severity};
    use chrono::Utc;

    fn alert(emergency_type: &str, callsign: Option<&str>, original: &str) -> EmergencyAlert {
        let now = Utc::now();
        EmergencyAlert {
            id: crate::shared::new_alert_id(now),
            source_message_id: None,
            source_timestamp: None,
            callsign: callsign.map(str::to_string),
            emergency_type: emergency_type.to_string(),
            severity: Severity::High,
            category: Category::Emergency,
            description: "Bird Strike detected".to_string(),
            original_message: original.to_string(),
            confidence: 0.8,
            status: AlertStatus::Active,
            acknowledged: false,
            escalated: false,
            souls: None,
            created_by: "test".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn catalog() -> ProtocolCatalog {
        ProtocolCatalog::load("/nonexistent/protocols.toml").unwrap()
    }

    #[test]
    fn souls_count_is_rendered_from_original_message() {
        let a = alert(
            "bird_strike",
            Some("AAL445"),
            "American 445, EMERGENCY, bird strike on departure, returning to field, 180 souls on board",
        );
        let plan = resolve(&catalog(), &a).unwrap();
        assert!(plan.script.contains("180"), "script: {}", plan.script);
        assert!(!plan.script.contains(UNKNOWN_MARKER));
        assert!(plan.script.contains("AAL445"));
    }

    #[test]
    fn missing_fields_become_unknown_never_raw_placeholders() {
        let a = alert("bird_strike", None, "");
        let plan = resolve(&catalog(), &a).unwrap();
        assert!(plan.script.contains(UNKNOWN_MARKER));
        assert!(!plan.script.contains('{'), "script: {}", plan.script);
        assert!(!plan.script.contains('}'));
    }

    #[test]
    fn every_builtin_template_renders_without_raw_placeholders() {
        let cat = catalog();
        for key in crate::protocol::builtin_protocols().keys() {
            let a = alert(key, Some("UAL123"), "test transmission");
            let plan = resolve(&cat, &a).unwrap();
            assert!(
                !plan.script.contains('{') && !plan.script.contains('}'),
                "protocol '{}' left raw placeholders: {}",
                key,
                plan.script
            );
        }
    }

    #[test]
    fn unknown_placeholder_names_render_as_unknown() {
        let a = alert("bird_strike", Some("UAL1"), "msg");
        let rendered = render_script("Status {frobnicator} for {callsign}", &a);
        assert!(rendered.contains("Status unknown for UAL1"));
    }

    #[test]
    fn unknown_type_uses_fallback_recipients_not_empty_list() {
        let a = alert("bespoke_type", Some("UAL1"), "msg");
        let plan = resolve(&catalog(), &a).unwrap();
        assert_eq!(plan.protocol_key, "general_emergency");
        assert!(!plan.recipients.is_empty());
    }

    #[test]
    fn souls_extraction_parses_count() {
        assert_eq!(extract_souls("298 souls on board"), Some(298));
        assert_eq!(extract_souls("180 SOULS aboard"), Some(180));
        assert_eq!(extract_souls("no count given"), None);
    }

    #[test]
    fn explicit_souls_hint_wins_over_message_text() {
        let mut a = alert("bird_strike", Some("UAL1"), "140 souls on board");
        a.souls = Some(152);
        let rendered = render_script("{souls} souls", &a);
        assert!(rendered.starts_with("152 souls"));
    }
}
