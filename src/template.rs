// ============================================================================
// FINDING TEMPLATES
// ============================================================================
// Static (category, severity) -> template table plus the safe formatter:
// - `{name}` placeholders, `{{` / `}}` escapes
// - a missing value renders as the fixed `Unknown` token
// - a template that cannot be parsed is returned verbatim
// ============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{FindingCategory, NormalizedEvent, Severity};
use crate::UNKNOWN_TOKEN;

/// Title, description and remediation text for one kind of finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindingTemplate {
    pub title: &'static str,
    pub description: &'static str,
    pub remediation: Option<&'static str>,
}

/// Key into the template catalog.
pub type TemplateKey = (FindingCategory, Severity);

const CATALOG: &[(FindingCategory, Severity, FindingTemplate)] = &[
    (
        FindingCategory::Connectivity,
        Severity::Severe,
        FindingTemplate {
            title: "{device_name} lost contact with the controller",
            description: "{device_name} ({subject_id}) stopped reporting at {timestamp}. Clients behind it may be offline.",
            remediation: Some("Check power and uplink cabling for {device_name}, then confirm it can reach the controller's inform URL."),
        },
    ),
    (
        FindingCategory::Connectivity,
        Severity::Medium,
        FindingTemplate {
            title: "WAN failover on {device_name}",
            description: "{message} (at {timestamp}).",
            remediation: Some("Review the primary WAN link and ISP status; traffic is running on the backup path."),
        },
    ),
    (
        FindingCategory::Connectivity,
        Severity::Low,
        FindingTemplate {
            title: "{device_name} reconnected",
            description: "{message} (at {timestamp}).",
            remediation: None,
        },
    ),
    (
        FindingCategory::Hardware,
        Severity::Severe,
        FindingTemplate {
            title: "PoE fault on {device_name}",
            description: "{message} (at {timestamp}).",
            remediation: Some("Check the PoE budget of {device_name} and the power draw of attached devices; reseat or replace the affected cable."),
        },
    ),
    (
        FindingCategory::Hardware,
        Severity::Medium,
        FindingTemplate {
            title: "{device_name} restarted unexpectedly",
            description: "{device_name} ({subject_id}) restarted without an administrator request at {timestamp}.",
            remediation: Some("Check the power source of {device_name}; repeated restarts can point at failing hardware or an unstable firmware build."),
        },
    ),
    (
        FindingCategory::Firmware,
        Severity::Low,
        FindingTemplate {
            title: "Firmware upgraded on {device_name}",
            description: "{message} (at {timestamp}).",
            remediation: None,
        },
    ),
    (
        FindingCategory::Wireless,
        Severity::Medium,
        FindingTemplate {
            title: "{subject_name} disconnected with {signal_quality} signal",
            description: "{subject_name} ({subject_id}) dropped off {ssid} at {timestamp}; last signal quality was {signal_quality}.",
            remediation: Some("Move the client closer to an access point or adjust transmit power and placement to improve coverage."),
        },
    ),
    (
        FindingCategory::Radio,
        Severity::Low,
        FindingTemplate {
            title: "{device_name} changed channel on {band}",
            description: "{device_name} moved to channel {channel} on the {band} band at {timestamp}.",
            remediation: None,
        },
    ),
    (
        FindingCategory::Roaming,
        Severity::Low,
        FindingTemplate {
            title: "{subject_name} roamed",
            description: "{subject_name} roamed from {ap_from} to {ap_to} at {timestamp}.",
            remediation: None,
        },
    ),
    (
        FindingCategory::Roaming,
        Severity::Medium,
        FindingTemplate {
            title: "{subject_name} is roaming repeatedly",
            description: "{subject_name} ({subject_id}) roamed {roam_count} times between {access_points}.",
            remediation: Some("Overlapping coverage with similar signal strength causes flapping; lower transmit power on neighbouring APs or raise the minimum RSSI."),
        },
    ),
    (
        FindingCategory::Security,
        Severity::Severe,
        FindingTemplate {
            title: "Intrusion prevention alert from {ip}",
            description: "{message} (at {timestamp}).",
            remediation: Some("Review the threat management log for {ip} and block the address if the traffic is not expected."),
        },
    ),
    (
        FindingCategory::Security,
        Severity::Medium,
        FindingTemplate {
            title: "Rogue access point detected",
            description: "{message} (at {timestamp}).",
            remediation: Some("Locate the rogue access point broadcasting near {device_name} and remove it, or mark it as a known neighbour."),
        },
    ),
    (
        FindingCategory::AccessControl,
        Severity::Medium,
        FindingTemplate {
            title: "Failed administrator login from {ip}",
            description: "{message} (at {timestamp}).",
            remediation: Some("Confirm the attempt was legitimate; repeated failures from {ip} should be blocked at the firewall."),
        },
    ),
    (
        FindingCategory::AccessControl,
        Severity::Low,
        FindingTemplate {
            title: "Administrator login from {ip}",
            description: "{message} (at {timestamp}).",
            remediation: None,
        },
    ),
];

/// Lookup table of finding templates.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: HashMap<TemplateKey, FindingTemplate>,
}

impl TemplateCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        Self::from_entries(CATALOG.iter().map(|(c, s, t)| ((*c, *s), *t)))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (TemplateKey, FindingTemplate)>) -> Self {
        Self {
            templates: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, category: FindingCategory, severity: Severity) -> Option<&FindingTemplate> {
        self.templates.get(&(category, severity))
    }

    pub fn contains(&self, category: FindingCategory, severity: Severity) -> bool {
        self.templates.contains_key(&(category, severity))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

// ----------------------------------------------------------------------------
// Render Context
// ----------------------------------------------------------------------------

/// Named values available to a template.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    values: HashMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Context for a single event.
    pub fn for_event(event: &NormalizedEvent) -> Self {
        let mut ctx = Self::new();
        ctx.set("message", event.message.clone());
        ctx.set("event_kind", event.kind.clone());
        ctx.set("timestamp", format_timestamp(event.timestamp));

        if let Some(id) = &event.subject_id {
            ctx.set("subject_id", id.clone());
        }
        let display = event.subject_name.clone().or_else(|| event.subject_id.clone());
        if let Some(name) = display {
            ctx.set("subject_name", name.clone());
            ctx.set("device_name", name);
        }

        if let Some(rssi) = event.payload_i64("rssi").or_else(|| event.payload_i64("signal")) {
            ctx.set("signal_quality", signal_quality(rssi));
        }
        if let Some(radio) = event.payload_str("radio").or_else(|| event.payload_str("radio_to")) {
            ctx.set("band", band_name(radio));
        }
        if let Some(channel) = event.payload_i64("channel").or_else(|| event.payload_i64("channel_to")) {
            ctx.set("channel", channel.to_string());
        }
        for (key, sources) in [
            ("ssid", &["ssid", "essid"][..]),
            ("ap_from", &["ap_from_name", "ap_from"][..]),
            ("ap_to", &["ap_to_name", "ap_to"][..]),
            ("ip", &["ip", "src_ip", "client_ip"][..]),
        ] {
            if let Some(v) = sources.iter().find_map(|k| event.payload_str(k)) {
                ctx.set(key, v);
            }
        }
        ctx
    }
}

/// Timestamp format used in rendered text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Describe a received signal strength in dBm.
pub fn signal_quality(rssi: i64) -> &'static str {
    match rssi {
        r if r >= -50 => "Excellent",
        r if r >= -60 => "Good",
        r if r >= -70 => "Fair",
        _ => "Poor",
    }
}

/// Human name of a controller radio identifier.
pub fn band_name(radio: &str) -> String {
    match radio {
        "ng" => "2.4 GHz".into(),
        "na" => "5 GHz".into(),
        "6e" => "6 GHz".into(),
        other => other.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Safe Formatter
// ----------------------------------------------------------------------------

/// Render `template` against `ctx`.
///
/// Never fails: unknown placeholders become [`UNKNOWN_TOKEN`] and a
/// structurally invalid template is returned unchanged.
pub fn render(template: &str, ctx: &RenderContext) -> String {
    try_render(template, ctx).unwrap_or_else(|| template.to_string())
}

fn try_render(template: &str, ctx: &RenderContext) -> Option<String> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        '{' => return None,
                        ch => name.push(ch),
                    }
                }
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                out.push_str(ctx.get(name).unwrap_or(UNKNOWN_TOKEN));
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return None,
            ch => out.push(ch),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventOrigin;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_render_substitutes_and_defaults() {
        let ctx = RenderContext::new().with("device_name", "Office AP");
        assert_eq!(render("{device_name} is down", &ctx), "Office AP is down");
        assert_eq!(render("{device_name} / {ssid}", &ctx), "Office AP / Unknown");
        assert_eq!(render("literal {{braces}}", &ctx), "literal {braces}");
    }

    #[rstest]
    #[case("unclosed {device_name")]
    #[case("stray } brace")]
    #[case("empty {} placeholder")]
    #[case("nested {a{b}}")]
    fn test_render_invalid_template_is_verbatim(#[case] template: &str) {
        let ctx = RenderContext::new().with("device_name", "x");
        assert_eq!(render(template, &ctx), template);
    }

    #[rstest]
    #[case(-45, "Excellent")]
    #[case(-50, "Excellent")]
    #[case(-58, "Good")]
    #[case(-70, "Fair")]
    #[case(-71, "Poor")]
    fn test_signal_quality(#[case] rssi: i64, #[case] expected: &str) {
        assert_eq!(signal_quality(rssi), expected);
    }

    #[test]
    fn test_event_context() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let payload = json!({"rssi": -66, "radio": "na", "channel": "44", "essid": "corp"});
        let ev = NormalizedEvent::new(EventOrigin::Api, "EVT_WU_Disconnected", "gone", ts)
            .with_subject(Some("aa:bb".into()), None)
            .with_payload(payload.as_object().cloned().unwrap_or_default());

        let ctx = RenderContext::for_event(&ev);
        assert_eq!(ctx.get("signal_quality"), Some("Fair"));
        assert_eq!(ctx.get("band"), Some("5 GHz"));
        assert_eq!(ctx.get("channel"), Some("44"));
        assert_eq!(ctx.get("ssid"), Some("corp"));
        assert_eq!(ctx.get("subject_name"), Some("aa:bb"));
        assert_eq!(ctx.get("timestamp"), Some("2024-05-01 09:30:00 UTC"));
        assert_eq!(ctx.get("ip"), None);
    }

    #[test]
    fn test_builtin_catalog_keys_are_unique() {
        let catalog = TemplateCatalog::builtin();
        assert_eq!(catalog.len(), CATALOG.len());
        assert!(catalog.contains(FindingCategory::Roaming, Severity::Medium));
        assert!(!catalog.contains(FindingCategory::Firmware, Severity::Severe));
    }
}
