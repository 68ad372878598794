// ============================================================================
// CORRELATION ENGINE
// ============================================================================
// Turns normalized events into findings:
// - ordered rule table, first match wins
// - optional message pattern per rule
// - per-batch repeated-roam aggregation
// - unknown event kinds tallied, never turned into findings
// ============================================================================

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::template::{self, FindingTemplate, RenderContext, TemplateCatalog};
use crate::types::{Finding, FindingCategory, NormalizedEvent, Severity};

/// Kind recorded on repeated-roam findings.
pub const ROAM_FLAP_KIND: &str = "ROAM_FLAP";

/// Event kinds counted as a client roam.
pub const ROAM_KINDS: &[&str] = &["EVT_WU_Roam", "EVT_WU_RoamRadio", "EVT_WG_Roam"];

// ----------------------------------------------------------------------------
// Rule Table
// ----------------------------------------------------------------------------

/// Declarative form of a rule, before its pattern is compiled.
#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub name: &'static str,
    pub kinds: &'static [&'static str],
    pub pattern: Option<&'static str>,
    pub severity: Severity,
    pub category: FindingCategory,
}

const BUILTIN_RULES: &[RuleSpec] = &[
    RuleSpec {
        name: "device_lost_contact",
        kinds: &["EVT_AP_Lost_Contact", "EVT_SW_Lost_Contact", "EVT_GW_Lost_Contact"],
        pattern: None,
        severity: Severity::Severe,
        category: FindingCategory::Connectivity,
    },
    RuleSpec {
        name: "wan_failover",
        kinds: &["EVT_GW_WANTransition", "EVT_GW_Failover"],
        pattern: None,
        severity: Severity::Medium,
        category: FindingCategory::Connectivity,
    },
    RuleSpec {
        name: "device_reconnected",
        kinds: &[
            "EVT_AP_Adopted",
            "EVT_SW_Adopted",
            "EVT_GW_Adopted",
            "EVT_AP_Connected",
            "EVT_SW_Connected",
            "EVT_GW_Connected",
        ],
        pattern: None,
        severity: Severity::Low,
        category: FindingCategory::Connectivity,
    },
    RuleSpec {
        name: "poe_fault",
        kinds: &["EVT_SW_PoeOverload", "EVT_SW_PoeDisconnect"],
        pattern: None,
        severity: Severity::Severe,
        category: FindingCategory::Hardware,
    },
    RuleSpec {
        name: "unexpected_restart",
        kinds: &["EVT_AP_RestartedUnknown", "EVT_SW_RestartedUnknown", "EVT_GW_RestartedUnknown"],
        pattern: None,
        severity: Severity::Medium,
        category: FindingCategory::Hardware,
    },
    RuleSpec {
        name: "firmware_upgraded",
        kinds: &["EVT_AP_Upgraded", "EVT_SW_Upgraded", "EVT_GW_Upgraded"],
        pattern: None,
        severity: Severity::Low,
        category: FindingCategory::Firmware,
    },
    RuleSpec {
        name: "client_roamed",
        kinds: ROAM_KINDS,
        pattern: None,
        severity: Severity::Low,
        category: FindingCategory::Roaming,
    },
    RuleSpec {
        name: "weak_signal_disconnect",
        kinds: &["EVT_WU_Disconnected", "EVT_WG_Disconnected"],
        pattern: Some(r"(?i)signal|rssi"),
        severity: Severity::Medium,
        category: FindingCategory::Wireless,
    },
    RuleSpec {
        name: "channel_changed",
        kinds: &["EVT_AP_ChannelChanged"],
        pattern: None,
        severity: Severity::Low,
        category: FindingCategory::Radio,
    },
    RuleSpec {
        name: "ips_alert",
        kinds: &["EVT_IPS_IpsAlert", "EVT_IPS_IpsBlocked"],
        pattern: None,
        severity: Severity::Severe,
        category: FindingCategory::Security,
    },
    RuleSpec {
        name: "rogue_ap",
        kinds: &["EVT_AP_DetectRogueAP"],
        pattern: None,
        severity: Severity::Medium,
        category: FindingCategory::Security,
    },
    RuleSpec {
        name: "admin_login_failed",
        kinds: &["EVT_AD_LoginFailed"],
        pattern: None,
        severity: Severity::Medium,
        category: FindingCategory::AccessControl,
    },
    RuleSpec {
        name: "admin_login",
        kinds: &["EVT_AD_Login"],
        pattern: None,
        severity: Severity::Low,
        category: FindingCategory::AccessControl,
    },
];

/// A compiled correlation rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: &'static str,
    pub kinds: &'static [&'static str],
    pub pattern: Option<Regex>,
    pub severity: Severity,
    pub category: FindingCategory,
}

impl Rule {
    fn declares(&self, kind: &str) -> bool {
        self.kinds.contains(&kind)
    }

    fn matches(&self, event: &NormalizedEvent) -> bool {
        self.declares(&event.kind)
            && self
                .pattern
                .as_ref()
                .map_or(true, |re| re.is_match(&event.message))
    }
}

/// Ordered rule table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Compile rule specs and check them against `catalog`.
    pub fn compile(specs: &[RuleSpec], catalog: &TemplateCatalog) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let pattern = match spec.pattern {
                Some(p) => Some(Regex::new(p).map_err(|e| ConfigError::InvalidRules {
                    message: format!("rule '{}' has an invalid pattern: {}", spec.name, e),
                })?),
                None => None,
            };
            rules.push(Rule {
                name: spec.name,
                kinds: spec.kinds,
                pattern,
                severity: spec.severity,
                category: spec.category,
            });
        }
        let table = Self { rules };
        table.validate(catalog)?;
        Ok(table)
    }

    pub fn builtin(catalog: &TemplateCatalog) -> Result<Self, ConfigError> {
        Self::compile(BUILTIN_RULES, catalog)
    }

    /// Every rule must declare at least one kind and have a template.
    pub fn validate(&self, catalog: &TemplateCatalog) -> Result<(), ConfigError> {
        for rule in &self.rules {
            if rule.kinds.is_empty() {
                return Err(ConfigError::InvalidRules {
                    message: format!("rule '{}' declares no event kinds", rule.name),
                });
            }
            if !catalog.contains(rule.category, rule.severity) {
                return Err(ConfigError::InvalidRules {
                    message: format!(
                        "rule '{}' has no template for ({}, {})",
                        rule.name, rule.category, rule.severity
                    ),
                });
            }
        }
        Ok(())
    }

    /// First rule whose kind set and pattern both match.
    pub fn find(&self, event: &NormalizedEvent) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(event))
    }

    /// Whether any rule declares `kind`, regardless of pattern.
    pub fn is_known_kind(&self, kind: &str) -> bool {
        self.rules.iter().any(|r| r.declares(kind))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Correlation Engine
// ----------------------------------------------------------------------------

/// Matches events against the rule table and renders findings.
#[derive(Debug)]
pub struct CorrelationEngine {
    rules: RuleTable,
    catalog: TemplateCatalog,
    roam_threshold: usize,
    unknown_kinds: BTreeMap<String, u64>,
}

impl CorrelationEngine {
    /// Engine with the built-in rules and templates.
    pub fn new(roam_threshold: usize) -> Result<Self, ConfigError> {
        let catalog = TemplateCatalog::builtin();
        let rules = RuleTable::builtin(&catalog)?;
        Ok(Self::with_rules(rules, catalog, roam_threshold))
    }

    pub fn with_rules(rules: RuleTable, catalog: TemplateCatalog, roam_threshold: usize) -> Self {
        Self {
            rules,
            catalog,
            roam_threshold: roam_threshold.max(1),
            unknown_kinds: BTreeMap::new(),
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Cumulative count of event kinds no rule declares.
    pub fn unknown_kinds(&self) -> &BTreeMap<String, u64> {
        &self.unknown_kinds
    }

    /// Correlate one batch of events.
    ///
    /// Per-event findings come first in event order, followed by one
    /// repeated-roam finding per flapping subject.
    pub fn analyze(&mut self, events: &[NormalizedEvent]) -> Vec<Finding> {
        let mut findings = Vec::new();

        for event in events {
            match self.rules.find(event) {
                Some(rule) => {
                    if let Some(template) = self.catalog.get(rule.category, rule.severity) {
                        findings.push(finding_from_event(rule, template, event));
                    }
                }
                None if self.rules.is_known_kind(&event.kind) => {
                    debug!(target: "vigil::correlation",
                        kind = %event.kind,
                        event_id = %event.id,
                        "Event matched no rule pattern, skipping");
                }
                None => {
                    *self.unknown_kinds.entry(event.kind.clone()).or_insert(0) += 1;
                    trace!(target: "vigil::correlation", kind = %event.kind, "Unknown event kind");
                }
            }
        }

        findings.extend(self.detect_roam_flapping(events));

        debug!(target: "vigil::correlation",
            events = events.len(),
            findings = findings.len(),
            "Batch correlated");
        findings
    }

    /// One Medium finding per subject with at least `roam_threshold` roams.
    fn detect_roam_flapping(&self, events: &[NormalizedEvent]) -> Vec<Finding> {
        let Some(template) = self.catalog.get(FindingCategory::Roaming, Severity::Medium) else {
            return Vec::new();
        };

        let mut by_subject: BTreeMap<&str, Vec<&NormalizedEvent>> = BTreeMap::new();
        for event in events {
            if !ROAM_KINDS.contains(&event.kind.as_str()) {
                continue;
            }
            if let Some(subject) = event.subject_id.as_deref() {
                by_subject.entry(subject).or_default().push(event);
            }
        }

        by_subject
            .into_iter()
            .filter(|(_, roams)| roams.len() >= self.roam_threshold)
            .filter_map(|(subject, mut roams)| {
                roams.sort_by_key(|e| e.timestamp);
                let first = roams.first()?.timestamp;
                let last = roams.last()?.timestamp;
                let access_points = distinct_access_points(&roams);
                let subject_name = roams
                    .iter()
                    .find_map(|e| e.subject_name.clone())
                    .unwrap_or_else(|| subject.to_string());

                let ctx = RenderContext::new()
                    .with("subject_id", subject)
                    .with("subject_name", subject_name.clone())
                    .with("roam_count", roams.len().to_string())
                    .with("access_points", access_points.join(", "))
                    .with("timestamp", template::format_timestamp(last));

                debug!(target: "vigil::correlation",
                    subject = subject,
                    roams = roams.len(),
                    "Repeated roaming detected");

                Some(
                    render_finding(
                        template,
                        &ctx,
                        Severity::Medium,
                        FindingCategory::Roaming,
                        ROAM_FLAP_KIND,
                        first,
                        last,
                    )
                    .with_subject(Some(subject.to_string()), Some(subject_name))
                    .with_event_ids(roams.iter().map(|e| e.id.clone()).collect())
                    .with_metadata("roam_count", roams.len())
                    .with_metadata("access_points", access_points),
                )
            })
            .collect()
    }
}

fn distinct_access_points(roams: &[&NormalizedEvent]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut ordered = Vec::new();
    for event in roams {
        for key in [["ap_from_name", "ap_from"], ["ap_to_name", "ap_to"]] {
            if let Some(ap) = key.iter().find_map(|k| event.payload_str(k)) {
                if seen.insert(ap.to_string()) {
                    ordered.push(ap.to_string());
                }
            }
        }
    }
    ordered
}

fn render_finding(
    template: &FindingTemplate,
    ctx: &RenderContext,
    severity: Severity,
    category: FindingCategory,
    kind: &str,
    first_seen: chrono::DateTime<chrono::Utc>,
    last_seen: chrono::DateTime<chrono::Utc>,
) -> Finding {
    let finding = Finding::new(
        severity,
        category,
        kind,
        template::render(template.title, ctx),
        template::render(template.description, ctx),
        first_seen,
        last_seen,
    );
    match template.remediation {
        Some(text) => finding.with_remediation(template::render(text, ctx)),
        None => finding,
    }
}

fn finding_from_event(rule: &Rule, template: &FindingTemplate, event: &NormalizedEvent) -> Finding {
    let ctx = RenderContext::for_event(event);
    render_finding(
        template,
        &ctx,
        rule.severity,
        rule.category,
        &event.kind,
        event.timestamp,
        event.timestamp,
    )
    .with_subject(event.subject_id.clone(), event.subject_name.clone())
    .with_event_ids(vec![event.id.clone()])
    .with_metadata("rule", rule.name)
    .with_metadata("origin", event.origin.as_str())
}
