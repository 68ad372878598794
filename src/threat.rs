// ============================================================================
// THREAT AGGREGATOR
// ============================================================================
// Summarizes IDS/IPS matches:
// - per-signature summaries, blocked and detected kept apart
// - per-source-address totals above a minimum threshold
// - internal/external locality for every reported address
// - a detection-mode note when nothing in the batch was blocked
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{SecurityEvent, Severity};
use crate::{DEFAULT_SOURCE_THRESHOLD, MAX_SAMPLE_SIGNATURES, PREMIUM_SIGNATURE_RANGE};

/// Note attached when the appliance only detects and never blocks.
pub const DETECTION_MODE_NOTE: &str = "No threats were blocked in this period. The intrusion \
    system appears to be running in detection-only mode; switch it to prevention to block \
    matching traffic automatically.";

// ----------------------------------------------------------------------------
// Category Table
// ----------------------------------------------------------------------------

/// Friendly naming for a signature category token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreatCategoryInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub remediation: &'static str,
}

const GENERIC_CATEGORY: ThreatCategoryInfo = ThreatCategoryInfo {
    name: "Other Threat",
    description: "Traffic matched an intrusion signature outside the common categories.",
    remediation: "Review the signature details and the hosts involved to decide whether the traffic is expected.",
};

const CATEGORY_TABLE: &[(&str, ThreatCategoryInfo)] = &[
    ("SCAN", ThreatCategoryInfo {
        name: "Network Scanning",
        description: "Hosts or ports were probed to discover reachable services.",
        remediation: "Confirm the probed services need to be exposed and restrict them with firewall rules.",
    }),
    ("POLICY", ThreatCategoryInfo {
        name: "Policy Violation",
        description: "Traffic that breaks common acceptable-use policy, such as remote access tools or unapproved software.",
        remediation: "Identify the internal host and confirm the application is approved on this network.",
    }),
    ("MALWARE", ThreatCategoryInfo {
        name: "Malware",
        description: "Traffic consistent with known malicious software.",
        remediation: "Isolate the internal host and run a full malware scan.",
    }),
    ("TROJAN", ThreatCategoryInfo {
        name: "Trojan Activity",
        description: "Command-and-control or payload traffic from a trojan.",
        remediation: "Isolate the internal host immediately and reimage it if the infection is confirmed.",
    }),
    ("EXPLOIT", ThreatCategoryInfo {
        name: "Exploit Attempt",
        description: "An attempt to exploit a known software vulnerability.",
        remediation: "Patch the targeted service and confirm it is not exposed more widely than necessary.",
    }),
    ("DOS", ThreatCategoryInfo {
        name: "Denial of Service",
        description: "Traffic patterns aimed at exhausting a service or link.",
        remediation: "Rate-limit or block the offending sources upstream and check service health.",
    }),
    ("WEB_SERVER", ThreatCategoryInfo {
        name: "Web Server Attack",
        description: "Requests targeting weaknesses in web server software.",
        remediation: "Keep the web server patched and place it behind a web application firewall.",
    }),
    ("WEB_SPECIFIC_APPS", ThreatCategoryInfo {
        name: "Web Application Attack",
        description: "Requests targeting a specific web application.",
        remediation: "Update the targeted application and restrict its admin interfaces.",
    }),
    ("P2P", ThreatCategoryInfo {
        name: "Peer-to-Peer",
        description: "File sharing or other peer-to-peer traffic.",
        remediation: "Block peer-to-peer applications if they are not permitted on this network.",
    }),
    ("TOR", ThreatCategoryInfo {
        name: "Tor Network",
        description: "Traffic to or from known Tor relays.",
        remediation: "Block Tor exit and relay addresses unless anonymized access is required.",
    }),
    ("DROP", ThreatCategoryInfo {
        name: "Known Bad Network",
        description: "Traffic involving address space on the Spamhaus DROP list.",
        remediation: "Block the listed networks at the edge.",
    }),
    ("CINS", ThreatCategoryInfo {
        name: "Poor Reputation Address",
        description: "Traffic involving an address with a poor reputation score.",
        remediation: "Block the address at the edge if repeated activity is observed.",
    }),
    ("COMPROMISED", ThreatCategoryInfo {
        name: "Compromised Host",
        description: "Traffic involving an address known to be compromised.",
        remediation: "Block the address and check internal hosts that communicated with it.",
    }),
    ("HUNTING", ThreatCategoryInfo {
        name: "Threat Hunting",
        description: "Indicators that warrant investigation but are not conclusive on their own.",
        remediation: "Correlate with other activity from the same host before acting.",
    }),
    ("INFO", ThreatCategoryInfo {
        name: "Informational",
        description: "Low-risk traffic worth being aware of.",
        remediation: "No action needed unless the activity is unexpected.",
    }),
    ("USER_AGENTS", ThreatCategoryInfo {
        name: "Suspicious User Agent",
        description: "HTTP requests carrying a user agent associated with malicious tools.",
        remediation: "Identify the internal client issuing the requests and check it for unwanted software.",
    }),
    ("DNS", ThreatCategoryInfo {
        name: "Suspicious DNS",
        description: "DNS lookups for domains associated with malicious activity.",
        remediation: "Check the querying host and consider DNS filtering.",
    }),
];

/// Look up friendly naming for a category token, falling back to a generic entry.
pub fn category_info(token: &str) -> &'static ThreatCategoryInfo {
    CATEGORY_TABLE
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(token))
        .map(|(_, info)| info)
        .unwrap_or(&GENERIC_CATEGORY)
}

fn is_known_token(token: &str) -> bool {
    CATEGORY_TABLE.iter().any(|(t, _)| t.eq_ignore_ascii_case(token))
}

/// Category token of an event: the raw category when it names a known
/// token, else the signature's second word (`ET SCAN ...` -> `SCAN`).
pub fn category_token(event: &SecurityEvent) -> String {
    let raw = event
        .category
        .as_deref()
        .map(|c| c.trim().to_uppercase().replace([' ', '-'], "_"))
        .filter(|c| !c.is_empty());
    let from_signature = event
        .signature
        .split_whitespace()
        .nth(1)
        .map(|t| t.to_uppercase());

    match (raw, from_signature) {
        (Some(r), _) if is_known_token(&r) => r,
        (_, Some(s)) if is_known_token(&s) => s,
        (Some(r), _) => r,
        (None, Some(s)) => s,
        (None, None) => "UNKNOWN".into(),
    }
}

/// Whether `ip` belongs to private, loopback or link-local address space.
pub fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal_v4(&v4),
            None => is_internal_v6(v6),
        },
    }
}

fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn is_internal_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

pub fn is_premium_signature(signature_id: Option<u64>) -> bool {
    signature_id.map_or(false, |id| PREMIUM_SIGNATURE_RANGE.contains(&id))
}

// ----------------------------------------------------------------------------
// Report Types
// ----------------------------------------------------------------------------

/// One distinct signature within the blocked or detected group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatSummary {
    pub signature: String,
    pub signature_id: Option<u64>,
    pub category: String,
    pub description: String,
    pub remediation: String,
    pub count: usize,
    /// Numerically lowest priority seen
    pub priority: u8,
    pub severity: Severity,
    pub source_ips: Vec<IpAddr>,
    pub is_premium: bool,
    pub premium_count: usize,
}

/// Activity attributed to one source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceIpSummary {
    pub ip: IpAddr,
    pub total: usize,
    pub categories: BTreeMap<String, usize>,
    pub is_internal: bool,
    pub sample_signatures: Vec<String>,
}

/// Aggregated view of one batch of security events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatReport {
    pub total_events: usize,
    pub blocked_count: usize,
    pub detected_count: usize,
    pub blocked: Vec<ThreatSummary>,
    pub detected: Vec<ThreatSummary>,
    pub internal_sources: Vec<SourceIpSummary>,
    pub external_sources: Vec<SourceIpSummary>,
    pub mode_note: Option<String>,
}

impl ThreatReport {
    pub fn is_empty(&self) -> bool {
        self.total_events == 0
    }
}

// ----------------------------------------------------------------------------
// Aggregator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ThreatAggregator {
    source_threshold: usize,
}

impl ThreatAggregator {
    pub fn new(source_threshold: usize) -> Self {
        Self {
            source_threshold: source_threshold.max(1),
        }
    }

    pub fn source_threshold(&self) -> usize {
        self.source_threshold
    }

    /// Aggregate a batch. Events repeated under the same id count once.
    pub fn aggregate(&self, events: &[SecurityEvent]) -> ThreatReport {
        let mut seen = HashSet::new();
        let unique: Vec<&SecurityEvent> = events.iter().filter(|e| seen.insert(e.id.as_str())).collect();

        let (blocked, detected): (Vec<&SecurityEvent>, Vec<&SecurityEvent>) =
            unique.iter().copied().partition(|e| e.is_blocked());
        let (internal_sources, external_sources) = self.summarize_sources(&unique);

        let report = ThreatReport {
            total_events: unique.len(),
            blocked_count: blocked.len(),
            detected_count: detected.len(),
            blocked: summarize_signatures(&blocked),
            detected: summarize_signatures(&detected),
            internal_sources,
            external_sources,
            mode_note: (!unique.is_empty() && blocked.is_empty()).then(|| DETECTION_MODE_NOTE.to_string()),
        };

        debug!(target: "vigil::threat",
            events = report.total_events,
            blocked = report.blocked_count,
            signatures = report.blocked.len() + report.detected.len(),
            sources = report.internal_sources.len() + report.external_sources.len(),
            "Threats aggregated");
        report
    }

    fn summarize_sources(
        &self,
        events: &[&SecurityEvent],
    ) -> (Vec<SourceIpSummary>, Vec<SourceIpSummary>) {
        let mut by_ip: BTreeMap<IpAddr, Vec<&SecurityEvent>> = BTreeMap::new();
        for &event in events {
            if let Some(ip) = event.src_ip {
                by_ip.entry(ip).or_default().push(event);
            }
        }

        let mut survivors: Vec<SourceIpSummary> = by_ip
            .into_iter()
            .filter(|(_, group)| group.len() >= self.source_threshold)
            .map(|(ip, group)| {
                let mut categories = BTreeMap::new();
                let mut samples: Vec<String> = Vec::new();
                for event in &group {
                    let name = category_info(&category_token(event)).name.to_string();
                    *categories.entry(name).or_insert(0) += 1;
                    if samples.len() < MAX_SAMPLE_SIGNATURES && !samples.contains(&event.signature) {
                        samples.push(event.signature.clone());
                    }
                }
                SourceIpSummary {
                    ip,
                    total: group.len(),
                    categories,
                    is_internal: is_internal(&ip),
                    sample_signatures: samples,
                }
            })
            .collect();

        survivors.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.ip.cmp(&b.ip)));
        survivors.into_iter().partition(|s| s.is_internal)
    }
}

impl Default for ThreatAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_THRESHOLD)
    }
}

fn summarize_signatures(events: &[&SecurityEvent]) -> Vec<ThreatSummary> {
    let mut groups: BTreeMap<&str, Vec<&SecurityEvent>> = BTreeMap::new();
    for &event in events {
        groups.entry(event.signature.as_str()).or_default().push(event);
    }

    let mut summaries: Vec<ThreatSummary> = groups
        .into_iter()
        .map(|(signature, group)| {
            let priority = group.iter().map(|e| e.priority).min().unwrap_or(u8::MAX);
            let sources: BTreeSet<IpAddr> = group.iter().filter_map(|e| e.src_ip).collect();
            let signature_id = group.iter().find_map(|e| e.signature_id);
            let premium_count = group
                .iter()
                .filter(|e| is_premium_signature(e.signature_id))
                .count();
            let info = category_info(&category_token(group[0]));

            ThreatSummary {
                signature: signature.to_string(),
                signature_id,
                category: info.name.to_string(),
                description: info.description.to_string(),
                remediation: info.remediation.to_string(),
                count: group.len(),
                priority,
                severity: Severity::from_ids_priority(priority),
                source_ips: sources.into_iter().collect(),
                is_premium: premium_count > 0,
                premium_count,
            }
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.signature.cmp(&b.signature)));
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThreatAction;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn sec(id: usize, signature: &str, src: &str, action: ThreatAction) -> SecurityEvent {
        SecurityEvent {
            id: format!("store:{}", id),
            timestamp: Utc::now(),
            signature: signature.into(),
            signature_id: Some(2_010_937),
            category: None,
            priority: 2,
            src_ip: src.parse().ok(),
            dst_ip: None,
            action,
        }
    }

    #[rstest]
    #[case("10.1.2.3", true)]
    #[case("172.16.0.1", true)]
    #[case("192.168.1.1", true)]
    #[case("127.0.0.1", true)]
    #[case("169.254.10.1", true)]
    #[case("8.8.8.8", false)]
    #[case("172.32.0.1", false)]
    #[case("fd00::1", true)]
    #[case("fe80::1", true)]
    #[case("::1", true)]
    #[case("2001:4860:4860::8888", false)]
    #[case("::ffff:192.168.0.1", true)]
    fn test_locality(#[case] ip: &str, #[case] internal: bool) {
        let ip: IpAddr = ip.parse().unwrap();
        assert_eq!(is_internal(&ip), internal);
    }

    #[test]
    fn test_source_threshold() {
        let agg = ThreatAggregator::new(10);
        let over: Vec<_> = (0..15)
            .map(|i| sec(i, "ET SCAN Nmap", "203.0.113.9", ThreatAction::Blocked))
            .collect();
        let report = agg.aggregate(&over);
        assert_eq!(report.external_sources.len(), 1);
        assert_eq!(report.external_sources[0].total, 15);
        assert!(report.internal_sources.is_empty());

        let under: Vec<_> = (0..5)
            .map(|i| sec(i, "ET SCAN Nmap", "203.0.113.9", ThreatAction::Blocked))
            .collect();
        let report = agg.aggregate(&under);
        assert!(report.external_sources.is_empty());
        assert!(report.internal_sources.is_empty());
    }

    #[test]
    fn test_same_signature_two_addresses() {
        let agg = ThreatAggregator::default();
        let report = agg.aggregate(&[
            sec(1, "ET SCAN Suspicious inbound to mySQL port 3306", "203.0.113.1", ThreatAction::Blocked),
            sec(2, "ET SCAN Suspicious inbound to mySQL port 3306", "203.0.113.2", ThreatAction::Blocked),
        ]);
        assert_eq!(report.blocked.len(), 1);
        let summary = &report.blocked[0];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.source_ips.len(), 2);
        assert_eq!(summary.category, "Network Scanning");
        assert_eq!(summary.severity, Severity::Medium);
        assert!(report.mode_note.is_none());
    }

    #[test]
    fn test_blocked_and_detected_never_mix() {
        let agg = ThreatAggregator::default();
        let mut worst = sec(3, "ET POLICY curl", "10.0.0.2", ThreatAction::Detected);
        worst.priority = 1;
        let report = agg.aggregate(&[
            sec(1, "ET POLICY curl", "10.0.0.2", ThreatAction::Blocked),
            sec(2, "ET POLICY curl", "10.0.0.2", ThreatAction::Detected),
            worst,
        ]);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].count, 1);
        assert_eq!(report.detected.len(), 1);
        assert_eq!(report.detected[0].count, 2);
        assert_eq!(report.detected[0].priority, 1);
        assert_eq!(report.detected[0].severity, Severity::Severe);
    }

    #[test]
    fn test_detection_mode_note() {
        let agg = ThreatAggregator::default();
        let report = agg.aggregate(&[sec(1, "ET INFO x", "10.0.0.2", ThreatAction::Detected)]);
        assert_eq!(report.mode_note.as_deref(), Some(DETECTION_MODE_NOTE));

        assert!(agg.aggregate(&[]).mode_note.is_none());
    }

    #[test]
    fn test_premium_and_duplicate_ids() {
        let agg = ThreatAggregator::default();
        let mut premium = sec(1, "ETPRO TROJAN Beacon", "10.0.0.9", ThreatAction::Blocked);
        premium.signature_id = Some(2_800_123);
        let report = agg.aggregate(&[premium.clone(), premium]);
        assert_eq!(report.total_events, 1);
        assert!(report.blocked[0].is_premium);
        assert_eq!(report.blocked[0].premium_count, 1);
        assert_eq!(report.blocked[0].category, "Trojan Activity");
    }

    #[test]
    fn test_category_token_resolution() {
        let mut ev = sec(1, "ET WEB_SERVER Possible SQLi", "1.2.3.4", ThreatAction::Detected);
        assert_eq!(category_token(&ev), "WEB_SERVER");
        ev.category = Some("Malware".into());
        assert_eq!(category_token(&ev), "MALWARE");
        ev.category = Some("Attempted Information Leak".into());
        assert_eq!(category_token(&ev), "WEB_SERVER");
        assert_eq!(category_info("nonsense").name, GENERIC_CATEGORY.name);
    }

    #[test]
    fn test_sources_sorted_and_sampled() {
        let agg = ThreatAggregator::new(2);
        let mut events = Vec::new();
        for (i, sig) in ["ET SCAN a", "ET SCAN b", "ET DOS c", "ET SCAN d"].iter().enumerate() {
            events.push(sec(i, sig, "192.168.1.50", ThreatAction::Blocked));
        }
        events.push(sec(10, "ET SCAN a", "192.168.1.60", ThreatAction::Blocked));
        events.push(sec(11, "ET SCAN a", "192.168.1.60", ThreatAction::Blocked));

        let report = agg.aggregate(&events);
        assert_eq!(report.internal_sources.len(), 2);
        let top = &report.internal_sources[0];
        assert_eq!(top.total, 4);
        assert_eq!(top.sample_signatures.len(), MAX_SAMPLE_SIGNATURES);
        assert_eq!(top.categories.get("Network Scanning"), Some(&3));
        assert_eq!(top.categories.get("Denial of Service"), Some(&1));
    }
}
