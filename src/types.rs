// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The data types flowing through the engine:
// - NormalizedEvent: one occurrence, whatever channel it came from
// - BufferedEvent: the raw realtime record held by the event buffer
// - Finding: a correlated, user-facing record
// - SecurityEvent: one IDS/IPS match feeding the threat aggregator
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Opaque key-value payload carried alongside events and findings.
pub type Payload = Map<String, JsonValue>;

// ----------------------------------------------------------------------------
// Severity
// ----------------------------------------------------------------------------

/// Severity level for findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    /// Informational, worth knowing about
    Low = 0,
    /// Should be addressed soon
    Medium = 1,
    /// Needs attention now
    Severe = 2,
}

impl Severity {
    /// All severities, lowest first.
    pub const ALL: [Severity; 3] = [Severity::Low, Severity::Medium, Severity::Severe];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::Severe => "severe",
        }
    }

    /// Map an IDS rule priority (1 = most severe) onto a finding severity.
    pub fn from_ids_priority(priority: u8) -> Self {
        match priority {
            0 | 1 => Severity::Severe,
            2 => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Low
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Finding Category
// ----------------------------------------------------------------------------

/// What area of the network a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    /// Devices losing or regaining contact with the controller
    Connectivity,
    /// Power, PoE and unexpected restarts
    Hardware,
    /// Firmware upgrades
    Firmware,
    /// Client association quality
    Wireless,
    /// Radio channel and band changes
    Radio,
    /// Client roaming behaviour
    Roaming,
    /// Intrusion and rogue-device detection
    Security,
    /// Administrator logins
    AccessControl,
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::Connectivity => "connectivity",
            FindingCategory::Hardware => "hardware",
            FindingCategory::Firmware => "firmware",
            FindingCategory::Wireless => "wireless",
            FindingCategory::Radio => "radio",
            FindingCategory::Roaming => "roaming",
            FindingCategory::Security => "security",
            FindingCategory::AccessControl => "access_control",
        }
    }
}

impl Display for FindingCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Event Origin
// ----------------------------------------------------------------------------

/// The acquisition channel an event arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Push stream drained from the background worker
    Realtime,
    /// Controller HTTP API polling
    Api,
    /// Log files read over a remote shell
    Shell,
    /// Direct query against the controller's data store
    Store,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Realtime => "realtime",
            EventOrigin::Api => "api",
            EventOrigin::Shell => "shell",
            EventOrigin::Store => "store",
        }
    }
}

impl Display for EventOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Normalized Event
// ----------------------------------------------------------------------------

/// Canonical, source-agnostic representation of one occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Unique across origins (prefixed with the origin)
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub origin: EventOrigin,
    /// Subject device or client identifier (usually a MAC address)
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    /// Vendor event key, e.g. `EVT_WU_Roam`
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub payload: Payload,
}

impl NormalizedEvent {
    /// Create an event with a generated identifier.
    pub fn new(
        origin: EventOrigin,
        kind: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{}:{}", origin.as_str(), Uuid::new_v4()),
            timestamp,
            origin,
            subject_id: None,
            subject_name: None,
            kind: kind.into(),
            message: message.into(),
            payload: Payload::new(),
        }
    }

    /// Use a source-provided identifier, namespaced by origin.
    pub fn with_source_id(mut self, raw_id: &str) -> Self {
        self.id = format!("{}:{}", self.origin.as_str(), raw_id);
        self
    }

    pub fn with_subject(mut self, id: Option<String>, name: Option<String>) -> Self {
        self.subject_id = id;
        self.subject_name = name;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Look up a string value in the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Look up an integer value in the payload, accepting numeric strings.
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        match self.payload.get(key)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Buffered Event
// ----------------------------------------------------------------------------

/// One record received on the realtime stream, stamped on arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub received_at: DateTime<Utc>,
    /// Stream message kind (`events`, `alarm`)
    pub kind: String,
    pub payload: Payload,
}

impl BufferedEvent {
    pub fn new(kind: impl Into<String>, payload: Payload) -> Self {
        Self {
            received_at: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }
}

// ----------------------------------------------------------------------------
// Finding
// ----------------------------------------------------------------------------

/// A correlated, user-facing record derived from one or more events.
///
/// `last_seen >= first_seen` holds for every value of this type: the window
/// is only set through [`Finding::new`], [`Finding::add_occurrence`] and
/// [`Finding::merge_occurrence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: FindingCategory,
    /// Event kind this finding was derived from
    pub kind: String,
    pub title: String,
    pub description: String,
    pub remediation: Option<String>,
    pub event_ids: Vec<String>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    occurrence_count: u32,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    #[serde(default)]
    pub metadata: Payload,
}

impl Finding {
    /// Create a finding covering `[first_seen, last_seen]`.
    /// A reversed window collapses to `first_seen`.
    pub fn new(
        severity: Severity,
        category: FindingCategory,
        kind: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            severity,
            category,
            kind: kind.into(),
            title: title.into(),
            description: description.into(),
            remediation: None,
            event_ids: Vec::new(),
            first_seen,
            last_seen: last_seen.max(first_seen),
            occurrence_count: 1,
            subject_id: None,
            subject_name: None,
            metadata: Payload::new(),
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn with_subject(mut self, id: Option<String>, name: Option<String>) -> Self {
        self.subject_id = id;
        self.subject_name = name;
        self
    }

    pub fn with_event_ids(mut self, ids: Vec<String>) -> Self {
        self.event_ids = ids;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record another equivalent event. `last_seen` only moves forward.
    pub fn add_occurrence(&mut self, event_id: impl Into<String>, timestamp: DateTime<Utc>) {
        self.occurrence_count = self.occurrence_count.saturating_add(1);
        if timestamp > self.last_seen {
            self.last_seen = timestamp;
        }
        self.event_ids.push(event_id.into());
    }

    /// Fold in another equivalent finding carrying `event_ids`.
    ///
    /// Ids already recorded are skipped. Returns `false`, leaving the finding
    /// untouched, when every carried id is already recorded.
    pub fn merge_occurrence<'a, I>(&mut self, event_ids: I, timestamp: DateTime<Utc>) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut carried = false;
        let mut fresh: Vec<&str> = Vec::new();
        for id in event_ids.into_iter().filter(|id| !id.is_empty()) {
            carried = true;
            if !self.event_ids.iter().any(|known| known == id) && !fresh.contains(&id) {
                fresh.push(id);
            }
        }
        if carried && fresh.is_empty() {
            return false;
        }

        self.occurrence_count = self.occurrence_count.saturating_add(1);
        if timestamp > self.last_seen {
            self.last_seen = timestamp;
        }
        self.event_ids.extend(fresh.into_iter().map(String::from));
        true
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn occurrence_count(&self) -> u32 {
        self.occurrence_count
    }

    pub fn is_recurring(&self, threshold: u32) -> bool {
        self.occurrence_count >= threshold
    }
}

// ----------------------------------------------------------------------------
// Security Event
// ----------------------------------------------------------------------------

/// What the IPS did with matched traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatAction {
    Blocked,
    Detected,
}

/// One signature match reported by the appliance's IDS/IPS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Full signature text, e.g. `ET SCAN Suspicious inbound to mySQL port 3306`
    pub signature: String,
    pub signature_id: Option<u64>,
    /// Raw category reported with the alert, if any
    pub category: Option<String>,
    /// Rule priority, 1 is the most severe
    pub priority: u8,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub action: ThreatAction,
}

impl SecurityEvent {
    pub fn is_blocked(&self) -> bool {
        self.action == ThreatAction::Blocked
    }
}
