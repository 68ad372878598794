// ============================================================================
// NORMALIZERS
// ============================================================================
// Per-origin adapters from raw records to the canonical event model:
// - controller JSON (API polling, realtime payloads, alarms)
// - syslog lines read over the remote shell
// - IDS/IPS alert records from the appliance's document store
// ============================================================================

use std::net::IpAddr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::NormalizeError;
use crate::types::{BufferedEvent, EventOrigin, NormalizedEvent, Payload, SecurityEvent, ThreatAction};

/// Keys naming the subject of an event, most specific first.
const SUBJECT_ID_KEYS: &[&str] = &["user", "client", "guest", "ap", "sw", "gw", "mac"];
const SUBJECT_NAME_KEYS: &[&str] = &["hostname", "name", "ap_name", "sw_name", "gw_name"];

/// Kind recorded for store alerts that carry no event key.
pub const DEFAULT_ALERT_KIND: &str = "EVT_IPS_IpsAlert";

/// Kind recorded for syslog lines that match no known shape.
pub const SYSLOG_KIND: &str = "SYSLOG";

// ----------------------------------------------------------------------------
// Field Helpers
// ----------------------------------------------------------------------------

fn as_object(record: &JsonValue) -> Result<&Payload, NormalizeError> {
    record.as_object().ok_or_else(|| NormalizeError::UnexpectedShape {
        reason: format!("expected a JSON object, got {}", json_type(record)),
    })
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn non_empty_str<'a>(obj: &'a Payload, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Record id, accepting both plain strings and extended-JSON `{"$oid": ..}`.
fn record_id(obj: &Payload) -> Option<String> {
    match obj.get("_id")? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Object(inner) => inner.get("$oid").and_then(|v| v.as_str()).map(String::from),
        _ => None,
    }
}

/// Integer field, accepting numbers, numeric strings and `{"$numberLong": ..}`.
fn int_field(obj: &Payload, key: &str) -> Option<i64> {
    match obj.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Object(inner) => inner
            .get("$numberLong")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        _ => None,
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, NormalizeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| NormalizeError::BadTimestamp { value: ms.to_string() })
}

/// Event time from `time` (epoch millis) or `datetime` (RFC 3339).
fn record_timestamp(obj: &Payload) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    if let Some(ms) = int_field(obj, "time").or_else(|| int_field(obj, "timestamp")) {
        return millis_to_utc(ms).map(Some);
    }
    if let Some(raw) = non_empty_str(obj, "datetime") {
        return DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| NormalizeError::BadTimestamp { value: raw.to_string() });
    }
    Ok(None)
}

fn subject_of(obj: &Payload) -> (Option<String>, Option<String>) {
    let id = SUBJECT_ID_KEYS
        .iter()
        .find_map(|k| non_empty_str(obj, k))
        .map(str::to_lowercase);
    let name = SUBJECT_NAME_KEYS
        .iter()
        .find_map(|k| non_empty_str(obj, k))
        .map(String::from);
    (id, name)
}

// ----------------------------------------------------------------------------
// Controller Records
// ----------------------------------------------------------------------------

/// Normalize one controller event or alarm object.
///
/// `fallback_time` is used when the record carries no timestamp of its own;
/// without one such a record is rejected.
pub fn from_controller_record(
    record: &JsonValue,
    origin: EventOrigin,
    fallback_time: Option<DateTime<Utc>>,
) -> Result<NormalizedEvent, NormalizeError> {
    let obj = as_object(record)?;

    let kind = non_empty_str(obj, "key").ok_or(NormalizeError::MissingField { field: "key" })?;
    let timestamp = match record_timestamp(obj)? {
        Some(ts) => ts,
        None => fallback_time.ok_or(NormalizeError::MissingField { field: "time" })?,
    };
    let message = non_empty_str(obj, "msg").unwrap_or(kind).to_string();
    let (subject_id, subject_name) = subject_of(obj);

    let event = NormalizedEvent::new(origin, kind, message, timestamp)
        .with_subject(subject_id, subject_name)
        .with_payload(obj.clone());

    Ok(match record_id(obj) {
        Some(id) => event.with_source_id(&id),
        None => event,
    })
}

/// Normalize a record drained from the realtime buffer.
pub fn from_buffered(event: &BufferedEvent) -> Result<NormalizedEvent, NormalizeError> {
    let record = JsonValue::Object(event.payload.clone());
    from_controller_record(&record, EventOrigin::Realtime, Some(event.received_at))
}

// ----------------------------------------------------------------------------
// Store Alert Records
// ----------------------------------------------------------------------------

fn alert_signature(obj: &Payload) -> Option<&str> {
    non_empty_str(obj, "inner_alert_signature")
        .or_else(|| non_empty_str(obj, "signature"))
        .or_else(|| non_empty_str(obj, "msg"))
}

fn ip_field(obj: &Payload, keys: &[&str]) -> Option<IpAddr> {
    keys.iter()
        .find_map(|k| non_empty_str(obj, k))
        .and_then(|s| s.parse().ok())
}

fn alert_action(obj: &Payload) -> ThreatAction {
    let action = non_empty_str(obj, "inner_alert_action")
        .or_else(|| non_empty_str(obj, "action"))
        .map(str::to_lowercase);
    match action.as_deref() {
        Some("blocked") | Some("block") | Some("drop") | Some("dropped") | Some("reject") => {
            ThreatAction::Blocked
        }
        _ if non_empty_str(obj, "key") == Some("EVT_IPS_IpsBlocked") => ThreatAction::Blocked,
        _ => ThreatAction::Detected,
    }
}

/// Build a security event from an IDS/IPS alert record.
pub fn security_event_from_alert(record: &JsonValue) -> Result<SecurityEvent, NormalizeError> {
    let obj = as_object(record)?;

    let signature = alert_signature(obj)
        .ok_or(NormalizeError::MissingField { field: "inner_alert_signature" })?
        .to_string();
    let timestamp = record_timestamp(obj)?.ok_or(NormalizeError::MissingField { field: "time" })?;
    let priority = int_field(obj, "inner_alert_severity")
        .or_else(|| int_field(obj, "priority"))
        .map(|p| p.clamp(0, u8::MAX as i64) as u8)
        .unwrap_or(3);
    let id = match record_id(obj) {
        Some(id) => format!("{}:{}", EventOrigin::Store, id),
        None => format!("{}:{}", EventOrigin::Store, uuid::Uuid::new_v4()),
    };

    Ok(SecurityEvent {
        id,
        timestamp,
        signature,
        signature_id: int_field(obj, "inner_alert_signature_id")
            .or_else(|| int_field(obj, "signature_id"))
            .and_then(|v| u64::try_from(v).ok()),
        category: non_empty_str(obj, "inner_alert_category")
            .or_else(|| non_empty_str(obj, "catname"))
            .map(String::from),
        priority,
        src_ip: ip_field(obj, &["src_ip", "srcipAddr"]),
        dst_ip: ip_field(obj, &["dest_ip", "dst_ip", "dstipAddr"]),
        action: alert_action(obj),
    })
}

/// Build a normalized event from an IDS/IPS alert record.
pub fn from_alert_record(record: &JsonValue) -> Result<NormalizedEvent, NormalizeError> {
    let obj = as_object(record)?;

    let signature = alert_signature(obj)
        .ok_or(NormalizeError::MissingField { field: "inner_alert_signature" })?;
    let timestamp = record_timestamp(obj)?.ok_or(NormalizeError::MissingField { field: "time" })?;
    let kind = non_empty_str(obj, "key").unwrap_or(DEFAULT_ALERT_KIND);
    let subject = non_empty_str(obj, "src_ip").map(String::from);

    let mut payload = obj.clone();
    if let Some(ip) = &subject {
        payload.entry("ip").or_insert_with(|| JsonValue::from(ip.clone()));
    }

    let event = NormalizedEvent::new(EventOrigin::Store, kind, signature, timestamp)
        .with_subject(subject, None)
        .with_payload(payload);
    Ok(match record_id(obj) {
        Some(id) => event.with_source_id(&id),
        None => event,
    })
}

// ----------------------------------------------------------------------------
// Syslog Lines
// ----------------------------------------------------------------------------

/// Parser for appliance syslog lines.
///
/// Accepts both the BSD header (`Jan  5 10:23:45 host proc[pid]: msg`) and an
/// RFC 3339 header (`2024-01-05T10:23:45+00:00 host proc: msg`).
#[derive(Debug)]
pub struct SyslogParser {
    line: Regex,
    event_key: Regex,
    mac: Regex,
    rssi: Regex,
    hints: Vec<(Regex, &'static str)>,
}

impl SyslogParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            line: Regex::new(
                r"^(?P<ts>\d{4}-\d{2}-\d{2}T\S+|[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+(?P<proc>[^:\[\s]+)(?:\[\d+\])?:\s*(?P<msg>.*)$",
            )?,
            event_key: Regex::new(r"\b(EVT_[A-Za-z0-9_]+)\b")?,
            mac: Regex::new(r"(?i)\b([0-9a-f]{2}(?::[0-9a-f]{2}){5})\b")?,
            rssi: Regex::new(r"(?i)\brssi[=:\s]+(-?\d+)")?,
            hints: vec![
                (Regex::new(r"(?i)\bdisassociated\b")?, "EVT_WU_Disconnected"),
                (Regex::new(r"(?i)\broam(?:ed|ing)?\b")?, "EVT_WU_Roam"),
            ],
        })
    }

    /// Parse one line. `now` anchors year inference for BSD headers.
    pub fn parse(&self, line: &str, now: DateTime<Utc>) -> Result<NormalizedEvent, NormalizeError> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return Err(NormalizeError::MalformedLine { reason: "empty line".into() });
        }

        let caps = self.line.captures(line).ok_or_else(|| NormalizeError::MalformedLine {
            reason: "no syslog header".into(),
        })?;
        let raw_ts = &caps["ts"];
        let message = caps["msg"].trim();
        let timestamp = parse_syslog_time(raw_ts, now)?;

        let kind = self
            .event_key
            .captures(message)
            .map(|c| c[1].to_string())
            .or_else(|| {
                self.hints
                    .iter()
                    .find(|(re, _)| re.is_match(message))
                    .map(|(_, kind)| kind.to_string())
            })
            .unwrap_or_else(|| SYSLOG_KIND.to_string());

        let subject_id = self.mac.captures(message).map(|c| c[1].to_lowercase());

        let mut payload = Payload::new();
        payload.insert("host".into(), JsonValue::from(&caps["host"]));
        payload.insert("process".into(), JsonValue::from(&caps["proc"]));
        if let Some(rssi) = self
            .rssi
            .captures(message)
            .and_then(|c| c[1].parse::<i64>().ok())
        {
            payload.insert("rssi".into(), JsonValue::from(rssi));
        }

        Ok(NormalizedEvent::new(EventOrigin::Shell, kind, message, timestamp)
            .with_subject(subject_id, None)
            .with_payload(payload))
    }
}

fn parse_syslog_time(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, NormalizeError> {
    let bad = || NormalizeError::BadTimestamp { value: raw.to_string() };

    if raw.as_bytes().first().map_or(false, u8::is_ascii_digit) {
        return DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| bad());
    }

    // BSD headers omit the year; assume the most recent one not in the future.
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let parse_in = |year: i32| {
        NaiveDateTime::parse_from_str(&format!("{} {}", year, collapsed), "%Y %b %d %H:%M:%S")
            .map(|naive| Utc.from_utc_datetime(&naive))
    };

    let candidate = parse_in(now.year()).map_err(|_| bad())?;
    if candidate > now + ChronoDuration::days(1) {
        parse_in(now.year() - 1).map_err(|_| bad())
    } else {
        Ok(candidate)
    }
}
