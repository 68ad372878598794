// ============================================================================
// EVENT SOURCES
// ============================================================================
// One collector per acquisition channel, all producing normalized events:
// - RealtimeSource: drains the background worker
// - PollingSource: controller API events and alarms
// - ShellSource: appliance syslog over SSH
// - StoreQuerySource: IDS/IPS alerts for correlation and the threat aggregator
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::client::AppClient;
use crate::config::{CollectionConfig, ShellConfig};
use crate::error::{CollectorResult, ConfigError, NormalizeError};
use crate::normalize::{self, SyslogParser};
use crate::shell::ShellExecutor;
use crate::types::{EventOrigin, NormalizedEvent, SecurityEvent};
use crate::worker::BackgroundWorker;
use crate::DEFAULT_POLL_WINDOW_HOURS;

/// A single acquisition channel.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn origin(&self) -> EventOrigin;

    /// Whether the source can deliver right now.
    fn is_available(&self) -> bool {
        true
    }

    /// Events from this channel. `since` is a hint; sources that cannot
    /// filter by time return everything they have.
    async fn collect(&self, since: Option<DateTime<Utc>>) -> CollectorResult<Vec<NormalizedEvent>>;
}

/// Normalize a batch, logging and skipping records that do not fit.
fn normalize_all<T>(
    target_origin: EventOrigin,
    records: impl IntoIterator<Item = T>,
    mut convert: impl FnMut(T) -> Result<NormalizedEvent, NormalizeError>,
) -> Vec<NormalizedEvent> {
    let mut events = Vec::new();
    let mut skipped = 0usize;
    let mut first_error: Option<NormalizeError> = None;

    for record in records {
        match convert(record) {
            Ok(event) => events.push(event),
            Err(e) => {
                skipped += 1;
                debug!(target: "vigil::collector", origin = %target_origin, error = %e, "Skipping record");
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        warn!(target: "vigil::collector",
            origin = %target_origin,
            skipped = skipped,
            first_error = %e,
            "Skipped malformed records");
    }
    events
}

// ----------------------------------------------------------------------------
// Realtime
// ----------------------------------------------------------------------------

/// Drains whatever the background worker buffered since the last cycle.
pub struct RealtimeSource {
    worker: Arc<BackgroundWorker>,
}

impl RealtimeSource {
    pub fn new(worker: Arc<BackgroundWorker>) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &Arc<BackgroundWorker> {
        &self.worker
    }
}

#[async_trait]
impl EventSource for RealtimeSource {
    fn name(&self) -> &str {
        "realtime"
    }

    fn origin(&self) -> EventOrigin {
        EventOrigin::Realtime
    }

    fn is_available(&self) -> bool {
        self.worker.is_running()
    }

    async fn collect(&self, _since: Option<DateTime<Utc>>) -> CollectorResult<Vec<NormalizedEvent>> {
        let drained = self.worker.drain_events();
        let events = normalize_all(EventOrigin::Realtime, drained.iter(), normalize::from_buffered);
        debug!(target: "vigil::collector::realtime", events = events.len(), "Realtime buffer drained");
        Ok(events)
    }
}

impl fmt::Debug for RealtimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSource").field("worker", &self.worker).finish()
    }
}

// ----------------------------------------------------------------------------
// Polling
// ----------------------------------------------------------------------------

/// Polls the controller API.
pub struct PollingSource {
    client: Arc<dyn AppClient>,
    site: String,
    window_hours: u32,
    include_alarms: bool,
}

impl PollingSource {
    pub fn new(client: Arc<dyn AppClient>, site: impl Into<String>, collection: &CollectionConfig) -> Self {
        Self {
            client,
            site: site.into(),
            window_hours: collection.window_hours,
            include_alarms: collection.include_alarms,
        }
    }

    pub fn client(&self) -> &Arc<dyn AppClient> {
        &self.client
    }
}

#[async_trait]
impl EventSource for PollingSource {
    fn name(&self) -> &str {
        "polling"
    }

    fn origin(&self) -> EventOrigin {
        EventOrigin::Api
    }

    async fn collect(&self, _since: Option<DateTime<Utc>>) -> CollectorResult<Vec<NormalizedEvent>> {
        let mut records = self.client.get_events(&self.site, self.window_hours).await?;

        if self.include_alarms {
            match self.client.get_alarms(&self.site).await {
                Ok(alarms) => records.extend(alarms),
                Err(e) => {
                    warn!(target: "vigil::collector::api", error = %e, "Alarm fetch failed, continuing with events");
                }
            }
        }

        let events = normalize_all(EventOrigin::Api, records.iter(), |r| {
            normalize::from_controller_record(r, EventOrigin::Api, None)
        });
        debug!(target: "vigil::collector::api",
            site = %self.site,
            events = events.len(),
            "Controller polled");
        Ok(events)
    }
}

impl fmt::Debug for PollingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingSource")
            .field("site", &self.site)
            .field("window_hours", &self.window_hours)
            .field("include_alarms", &self.include_alarms)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Shell
// ----------------------------------------------------------------------------

/// Reads appliance logs over the remote shell.
pub struct ShellSource {
    executor: Arc<dyn ShellExecutor>,
    log_path: String,
    max_lines: usize,
    parser: SyslogParser,
}

impl ShellSource {
    pub fn new(executor: Arc<dyn ShellExecutor>, config: &ShellConfig) -> Result<Self, ConfigError> {
        let parser = SyslogParser::new().map_err(|e| ConfigError::InvalidRules {
            message: format!("syslog parser: {}", e),
        })?;
        Ok(Self {
            executor,
            log_path: config.log_path.clone(),
            max_lines: config.max_lines,
            parser,
        })
    }
}

#[async_trait]
impl EventSource for ShellSource {
    fn name(&self) -> &str {
        "shell"
    }

    fn origin(&self) -> EventOrigin {
        EventOrigin::Shell
    }

    async fn collect(&self, _since: Option<DateTime<Utc>>) -> CollectorResult<Vec<NormalizedEvent>> {
        let lines = self.executor.read_log_lines(&self.log_path, self.max_lines).await?;
        let now = Utc::now();
        let events = normalize_all(EventOrigin::Shell, lines.iter(), |line| self.parser.parse(line, now));
        debug!(target: "vigil::collector::shell",
            path = %self.log_path,
            lines = lines.len(),
            events = events.len(),
            "Log lines parsed");
        Ok(events)
    }
}

impl fmt::Debug for ShellSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSource")
            .field("log_path", &self.log_path)
            .field("max_lines", &self.max_lines)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Store Query
// ----------------------------------------------------------------------------

/// One store query seen both ways.
#[derive(Debug, Clone, Default)]
pub struct AlertBatch {
    /// Alerts as events for correlation
    pub events: Vec<NormalizedEvent>,
    /// Alerts as security events for the threat aggregator
    pub threats: Vec<SecurityEvent>,
}

/// Queries IDS/IPS alerts straight from the appliance's document store.
///
/// Without a cutoff the last [`DEFAULT_POLL_WINDOW_HOURS`] are queried.
pub struct StoreQuerySource {
    executor: Arc<dyn ShellExecutor>,
    limit: usize,
    lookback: ChronoDuration,
}

impl StoreQuerySource {
    pub fn new(executor: Arc<dyn ShellExecutor>, config: &ShellConfig) -> Self {
        Self {
            executor,
            limit: config.alert_limit,
            lookback: ChronoDuration::hours(i64::from(DEFAULT_POLL_WINDOW_HOURS)),
        }
    }

    async fn records(&self, since: Option<DateTime<Utc>>) -> CollectorResult<Vec<JsonValue>> {
        let since = since.unwrap_or_else(|| Utc::now() - self.lookback);
        self.executor.query_alert_records(since, self.limit).await
    }

    /// Query once and normalize every alert both ways.
    pub async fn collect_alerts(&self, since: Option<DateTime<Utc>>) -> CollectorResult<AlertBatch> {
        let records = self.records(since).await?;
        let batch = AlertBatch {
            events: normalize_all(EventOrigin::Store, records.iter(), normalize::from_alert_record),
            threats: threats_from(&records),
        };
        debug!(target: "vigil::collector::store",
            records = records.len(),
            events = batch.events.len(),
            threats = batch.threats.len(),
            "Alert records collected");
        Ok(batch)
    }
}

fn threats_from(records: &[JsonValue]) -> Vec<SecurityEvent> {
    let mut threats = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in records {
        match normalize::security_event_from_alert(record) {
            Ok(threat) => threats.push(threat),
            Err(e) => {
                skipped += 1;
                debug!(target: "vigil::collector::store", error = %e, "Skipping alert record");
            }
        }
    }
    if skipped > 0 {
        warn!(target: "vigil::collector::store", skipped = skipped, "Skipped malformed alert records");
    }
    threats
}

#[async_trait]
impl EventSource for StoreQuerySource {
    fn name(&self) -> &str {
        "store"
    }

    fn origin(&self) -> EventOrigin {
        EventOrigin::Store
    }

    async fn collect(&self, since: Option<DateTime<Utc>>) -> CollectorResult<Vec<NormalizedEvent>> {
        let records = self.records(since).await?;
        Ok(normalize_all(EventOrigin::Store, records.iter(), normalize::from_alert_record))
    }
}

impl fmt::Debug for StoreQuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreQuerySource").field("limit", &self.limit).finish()
    }
}
