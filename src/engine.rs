// ============================================================================
// ENGINE
// ============================================================================
// Owns every store and drives collection cycles from one task:
// - collection through the fallback orchestrator
// - correlation into findings, then deduplication
// - threat aggregation over store-queried IDS/IPS alerts
// The realtime worker is the only component running elsewhere.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{AppClient, ConnectionParams, HttpAppClient};
use crate::config::VigilConfig;
use crate::correlation::CorrelationEngine;
use crate::dedup::{DedupStore, FindingSummary};
use crate::error::VigilResult;
use crate::orchestrator::{CollectOptions, FallbackOrchestrator, SourceAttempt};
use crate::shell::{ShellExecutor, SshExecutor};
use crate::sources::{PollingSource, RealtimeSource, ShellSource, StoreQuerySource};
use crate::threat::{ThreatAggregator, ThreatReport};
use crate::types::Finding;
use crate::worker::BackgroundWorker;
use crate::{ENGINE_FULL_NAME, ENGINE_VERSION};

/// Everything one collection cycle produced.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<SourceAttempt>,
    pub events_collected: usize,
    /// Store alerts fed to correlation alongside the collected events
    pub alerts_correlated: usize,
    pub new_findings: usize,
    pub merged_findings: usize,
    /// Findings whose events were already recorded
    pub repeated_findings: usize,
    /// All stored findings, most recently seen first
    pub findings: Vec<Finding>,
    pub summary: FindingSummary,
    pub threats: Option<ThreatReport>,
    pub unknown_kinds: BTreeMap<String, u64>,
}

/// The collection and correlation engine.
pub struct Engine {
    config: VigilConfig,
    orchestrator: FallbackOrchestrator,
    correlation: CorrelationEngine,
    dedup: DedupStore,
    threats: ThreatAggregator,
    store: Option<Arc<StoreQuerySource>>,
    realtime: Option<(Arc<BackgroundWorker>, ConnectionParams)>,
    cycles: u64,
    start_time: Instant,
}

impl Engine {
    /// Create an engine around an already assembled orchestrator.
    pub fn new(config: VigilConfig, orchestrator: FallbackOrchestrator) -> VigilResult<Self> {
        let correlation = CorrelationEngine::new(config.correlation.roam_flap_threshold)?;
        let dedup = DedupStore::new(config.correlation.dedup_window, config.correlation.recurring_threshold);
        let threats = ThreatAggregator::new(config.threats.source_threshold);

        debug!(target: "vigil::engine",
            rules = correlation.rules().len(),
            orchestrator = ?orchestrator,
            "Engine assembled");

        Ok(Self {
            config,
            orchestrator,
            correlation,
            dedup,
            threats,
            store: None,
            realtime: None,
            cycles: 0,
            start_time: Instant::now(),
        })
    }

    /// Wire every source described by `config`.
    pub fn from_config(config: VigilConfig) -> VigilResult<Self> {
        config.validate()?;

        let client: Arc<dyn AppClient> = Arc::new(HttpAppClient::new(&config.controller)?);
        let mut orchestrator = FallbackOrchestrator::new(&config.collection).with_polling(Arc::new(
            PollingSource::new(Arc::clone(&client), &config.controller.site, &config.collection),
        ));

        let executor: Option<Arc<dyn ShellExecutor>> = config
            .shell
            .clone()
            .map(|shell| Arc::new(SshExecutor::new(shell)) as Arc<dyn ShellExecutor>);

        if let (Some(executor), Some(shell)) = (&executor, &config.shell) {
            if config.collection.shell_fallback {
                orchestrator = orchestrator.with_shell(Arc::new(ShellSource::new(Arc::clone(executor), shell)?));
            }
        }

        let realtime = realtime_worker(&config, client.as_ref());
        if let Some((worker, _)) = &realtime {
            orchestrator = orchestrator.with_realtime(Arc::new(RealtimeSource::new(Arc::clone(worker))));
        }

        let store = match (&executor, &config.shell) {
            (Some(executor), Some(shell)) if config.threats.enabled => {
                Some(Arc::new(StoreQuerySource::new(Arc::clone(executor), shell)))
            }
            _ => None,
        };

        let mut engine = Self::new(config, orchestrator)?;
        engine.realtime = realtime;
        engine.store = store;
        Ok(engine)
    }

    /// Feed IDS/IPS alerts from `store` into correlation and each cycle's
    /// threat report.
    pub fn with_store(mut self, store: Arc<StoreQuerySource>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start `worker` with `params` when the engine runs.
    pub fn with_worker(mut self, worker: Arc<BackgroundWorker>, params: ConnectionParams) -> Self {
        self.realtime = Some((worker, params));
        self
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Spawn the realtime worker, if one is configured.
    pub fn start_realtime(&self) -> VigilResult<()> {
        if let Some((worker, params)) = &self.realtime {
            worker.start(params.clone())?;
        }
        Ok(())
    }

    /// Run one collection, correlation and threat pass.
    ///
    /// Fails only when every attempted source failed; an alert query
    /// failure is logged and leaves `threats` empty.
    pub async fn run_cycle(&mut self, options: &CollectOptions) -> VigilResult<CycleReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.cycles += 1;

        let collection = self.orchestrator.collect(options).await?;

        let alerts = match &self.store {
            Some(store) => match store.collect_alerts(options.since).await {
                Ok(batch) => Some(batch),
                Err(e) => {
                    warn!(target: "vigil::engine", error = %e, "Alert query failed, skipping threat report");
                    None
                }
            },
            None => None,
        };

        let mut findings = self.correlation.analyze(&collection.events);
        if let Some(batch) = &alerts {
            findings.extend(self.correlation.analyze(&batch.events));
        }
        let stats = self.dedup.absorb(findings);
        let threats = alerts.as_ref().map(|batch| self.threats.aggregate(&batch.threats));

        let report = CycleReport {
            cycle: self.cycles,
            started_at,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            sources: collection.attempts,
            events_collected: collection.events.len(),
            alerts_correlated: alerts.as_ref().map_or(0, |batch| batch.events.len()),
            new_findings: stats.new,
            merged_findings: stats.merged,
            repeated_findings: stats.repeated,
            findings: self.dedup.all().into_iter().cloned().collect(),
            summary: self.dedup.summary(),
            threats,
            unknown_kinds: self.correlation.unknown_kinds().clone(),
        };

        info!(target: "vigil::engine",
            cycle = report.cycle,
            events = report.events_collected,
            alerts = report.alerts_correlated,
            new = report.new_findings,
            merged = report.merged_findings,
            repeated = report.repeated_findings,
            total = report.summary.total,
            duration_ms = report.duration_ms,
            "Cycle complete");
        Ok(report)
    }

    /// Run cycles on the configured interval until `shutdown` is cancelled
    /// or the process receives SIGINT/SIGTERM, then stop the realtime worker.
    pub async fn run(&mut self, shutdown: CancellationToken) -> VigilResult<()> {
        info!(target: "vigil::engine",
            version = ENGINE_VERSION,
            interval_secs = self.config.collection.interval.as_secs(),
            "Starting {}", ENGINE_FULL_NAME);

        self.start_realtime()?;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut ticker = interval(self.config.collection.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut since: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cycle_start = Utc::now();
                    match self.run_cycle(&CollectOptions { since, skip_polling: false }).await {
                        Ok(_) => since = Some(cycle_start),
                        Err(e) => {
                            error!(target: "vigil::engine",
                                error = %e,
                                category = e.category(),
                                recoverable = e.is_recoverable(),
                                "Cycle failed");
                            if !e.is_recoverable() {
                                self.stop_realtime().await;
                                return Err(e);
                            }
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(target: "vigil::engine", "Shutdown requested");
                    break;
                }
                _ = sigterm.recv() => {
                    info!(target: "vigil::engine", "Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!(target: "vigil::engine", "Received SIGINT");
                    break;
                }
            }
        }

        self.stop_realtime().await;
        info!(target: "vigil::engine",
            cycles = self.cycles,
            uptime_secs = self.start_time.elapsed().as_secs(),
            "Engine shutdown complete");
        Ok(())
    }

    async fn stop_realtime(&self) {
        let Some((worker, _)) = &self.realtime else {
            return;
        };
        let worker = Arc::clone(worker);
        if let Err(e) = tokio::task::spawn_blocking(move || worker.stop()).await {
            error!(target: "vigil::engine", error = %e, "Worker stop task failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("orchestrator", &self.orchestrator)
            .field("findings", &self.dedup.len())
            .field("store", &self.store.is_some())
            .field("realtime", &self.realtime.is_some())
            .field("cycles", &self.cycles)
            .finish()
    }
}

#[cfg(feature = "websocket")]
fn realtime_worker(
    config: &VigilConfig,
    client: &dyn AppClient,
) -> Option<(Arc<BackgroundWorker>, ConnectionParams)> {
    if !config.realtime.enabled {
        return None;
    }
    let connector = Arc::new(crate::realtime::WebSocketConnector);
    let worker = Arc::new(BackgroundWorker::new(connector, config.realtime.clone()));
    let params = ConnectionParams::from_client(client, config.controller.site.clone(), config.controller.verify_tls);
    Some((worker, params))
}

#[cfg(not(feature = "websocket"))]
fn realtime_worker(
    config: &VigilConfig,
    _client: &dyn AppClient,
) -> Option<(Arc<BackgroundWorker>, ConnectionParams)> {
    if config.realtime.enabled {
        warn!(target: "vigil::engine", "Realtime enabled but built without the websocket feature");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAppClient;
    use crate::config::{CollectionConfig, ShellConfig};
    use crate::error::{CollectorError, VigilError};
    use crate::shell::MockShellExecutor;
    use serde_json::json;

    fn engine_with(client: MockAppClient, shell: Option<MockShellExecutor>) -> Engine {
        let config = VigilConfig::default();
        let collection = CollectionConfig {
            min_events: 1,
            ..CollectionConfig::default()
        };
        let orchestrator = FallbackOrchestrator::new(&collection)
            .with_polling(Arc::new(PollingSource::new(Arc::new(client), "default", &collection)));
        let engine = Engine::new(config, orchestrator).unwrap();
        match shell {
            Some(exec) => engine.with_store(Arc::new(StoreQuerySource::new(Arc::new(exec), &ShellConfig::default()))),
            None => engine,
        }
    }

    fn lost_contact(id: &str, time: i64) -> serde_json::Value {
        json!({
            "_id": id,
            "key": "EVT_AP_Lost_Contact",
            "msg": "AP lost contact",
            "ap": "AA:BB:CC:00:00:01",
            "ap_name": "Office AP",
            "time": time,
        })
    }

    #[tokio::test]
    async fn test_cycles_deduplicate_across_runs() {
        let mut client = MockAppClient::new();
        let mut call = 0i64;
        client.expect_get_events().times(2).returning(move |_, _| {
            call += 1;
            Ok(vec![lost_contact(&format!("e{}", call), 1_700_000_000_000 + call * 60_000)])
        });
        client.expect_get_alarms().returning(|_| Ok(Vec::new()));

        let mut engine = engine_with(client, None);
        let first = engine.run_cycle(&CollectOptions::default()).await.unwrap();
        assert_eq!(first.new_findings, 1);
        assert!(first.threats.is_none());

        let second = engine.run_cycle(&CollectOptions::default()).await.unwrap();
        assert_eq!(second.cycle, 2);
        assert_eq!(second.merged_findings, 1);
        assert_eq!(second.findings.len(), 1);
        assert_eq!(second.findings[0].occurrence_count(), 2);
    }

    #[tokio::test]
    async fn test_same_polled_event_counts_once() {
        let mut client = MockAppClient::new();
        client
            .expect_get_events()
            .times(4)
            .returning(|_, _| Ok(vec![lost_contact("e1", 1_700_000_000_000)]));
        client.expect_get_alarms().returning(|_| Ok(Vec::new()));

        let mut engine = engine_with(client, None);
        let first = engine.run_cycle(&CollectOptions::default()).await.unwrap();
        assert_eq!(first.new_findings, 1);

        // Without a cutoff the refetched event reaches the store again
        let second = engine.run_cycle(&CollectOptions::default()).await.unwrap();
        assert_eq!(second.events_collected, 1);
        assert_eq!(second.merged_findings, 0);
        assert_eq!(second.repeated_findings, 1);

        // With one it never leaves the orchestrator
        for _ in 0..2 {
            let later = engine.run_cycle(&CollectOptions::since(Utc::now())).await.unwrap();
            assert_eq!(later.events_collected, 0);
            assert_eq!(later.repeated_findings, 0);
        }

        let findings = engine.dedup().all();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].occurrence_count(), 1);
        assert_eq!(findings[0].event_ids, vec!["api:e1".to_string()]);
        assert!(engine.dedup().recurring().is_empty());
    }

    #[tokio::test]
    async fn test_total_failure_is_an_error() {
        let mut client = MockAppClient::new();
        client
            .expect_get_events()
            .returning(|_, _| Err(CollectorError::timeout("list/event", 30_000)));
        client.expect_get_alarms().never();

        let mut engine = engine_with(client, None);
        let err = engine.run_cycle(&CollectOptions::default()).await.unwrap_err();
        assert!(matches!(err, VigilError::Collection(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_threat_failure_does_not_fail_cycle() {
        let mut client = MockAppClient::new();
        client.expect_get_events().returning(|_, _| Ok(vec![lost_contact("e1", 1_700_000_000_000)]));
        client.expect_get_alarms().returning(|_| Ok(Vec::new()));
        let mut exec = MockShellExecutor::new();
        exec.expect_query_alert_records()
            .returning(|_, _| Err(CollectorError::collection_failed("ssh", "exit 255")));

        let mut engine = engine_with(client, Some(exec));
        let report = engine.run_cycle(&CollectOptions::default()).await.unwrap();
        assert!(report.threats.is_none());
        assert_eq!(report.new_findings, 1);
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let mut client = MockAppClient::new();
        client.expect_get_events().returning(|_, _| {
            Ok(vec![json!({"key": "EVT_Mystery", "time": 1_700_000_000_000i64})])
        });
        client.expect_get_alarms().returning(|_| Ok(Vec::new()));
        let mut exec = MockShellExecutor::new();
        exec.expect_query_alert_records().returning(|_, _| Ok(Vec::new()));

        let mut engine = engine_with(client, Some(exec));
        let report = engine.run_cycle(&CollectOptions::default()).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["unknown_kinds"]["EVT_Mystery"], 1);
        assert_eq!(json["sources"][1]["status"], "succeeded");
        assert_eq!(json["threats"]["total_events"], 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut client = MockAppClient::new();
        client.expect_get_events().returning(|_, _| Ok(Vec::new()));
        client.expect_get_alarms().returning(|_| Ok(Vec::new()));

        let mut engine = engine_with(client, None);
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        engine.run(shutdown).await.unwrap();
        assert!(engine.cycles() >= 1);
    }
}
