// ============================================================================
// FALLBACK ORCHESTRATOR
// ============================================================================
// Produces the best available event set for one collection cycle:
// - realtime buffer first, then controller polling, then the shell fallback
// - merges by (timestamp, message), earlier sources win ties
// - stops early once enough data is in hand
// - fails only when every attempted source failed
// ============================================================================

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::config::CollectionConfig;
use crate::error::{CollectionError, CollectorError, SourceFailure};
use crate::sources::EventSource;
use crate::types::{EventOrigin, NormalizedEvent};

/// Per-cycle knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectOptions {
    /// Drop realtime and shell events older than this (minus clock skew)
    pub since: Option<DateTime<Utc>>,
    /// Go straight from realtime to the shell fallback
    pub skip_polling: bool,
}

impl CollectOptions {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            skip_polling: false,
        }
    }

    pub fn skipping_polling(mut self) -> Self {
        self.skip_polling = true;
        self
    }
}

/// What happened to one source during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded {
        count: usize,
    },
    Failed {
        #[serde(serialize_with = "serialize_display")]
        error: CollectorError,
    },
    Skipped {
        reason: String,
    },
}

impl SourceOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        SourceOutcome::Skipped { reason: reason.into() }
    }

    /// Whether the source was actually invoked.
    pub fn was_attempted(&self) -> bool {
        !matches!(self, SourceOutcome::Skipped { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SourceOutcome::Succeeded { .. })
    }
}

fn serialize_display<S: Serializer>(error: &CollectorError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// One source's outcome, tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAttempt {
    pub origin: EventOrigin,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

/// Events collected in one cycle plus how each source fared.
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    pub events: Vec<NormalizedEvent>,
    pub attempts: Vec<SourceAttempt>,
}

impl CollectionReport {
    pub fn outcome(&self, origin: EventOrigin) -> Option<&SourceOutcome> {
        self.attempts.iter().find(|a| a.origin == origin).map(|a| &a.outcome)
    }

    fn record(&mut self, origin: EventOrigin, outcome: SourceOutcome) {
        self.attempts.push(SourceAttempt { origin, outcome });
    }
}

/// Merge two event lists keyed by `(timestamp, message)`.
///
/// Entries from `first` win on conflict; repeats inside either list are
/// dropped as well. Relative order is preserved.
pub fn merge_events(first: Vec<NormalizedEvent>, second: Vec<NormalizedEvent>) -> Vec<NormalizedEvent> {
    let mut seen: HashSet<(DateTime<Utc>, String)> = HashSet::with_capacity(first.len() + second.len());
    first
        .into_iter()
        .chain(second)
        .filter(|event| seen.insert((event.timestamp, event.message.clone())))
        .collect()
}

/// Runs the realtime → polling → shell fallback chain.
pub struct FallbackOrchestrator {
    realtime: Option<Arc<dyn EventSource>>,
    polling: Option<Arc<dyn EventSource>>,
    shell: Option<Arc<dyn EventSource>>,
    min_events: usize,
    clock_skew: ChronoDuration,
}

impl FallbackOrchestrator {
    pub fn new(config: &CollectionConfig) -> Self {
        Self {
            realtime: None,
            polling: None,
            shell: None,
            min_events: config.min_events,
            clock_skew: ChronoDuration::from_std(config.clock_skew)
                .unwrap_or_else(|_| ChronoDuration::seconds(crate::CLOCK_SKEW_TOLERANCE_SECS)),
        }
    }

    pub fn with_realtime(mut self, source: Arc<dyn EventSource>) -> Self {
        self.realtime = Some(source);
        self
    }

    pub fn with_polling(mut self, source: Arc<dyn EventSource>) -> Self {
        self.polling = Some(source);
        self
    }

    /// Enable the shell fallback.
    pub fn with_shell(mut self, source: Arc<dyn EventSource>) -> Self {
        self.shell = Some(source);
        self
    }

    pub fn min_events(&self) -> usize {
        self.min_events
    }

    pub fn shell_enabled(&self) -> bool {
        self.shell.is_some()
    }

    fn keep_since(&self, events: Vec<NormalizedEvent>, since: Option<DateTime<Utc>>) -> Vec<NormalizedEvent> {
        match since {
            Some(since) => {
                let cutoff = since - self.clock_skew;
                events.into_iter().filter(|e| e.timestamp >= cutoff).collect()
            }
            None => events,
        }
    }

    async fn attempt(
        source: &dyn EventSource,
        since: Option<DateTime<Utc>>,
        report: &mut CollectionReport,
        failures: &mut Vec<SourceFailure>,
    ) -> Option<Vec<NormalizedEvent>> {
        let origin = source.origin();
        match source.collect(since).await {
            Ok(events) => {
                debug!(target: "vigil::orchestrator", source = source.name(), events = events.len(), "Source collected");
                Some(events)
            }
            Err(error) => {
                warn!(target: "vigil::orchestrator",
                    source = source.name(),
                    error = %error,
                    hint = ?error.recovery_hint(),
                    "Source failed");
                failures.push(SourceFailure {
                    origin,
                    error: error.clone(),
                });
                report.record(origin, SourceOutcome::Failed { error });
                None
            }
        }
    }

    /// Collect one cycle's events.
    ///
    /// Returns an error only when at least one source was attempted and every
    /// attempted source failed.
    pub async fn collect(&self, options: &CollectOptions) -> Result<CollectionReport, CollectionError> {
        let mut report = CollectionReport::default();
        let mut failures = Vec::new();
        let mut merged: Vec<NormalizedEvent> = Vec::new();

        // ---- Realtime ----
        match &self.realtime {
            Some(source) if source.is_available() => {
                if let Some(events) = Self::attempt(source.as_ref(), options.since, &mut report, &mut failures).await {
                    let events = self.keep_since(events, options.since);
                    report.record(EventOrigin::Realtime, SourceOutcome::Succeeded { count: events.len() });
                    merged = events;
                }
            }
            Some(_) => report.record(EventOrigin::Realtime, SourceOutcome::skipped("listener not connected")),
            None => report.record(EventOrigin::Realtime, SourceOutcome::skipped("not configured")),
        }

        // ---- Polling ----
        let mut quiet_poll = false;
        match &self.polling {
            _ if options.skip_polling => {
                report.record(EventOrigin::Api, SourceOutcome::skipped("skipped by caller"))
            }
            Some(source) => {
                if let Some(events) = Self::attempt(source.as_ref(), options.since, &mut report, &mut failures).await {
                    // The controller answers with its whole window every poll
                    let events = self.keep_since(events, options.since);
                    quiet_poll = events.is_empty();
                    report.record(EventOrigin::Api, SourceOutcome::Succeeded { count: events.len() });
                    merged = merge_events(merged, events);
                }
            }
            None => report.record(EventOrigin::Api, SourceOutcome::skipped("not configured")),
        }

        // A successful poll with nothing in it means the network was quiet;
        // a sparse one still gets topped up from the shell.
        if merged.len() >= self.min_events || quiet_poll {
            debug!(target: "vigil::orchestrator",
                events = merged.len(),
                min_events = self.min_events,
                quiet_poll = quiet_poll,
                "Skipping shell fallback");
            report.record(EventOrigin::Shell, SourceOutcome::skipped("enough data"));
            return self.finish(report, merged, failures);
        }

        // ---- Shell ----
        match &self.shell {
            Some(source) => {
                info!(target: "vigil::orchestrator",
                    events = merged.len(),
                    min_events = self.min_events,
                    "Below minimum, trying shell fallback");
                if let Some(events) = Self::attempt(source.as_ref(), options.since, &mut report, &mut failures).await {
                    let events = self.keep_since(events, options.since);
                    report.record(EventOrigin::Shell, SourceOutcome::Succeeded { count: events.len() });
                    merged = merge_events(merged, events);
                }
            }
            None => report.record(EventOrigin::Shell, SourceOutcome::skipped("fallback disabled")),
        }

        self.finish(report, merged, failures)
    }

    fn finish(
        &self,
        mut report: CollectionReport,
        events: Vec<NormalizedEvent>,
        failures: Vec<SourceFailure>,
    ) -> Result<CollectionReport, CollectionError> {
        let attempted = report.attempts.iter().filter(|a| a.outcome.was_attempted()).count();

        if attempted == 0 {
            warn!(target: "vigil::orchestrator", "No source was available this cycle");
        } else if failures.len() == attempted {
            return Err(CollectionError::AllSourcesFailed { failures });
        }

        info!(target: "vigil::orchestrator",
            events = events.len(),
            attempted = attempted,
            failed = failures.len(),
            "Collection complete");
        report.events = events;
        Ok(report)
    }
}

impl fmt::Debug for FallbackOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOrchestrator")
            .field("realtime", &self.realtime.as_ref().map(|s| s.name().to_string()))
            .field("polling", &self.polling.as_ref().map(|s| s.name().to_string()))
            .field("shell", &self.shell.as_ref().map(|s| s.name().to_string()))
            .field("min_events", &self.min_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::CollectorResult;

    struct StaticSource {
        origin: EventOrigin,
        available: bool,
        result: CollectorResult<Vec<NormalizedEvent>>,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn ok(origin: EventOrigin, events: Vec<NormalizedEvent>) -> Arc<Self> {
            Arc::new(Self {
                origin,
                available: true,
                result: Ok(events),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(origin: EventOrigin) -> Arc<Self> {
            Arc::new(Self {
                origin,
                available: true,
                result: Err(CollectorError::connection_failed(origin.as_str(), "refused")),
                calls: AtomicUsize::new(0),
            })
        }

        fn unavailable(origin: EventOrigin) -> Arc<Self> {
            Arc::new(Self {
                origin,
                available: false,
                result: Ok(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for StaticSource {
        fn name(&self) -> &str {
            self.origin.as_str()
        }

        fn origin(&self) -> EventOrigin {
            self.origin
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn collect(&self, _since: Option<DateTime<Utc>>) -> CollectorResult<Vec<NormalizedEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn events(origin: EventOrigin, n: usize, prefix: &str) -> Vec<NormalizedEvent> {
        (0..n)
            .map(|i| {
                NormalizedEvent::new(
                    origin,
                    "EVT_AP_Lost_Contact",
                    format!("{} {}", prefix, i),
                    base() + ChronoDuration::seconds(i as i64),
                )
            })
            .collect()
    }

    fn orchestrator(min_events: usize) -> FallbackOrchestrator {
        FallbackOrchestrator::new(&CollectionConfig {
            min_events,
            ..CollectionConfig::default()
        })
    }

    #[test]
    fn test_merge_prefers_first_list() {
        let first = events(EventOrigin::Realtime, 2, "ap");
        let mut second = events(EventOrigin::Api, 3, "ap");
        second.push(second[0].clone());

        let merged = merge_events(first.clone(), second.clone());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, first[0].id);
        assert_eq!(merged[1].id, first[1].id);
        assert_eq!(merged[2].id, second[2].id);
    }

    #[tokio::test]
    async fn test_quiet_poll_skips_shell() {
        let polling = StaticSource::ok(EventOrigin::Api, Vec::new());
        let shell = StaticSource::ok(EventOrigin::Shell, events(EventOrigin::Shell, 3, "log"));
        let orch = orchestrator(10).with_polling(polling.clone()).with_shell(shell.clone());

        let report = orch.collect(&CollectOptions::default()).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(shell.calls(), 0);
        assert_eq!(report.outcome(EventOrigin::Api), Some(&SourceOutcome::Succeeded { count: 0 }));
    }

    #[tokio::test]
    async fn test_sparse_poll_falls_back_and_survives_shell_failure() {
        let polling = StaticSource::ok(EventOrigin::Api, events(EventOrigin::Api, 5, "poll"));
        let shell = StaticSource::failing(EventOrigin::Shell);
        let orch = orchestrator(10).with_polling(polling).with_shell(shell.clone());

        let report = orch.collect(&CollectOptions::default()).await.unwrap();
        assert_eq!(report.events.len(), 5);
        assert_eq!(shell.calls(), 1);
        assert!(matches!(report.outcome(EventOrigin::Shell), Some(SourceOutcome::Failed { .. })));
    }

    #[tokio::test]
    async fn test_enough_events_skip_shell_despite_poll_failure() {
        let realtime = StaticSource::ok(EventOrigin::Realtime, events(EventOrigin::Realtime, 10, "rt"));
        let polling = StaticSource::failing(EventOrigin::Api);
        let shell = StaticSource::ok(EventOrigin::Shell, Vec::new());
        let orch = orchestrator(10)
            .with_realtime(realtime)
            .with_polling(polling.clone())
            .with_shell(shell.clone());

        let report = orch.collect(&CollectOptions::default()).await.unwrap();
        assert_eq!(report.events.len(), 10);
        assert_eq!(polling.calls(), 1);
        assert_eq!(shell.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_attempted_sources_failed() {
        let orch = orchestrator(10)
            .with_realtime(StaticSource::unavailable(EventOrigin::Realtime))
            .with_polling(StaticSource::failing(EventOrigin::Api))
            .with_shell(StaticSource::failing(EventOrigin::Shell));

        let err = orch.collect(&CollectOptions::default()).await.unwrap_err();
        let origins: Vec<_> = err.failures().iter().map(|f| f.origin).collect();
        assert_eq!(origins, vec![EventOrigin::Api, EventOrigin::Shell]);
    }

    #[tokio::test]
    async fn test_nothing_attempted_is_empty_report() {
        let orch = orchestrator(10).with_realtime(StaticSource::unavailable(EventOrigin::Realtime));
        let report = orch
            .collect(&CollectOptions::default().skipping_polling())
            .await
            .unwrap();
        assert!(report.events.is_empty());
        assert!(report.attempts.iter().all(|a| !a.outcome.was_attempted()));
    }

    #[tokio::test]
    async fn test_since_filter_applies_to_every_source() {
        let since = base() + ChronoDuration::minutes(10);
        let old = |origin, msg: &str| {
            NormalizedEvent::new(origin, "EVT_X", msg, since - ChronoDuration::minutes(6))
        };
        let skewed = |origin, msg: &str| {
            NormalizedEvent::new(origin, "EVT_X", msg, since - ChronoDuration::minutes(4))
        };

        let realtime = StaticSource::ok(
            EventOrigin::Realtime,
            vec![old(EventOrigin::Realtime, "rt old"), skewed(EventOrigin::Realtime, "rt ok")],
        );
        let polling = StaticSource::ok(
            EventOrigin::Api,
            vec![old(EventOrigin::Api, "api old"), skewed(EventOrigin::Api, "api ok")],
        );
        let shell = StaticSource::ok(
            EventOrigin::Shell,
            vec![old(EventOrigin::Shell, "sh old"), skewed(EventOrigin::Shell, "sh ok")],
        );
        let orch = orchestrator(10)
            .with_realtime(realtime)
            .with_polling(polling)
            .with_shell(shell);

        let report = orch.collect(&CollectOptions::since(since)).await.unwrap();
        let messages: Vec<_> = report.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["rt ok", "api ok", "sh ok"]);
        assert_eq!(report.outcome(EventOrigin::Api), Some(&SourceOutcome::Succeeded { count: 1 }));
    }

    #[tokio::test]
    async fn test_poll_with_only_stale_events_is_quiet() {
        let since = base() + ChronoDuration::hours(1);
        let polling = StaticSource::ok(EventOrigin::Api, events(EventOrigin::Api, 3, "ap"));
        let shell = StaticSource::ok(EventOrigin::Shell, events(EventOrigin::Shell, 3, "log"));
        let orch = orchestrator(10).with_polling(polling).with_shell(shell.clone());

        let report = orch.collect(&CollectOptions::since(since)).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(shell.calls(), 0);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let attempt = SourceAttempt {
            origin: EventOrigin::Shell,
            outcome: SourceOutcome::Failed {
                error: CollectorError::timeout("tail", 30_000),
            },
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["origin"], "shell");
        assert_eq!(json["status"], "failed");
        assert!(json["error"].as_str().unwrap().contains("Timeout"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn merge_keeps_one_entry_per_key(
                a in proptest::collection::vec((0i64..20, 0u8..4), 0..30),
                b in proptest::collection::vec((0i64..20, 0u8..4), 0..30),
            ) {
                let build = |origin, items: &[(i64, u8)]| -> Vec<NormalizedEvent> {
                    items
                        .iter()
                        .map(|(secs, msg)| {
                            NormalizedEvent::new(origin, "EVT_X", format!("m{}", msg), base() + ChronoDuration::seconds(*secs))
                        })
                        .collect()
                };
                let first = build(EventOrigin::Realtime, &a);
                let second = build(EventOrigin::Api, &b);
                let merged = merge_events(first.clone(), second.clone());

                let mut keys = HashSet::new();
                for event in &merged {
                    prop_assert!(keys.insert((event.timestamp, event.message.clone())));
                }
                for event in first.iter().chain(second.iter()) {
                    prop_assert!(keys.contains(&(event.timestamp, event.message.clone())));
                }
                for event in &first {
                    let kept = merged
                        .iter()
                        .find(|m| m.timestamp == event.timestamp && m.message == event.message);
                    prop_assert_eq!(kept.map(|m| m.origin), Some(EventOrigin::Realtime));
                }
            }
        }
    }
}
