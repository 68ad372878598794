// ============================================================================
// DEDUPLICATION STORE
// ============================================================================
// Clusters repeated findings per (event kind, subject) inside a time window:
// - within the window the existing finding absorbs the new occurrence
// - outside it the new finding replaces the old one, which is archived
// - findings are never deleted
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{Finding, FindingCategory, Severity};
use crate::{DEFAULT_DEDUP_WINDOW_SECS, RECURRING_THRESHOLD};

/// Identity of a finding for clustering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub kind: String,
    pub subject_id: Option<String>,
}

impl DedupKey {
    pub fn new(kind: impl Into<String>, subject_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            subject_id,
        }
    }

    /// Key a finding by its own kind and subject.
    pub fn for_finding(finding: &Finding) -> Self {
        Self::new(finding.kind.clone(), finding.subject_id.clone())
    }
}

/// Result of offering a finding to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOutcome {
    /// Stored as the key's entry
    New,
    /// Folded into the existing entry
    Merged,
    /// Every event it carries is already part of the entry
    Repeated,
}

/// New/merged/repeated counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorbStats {
    pub new: usize,
    pub merged: usize,
    pub repeated: usize,
}

/// Counts by severity and category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub total: usize,
    pub recurring: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<FindingCategory, usize>,
}

/// Time-windowed store of findings.
#[derive(Debug)]
pub struct DedupStore {
    window: ChronoDuration,
    recurring_threshold: u32,
    active: HashMap<DedupKey, Finding>,
    archived: Vec<Finding>,
}

impl DedupStore {
    pub fn new(window: Duration, recurring_threshold: u32) -> Self {
        let window = ChronoDuration::from_std(window)
            .unwrap_or_else(|_| ChronoDuration::seconds(DEFAULT_DEDUP_WINDOW_SECS as i64));
        Self {
            window,
            recurring_threshold: recurring_threshold.max(1),
            active: HashMap::new(),
            archived: Vec::new(),
        }
    }

    /// Merge `finding` into the entry for `key` when that entry was last seen
    /// within the window of `timestamp`; otherwise make it the key's entry.
    ///
    /// An `event_id` the entry already holds is reported as
    /// [`MergeOutcome::Repeated`] and not counted again.
    pub fn add_or_merge(
        &mut self,
        key: DedupKey,
        mut finding: Finding,
        event_id: &str,
        timestamp: DateTime<Utc>,
    ) -> MergeOutcome {
        if !event_id.is_empty() && !finding.event_ids.iter().any(|id| id == event_id) {
            finding.event_ids.push(event_id.to_string());
        }
        self.merge_or_insert(key, finding, timestamp)
    }

    /// Feed a batch of findings in, each under its own key.
    pub fn absorb(&mut self, findings: Vec<Finding>) -> AbsorbStats {
        let mut stats = AbsorbStats::default();
        for finding in findings {
            let key = DedupKey::for_finding(&finding);
            let timestamp = finding.last_seen();
            match self.merge_or_insert(key, finding, timestamp) {
                MergeOutcome::New => stats.new += 1,
                MergeOutcome::Merged => stats.merged += 1,
                MergeOutcome::Repeated => stats.repeated += 1,
            }
        }
        stats
    }

    fn merge_or_insert(&mut self, key: DedupKey, finding: Finding, timestamp: DateTime<Utc>) -> MergeOutcome {
        if let Some(existing) = self.active.get_mut(&key) {
            let mut carried = finding.event_ids.iter().filter(|id| !id.is_empty()).peekable();
            if carried.peek().is_some() && carried.all(|id| existing.event_ids.contains(id)) {
                trace!(target: "vigil::dedup",
                    kind = %key.kind,
                    subject = ?key.subject_id,
                    "Events already recorded, not counting again");
                return MergeOutcome::Repeated;
            }

            let gap = (timestamp - existing.last_seen()).abs();
            if gap <= self.window {
                existing.merge_occurrence(finding.event_ids.iter().map(String::as_str), timestamp);
                trace!(target: "vigil::dedup",
                    kind = %key.kind,
                    subject = ?key.subject_id,
                    count = existing.occurrence_count(),
                    "Finding merged");
                return MergeOutcome::Merged;
            }
        }

        if let Some(previous) = self.active.insert(key.clone(), finding) {
            debug!(target: "vigil::dedup",
                kind = %key.kind,
                subject = ?key.subject_id,
                previous_count = previous.occurrence_count(),
                "Finding outside window, archiving previous cluster");
            self.archived.push(previous);
        }
        MergeOutcome::New
    }

    pub fn get(&self, key: &DedupKey) -> Option<&Finding> {
        self.active.get(key)
    }

    /// Every finding ever stored, most recently seen first.
    pub fn all(&self) -> Vec<&Finding> {
        let mut all: Vec<&Finding> = self.active.values().chain(self.archived.iter()).collect();
        all.sort_by(|a, b| {
            b.last_seen()
                .cmp(&a.last_seen())
                .then_with(|| b.severity.cmp(&a.severity))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        all
    }

    pub fn by_severity(&self, severity: Severity) -> Vec<&Finding> {
        self.all().into_iter().filter(|f| f.severity == severity).collect()
    }

    pub fn by_category(&self, category: FindingCategory) -> Vec<&Finding> {
        self.all().into_iter().filter(|f| f.category == category).collect()
    }

    pub fn recurring(&self) -> Vec<&Finding> {
        self.all()
            .into_iter()
            .filter(|f| f.is_recurring(self.recurring_threshold))
            .collect()
    }

    pub fn summary(&self) -> FindingSummary {
        let mut summary = FindingSummary::default();
        for finding in self.all() {
            summary.total += 1;
            if finding.is_recurring(self.recurring_threshold) {
                summary.recurring += 1;
            }
            *summary.by_severity.entry(finding.severity).or_insert(0) += 1;
            *summary.by_category.entry(finding.category).or_insert(0) += 1;
        }
        summary
    }

    /// Number of live keys.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Number of stored findings, archived included.
    pub fn len(&self) -> usize {
        self.active.len() + self.archived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS), RECURRING_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn finding(kind: &str, subject: Option<&str>, ts: DateTime<Utc>) -> Finding {
        Finding::new(Severity::Medium, FindingCategory::Hardware, kind, "t", "d", ts, ts)
            .with_subject(subject.map(String::from), None)
    }

    #[test]
    fn test_merge_within_window() {
        let mut store = DedupStore::default();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::minutes(30);
        let key = DedupKey::new("EVT_AP_RestartedUnknown", Some("ap1".into()));

        let first = store.add_or_merge(key.clone(), finding("EVT_AP_RestartedUnknown", Some("ap1"), t0), "e1", t0);
        let second = store.add_or_merge(key.clone(), finding("EVT_AP_RestartedUnknown", Some("ap1"), t1), "e2", t1);

        assert_eq!(first, MergeOutcome::New);
        assert_eq!(second, MergeOutcome::Merged);
        assert_eq!(store.len(), 1);
        let f = store.get(&key).unwrap();
        assert_eq!(f.occurrence_count(), 2);
        assert_eq!(f.first_seen(), t0);
        assert_eq!(f.last_seen(), t1);
        assert_eq!(f.event_ids, vec!["e1".to_string(), "e2".to_string()]);
    }

    #[test]
    fn test_same_event_twice_is_repeated() {
        let mut store = DedupStore::default();
        let t0 = Utc::now();
        let key = DedupKey::new("EVT_AP_Lost_Contact", Some("ap1".into()));

        store.add_or_merge(key.clone(), finding("EVT_AP_Lost_Contact", Some("ap1"), t0), "api:e1", t0);
        for _ in 0..4 {
            let outcome =
                store.add_or_merge(key.clone(), finding("EVT_AP_Lost_Contact", Some("ap1"), t0), "api:e1", t0);
            assert_eq!(outcome, MergeOutcome::Repeated);
        }

        let f = store.get(&key).unwrap();
        assert_eq!(f.occurrence_count(), 1);
        assert_eq!(f.event_ids, vec!["api:e1".to_string()]);
        assert!(store.recurring().is_empty());
    }

    #[test]
    fn test_flap_findings_merge_all_event_ids() {
        let mut store = DedupStore::default();
        let t0 = Utc::now();
        let flap = |ids: &[&str], first: i64, last: i64| {
            Finding::new(
                Severity::Medium,
                FindingCategory::Roaming,
                "ROAM_FLAP",
                "t",
                "d",
                t0 + ChronoDuration::minutes(first),
                t0 + ChronoDuration::minutes(last),
            )
            .with_subject(Some("11:22:33:44:55:66".into()), None)
            .with_event_ids(ids.iter().map(|id| id.to_string()).collect())
        };

        let stats = store.absorb(vec![flap(&["r1", "r2", "r3"], 0, 4)]);
        assert_eq!(stats.new, 1);
        let stats = store.absorb(vec![flap(&["r3", "r4", "r5"], 4, 12)]);
        assert_eq!(stats, AbsorbStats { new: 0, merged: 1, repeated: 0 });
        let stats = store.absorb(vec![flap(&["r4", "r5"], 8, 12)]);
        assert_eq!(stats.repeated, 1);

        let key = DedupKey::new("ROAM_FLAP", Some("11:22:33:44:55:66".into()));
        let f = store.get(&key).unwrap();
        assert_eq!(f.event_ids, vec!["r1", "r2", "r3", "r4", "r5"]);
        assert_eq!(f.occurrence_count(), 2);
        assert_eq!(f.first_seen(), t0);
        assert_eq!(f.last_seen(), t0 + ChronoDuration::minutes(12));
    }

    #[test]
    fn test_outside_window_replaces_and_archives() {
        let mut store = DedupStore::default();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::hours(2);
        let key = DedupKey::new("EVT_AP_RestartedUnknown", Some("ap1".into()));

        store.add_or_merge(key.clone(), finding("EVT_AP_RestartedUnknown", Some("ap1"), t0), "e1", t0);
        let outcome =
            store.add_or_merge(key.clone(), finding("EVT_AP_RestartedUnknown", Some("ap1"), t1), "e2", t1);

        assert_eq!(outcome, MergeOutcome::New);
        assert_eq!(store.active_len(), 1);
        assert_eq!(store.get(&key).unwrap().first_seen(), t1);
        assert_eq!(store.get(&key).unwrap().occurrence_count(), 1);

        let all = store.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].last_seen(), t1);
        assert_eq!(all[1].last_seen(), t0);
    }

    #[test]
    fn test_earlier_event_within_window_merges_without_moving_back() {
        let mut store = DedupStore::default();
        let t0 = Utc::now();
        let key = DedupKey::new("EVT_SW_PoeOverload", None);
        store.add_or_merge(key.clone(), finding("EVT_SW_PoeOverload", None, t0), "e1", t0);
        let outcome = store.add_or_merge(
            key.clone(),
            finding("EVT_SW_PoeOverload", None, t0),
            "e0",
            t0 - ChronoDuration::minutes(20),
        );
        assert_eq!(outcome, MergeOutcome::Merged);
        let f = store.get(&key).unwrap();
        assert_eq!(f.last_seen(), t0);
        assert!(f.last_seen() >= f.first_seen());
    }

    #[test]
    fn test_subjects_are_independent() {
        let mut store = DedupStore::default();
        let t0 = Utc::now();
        let stats = store.absorb(vec![
            finding("EVT_AP_Lost_Contact", Some("ap1"), t0),
            finding("EVT_AP_Lost_Contact", Some("ap2"), t0),
            finding("EVT_AP_Lost_Contact", None, t0),
            finding("EVT_AP_Lost_Contact", Some("ap1"), t0 + ChronoDuration::minutes(1)),
        ]);
        assert_eq!(stats, AbsorbStats { new: 3, merged: 1, repeated: 0 });
        assert_eq!(store.active_len(), 3);
    }

    #[test]
    fn test_recurring_and_summary() {
        let mut store = DedupStore::new(Duration::from_secs(3600), 5);
        let t0 = Utc::now();
        let batch: Vec<_> = (0..5)
            .map(|i| finding("EVT_AP_RestartedUnknown", Some("ap1"), t0 + ChronoDuration::minutes(i)))
            .collect();
        store.absorb(batch);
        store.absorb(vec![Finding::new(
            Severity::Low,
            FindingCategory::Firmware,
            "EVT_AP_Upgraded",
            "t",
            "d",
            t0,
            t0,
        )]);

        assert_eq!(store.recurring().len(), 1);
        assert_eq!(store.by_severity(Severity::Low).len(), 1);
        assert_eq!(store.by_category(FindingCategory::Hardware).len(), 1);

        let summary = store.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.recurring, 1);
        assert_eq!(summary.by_severity.get(&Severity::Medium), Some(&1));
        assert_eq!(summary.by_category.get(&FindingCategory::Firmware), Some(&1));
    }
}
