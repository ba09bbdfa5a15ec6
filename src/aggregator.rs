// ETA aggregation: fan out one request per watch entry, merge, group by stop.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use futures::future::{join_all, try_join_all};
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::EtaSource;
use crate::error::{EtaError, Result};
use crate::models::{EtaBatch, EtaRecord, StopGroup, StopInfo, WatchEntry};
use crate::stop_name::normalize;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PollResult {
    pub records: Vec<EtaRecord>,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub entry: WatchEntry,
    pub error: EtaError,
}

/// Outcome of a poll where failing entries are set aside instead of
/// failing the whole cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PollReport {
    pub records: Vec<EtaRecord>,
    pub generated_at: String,
    pub failures: Vec<EntryFailure>,
}

// The stop id is stamped here, from the entry that issued the request, and
// never inferred from route/direction afterwards.
async fn fetch_tagged<S: EtaSource>(source: &S, entry: &WatchEntry) -> Result<EtaBatch> {
    let mut batch = source
        .fetch_route_etas(&entry.stop_id, &entry.route, &entry.service_type)
        .await?;

    for record in &mut batch.records {
        record.stop_id.clone_from(&entry.stop_id);
    }

    Ok(batch)
}

/// Fetches every entry concurrently. Outcomes come back in entry order,
/// paired with the entry that produced them.
pub async fn poll_each<'a, S: EtaSource>(
    source: &S,
    entries: &'a [WatchEntry],
) -> Vec<(&'a WatchEntry, Result<EtaBatch>)> {
    let outcomes = join_all(entries.iter().map(|entry| fetch_tagged(source, entry))).await;
    entries.iter().zip(outcomes).collect()
}

/// Fetches every entry concurrently and concatenates the records in entry
/// order. The first request to fail ends the poll right away with its error;
/// requests still pending are dropped.
pub async fn poll_all<S: EtaSource>(source: &S, entries: &[WatchEntry]) -> Result<PollResult> {
    let batches = try_join_all(entries.iter().map(|entry| fetch_tagged(source, entry))).await?;

    let mut result = PollResult::default();
    let mut have_timestamp = false;
    for batch in batches {
        if !have_timestamp {
            result.generated_at = batch.generated_at;
            have_timestamp = true;
        }
        result.records.extend(batch.records);
    }

    debug!("🚌 Polled {} entries, {} ETAs", entries.len(), result.records.len());
    Ok(result)
}

/// Like [`poll_all`], but one bad route does not blank the rest.
pub async fn poll_isolated<S: EtaSource>(source: &S, entries: &[WatchEntry]) -> PollReport {
    let mut report = PollReport::default();
    let mut have_timestamp = false;

    for (entry, batch) in poll_each(source, entries).await {
        match batch {
            Ok(batch) => {
                if !have_timestamp {
                    report.generated_at = batch.generated_at;
                    have_timestamp = true;
                }
                report.records.extend(batch.records);
            }
            Err(e) => {
                warn!("⚠️  Could not fetch ETAs for {} ({})", entry.key(), e);
                report.failures.push(EntryFailure {
                    entry: entry.clone(),
                    error: e,
                });
            }
        }
    }

    report
}

/// Groups records by normalized stop name.
///
/// Every entry's stop yields a group, in entry order, even if no record
/// lands in it. Stops without a known name are grouped under their raw id.
pub fn group_by_stop(
    entries: &[WatchEntry],
    records: &[EtaRecord],
    stop_names: &HashMap<String, String>,
) -> Vec<StopGroup> {
    let display_key = |stop_id: &str| {
        let raw = stop_names.get(stop_id).map(String::as_str).unwrap_or(stop_id);
        normalize(raw)
    };

    let mut groups: Vec<StopGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let name = display_key(&entry.stop_id);
        let slot = *index.entry(name.clone()).or_insert_with(|| {
            groups.push(StopGroup::new(name));
            groups.len() - 1
        });
        groups[slot].member_stop_ids.insert(entry.stop_id.clone());
    }

    for record in records {
        if let Some(&slot) = index.get(&display_key(&record.stop_id)) {
            groups[slot].etas.push(record.clone());
        }
    }

    groups
}

// ============================================================================
// Stop metadata cache
// ============================================================================

/// Session cache of stop metadata. Misses are not remembered, so a stop
/// that failed to resolve is asked for again next cycle.
#[derive(Default)]
pub struct StopNameCache {
    stops: Mutex<HashMap<String, StopInfo>>,
}

impl StopNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stop_id: &str) -> Option<StopInfo> {
        self.stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stop_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.stops.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// English names for `stop_ids`, fetching the ones not cached yet.
    pub async fn resolve<S: EtaSource>(&self, source: &S, stop_ids: &[&str]) -> HashMap<String, String> {
        let missing: Vec<&str> = {
            let cached = self.stops.lock().unwrap_or_else(PoisonError::into_inner);
            let mut seen = HashSet::new();
            stop_ids
                .iter()
                .copied()
                .filter(|id| !cached.contains_key(*id) && seen.insert(*id))
                .collect()
        };

        if !missing.is_empty() {
            let fetched = join_all(missing.iter().map(|id| source.fetch_stop_metadata(id))).await;
            let mut cached = self.stops.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, info) in missing.iter().zip(fetched) {
                match info {
                    Some(info) => {
                        cached.insert(id.to_string(), info);
                    }
                    None => debug!("ℹ️  No name for stop {}, showing raw id", id),
                }
            }
        }

        let cached = self.stops.lock().unwrap_or_else(PoisonError::into_inner);
        stop_ids
            .iter()
            .filter_map(|id| cached.get(*id).map(|info| (id.to_string(), info.name_en.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSource, upstream_record};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn names(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_poll_all_tags_shared_route_by_entry() {
        // Same route and direction at two different stops.
        let source = FakeSource::new()
            .with_route("S1", "272P", "1", "2024-05-01T10:00:05+08:00", vec![
                upstream_record("272P", "O", "UNIVERSITY STATION", "2024-05-01T10:04:00+08:00"),
            ])
            .with_route("S2", "272P", "1", "2024-05-01T10:00:06+08:00", vec![
                upstream_record("272P", "O", "UNIVERSITY STATION", "2024-05-01T10:09:00+08:00"),
            ]);
        let entries = vec![WatchEntry::new("S1", "272P", "1"), WatchEntry::new("S2", "272P", "1")];

        let result = poll_all(&source, &entries).await.unwrap();

        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].stop_id, "S1");
        assert_eq!(result.records[0].eta, "2024-05-01T10:04:00+08:00");
        assert_eq!(result.records[1].stop_id, "S2");
        assert_eq!(result.records[1].eta, "2024-05-01T10:09:00+08:00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_all_keeps_entry_order_when_responses_race() {
        let source = FakeSource::new()
            .with_delayed_route("S1", "1A", "1", "T1", vec![upstream_record("1A", "O", "A", "")], Duration::from_millis(50))
            .with_delayed_route("S2", "2", "1", "T2", vec![upstream_record("2", "I", "B", "")], Duration::from_millis(5));
        let entries = vec![WatchEntry::new("S1", "1A", "1"), WatchEntry::new("S2", "2", "1")];

        let result = poll_all(&source, &entries).await.unwrap();

        let routes: Vec<_> = result.records.iter().map(|r| r.route.as_str()).collect();
        assert_eq!(routes, vec!["1A", "2"]);
        assert_eq!(result.generated_at, "T1");
    }

    #[tokio::test]
    async fn test_poll_all_empty_entries() {
        let source = FakeSource::new();
        let result = poll_all(&source, &[]).await.unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.generated_at, "");
        assert_eq!(source.route_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poll_all_fails_on_error() {
        let source = FakeSource::new()
            .with_route("S1", "1A", "1", "T1", vec![upstream_record("1A", "O", "A", "")])
            .with_failing_route("S2", "2", "1", EtaError::Parse("bad body".to_string()));
        let entries = vec![WatchEntry::new("S1", "1A", "1"), WatchEntry::new("S2", "2", "1")];

        let err = poll_all(&source, &entries).await.unwrap_err();
        assert_eq!(err, EtaError::Parse("bad body".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_all_does_not_wait_for_slow_routes_after_failure() {
        let source = FakeSource::new()
            .with_delayed_route("S1", "1A", "1", "T1", vec![upstream_record("1A", "O", "A", "")], Duration::from_secs(20))
            .with_failing_route("S2", "2", "1", EtaError::Network("down".to_string()));
        let entries = vec![WatchEntry::new("S1", "1A", "1"), WatchEntry::new("S2", "2", "1")];

        let started = tokio::time::Instant::now();
        let err = poll_all(&source, &entries).await.unwrap_err();

        assert_eq!(err, EtaError::Network("down".to_string()));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_poll_each_pairs_outcomes_with_entries() {
        let source = FakeSource::new()
            .with_route("S1", "1A", "1", "T1", vec![upstream_record("1A", "O", "A", "")])
            .with_failing_route("S1", "1A", "2", EtaError::Network("down".to_string()));
        let entries = vec![WatchEntry::new("S1", "1A", "1"), WatchEntry::new("S1", "1A", "2")];

        let outcomes = poll_each(&source, &entries).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0, &entries[0]);
        assert_eq!(outcomes[0].1.as_ref().unwrap().records[0].stop_id, "S1");
        assert_eq!(outcomes[1].0, &entries[1]);
        assert!(outcomes[1].1.is_err());
    }

    #[tokio::test]
    async fn test_poll_isolated_reports_failures() {
        let source = FakeSource::new()
            .with_failing_route("S1", "1A", "1", EtaError::Network("down".to_string()))
            .with_route("S2", "2", "1", "T2", vec![upstream_record("2", "I", "B", "")]);
        let entries = vec![WatchEntry::new("S1", "1A", "1"), WatchEntry::new("S2", "2", "1")];

        let report = poll_isolated(&source, &entries).await;

        assert_eq!(report.generated_at, "T2");
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].stop_id, "S2");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entry, entries[0]);
        assert_eq!(report.failures[0].error, EtaError::Network("down".to_string()));
    }

    #[test]
    fn test_group_merges_platform_variants() {
        let entries = vec![
            WatchEntry::new("S1", "272P", "1"),
            WatchEntry::new("S2", "272X", "1"),
            WatchEntry::new("S3", "74K", "1"),
        ];
        let mut r1 = upstream_record("272P", "O", "A", "");
        r1.stop_id = "S1".to_string();
        let mut r2 = upstream_record("272X", "O", "B", "");
        r2.stop_id = "S2".to_string();
        let stop_names = names(&[("S1", "Tai Po Market (TP1)"), ("S2", "Tai Po Market (TP2)"), ("S3", "Tai Wo")]);

        let groups = group_by_stop(&entries, &[r1.clone(), r2.clone()], &stop_names);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].normalized_name, "Tai Po Market");
        assert_eq!(groups[0].member_stop_ids.iter().collect::<Vec<_>>(), vec!["S1", "S2"]);
        assert_eq!(groups[0].etas, vec![r1, r2]);
        assert_eq!(groups[1].normalized_name, "Tai Wo");
    }

    #[test]
    fn test_group_retains_stops_without_etas() {
        let entries = vec![WatchEntry::new("S1", "272P", "1"), WatchEntry::new("S9", "1", "1")];
        let mut r1 = upstream_record("272P", "O", "A", "");
        r1.stop_id = "S1".to_string();

        let groups = group_by_stop(&entries, &[r1], &names(&[("S1", "Central")]));

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].normalized_name, "S9");
        assert!(groups[1].etas.is_empty());
    }

    #[test]
    fn test_group_ignores_records_from_unwatched_stops() {
        let entries = vec![WatchEntry::new("S1", "272P", "1")];
        let mut stray = upstream_record("272P", "O", "A", "");
        stray.stop_id = "S7".to_string();

        let groups = group_by_stop(&entries, &[stray], &HashMap::new());

        assert_eq!(groups.len(), 1);
        assert!(groups[0].etas.is_empty());
    }

    #[tokio::test]
    async fn test_name_cache_fetches_once_and_retries_misses() {
        let source = FakeSource::new().with_stop("S1", "Central (PA1)");
        let cache = StopNameCache::new();

        let first = cache.resolve(&source, &["S1", "S1", "S2"]).await;
        assert_eq!(first, names(&[("S1", "Central (PA1)")]));
        assert_eq!(source.stop_calls.load(Ordering::SeqCst), 2);

        let second = cache.resolve(&source, &["S1", "S2"]).await;
        assert_eq!(second, first);
        // S1 is cached, S2 is asked for again.
        assert_eq!(source.stop_calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 1);
    }
}
