// Live stop-centric board: one refresh cycle, the last good snapshot, and
// the view rows the HTTP layer hands out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::aggregator::{EntryFailure, StopNameCache, group_by_stop, poll_each};
use crate::client::EtaSource;
use crate::error::Result;
use crate::models::{EtaRecord, StopGroup, WatchEntry};
use crate::scheduler::{Clock, Scheduler};
use crate::storage::KeyValueStore;
use crate::store::WatchListStore;
use crate::time_format::{format_countdown, format_time_of_day, minutes_until};

/// Records published for one watch entry. `stale` marks records kept from
/// an earlier cycle because this cycle's fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecords {
    pub entry: WatchEntry,
    pub records: Vec<EtaRecord>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub generated_at: String,
    pub refreshed_at: DateTime<Utc>,
    pub entries: Vec<EntryRecords>,
    pub groups: Vec<StopGroup>,
    pub failures: Vec<EntryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Published,
    /// The board was shut down while the cycle was in flight.
    Discarded,
}

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArrivalView {
    pub route: String,
    pub destination: String,
    pub direction: String,
    pub eta: String,
    pub minutes: Option<i64>,
    pub countdown: String,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopView {
    pub name: String,
    pub stop_ids: Vec<String>,
    pub arrivals: Vec<ArrivalView>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardView {
    pub generated_at: String,
    pub local_time: String,
    pub stops: Vec<StopView>,
    pub failed_routes: Vec<String>,
}

impl BoardSnapshot {
    /// Every record, in watch-list order.
    pub fn records(&self) -> impl Iterator<Item = &EtaRecord> {
        self.entries.iter().flat_map(|e| e.records.iter())
    }

    /// What this snapshot holds for the entry with the same key as `entry`.
    pub fn records_for(&self, entry: &WatchEntry) -> Option<&[EtaRecord]> {
        self.entries
            .iter()
            .find(|e| e.entry.matches(&entry.key()))
            .map(|e| e.records.as_slice())
    }

    pub fn render(&self, now: DateTime<Utc>) -> BoardView {
        let stops = self
            .groups
            .iter()
            .map(|group| {
                let arrivals: Vec<ArrivalView> = group
                    .etas
                    .iter()
                    .map(|eta| ArrivalView {
                        route: eta.route.clone(),
                        destination: eta.destination_en.clone(),
                        direction: eta.bound().to_string(),
                        eta: format_time_of_day(&eta.eta),
                        minutes: minutes_until(&eta.eta, now),
                        countdown: format_countdown(&eta.eta, now),
                        remark: eta.remark_en.clone(),
                    })
                    .collect();

                let message = arrivals
                    .is_empty()
                    .then(|| "No buses found for this stop.".to_string());

                StopView {
                    name: group.normalized_name.clone(),
                    stop_ids: group.member_stop_ids.iter().cloned().collect(),
                    arrivals,
                    message,
                }
            })
            .collect();

        BoardView {
            generated_at: format_time_of_day(&self.generated_at),
            local_time: format_time_of_day(&now.to_rfc3339()),
            stops,
            failed_routes: self.failures.iter().map(|f| f.entry.key().to_string()).collect(),
        }
    }
}

// ============================================================================
// Live board
// ============================================================================

pub struct LiveBoard<S, K, C> {
    source: S,
    store: Arc<WatchListStore<K>>,
    names: StopNameCache,
    clock: C,
    snapshot: RwLock<Option<Arc<BoardSnapshot>>>,
    // One cycle at a time, so an older cycle never publishes over a newer one.
    cycle: Mutex<()>,
    torn_down: AtomicBool,
}

impl<S, K, C> LiveBoard<S, K, C>
where
    S: EtaSource + 'static,
    K: KeyValueStore + 'static,
    C: Clock + 'static,
{
    pub fn new(source: S, store: Arc<WatchListStore<K>>, clock: C) -> Self {
        LiveBoard {
            source,
            store,
            names: StopNameCache::new(),
            clock,
            snapshot: RwLock::new(None),
            cycle: Mutex::new(()),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &WatchListStore<K> {
        &self.store
    }

    pub fn stop_names(&self) -> &StopNameCache {
        &self.names
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Last published snapshot, if any cycle has completed.
    pub fn snapshot(&self) -> Option<Arc<BoardSnapshot>> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn render(&self) -> Option<BoardView> {
        self.snapshot().map(|s| s.render(self.clock.now()))
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// After this, cycles still in flight finish but publish nothing.
    pub fn shutdown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }

    /// Runs one poll cycle.
    ///
    /// Cycles never overlap: a call made while another is running waits for
    /// it, then reads the watch-list afresh. When every route fails the
    /// previous snapshot stays and the first error is returned. A route that
    /// fails on its own keeps, in its own place, the records the previous
    /// snapshot had for that exact entry.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let _cycle = self.cycle.lock().await;

        let entries = self.store.load().await;
        let outcomes = poll_each(&self.source, &entries).await;

        if outcomes.iter().all(|(_, outcome)| outcome.is_err()) {
            if let Some((_, Err(error))) = outcomes.first() {
                warn!("⚠️  Every route failed, keeping last board ({})", error);
                return Err(error.clone());
            }
        }

        let previous = self.snapshot();
        let mut generated_at: Option<String> = None;
        let mut published = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();

        for (entry, outcome) in outcomes {
            match outcome {
                Ok(batch) => {
                    if generated_at.is_none() {
                        generated_at = Some(batch.generated_at);
                    }
                    published.push(EntryRecords {
                        entry: entry.clone(),
                        records: batch.records,
                        stale: false,
                    });
                }
                Err(error) => {
                    warn!("⚠️  Could not fetch ETAs for {} ({})", entry.key(), error);
                    let kept = previous
                        .as_deref()
                        .and_then(|p| p.records_for(entry))
                        .map(<[EtaRecord]>::to_vec)
                        .unwrap_or_default();
                    published.push(EntryRecords {
                        entry: entry.clone(),
                        records: kept,
                        stale: true,
                    });
                    failures.push(EntryFailure {
                        entry: entry.clone(),
                        error,
                    });
                }
            }
        }

        let records: Vec<EtaRecord> = published.iter().flat_map(|e| e.records.iter().cloned()).collect();
        let stop_ids: Vec<&str> = entries.iter().map(|e| e.stop_id.as_str()).collect();
        let stop_names = self.names.resolve(&self.source, &stop_ids).await;
        let groups = group_by_stop(&entries, &records, &stop_names);

        if self.is_torn_down() {
            return Ok(RefreshOutcome::Discarded);
        }

        info!(
            "✓ Board refreshed: {} stops, {} ETAs, {} failed routes",
            groups.len(),
            records.len(),
            failures.len()
        );

        let snapshot = BoardSnapshot {
            generated_at: generated_at.unwrap_or_default(),
            refreshed_at: self.clock.now(),
            entries: published,
            groups,
            failures,
        };
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot));

        Ok(RefreshOutcome::Published)
    }

    /// Refreshes every `period` on a background task.
    pub fn start_polling(self: &Arc<Self>, period: Duration) -> Scheduler {
        let board = Arc::clone(self);
        Scheduler::start(period, move || {
            let board = Arc::clone(&board);
            async move {
                if let Err(e) = board.refresh().await {
                    warn!("⚠️  Auto-refresh failed: {}", e);
                }
            }
        })
    }
}
