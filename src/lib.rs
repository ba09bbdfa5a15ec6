// Live KMB bus arrival board: polls the KMB open data ETA API for a
// persisted watch-list of route/stop pairs and groups the predictions by
// physical stop.

pub mod aggregator;
pub mod board;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod stop_name;
pub mod storage;
pub mod store;
pub mod time_format;

#[cfg(test)]
mod testing;

pub use aggregator::{PollReport, PollResult, StopNameCache, group_by_stop, poll_all, poll_each, poll_isolated};
pub use board::{BoardSnapshot, BoardView, EntryRecords, LiveBoard, RefreshOutcome};
pub use client::{EtaSource, KmbClient};
pub use config::Config;
pub use error::{EtaError, Result};
pub use models::{Direction, EntryKey, EtaRecord, StopGroup, StopInfo, WatchEntry, default_watch_list};
pub use scheduler::{Clock, ManualClock, Scheduler, SystemClock};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use store::WatchListStore;
pub use time_format::{format_time_of_day, minutes_until};
