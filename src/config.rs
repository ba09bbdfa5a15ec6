use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::client::KmbClient;
use crate::scheduler::Scheduler;
use crate::storage::FileStore;

/// Runtime settings, read from the environment (and `.env` when present).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_base_url: String,
    pub data_dir: PathBuf,
    pub poll_period: Duration,
    pub request_timeout: Duration,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: KmbClient::BASE_URL.to_string(),
            data_dir: FileStore::default_dir(),
            poll_period: Scheduler::DATA_POLL_PERIOD,
            request_timeout: Duration::from_secs(KmbClient::REQUEST_TIMEOUT_SECS),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        Config {
            api_base_url: lookup("KMB_API_BASE_URL").unwrap_or(defaults.api_base_url),
            data_dir: lookup("KMB_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            poll_period: parse_secs(&lookup, "KMB_POLL_SECS").unwrap_or(defaults.poll_period),
            request_timeout: parse_secs(&lookup, "KMB_REQUEST_TIMEOUT_SECS").unwrap_or(defaults.request_timeout),
            bind_addr: lookup("KMB_BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match u64::from_str(raw.trim()) {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!("⚠️  Ignoring {}={:?}, expected a positive number of seconds", key, raw);
            None
        }
    }
}
