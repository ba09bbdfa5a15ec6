// Data model for the KMB ETA board.
// KMB open data: https://data.etabus.gov.hk/
//
// API Endpoints:
// - Route ETA at a stop: {base}/eta/{stop_id}/{route}/{service_type}
// - Stop metadata:       {base}/stop/{stop_id}

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Watch-list
// ============================================================================

/// One subscription: a route variant expected at a physical stop.
///
/// Serialized with the field names the persisted list has always used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchEntry {
    #[serde(rename = "stop")]
    pub stop_id: String,
    pub route: String,
    #[serde(rename = "service_type", alias = "dir")]
    pub service_type: String,
}

impl WatchEntry {
    pub fn new(stop_id: impl Into<String>, route: impl Into<String>, service_type: impl Into<String>) -> Self {
        WatchEntry {
            stop_id: stop_id.into(),
            route: route.into(),
            service_type: service_type.into(),
        }
    }

    pub fn key(&self) -> EntryKey<'_> {
        EntryKey {
            stop_id: &self.stop_id,
            route: &self.route,
            service_type: &self.service_type,
        }
    }

    pub fn matches(&self, key: &EntryKey<'_>) -> bool {
        self.key() == *key
    }
}

/// Uniqueness key of a [`WatchEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey<'a> {
    pub stop_id: &'a str,
    pub route: &'a str,
    pub service_type: &'a str,
}

impl fmt::Display for EntryKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.route, self.stop_id, self.service_type)
    }
}

/// Entries the board starts with when nothing has been saved yet.
pub fn default_watch_list() -> Vec<WatchEntry> {
    vec![
        WatchEntry::new("B464BD6334A93FA1", "272P", "1"),
        WatchEntry::new("B644204AEDE7A031", "272X", "1"),
    ]
}

// ============================================================================
// ETA records
// ============================================================================

/// Travel direction as published in the `dir` field.
///
/// Only `O`/`1` and `I`/`2` are known encodings; other codes are kept
/// verbatim rather than guessed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
    Other(String),
}

impl Direction {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "O" | "o" | "1" => Direction::Outbound,
            "I" | "i" | "2" => Direction::Inbound,
            other => Direction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
            Direction::Other(code) => write!(f, "{}", code),
        }
    }
}

/// One predicted arrival. Rebuilt on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EtaRecord {
    pub route: String,
    pub direction: String,
    pub service_type: String,
    pub destination_en: String,
    pub eta: String,
    pub eta_seq: u32,
    pub remark_en: String,
    pub data_timestamp: String,
    /// Stop of the watch entry whose request produced this record.
    pub stop_id: String,
}

impl EtaRecord {
    pub fn bound(&self) -> Direction {
        Direction::from_code(&self.direction)
    }
}

/// Result of a single route request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EtaBatch {
    pub generated_at: String,
    pub records: Vec<EtaRecord>,
}

// ============================================================================
// Stops
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopInfo {
    pub stop_id: String,
    pub name_en: String,
    pub name_tc: Option<String>,
    pub name_sc: Option<String>,
    pub coordinates: Option<Coordinates>,
}

/// Records for every subscribed stop sharing a normalized name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopGroup {
    pub normalized_name: String,
    pub member_stop_ids: BTreeSet<String>,
    pub etas: Vec<EtaRecord>,
}

impl StopGroup {
    pub fn new(normalized_name: String) -> Self {
        StopGroup {
            normalized_name,
            member_stop_ids: BTreeSet::new(),
            etas: Vec::new(),
        }
    }
}

// ============================================================================
// Raw API payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct RawEtaResponse {
    #[serde(default, deserialize_with = "nullable_string")]
    pub generated_timestamp: String,
    #[serde(default)]
    pub data: Option<Vec<RawEta>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawEta {
    #[serde(default, deserialize_with = "nullable_string")]
    pub route: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub dir: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub service_type: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub dest_en: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub eta: String,
    #[serde(default)]
    pub eta_seq: Option<u32>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub rmk_en: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub data_timestamp: String,
}

impl RawEta {
    pub fn into_record(self, stop_id: &str) -> EtaRecord {
        EtaRecord {
            route: self.route,
            direction: self.dir,
            service_type: self.service_type,
            destination_en: self.dest_en,
            eta: self.eta,
            eta_seq: self.eta_seq.unwrap_or(0),
            remark_en: self.rmk_en,
            data_timestamp: self.data_timestamp,
            stop_id: stop_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawStopResponse {
    #[serde(default)]
    pub data: Option<RawStop>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawStop {
    #[serde(default, deserialize_with = "nullable_string")]
    pub stop: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name_en: String,
    #[serde(default)]
    pub name_tc: Option<String>,
    #[serde(default)]
    pub name_sc: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub lat: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub long: String,
}

impl RawStop {
    pub fn into_stop_info(self, requested_id: &str) -> Option<StopInfo> {
        if self.name_en.is_empty() {
            return None;
        }

        let coordinates = match (self.lat.parse::<f64>(), self.long.parse::<f64>()) {
            (Ok(latitude), Ok(longitude)) => Some(Coordinates { latitude, longitude }),
            _ => None,
        };

        let stop_id = if self.stop.is_empty() {
            requested_id.to_string()
        } else {
            self.stop
        };

        Some(StopInfo {
            stop_id,
            name_en: self.name_en,
            name_tc: self.name_tc.filter(|s| !s.is_empty()),
            name_sc: self.name_sc.filter(|s| !s.is_empty()),
            coordinates,
        })
    }
}

fn nullable_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// Some KMB fields flip between "1" and 1 depending on the endpoint.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_entry_persisted_field_names() {
        let entry = WatchEntry::new("B464BD6334A93FA1", "272P", "1");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"stop":"B464BD6334A93FA1","route":"272P","service_type":"1"}"#);

        let back: WatchEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_watch_entry_accepts_dir_alias() {
        let entry: WatchEntry =
            serde_json::from_str(r#"{"stop":"S1","route":"1A","dir":"1"}"#).unwrap();
        assert_eq!(entry.service_type, "1");
    }

    #[test]
    fn test_entry_key_equality() {
        let a = WatchEntry::new("S1", "1A", "1");
        let b = WatchEntry::new("S1", "1A", "2");
        assert!(a.matches(&a.key()));
        assert!(!a.matches(&b.key()));
        assert_eq!(a.key().to_string(), "1A@S1/1");
    }

    #[test]
    fn test_direction_codes() {
        assert_eq!(Direction::from_code("O"), Direction::Outbound);
        assert_eq!(Direction::from_code("1"), Direction::Outbound);
        assert_eq!(Direction::from_code("I"), Direction::Inbound);
        assert_eq!(Direction::from_code("2"), Direction::Inbound);
        assert_eq!(Direction::from_code("3"), Direction::Other("3".to_string()));
    }

    #[test]
    fn test_stop_without_name_is_absent() {
        let raw = RawStop {
            stop: "S1".to_string(),
            ..Default::default()
        };
        assert!(raw.into_stop_info("S1").is_none());
    }
}
