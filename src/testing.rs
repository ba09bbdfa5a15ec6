// Canned ETA source shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::client::EtaSource;
use crate::error::{EtaError, Result};
use crate::models::{EtaBatch, EtaRecord, StopInfo};

#[derive(Clone)]
struct CannedRoute {
    outcome: std::result::Result<EtaBatch, EtaError>,
    delay: Duration,
}

#[derive(Default)]
pub struct FakeSource {
    routes: Mutex<HashMap<String, CannedRoute>>,
    stops: HashMap<String, StopInfo>,
    pub route_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

fn route_key(stop_id: &str, route: &str, service_type: &str) -> String {
    format!("{}|{}|{}", stop_id, route, service_type)
}

/// A record as upstream would send it: no stop attached.
pub fn upstream_record(route: &str, dir: &str, dest: &str, eta: &str) -> EtaRecord {
    EtaRecord {
        route: route.to_string(),
        direction: dir.to_string(),
        service_type: "1".to_string(),
        destination_en: dest.to_string(),
        eta: eta.to_string(),
        eta_seq: 1,
        remark_en: String::new(),
        data_timestamp: "2024-05-01T10:00:00+08:00".to_string(),
        stop_id: String::new(),
    }
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(
        self,
        stop_id: &str,
        route: &str,
        service_type: &str,
        generated_at: &str,
        records: Vec<EtaRecord>,
    ) -> Self {
        self.with_delayed_route(stop_id, route, service_type, generated_at, records, Duration::ZERO)
    }

    pub fn with_delayed_route(
        self,
        stop_id: &str,
        route: &str,
        service_type: &str,
        generated_at: &str,
        records: Vec<EtaRecord>,
        delay: Duration,
    ) -> Self {
        let batch = EtaBatch {
            generated_at: generated_at.to_string(),
            records,
        };
        self.set_outcome(stop_id, route, service_type, Ok(batch), delay);
        self
    }

    pub fn with_failing_route(self, stop_id: &str, route: &str, service_type: &str, error: EtaError) -> Self {
        self.set_outcome(stop_id, route, service_type, Err(error), Duration::ZERO);
        self
    }

    pub fn with_stop(mut self, stop_id: &str, name_en: &str) -> Self {
        self.stops.insert(
            stop_id.to_string(),
            StopInfo {
                stop_id: stop_id.to_string(),
                name_en: name_en.to_string(),
                name_tc: None,
                name_sc: None,
                coordinates: None,
            },
        );
        self
    }

    /// Replaces the canned answer for a route after construction.
    pub fn set_outcome(
        &self,
        stop_id: &str,
        route: &str,
        service_type: &str,
        outcome: std::result::Result<EtaBatch, EtaError>,
        delay: Duration,
    ) {
        self.routes
            .lock()
            .unwrap()
            .insert(route_key(stop_id, route, service_type), CannedRoute { outcome, delay });
    }
}

impl EtaSource for FakeSource {
    async fn fetch_route_etas(&self, stop_id: &str, route: &str, service_type: &str) -> Result<EtaBatch> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        let canned = self
            .routes
            .lock()
            .unwrap()
            .get(&route_key(stop_id, route, service_type))
            .cloned();

        match canned {
            Some(canned) => {
                if !canned.delay.is_zero() {
                    tokio::time::sleep(canned.delay).await;
                }
                canned.outcome
            }
            None => Err(EtaError::Network(format!("no canned route for {}", route))),
        }
    }

    async fn fetch_stop_metadata(&self, stop_id: &str) -> Option<StopInfo> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.stops.get(stop_id).cloned()
    }
}
