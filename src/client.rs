// Remote ETA client for the KMB open data API.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{EtaError, Result};
use crate::models::{EtaBatch, RawEtaResponse, RawStopResponse, StopInfo};

/// Where arrival predictions and stop metadata come from.
///
/// The aggregator and the live board are generic over this so they can run
/// against canned data.
pub trait EtaSource: Send + Sync {
    /// One request for one route variant at one stop. Every record in the
    /// batch is tagged with `stop_id`.
    fn fetch_route_etas(
        &self,
        stop_id: &str,
        route: &str,
        service_type: &str,
    ) -> impl Future<Output = Result<EtaBatch>> + Send;

    /// Stop metadata, or `None` when unknown or unreachable.
    fn fetch_stop_metadata(&self, stop_id: &str) -> impl Future<Output = Option<StopInfo>> + Send;
}

pub struct KmbClient {
    http: Client,
    base_url: String,
}

impl KmbClient {
    pub const BASE_URL: &'static str = "https://data.etabus.gov.hk/v1/transport/kmb";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;

    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EtaError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(KmbClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EtaError::Network(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(EtaError::Network(format!("API returned error: {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| EtaError::Network(format!("Failed to read response: {}", e)))
    }
}

impl EtaSource for KmbClient {
    async fn fetch_route_etas(&self, stop_id: &str, route: &str, service_type: &str) -> Result<EtaBatch> {
        let url = format!("{}/eta/{}/{}/{}", self.base_url, stop_id, route, service_type);
        debug!("📡 GET {}", url);

        let body = self.get_text(&url).await?;
        parse_eta_body(&body, stop_id)
    }

    async fn fetch_stop_metadata(&self, stop_id: &str) -> Option<StopInfo> {
        let url = format!("{}/stop/{}", self.base_url, stop_id);

        match self.get_text(&url).await {
            Ok(body) => {
                let info = parse_stop_body(&body, stop_id);
                if info.is_none() {
                    debug!("ℹ️  No stop record for {}", stop_id);
                }
                info
            }
            Err(e) => {
                warn!("⚠️  Failed to fetch stop info for {} ({})", stop_id, e);
                None
            }
        }
    }
}

/// Decodes an `/eta` body, tagging every record with `stop_id`.
pub fn parse_eta_body(body: &str, stop_id: &str) -> Result<EtaBatch> {
    let response: RawEtaResponse = serde_json::from_str(body)
        .map_err(|e| EtaError::Parse(format!("Invalid ETA response: {}", e)))?;

    let records = response
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|raw| raw.into_record(stop_id))
        .collect();

    Ok(EtaBatch {
        generated_at: response.generated_timestamp,
        records,
    })
}

/// Decodes a `/stop` body. Anything unusable counts as "no record".
pub fn parse_stop_body(body: &str, stop_id: &str) -> Option<StopInfo> {
    match serde_json::from_str::<RawStopResponse>(body) {
        Ok(response) => response.data?.into_stop_info(stop_id),
        Err(e) => {
            warn!("⚠️  Failed to parse stop info for {} ({})", stop_id, e);
            None
        }
    }
}
