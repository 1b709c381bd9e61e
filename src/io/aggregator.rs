//! Carrier aggregator client (Sendcloud REST v2)

use crate::domain::error::UpstreamError;
use crate::domain::types::{strip_code, ParcelRecord};
use crate::infra::config::Config;
use crate::services::carriers;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Multi-carrier tracking aggregator
#[async_trait]
pub trait CarrierAggregator: Send + Sync {
    /// Single parcel lookup; `None` when the aggregator does not know the code
    async fn get_parcel_by_tracking(&self, code: &str) -> Result<Option<ParcelRecord>, UpstreamError>;

    /// Every parcel updated since `since`, all pages
    async fn list_parcels_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ParcelRecord>, UpstreamError>;
}

pub struct SendcloudClient {
    base_url: String,
    auth_header: String,
    http: reqwest::Client,
    page_limit: u32,
    max_pages: u32,
    page_pause: Duration,
}

impl SendcloudClient {
    pub fn new(config: &Config) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.sendcloud_timeout_ms()))
            .build()?;
        let credentials = format!("{}:{}", config.sendcloud_public_key(), config.sendcloud_secret_key());
        Ok(Self {
            base_url: config.sendcloud_url().trim_end_matches('/').to_string(),
            auth_header: format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            ),
            http,
            page_limit: config.sendcloud_page_limit(),
            max_pages: config.sendcloud_max_pages(),
            page_pause: Duration::from_millis(config.sendcloud_page_pause_ms()),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>, UpstreamError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status: status.as_u16(), body });
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl CarrierAggregator for SendcloudClient {
    async fn get_parcel_by_tracking(&self, code: &str) -> Result<Option<ParcelRecord>, UpstreamError> {
        // tracking codes are alphanumeric; scanner noise must not reach the URL path
        let code = strip_code(code);
        if code.is_empty() {
            return Ok(None);
        }
        let url = format!("{}/tracking/{}", self.base_url, code);
        let Some(body) = self.get_json(&url).await? else {
            debug!(code = %code, "aggregator_tracking_not_found");
            return Ok(None);
        };
        Ok(parcel_from_tracking(&code, &body))
    }

    async fn list_parcels_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ParcelRecord>, UpstreamError> {
        let started = Instant::now();
        let mut url = Some(format!(
            "{}/parcels?updated_after={}&limit={}",
            self.base_url,
            since.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.page_limit
        ));
        let mut parcels = Vec::new();
        let mut pages = 0u32;

        while let Some(next) = url.take() {
            if pages >= self.max_pages {
                warn!(pages = pages, parcels = parcels.len(), "aggregator_page_cap_reached");
                break;
            }
            if pages > 0 && !self.page_pause.is_zero() {
                tokio::time::sleep(self.page_pause).await;
            }
            let body = self
                .get_json(&next)
                .await?
                .ok_or_else(|| UpstreamError::Decode("parcel listing returned 404".to_string()))?;
            pages += 1;

            let page = body
                .get("parcels")
                .and_then(Value::as_array)
                .ok_or_else(|| UpstreamError::Decode("missing parcels array".to_string()))?;
            parcels.extend(page.iter().filter_map(parcel_from_listing));
            url = body.get("next").and_then(Value::as_str).map(str::to_string);
        }

        info!(
            pages = pages,
            parcels = parcels.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "aggregator_parcels_listed"
        );
        Ok(parcels)
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Parcel object from `GET /parcels`
fn parcel_from_listing(parcel: &Value) -> Option<ParcelRecord> {
    let tracking = text(parcel.get("tracking_number"))
        .or_else(|| text(parcel.pointer("/carrier/tracking_number")))?;
    let carrier_code =
        text(parcel.pointer("/carrier/code")).or_else(|| text(parcel.pointer("/shipment/name")));
    Some(ParcelRecord {
        tracking: tracking.to_uppercase(),
        carrier: carrier_code.as_deref().and_then(carriers::normalize),
        carrier_code,
        order_ref: text(parcel.get("order_number")),
        external_ref: text(parcel.get("external_reference")),
        recipient: text(parcel.get("name")),
        company: text(parcel.get("company_name")),
        status: text(parcel.pointer("/status/message")),
        created_at: text(parcel.get("date_created")),
    })
}

/// Tracking object from `GET /tracking/{code}`
fn parcel_from_tracking(code: &str, body: &Value) -> Option<ParcelRecord> {
    let carrier_code =
        text(body.get("carrier_code")).or_else(|| text(body.pointer("/carrier/code")));
    let tracking = text(body.get("tracking_number")).unwrap_or_else(|| code.trim().to_uppercase());
    if tracking.is_empty() {
        return None;
    }
    Some(ParcelRecord {
        tracking: tracking.to_uppercase(),
        carrier: carrier_code.as_deref().and_then(carriers::normalize),
        carrier_code,
        order_ref: text(body.get("order_number")),
        external_ref: text(body.get("external_reference")),
        recipient: text(body.get("name")),
        company: text(body.get("company_name")),
        status: text(body.pointer("/status/message")).or_else(|| text(body.get("status"))),
        created_at: text(body.get("date_created")),
    })
}
