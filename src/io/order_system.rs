//! Order system client (Odoo JSON-RPC)
//!
//! Outbound shipments are `stock.picking` records. The session uid is
//! obtained once through `common.authenticate` and reused for every
//! `object.execute_kw` call.

use crate::domain::error::UpstreamError;
use crate::domain::types::{parse_date_prefix, strip_code, Carrier, ShipmentId, ShipmentRecord};
use crate::infra::config::Config;
use crate::services::patterns::MIN_CANDIDATE_LEN;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Read and write access to outbound shipments
#[async_trait]
pub trait OrderSystem: Send + Sync {
    /// Declared-code lookup: exact match first, then contains
    ///
    /// The contains step only runs for codes of at least `MIN_CANDIDATE_LEN`
    /// characters.
    async fn find_shipment_by_tracking_code(
        &self,
        code: &str,
    ) -> Result<Option<ShipmentRecord>, UpstreamError>;

    /// First outbound, completed shipment whose declared code contains one of
    /// the candidates, tried in the given order
    async fn search_shipments_by_candidates(
        &self,
        candidates: &[String],
        carrier: Option<&Carrier>,
    ) -> Result<Option<ShipmentRecord>, UpstreamError>;

    /// Recent outbound shipments with a declared code, scheduled on or after `since`
    async fn list_recent_outbound(&self, since: NaiveDate) -> Result<Vec<ShipmentRecord>, UpstreamError>;

    /// Write the expedition date; returns how many shipments were updated
    async fn set_expedition_date(
        &self,
        ids: &[ShipmentId],
        date: NaiveDate,
    ) -> Result<usize, UpstreamError>;

    async fn find_by_customer_name(
        &self,
        name: &str,
        since: NaiveDate,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError>;

    async fn find_by_order_reference(
        &self,
        reference: &str,
        since: NaiveDate,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError>;
}

const MODEL: &str = "stock.picking";
const RECENT_LIMIT: u32 = 15_000;
const CLIENT_SEARCH_LIMIT: u32 = 20;
const RECENT_STATES: [&str; 4] = ["done", "assigned", "confirmed", "waiting"];

const FIELDS: [&str; 9] = [
    "id",
    "name",
    "carrier_tracking_ref",
    "partner_id",
    "origin",
    "scheduled_date",
    "state",
    "carrier_id",
    "manual_expedition_date",
];

/// Odoo JSON-RPC client
pub struct OdooClient {
    endpoint: String,
    db: String,
    user: String,
    api_key: String,
    http: reqwest::Client,
    uid: OnceCell<i64>,
    team_filter: Option<String>,
    request_id: AtomicU64,
}

impl OdooClient {
    pub fn new(config: &Config) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.odoo_timeout_ms()))
            .build()?;
        Ok(Self {
            endpoint: format!("{}/jsonrpc", config.odoo_url()),
            db: config.odoo_db().to_string(),
            user: config.odoo_user().to_string(),
            api_key: config.odoo_api_key().to_string(),
            http,
            uid: OnceCell::new(),
            team_filter: config.odoo_team_filter().map(str::to_string),
            request_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, UpstreamError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": { "service": service, "method": method, "args": args },
            "id": id,
        });

        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status: status.as_u16(), body });
        }

        let mut reply: Value = response.json().await?;
        if let Some(error) = reply.get("error") {
            return Err(UpstreamError::Rpc(rpc_error_message(error)));
        }
        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    async fn uid(&self) -> Result<i64, UpstreamError> {
        self.uid
            .get_or_try_init(|| async {
                let result = self
                    .call("common", "authenticate", json!([self.db, self.user, self.api_key, {}]))
                    .await?;
                // Odoo answers `false` for bad credentials
                result.as_i64().ok_or(UpstreamError::Auth)
            })
            .await
            .copied()
    }

    async fn execute_kw(&self, method: &str, args: Value, kwargs: Value) -> Result<Value, UpstreamError> {
        let uid = self.uid().await?;
        self.call(
            "object",
            "execute_kw",
            json!([self.db, uid, self.api_key, MODEL, method, args, kwargs]),
        )
        .await
    }

    async fn search_read(
        &self,
        domain: Value,
        limit: u32,
        order: Option<&str>,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        let mut kwargs = json!({ "fields": FIELDS, "limit": limit });
        if let Some(order) = order {
            kwargs["order"] = json!(order);
        }
        let rows = self.execute_kw("search_read", json!([domain]), kwargs).await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| UpstreamError::Decode("search_read did not return a list".to_string()))?;
        Ok(rows.iter().filter_map(shipment_from_row).collect())
    }

    async fn search_one(&self, domain: Value) -> Result<Option<ShipmentRecord>, UpstreamError> {
        Ok(self.search_read(domain, 1, None).await?.into_iter().next())
    }
}

#[async_trait]
impl OrderSystem for OdooClient {
    async fn find_shipment_by_tracking_code(
        &self,
        code: &str,
    ) -> Result<Option<ShipmentRecord>, UpstreamError> {
        if let Some(found) = self.search_one(json!([["carrier_tracking_ref", "=", code]])).await? {
            return Ok(Some(found));
        }
        if strip_code(code).len() < MIN_CANDIDATE_LEN {
            return Ok(None);
        }
        self.search_one(json!([["carrier_tracking_ref", "ilike", code]])).await
    }

    async fn search_shipments_by_candidates(
        &self,
        candidates: &[String],
        carrier: Option<&Carrier>,
    ) -> Result<Option<ShipmentRecord>, UpstreamError> {
        for candidate in candidates {
            let mut domain = vec![
                json!(["carrier_tracking_ref", "ilike", candidate]),
                json!(["state", "=", "done"]),
                json!(["picking_type_code", "=", "outgoing"]),
            ];
            if let Some(carrier) = carrier {
                domain.push(json!(["carrier_id.name", "ilike", carrier.as_str()]));
            }
            if let Some(found) = self.search_one(Value::Array(domain)).await? {
                debug!(candidate = %candidate, declared = %found.declared_code, "candidate_matched");
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn list_recent_outbound(&self, since: NaiveDate) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        let since = since.format("%Y-%m-%d").to_string();
        let mut domain = vec![
            json!("|"),
            json!(["name", "ilike", "out"]),
            json!(["origin", "ilike", "out"]),
            json!(["state", "in", RECENT_STATES]),
            json!(["location_dest_id", "ilike", "customer"]),
            json!(["scheduled_date", ">=", since]),
            json!(["carrier_tracking_ref", "!=", false]),
        ];
        if let Some(team) = &self.team_filter {
            domain.push(json!(["sale_id.team_id", "ilike", team]));
        }
        let shipments =
            self.search_read(Value::Array(domain), RECENT_LIMIT, Some("scheduled_date desc")).await?;
        Ok(shipments.into_iter().filter(|s| !s.declared_code.trim().is_empty()).collect())
    }

    async fn set_expedition_date(
        &self,
        ids: &[ShipmentId],
        date: NaiveDate,
    ) -> Result<usize, UpstreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let result = self
            .execute_kw(
                "write",
                json!([raw, { "manual_expedition_date": date.format("%Y-%m-%d").to_string() }]),
                json!({}),
            )
            .await?;
        if result.as_bool() == Some(true) {
            Ok(ids.len())
        } else {
            warn!(result = %result, "expedition_write_unexpected_reply");
            Err(UpstreamError::Decode(format!("write returned {result}")))
        }
    }

    async fn find_by_customer_name(
        &self,
        name: &str,
        since: NaiveDate,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        self.search_read(client_domain("partner_id.name", name, since), CLIENT_SEARCH_LIMIT, Some("scheduled_date desc"))
            .await
    }

    async fn find_by_order_reference(
        &self,
        reference: &str,
        since: NaiveDate,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        self.search_read(client_domain("origin", reference, since), CLIENT_SEARCH_LIMIT, Some("scheduled_date desc"))
            .await
    }
}

fn client_domain(field: &str, term: &str, since: NaiveDate) -> Value {
    json!([
        [field, "ilike", term],
        ["state", "=", "done"],
        ["picking_type_code", "=", "outgoing"],
        ["carrier_tracking_ref", "!=", false],
        ["scheduled_date", ">=", since.format("%Y-%m-%d").to_string()],
    ])
}

fn rpc_error_message(error: &Value) -> String {
    error
        .pointer("/data/message")
        .or_else(|| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown fault")
        .to_string()
}

/// Odoo sends `false` for empty scalar fields
fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Display name of a many2one field (`[id, "name"]` or `false`)
fn many2one_name(value: Option<&Value>) -> Option<String> {
    text(value.and_then(|v| v.get(1)))
}

fn shipment_from_row(row: &Value) -> Option<ShipmentRecord> {
    let id = row.get("id")?.as_i64()?;
    Some(ShipmentRecord {
        id: ShipmentId(id),
        name: text(row.get("name")).unwrap_or_default(),
        declared_code: text(row.get("carrier_tracking_ref")).unwrap_or_default(),
        order_ref: text(row.get("origin")).unwrap_or_default(),
        customer_name: many2one_name(row.get("partner_id")).unwrap_or_default(),
        scheduled_date: text(row.get("scheduled_date")).as_deref().and_then(parse_date_prefix),
        state: text(row.get("state")).unwrap_or_default(),
        carrier_hint: many2one_name(row.get("carrier_id")),
        expedition_date: text(row.get("manual_expedition_date")).as_deref().and_then(parse_date_prefix),
    })
}
