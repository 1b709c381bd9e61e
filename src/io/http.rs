//! HTTP operations endpoint
//!
//! Serves Prometheus text at /metrics plus the index controls:
//! - `GET /health`
//! - `GET /index/summary` - summary of the installed snapshot
//! - `POST /index/rebuild` - synchronous rebuild, 409 while one is running
//!
//! Uses hyper for the HTTP server.

use crate::domain::error::Rejection;
use crate::domain::types::Provenance;
use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, UPSTREAM_LABELS,
};
use crate::services::index::IndexHandle;
use crate::services::index_builder::{BuildError, IndexBuilder};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write one counter family split by a single label
fn write_labeled_counter<'a>(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: impl Iterator<Item = (&'a str, u64)>,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.summary();
    let mut output = String::with_capacity(4096);

    write_resolution_metrics(&mut output, site_id, &summary);
    write_consolidation_metrics(&mut output, site_id, &summary);
    write_index_metrics(&mut output, site_id, &summary);

    output
}

fn write_resolution_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "dock_resolutions_total",
        "Scanned codes resolved, by provenance",
        site,
        "provenance",
        Provenance::ALL.iter().map(|p| (p.as_str(), summary.resolutions[p.slot()])),
    );
    write_histogram(
        output,
        "dock_resolve_latency_ms",
        "Resolution latency in milliseconds",
        site,
        &summary.resolve_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.resolve_latency_sum_ms,
    );
    write_metric(
        output,
        "dock_resolve_latency_p99_ms",
        "99th percentile resolution latency",
        MetricType::Gauge,
        site,
        summary.resolve_latency_p99_ms,
    );
    write_labeled_counter(
        output,
        "dock_upstream_failures_total",
        "Failed calls to upstream systems",
        site,
        "upstream",
        UPSTREAM_LABELS.iter().copied().zip(summary.upstream_failures.iter().copied()),
    );
}

fn write_consolidation_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dock_scans_accepted_total",
        "Packages added to sessions",
        MetricType::Counter,
        site,
        summary.scans_accepted,
    );
    write_labeled_counter(
        output,
        "dock_rejections_total",
        "Rejected operations, by kind",
        site,
        "kind",
        Rejection::KINDS.iter().copied().zip(summary.rejections.iter().copied()),
    );
    write_metric(
        output,
        "dock_pallets_created_total",
        "Pallets closed",
        MetricType::Counter,
        site,
        summary.pallets_created,
    );
    write_metric(
        output,
        "dock_pickups_created_total",
        "Pickups created",
        MetricType::Counter,
        site,
        summary.pickups_created,
    );
    write_metric(
        output,
        "dock_manifests_signed_total",
        "Pickup manifests signed",
        MetricType::Counter,
        site,
        summary.manifests_signed,
    );
    write_metric(
        output,
        "dock_expedition_sync_failures_total",
        "Expedition dates not written back",
        MetricType::Counter,
        site,
        summary.expedition_sync_failures,
    );
}

fn write_index_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dock_index_builds_total",
        "Completed index builds",
        MetricType::Counter,
        site,
        summary.index_builds_ok,
    );
    write_metric(
        output,
        "dock_index_build_failures_total",
        "Failed index builds",
        MetricType::Counter,
        site,
        summary.index_builds_failed,
    );
    write_metric(
        output,
        "dock_index_builds_rejected_total",
        "Build requests rejected while a build was running",
        MetricType::Counter,
        site,
        summary.index_builds_rejected,
    );
    write_metric(
        output,
        "dock_index_last_build_ms",
        "Duration of the last successful build",
        MetricType::Gauge,
        site,
        summary.index_last_build_ms,
    );
    write_metric(
        output,
        "dock_index_entries",
        "Entries in the installed index",
        MetricType::Gauge,
        site,
        summary.index_entries,
    );
    write_metric(
        output,
        "dock_index_unmatched",
        "Shipments left unmatched by the last build",
        MetricType::Gauge,
        site,
        summary.index_unmatched,
    );
}

/// Shared state for request handlers
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub site_id: String,
    pub index: Arc<IndexHandle>,
    pub builder: Arc<IndexBuilder>,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("static response should not fail"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialize", &e.to_string()),
    }
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "ok": false, "error": kind, "message": message });
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

async fn route(method: &Method, path: &str, state: &HttpState) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics, &state.site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail"),
        (&Method::GET, "/index/summary") => {
            let snapshot = state.index.current();
            json_response(StatusCode::OK, &snapshot.summary)
        }
        (&Method::POST, "/index/rebuild") => {
            info!("manual_index_rebuild");
            match state.builder.rebuild_now().await {
                Ok(summary) => json_response(StatusCode::OK, &summary),
                Err(e) => {
                    let status = match e {
                        BuildError::InFlight => StatusCode::CONFLICT,
                        BuildError::Upstream(..) => StatusCode::BAD_GATEWAY,
                        BuildError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    };
                    error_response(status, e.kind(), &e.to_string())
                }
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &state).await)
}

/// Start the HTTP server
pub async fn start_http_server(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(state);

    info!(port = %port, site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::Upstream;
    use crate::io::snapshot::SnapshotFiles;
    use crate::services::fakes::{FakeAggregator, FakeOrderSystem};
    use crate::services::index::fixtures::{parcel, shipment};
    use http_body_util::BodyExt;

    fn state(dir: &std::path::Path, orders: Arc<FakeOrderSystem>) -> HttpState {
        let metrics = Arc::new(Metrics::new());
        let index = Arc::new(IndexHandle::empty());
        let builder = Arc::new(IndexBuilder::new(
            orders,
            Arc::new(FakeAggregator::with(vec![parcel("JJD0001", "gls")])),
            index.clone(),
            SnapshotFiles::new(dir),
            metrics.clone(),
            4,
        ));
        HttpState { metrics, site_id: "mad1".to_string(), index, builder }
    }

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_resolution(Provenance::Index, 4);
        metrics.record_resolution(Provenance::Live, 300);
        metrics.record_upstream_failure(Upstream::Aggregator);
        metrics.record_rejection(&Rejection::Duplicate { code: "JJD0001".to_string() });
        metrics.record_scan_accepted();

        let output = format_prometheus_metrics(&metrics, "mad1");

        assert!(output.contains("dock_resolutions_total{site=\"mad1\",provenance=\"index\"} 1"));
        assert!(output.contains("dock_resolutions_total{site=\"mad1\",provenance=\"live\"} 1"));
        assert!(output.contains("dock_resolve_latency_ms_bucket{site=\"mad1\",le=\"5\"} 1"));
        assert!(output.contains("dock_resolve_latency_ms_bucket{site=\"mad1\",le=\"+Inf\"} 2"));
        assert!(output.contains("dock_resolve_latency_ms_sum{site=\"mad1\"} 304"));
        assert!(output.contains("dock_upstream_failures_total{site=\"mad1\",upstream=\"aggregator\"} 1"));
        assert!(output.contains("dock_rejections_total{site=\"mad1\",kind=\"duplicate\"} 1"));
        assert!(output.contains("dock_scans_accepted_total{site=\"mad1\"} 1"));
    }

    #[tokio::test]
    async fn test_rebuild_then_summary() {
        let dir = tempfile::tempdir().unwrap();
        let orders = Arc::new(FakeOrderSystem::with(vec![shipment(1, "JJD0001")]));
        let state = state(dir.path(), orders);

        let resp = route(&Method::GET, "/index/summary", &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["build_id"], "");

        let resp = route(&Method::POST, "/index/rebuild", &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let built = body_json(resp).await;
        assert_eq!(built["matched"], 1);

        let resp = route(&Method::GET, "/index/summary", &state).await;
        assert_eq!(body_json(resp).await["build_id"], built["build_id"]);
    }

    #[tokio::test]
    async fn test_rebuild_upstream_failure_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let orders = Arc::new(FakeOrderSystem::with(vec![]));
        orders.set_fail(true);
        let state = state(dir.path(), orders);

        let resp = route(&Method::POST, "/index/rebuild", &state).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["error"], "upstream");
    }

    #[tokio::test]
    async fn test_rebuild_while_running_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let orders = Arc::new(FakeOrderSystem::with(vec![shipment(1, "JJD0001")]));
        let held = orders.hold.clone().lock_owned().await;
        let state = Arc::new(state(dir.path(), orders));

        let running = {
            let state = state.clone();
            tokio::spawn(async move { route(&Method::POST, "/index/rebuild", &state).await.status() })
        };
        while !state.builder.is_building() {
            tokio::task::yield_now().await;
        }

        let resp = route(&Method::POST, "/index/rebuild", &state).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        drop(held);
        assert_eq!(running.await.unwrap(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Arc::new(FakeOrderSystem::with(vec![])));
        let resp = route(&Method::GET, "/nope", &state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
