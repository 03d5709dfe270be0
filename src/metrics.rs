//! Prometheus exposition and the liveness/readiness HTTP endpoint.
//!
//! Adapted from `couchestor::main::run_health_server` /
//! `run_metrics_server`: a node-local counters struct registered with
//! the global `prometheus` registry, plus two plain `hyper` servers
//! serving `/healthz` and `/metrics`. There is no Prometheus-querying
//! watcher here — this crate only ever exposes its own counters.

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Node-local Prometheus counters, registered once at startup and
/// shared by every code path that touches the commit protocol or the
/// block store.
#[derive(Clone)]
pub struct NodeMetrics {
    pub writes_total: CounterVec,
    pub reads_total: Counter,
    pub commits_total: CounterVec,
    pub timeouts_total: Counter,
    pub gc_pruned_total: Counter,
    pub active_stripe_managers: Gauge,
}

impl NodeMetrics {
    pub fn register() -> Result<Self> {
        let writes_total = prometheus::register_counter_vec!(
            "netraid_writes_total",
            "Total participant write sub-operations, by outcome",
            &["outcome"]
        )
        .map_err(|e| Error::Internal(format!("failed to register writes_total: {e}")))?;
        let reads_total = prometheus::register_counter!(
            "netraid_reads_total",
            "Total stripe-unit reads served"
        )
        .map_err(|e| Error::Internal(format!("failed to register reads_total: {e}")))?;
        let commits_total = prometheus::register_counter_vec!(
            "netraid_commits_total",
            "Total three-phase-commit operations completed, by outcome",
            &["outcome"]
        )
        .map_err(|e| Error::Internal(format!("failed to register commits_total: {e}")))?;
        let timeouts_total = prometheus::register_counter!(
            "netraid_operation_timeouts_total",
            "Total coordinator operations failed by the watchdog sweep"
        )
        .map_err(|e| Error::Internal(format!("failed to register timeouts_total: {e}")))?;
        let gc_pruned_total = prometheus::register_counter!(
            "netraid_gc_blocks_pruned_total",
            "Total stale block versions removed by garbage collection"
        )
        .map_err(|e| Error::Internal(format!("failed to register gc_pruned_total: {e}")))?;
        let active_stripe_managers = prometheus::register_gauge!(
            "netraid_active_stripe_managers",
            "Number of inodes with at least one in-flight operation"
        )
        .map_err(|e| Error::Internal(format!("failed to register active_stripe_managers: {e}")))?;

        Ok(Self {
            writes_total,
            reads_total,
            commits_total,
            timeouts_total,
            gc_pruned_total,
            active_stripe_managers,
        })
    }
}

async fn health_handler(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" | "/readyz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Serves `/healthz`, `/livez`, and `/readyz` until the process exits.
pub async fn run_health_server(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind health server: {e}")))?;
    info!(%addr, "health server listening");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("health server accept error: {e}")))?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                error!(%err, "health server connection error");
            }
        });
    }
}

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", encoder.format_type())
                .body(Full::new(Bytes::from(buffer)))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Serves `/metrics` in the Prometheus text exposition format until the
/// process exits.
pub async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind metrics server: {e}")))?;
    info!(%addr, "metrics server listening");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("metrics server accept error: {e}")))?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!(%err, "metrics server connection error");
            }
        });
    }
}
