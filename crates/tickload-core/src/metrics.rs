use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const BUCKETS: usize = 50;

/// Pull-based view of the run. Written by the aggregator only.
pub struct Metrics {
    registry: Registry,
    requests: IntCounter,
    successes: IntCounter,
    latency_ms: Histogram,
    latency_us: Histogram,
    latency_ns: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounter::new("requests_total", "Number of requests")?;
        let successes = IntCounter::new("successes_total", "Number of successful requests")?;
        // 0.5ms to ~3 minutes
        let latency_ms = histogram("latency_ms", "Request latency in milliseconds", 0.5, 1.3)?;
        // 1us to ~2.4 seconds
        let latency_us = histogram("latency_us", "Request latency in microseconds", 1.0, 1.35)?;
        // 1ns to ~0.4 seconds
        let latency_ns = histogram("latency_ns", "Request latency in nanoseconds", 1.0, 1.5)?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(successes.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        registry.register(Box::new(latency_us.clone()))?;
        registry.register(Box::new(latency_ns.clone()))?;

        Ok(Self {
            registry,
            requests,
            successes,
            latency_ms,
            latency_us,
            latency_ns,
        })
    }

    pub fn record_request(&self) {
        self.requests.inc();
    }

    pub fn record_success(&self, latency: Duration) {
        self.successes.inc();
        let secs = latency.as_secs_f64();
        self.latency_ms.observe(secs * 1e3);
        self.latency_us.observe(secs * 1e6);
        self.latency_ns.observe(secs * 1e9);
    }

    pub fn requests(&self) -> u64 {
        self.requests.get()
    }

    pub fn successes(&self) -> u64 {
        self.successes.get()
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

fn histogram(name: &str, help: &str, start: f64, factor: f64) -> Result<Histogram> {
    let opts = HistogramOpts::new(name, help).buckets(exponential_buckets(start, factor, BUCKETS)?);
    Ok(Histogram::with_opts(opts)?)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve `GET /metrics` on `bind` from a background task.
///
/// Binding happens before returning so a bad address fails the startup.
pub async fn serve_metrics(bind: &str, metrics: Arc<Metrics>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {}", bind))?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    info!("Serving metrics on http://{}/metrics", addr);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Metrics endpoint stopped: {}", e);
        }
    });
    Ok((addr, handle))
}
