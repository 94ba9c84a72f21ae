use crate::aggregator::{Aggregator, AggregatorSettings};
use crate::config::Config;
use crate::dispatcher::{spawn_workers, Dispatch, RequestCounter};
use crate::error::ConfigError;
use crate::metrics::Metrics;
use crate::payload::{PayloadSource, StaticPayload};
use crate::report::{banner, column_header, format_timestamp, RunReport, TargetCalls};
use crate::sampler::HashSampler;
use crate::shutdown::{control_channel, forward_interrupts, Control, Latch, ShutdownFlag, ShutdownTrigger};
use crate::targets::Target;
use crate::transport::Transport;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One load test run: workers, aggregator and the channels between them.
pub struct Engine {
    config: Config,
    targets: Arc<Vec<Target>>,
    transport: Arc<dyn Transport>,
    payload: Arc<dyn PayloadSource>,
    body: Bytes,
    metrics: Option<Arc<Metrics>>,
    source: String,
    trigger: ShutdownTrigger,
    control: mpsc::Receiver<Control>,
    handle_signals: bool,
}

impl Engine {
    /// Validates `config` and resolves the request body; nothing is sent yet.
    pub fn new(config: Config, targets: Vec<Target>, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        if targets.is_empty() {
            return Err(ConfigError::NoTargets.into());
        }
        let body = config.request.body()?;
        let source = targets
            .first()
            .map(|t| t.url.to_string())
            .unwrap_or_default();
        let (trigger, control) = control_channel();
        Ok(Self {
            config,
            targets: Arc::new(targets),
            transport,
            payload: Arc::new(StaticPayload),
            body,
            metrics: None,
            source,
            trigger,
            control,
            handle_signals: true,
        })
    }

    pub fn with_payload(mut self, payload: Arc<dyn PayloadSource>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Where the target list came from, shown in the banner for multi-target runs.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Whether Ctrl-C starts the drain. On by default.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Handle for stopping the run from outside.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Send load until a cap is reached or the run is interrupted, writing the
    /// live report to `out`.
    pub async fn run<W: Write>(self, mut out: W) -> Result<RunReport> {
        let Engine {
            config,
            targets,
            transport,
            payload,
            body,
            metrics,
            source,
            trigger,
            control,
            handle_signals,
        } = self;
        let load = &config.load;
        let concurrency = load.concurrency as usize;

        let urls: Vec<String> = targets.iter().map(|t| t.url.to_string()).collect();
        writeln!(
            out,
            "{}",
            banner(&config.request.method, load.qps, load.concurrency, &urls, &source)
        )?;
        writeln!(out, "{}", column_header(config.interval()))?;
        out.flush()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let flag = ShutdownFlag::new();
        let latch = Latch::new(concurrency);
        let counter = Arc::new(RequestCounter::new());
        let (results_tx, results_rx) = mpsc::channel(1);

        let dispatch = Arc::new(Dispatch {
            targets: Arc::clone(&targets),
            transport: Arc::clone(&transport),
            payload: Arc::clone(&payload),
            method: config.request.method.clone(),
            body,
            qps: load.qps,
            sampler: HashSampler::new(config.hash.sample_rate, config.hash.expected),
            flag: flag.clone(),
            counter: Arc::clone(&counter),
        });
        let seed = load.seed.unwrap_or_else(rand::random);
        info!(
            "Starting {} workers at {} req/s each ({} transport, {} payload, seed {})",
            concurrency,
            load.qps,
            transport.name(),
            payload.name(),
            seed
        );
        let workers = spawn_workers(dispatch, concurrency, seed, results_tx, &latch);
        let signals = handle_signals.then(|| forward_interrupts(trigger.clone()));

        let settings = AggregatorSettings {
            qps: load.qps,
            concurrency: load.concurrency,
            interval: config.interval(),
            iterations: load.iterations,
            total_requests: load.total_requests,
            latency_unit: config.report.latency_unit,
            latency_summary: config.report.latency_summary,
            csv_path: config.report.csv_path.clone(),
            target_count: targets.len(),
        };
        let mut aggregator = Aggregator::new(settings, &mut out, flag.clone(), latch, trigger)?
            .with_request_counter(Arc::clone(&counter));
        if let Some(metrics) = metrics {
            aggregator = aggregator.with_metrics(metrics);
        }
        let outcome = aggregator.run(results_rx, control).await;

        if let Some(signals) = signals {
            signals.abort();
        }
        flag.trigger();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker task failed: {}", e);
            }
        }
        let outcome = outcome.context("Aggregator failed")?;

        let elapsed = clock.elapsed();
        let answered = outcome.totals.good + outcome.totals.bad;
        let achieved_rps = if elapsed.as_secs_f64() > 0.0 {
            (answered as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        let target_calls: Vec<TargetCalls> = urls
            .into_iter()
            .zip(outcome.target_calls)
            .map(|(url, calls)| TargetCalls { url, calls })
            .collect();
        for t in &target_calls {
            info!("{} calls to {}", t.calls, t.url);
        }

        let report = RunReport {
            started_at: format_timestamp(started_at),
            finished_at: format_timestamp(Utc::now()),
            duration_ms: elapsed.as_millis() as u64,
            iterations: outcome.iterations,
            latency_unit: config.report.latency_unit,
            totals: outcome.totals,
            quantiles: outcome.quantiles,
            achieved_rps,
            targets: target_calls,
        };
        info!(
            "Run finished after {} intervals: {} requests, {} good, {} bad, {} failed",
            report.iterations,
            report.totals.requests,
            report.totals.good,
            report.totals.bad,
            report.totals.failed
        );
        if let Some(path) = &config.report.json_path {
            report.write_json(path)?;
            info!("Run report written to {:?}", path);
        }
        Ok(report)
    }
}
