use crate::config::LatencyUnit;
use crate::dispatcher::{MeasuredResponse, Outcome, RequestCounter};
use crate::metrics::Metrics;
use crate::report::{latency_summary, write_latency_csv, IntervalReport};
use crate::shutdown::{spawn_drain_waiter, Control, Latch, Phase, ShutdownFlag, ShutdownTrigger};
use crate::stats::{percent_achieved, traffic_target, IntervalStats, LatencyHistogram, Quantiles, RunTotals};
use crate::trend::TrendWindow;
use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub qps: u32,
    pub concurrency: u32,
    pub interval: Duration,
    /// 0 means unbounded
    pub iterations: u64,
    /// 0 means unbounded
    pub total_requests: u64,
    pub latency_unit: LatencyUnit,
    pub latency_summary: bool,
    pub csv_path: Option<PathBuf>,
    pub target_count: usize,
}

/// Everything the aggregator learned, handed back once all workers are gone.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub iterations: u64,
    pub totals: RunTotals,
    pub quantiles: Quantiles,
    pub target_calls: Vec<u64>,
    /// What started the drain
    pub cause: Control,
}

/// Sole owner of the run's statistics.
pub struct Aggregator<W: Write> {
    settings: AggregatorSettings,
    out: W,
    stats: IntervalStats,
    global: LatencyHistogram,
    trend: TrendWindow,
    totals: RunTotals,
    target_calls: Vec<u64>,
    iteration: u64,
    phase: Phase,
    flag: ShutdownFlag,
    latch: Latch,
    trigger: ShutdownTrigger,
    counter: Option<Arc<RequestCounter>>,
    metrics: Option<Arc<Metrics>>,
}

impl<W: Write> Aggregator<W> {
    pub fn new(
        settings: AggregatorSettings,
        out: W,
        flag: ShutdownFlag,
        latch: Latch,
        trigger: ShutdownTrigger,
    ) -> Result<Self> {
        let unit = settings.latency_unit;
        Ok(Self {
            stats: IntervalStats::new(unit).context("Failed to create interval histogram")?,
            global: LatencyHistogram::new(unit).context("Failed to create global histogram")?,
            trend: TrendWindow::default(),
            totals: RunTotals::default(),
            target_calls: vec![0; settings.target_count],
            iteration: 0,
            phase: Phase::Running,
            settings,
            out,
            flag,
            latch,
            trigger,
            counter: None,
            metrics: None,
        })
    }

    /// Enables the total request cap.
    pub fn with_request_counter(mut self, counter: Arc<RequestCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the event loop until every worker has stopped and every result
    /// they sent has been consumed.
    pub async fn run(
        mut self,
        mut results: mpsc::Receiver<MeasuredResponse>,
        mut control: mpsc::Receiver<Control>,
    ) -> Result<AggregateOutcome> {
        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Replaced by the real waiter when draining starts.
        let (_idle, mut drained) = oneshot::channel::<()>();
        let mut workers_done = false;
        let mut results_open = true;
        let mut cause = Control::Cleanup;

        while results_open || !workers_done {
            tokio::select! {
                received = results.recv(), if results_open => match received {
                    Some(result) => self.record(result),
                    None => {
                        results_open = false;
                        if self.phase == Phase::Running {
                            // Every worker exited on its own.
                            self.begin_drain()?;
                            drained = spawn_drain_waiter(self.latch.clone());
                        }
                    }
                },
                _ = ticker.tick(), if self.phase == Phase::Running => {
                    self.report_interval()?;
                }
                Some(signal) = control.recv(), if self.phase == Phase::Running => {
                    info!("Shutting down ({:?})", signal);
                    cause = signal;
                    self.begin_drain()?;
                    drained = spawn_drain_waiter(self.latch.clone());
                }
                _ = &mut drained, if self.phase == Phase::Draining && !workers_done => {
                    info!("All workers stopped");
                    workers_done = true;
                }
            }
        }

        self.phase = Phase::Exited;
        self.totals.absorb(&self.stats);
        Ok(AggregateOutcome {
            iterations: self.iteration,
            totals: self.totals,
            quantiles: self.global.quantiles(),
            target_calls: self.target_calls,
            cause,
        })
    }

    fn record(&mut self, result: MeasuredResponse) {
        if let Some(calls) = self.target_calls.get_mut(result.target) {
            *calls += 1;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_request();
        }
        match result.outcome {
            Outcome::Failed => self.stats.record_failure(),
            Outcome::Response {
                status,
                latency,
                size,
                hash_failed,
            } => {
                let value = self.settings.latency_unit.convert(latency);
                let good = self.stats.record_response(status, value, size, hash_failed);
                self.global.record(value);
                if good {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_success(latency);
                    }
                }
            }
        }
    }

    fn report_interval(&mut self) -> Result<()> {
        let s = &self.settings;
        let target = traffic_target(s.qps, s.concurrency, s.interval);
        let hist = &self.stats.histogram;
        let p99 = hist.value_at_quantile(0.99);
        let change = self.trend.indicator(p99);
        self.trend.push(p99);

        let line = IntervalReport {
            timestamp: Utc::now(),
            iteration: self.iteration,
            good: self.stats.good,
            bad: self.stats.bad,
            failed: self.stats.failed,
            target,
            percent_achieved: percent_achieved(self.stats.good, self.stats.bad, target),
            interval: s.interval,
            min: self.stats.min(),
            p50: hist.value_at_quantile(0.5),
            p95: hist.value_at_quantile(0.95),
            p99,
            p999: hist.value_at_quantile(0.999),
            max: self.stats.max,
            hash_failures: self.stats.hash_failures,
            change,
        };
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;

        self.totals.absorb(&self.stats);
        self.stats.reset();
        self.iteration += 1;

        if s.iterations > 0 && self.iteration >= s.iterations {
            info!("Reached {} iterations", self.iteration);
            self.trigger.cleanup();
        }
        // Stops once the issued ids reach the cap, so only requests already in
        // flight at this boundary can push the total past it.
        if let Some(counter) = &self.counter {
            if s.total_requests > 0 && counter.issued() >= s.total_requests {
                info!("Reached {} requests", counter.issued());
                self.trigger.cleanup();
            }
        }
        Ok(())
    }

    /// `Running -> Draining`: stop the workers and write the cumulative summary.
    fn begin_drain(&mut self) -> Result<()> {
        self.phase = Phase::Draining;
        self.flag.trigger();

        if self.settings.latency_summary {
            writeln!(self.out, "{}", latency_summary(&self.global.quantiles())?)?;
            self.out.flush()?;
        }
        if let Some(path) = &self.settings.csv_path {
            match write_latency_csv(path, &self.global) {
                Ok(()) => info!("Latency distribution written to {:?}", path),
                Err(e) => warn!("{:#}", e),
            }
        }
        info!("Waiting for {} workers to finish", self.latch.remaining());
        Ok(())
    }
}
