use crate::payload::{PayloadSource, RequestPayload};
use crate::rate_limiter::RateLimiter;
use crate::sampler::HashSampler;
use crate::shutdown::{Latch, LatchGuard, ShutdownFlag};
use crate::targets::Target;
use crate::transport::Transport;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Request ids shared by all workers. The first id handed out is 1.
#[derive(Debug, Default)]
pub struct RequestCounter(AtomicU64);

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Response {
        status: u16,
        latency: Duration,
        size: u64,
        hash_failed: bool,
    },
    /// Transport or payload error; nothing else about the request is known.
    Failed,
}

/// What a worker hands to the aggregator for every request it sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasuredResponse {
    /// Index into the run's target list
    pub target: usize,
    pub request_id: u64,
    pub outcome: Outcome,
}

/// Read-only state every worker needs.
pub struct Dispatch {
    pub targets: Arc<Vec<Target>>,
    pub transport: Arc<dyn Transport>,
    pub payload: Arc<dyn PayloadSource>,
    pub method: String,
    pub body: Bytes,
    pub qps: u32,
    pub sampler: HashSampler,
    pub flag: ShutdownFlag,
    pub counter: Arc<RequestCounter>,
}

struct Worker {
    id: usize,
    dispatch: Arc<Dispatch>,
    results: mpsc::Sender<MeasuredResponse>,
    rng: StdRng,
    _guard: LatchGuard,
}

impl Worker {
    async fn run(mut self) {
        let dispatch = Arc::clone(&self.dispatch);
        let targets = dispatch.targets.as_slice();
        if targets.is_empty() {
            return;
        }
        let mut limiter = RateLimiter::new(dispatch.qps);
        let mut next = self.id % targets.len();
        let mut scratch = Vec::new();

        loop {
            limiter.acquire().await;
            if dispatch.flag.is_set() {
                break;
            }

            let target_idx = next;
            next = (next + 1) % targets.len();
            let target = &targets[target_idx];
            let request_id = dispatch.counter.next();
            let template = RequestPayload {
                method: dispatch.method.clone(),
                url: target.url.to_string(),
                host: target.hosts.choose(&mut self.rng).cloned(),
                body: dispatch.body.clone(),
                request_id,
            };
            let check_hash = dispatch.sampler.should_check(&mut self.rng);

            let outcome = self.send(template, check_hash, &mut scratch).await;
            let measured = MeasuredResponse {
                target: target_idx,
                request_id,
                outcome,
            };
            if self.results.send(measured).await.is_err() {
                break;
            }
        }
        debug!("Worker {} stopped", self.id);
    }

    async fn send(&self, template: RequestPayload, check_hash: bool, scratch: &mut Vec<u8>) -> Outcome {
        let dispatch = &self.dispatch;
        let request = match dispatch.payload.generate(template).await {
            Ok(request) => request,
            Err(e) => {
                warn!("Payload generation failed ({}): {}", dispatch.payload.name(), e);
                return Outcome::Failed;
            }
        };
        match dispatch.transport.execute(&request, check_hash, scratch).await {
            Ok(exchange) => Outcome::Response {
                status: exchange.status,
                latency: exchange.latency,
                size: exchange.size,
                hash_failed: exchange
                    .body_hash
                    .map_or(false, |hash| dispatch.sampler.mismatch(hash)),
            },
            Err(e) => {
                warn!("Request {} to {} failed: {}", request.request_id, request.url, e);
                Outcome::Failed
            }
        }
    }
}

/// Start `concurrency` workers. Each holds a guard on `latch` for its lifetime
/// and a clone of `results`, which is consumed here.
pub fn spawn_workers(
    dispatch: Arc<Dispatch>,
    concurrency: usize,
    seed: u64,
    results: mpsc::Sender<MeasuredResponse>,
    latch: &Latch,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|id| {
            let worker = Worker {
                id,
                dispatch: Arc::clone(&dispatch),
                results: results.clone(),
                rng: StdRng::seed_from_u64(seed ^ id as u64),
                _guard: latch.guard(),
            };
            tokio::spawn(worker.run())
        })
        .collect()
}
