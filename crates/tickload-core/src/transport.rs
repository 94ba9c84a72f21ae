use crate::error::ConfigError;
use crate::payload::RequestPayload;
use crate::sampler::body_hash;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use reqwest::Method;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "tl-req-id";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one request that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub status: u16,
    /// Time from dispatch until the response head arrived
    pub latency: Duration,
    /// Body bytes received
    pub size: u64,
    /// FNV-1a 64 of the body, only when hashing was requested
    pub body_hash: Option<u64>,
}

pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = Result<Exchange>> + Send + 'a>>;

/// Sends one request and consumes its response.
///
/// When `hash_body` is false the body is streamed and discarded; otherwise it
/// is collected into `scratch` (cleared first, capacity kept) and hashed.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        request: &'a RequestPayload,
        hash_body: bool,
        scratch: &'a mut Vec<u8>,
    ) -> ExchangeFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub compress: bool,
    pub no_reuse: bool,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            compress: false,
            no_reuse: false,
            max_idle_per_host: 1,
            headers: Vec::new(),
        }
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    no_reuse: bool,
}

impl HttpTransport {
    pub fn new(options: HttpOptions) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let invalid = || ConfigError::InvalidHeader(format!("{}: {}", name, value));
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.append(name, value);
        }

        let idle = if options.no_reuse {
            0
        } else {
            options.max_idle_per_host
        };
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(idle)
            .gzip(options.compress)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            headers,
            no_reuse: options.no_reuse,
        })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        request: &'a RequestPayload,
        hash_body: bool,
        scratch: &'a mut Vec<u8>,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let method = Method::from_bytes(request.method.as_bytes())
                .map_err(|_| anyhow!("invalid method {}", request.method))?;

            let mut builder = self
                .client
                .request(method, request.url.as_str())
                .headers(self.headers.clone())
                .header(REQUEST_ID_HEADER, request.request_id.to_string())
                .body(request.body.clone());
            if let Some(host) = &request.host {
                builder = builder.header(HOST, host.as_str());
            }
            if self.no_reuse {
                builder = builder.header(CONNECTION, "close");
            }

            let start = Instant::now();
            let mut response = builder.send().await?;
            let latency = start.elapsed();
            let status = response.status().as_u16();

            if hash_body {
                scratch.clear();
                while let Some(chunk) = response.chunk().await? {
                    scratch.extend_from_slice(&chunk);
                }
                Ok(Exchange {
                    status,
                    latency,
                    size: scratch.len() as u64,
                    body_hash: Some(body_hash(scratch)),
                })
            } else {
                let mut size = 0u64;
                while let Some(chunk) = response.chunk().await? {
                    size += chunk.len() as u64;
                }
                Ok(Exchange {
                    status,
                    latency,
                    size,
                    body_hash: None,
                })
            }
        })
    }
}

/// Canned responses after a fixed delay, for tests.
pub struct MockTransport {
    delay: Duration,
    status: u16,
    body: Bytes,
    fail: bool,
    calls: AtomicU64,
}

impl MockTransport {
    pub fn new(delay: Duration, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            delay,
            status,
            body: body.into(),
            fail: false,
            calls: AtomicU64::new(0),
        }
    }

    /// Every request fails as a transport error after the delay.
    pub fn failing(delay: Duration) -> Self {
        Self {
            fail: true,
            ..Self::new(delay, 0, Bytes::new())
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(
        &'a self,
        _request: &'a RequestPayload,
        hash_body: bool,
        scratch: &'a mut Vec<u8>,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            sleep(self.delay).await;
            if self.fail {
                return Err(anyhow!("connection refused"));
            }
            let body_hash = if hash_body {
                scratch.clear();
                scratch.extend_from_slice(&self.body);
                Some(body_hash(scratch))
            } else {
                None
            };
            Ok(Exchange {
                status: self.status,
                latency: self.delay,
                size: self.body.len() as u64,
                body_hash,
            })
        })
    }
}
