//! Scripted payload generation.
//!
//! A user script defines `generate_data(method, url, host, requestId)` and
//! returns an object with any of `method`, `url`, `host` and `body`. Each
//! JavaScript context lives on its own thread; a request holds a context for
//! exactly one call.

use crate::error::ConfigError;
use crate::payload::{PayloadFuture, PayloadSource, RequestPayload};
use anyhow::{anyhow, Context as _, Result};
use boa_engine::{Context, Source};
use bytes::Bytes;
use serde::Deserialize;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct Job {
    template: RequestPayload,
    reply: oneshot::Sender<Result<RequestPayload>>,
}

#[derive(Debug, Default, Deserialize)]
struct Generated {
    method: Option<String>,
    url: Option<String>,
    host: Option<String>,
    body: Option<String>,
}

pub struct ScriptPayload {
    jobs: mpsc::Sender<Job>,
    pool_size: usize,
}

impl ScriptPayload {
    pub fn from_file(path: impl AsRef<Path>, pool_size: usize) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_source(source, pool_size)
    }

    /// Start `pool_size` contexts, each evaluating `source` once.
    pub fn from_source(source: String, pool_size: usize) -> Result<Self, ConfigError> {
        let pool_size = pool_size.max(1);
        let source = Arc::new(source);
        let (jobs, queue) = mpsc::channel::<Job>();
        let queue = Arc::new(Mutex::new(queue));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        for slot in 0..pool_size {
            let source = Arc::clone(&source);
            let queue = Arc::clone(&queue);
            let ready = ready_tx.clone();
            thread::Builder::new()
                .name(format!("script-{}", slot))
                .spawn(move || run_context(slot, &source, &queue, ready))
                .map_err(|e| ConfigError::Script(e.to_string()))?;
        }
        drop(ready_tx);

        for _ in 0..pool_size {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => return Err(ConfigError::Script(message)),
                Err(_) => return Err(ConfigError::Script("script context exited".into())),
            }
        }

        info!("Loaded payload script into {} contexts", pool_size);
        Ok(Self { jobs, pool_size })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl PayloadSource for ScriptPayload {
    fn name(&self) -> &'static str {
        "script"
    }

    fn generate<'a>(&'a self, template: RequestPayload) -> PayloadFuture<'a> {
        Box::pin(async move {
            let (reply, response) = oneshot::channel();
            self.jobs
                .send(Job { template, reply })
                .map_err(|_| anyhow!("script pool has shut down"))?;
            response
                .await
                .map_err(|_| anyhow!("script context dropped the request"))?
        })
    }
}

fn run_context(
    slot: usize,
    source: &str,
    queue: &Mutex<mpsc::Receiver<Job>>,
    ready: mpsc::Sender<Result<(), String>>,
) {
    let mut context = Context::default();
    if let Err(e) = context.eval(Source::from_bytes(source)) {
        let _ = ready.send(Err(format!("script failed to load: {}", e)));
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        let job = match queue.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        let Ok(job) = job else {
            break;
        };
        let result = generate(&mut context, job.template);
        let _ = job.reply.send(result);
    }
    debug!("Script context {} stopped", slot);
}

fn generate(context: &mut Context, template: RequestPayload) -> Result<RequestPayload> {
    let call = format!(
        "JSON.stringify(generate_data({}, {}, {}, {}))",
        serde_json::to_string(&template.method)?,
        serde_json::to_string(&template.url)?,
        serde_json::to_string(template.host.as_deref().unwrap_or(""))?,
        template.request_id
    );
    let value = context
        .eval(Source::from_bytes(&call))
        .map_err(|e| anyhow!("generate_data failed: {}", e))?;
    let json = value
        .to_string(context)
        .map_err(|e| anyhow!("generate_data result is not printable: {}", e))?
        .to_std_string_escaped();
    let generated: Generated = serde_json::from_str(&json)
        .with_context(|| format!("generate_data must return an object, got {}", json))?;
    Ok(merge(template, generated))
}

fn merge(template: RequestPayload, generated: Generated) -> RequestPayload {
    RequestPayload {
        method: generated.method.unwrap_or(template.method),
        url: generated.url.unwrap_or(template.url),
        host: match generated.host {
            Some(host) if !host.is_empty() => Some(host),
            Some(_) => None,
            None => template.host,
        },
        body: generated.body.map(Bytes::from).unwrap_or(template.body),
        request_id: template.request_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(request_id: u64) -> RequestPayload {
        RequestPayload {
            method: "GET".into(),
            url: "http://localhost:8080/".into(),
            host: None,
            body: Bytes::new(),
            request_id,
        }
    }

    #[tokio::test]
    async fn test_script_overrides_fields() {
        let script = r#"
            function generate_data(method, url, host, requestId) {
                return {
                    method: "POST",
                    url: url + "items/" + requestId,
                    body: JSON.stringify({ id: requestId })
                };
            }
        "#;
        let source = ScriptPayload::from_source(script.to_string(), 2).unwrap();
        assert_eq!(source.pool_size(), 2);

        let payload = source.generate(template(7)).await.unwrap();
        assert_eq!(payload.method, "POST");
        assert_eq!(payload.url, "http://localhost:8080/items/7");
        assert_eq!(payload.body, Bytes::from_static(b"{\"id\":7}"));
        assert_eq!(payload.host, None);
        assert_eq!(payload.request_id, 7);
    }

    #[tokio::test]
    async fn test_script_missing_fields_keep_template() {
        let script = "function generate_data() { return { host: 'svc.internal' }; }";
        let source = ScriptPayload::from_source(script.to_string(), 1).unwrap();
        let payload = source.generate(template(1)).await.unwrap();
        assert_eq!(payload.method, "GET");
        assert_eq!(payload.host.as_deref(), Some("svc.internal"));
    }

    #[tokio::test]
    async fn test_script_errors_are_per_request() {
        let script = r#"
            function generate_data(m, u, h, id) {
                if (id % 2 == 0) { throw new Error("even"); }
                return {};
            }
        "#;
        let source = ScriptPayload::from_source(script.to_string(), 1).unwrap();
        assert!(source.generate(template(2)).await.is_err());
        assert!(source.generate(template(3)).await.is_ok());
    }

    #[test]
    fn test_broken_script_is_config_error() {
        let result = ScriptPayload::from_source("function (".to_string(), 2);
        assert!(matches!(result, Err(ConfigError::Script(_))));
    }
}
