use anyhow::Result;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// One request as it will be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPayload {
    pub method: String,
    pub url: String,
    /// Host header override
    pub host: Option<String>,
    pub body: Bytes,
    /// Correlation id, also sent as a header
    pub request_id: u64,
}

pub type PayloadFuture<'a> = Pin<Box<dyn Future<Output = Result<RequestPayload>> + Send + 'a>>;

/// Produces the request to send for a given request id.
///
/// The worker builds a template from its target and the configured
/// method, host and body; a source may override any of them. Errors are
/// counted as failed requests, never fatal.
pub trait PayloadSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate<'a>(&'a self, template: RequestPayload) -> PayloadFuture<'a>;
}

/// Sends the template unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPayload;

impl PayloadSource for StaticPayload {
    fn name(&self) -> &'static str {
        "static"
    }

    fn generate<'a>(&'a self, template: RequestPayload) -> PayloadFuture<'a> {
        Box::pin(async move { Ok(template) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_payload_is_identity() {
        let template = RequestPayload {
            method: "POST".into(),
            url: "http://localhost:8080/".into(),
            host: Some("svc.local".into()),
            body: Bytes::from_static(b"{}"),
            request_id: 17,
        };
        let generated = StaticPayload.generate(template.clone()).await.unwrap();
        assert_eq!(generated, template);
        assert_eq!(StaticPayload.name(), "static");
    }
}
