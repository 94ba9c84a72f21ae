use crate::error::ConfigError;
use crate::targets::{parse_target_url, Target, TargetProvider, TargetsFuture};
use anyhow::Result;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;
use url::Url;

/// Registry application list, as served with `Accept: application/json`.
#[derive(Debug, Deserialize)]
struct Registry {
    applications: Applications,
}

#[derive(Debug, Deserialize)]
struct Applications {
    #[serde(default)]
    application: OneOrMany<Application>,
}

#[derive(Debug, Deserialize)]
struct Application {
    name: String,
    #[serde(default)]
    instance: OneOrMany<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    host_name: String,
    #[serde(default)]
    port: Option<Port>,
    #[serde(default)]
    secure_port: Option<Port>,
}

#[derive(Debug, Deserialize)]
struct Port {
    #[serde(rename = "$")]
    value: Value,
    #[serde(rename = "@enabled", default)]
    enabled: Value,
}

impl Port {
    fn enabled(&self) -> bool {
        match &self.enabled {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    fn number(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Registries collapse single-element lists into a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Targets taken from a service registry at startup.
pub struct EurekaTargets {
    client: reqwest::Client,
    registry: Url,
    service: String,
    path_suffix: String,
    hosts: Vec<String>,
}

impl EurekaTargets {
    pub fn new(registry: Url, service: impl Into<String>, path_suffix: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            registry,
            service: service.into(),
            path_suffix: path_suffix.into(),
            hosts: Vec::new(),
        })
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    async fn fetch(&self) -> Result<String, ConfigError> {
        let response = self
            .client
            .get(self.registry.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ConfigError::Discovery(format!("{}: {}", self.registry, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConfigError::Discovery(format!(
                "{} returned {}",
                self.registry, status
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ConfigError::Discovery(format!("{}: {}", self.registry, e)))
    }
}

impl TargetProvider for EurekaTargets {
    fn name(&self) -> &'static str {
        "eureka"
    }

    fn targets<'a>(&'a self) -> TargetsFuture<'a> {
        Box::pin(async move {
            let body = self.fetch().await?;
            let urls = parse_registry(&body, &self.service, &self.path_suffix)?;
            info!(
                "Discovered {} instances of '{}' from {}",
                urls.len(),
                self.service,
                self.registry
            );
            Ok(urls
                .into_iter()
                .map(|url| Target::new(url).with_hosts(self.hosts.clone()))
                .collect())
        })
    }
}

/// Instance URLs of every application whose name contains `service`.
pub fn parse_registry(body: &str, service: &str, path_suffix: &str) -> Result<Vec<Url>, ConfigError> {
    let registry: Registry = serde_json::from_str(body)
        .map_err(|e| ConfigError::Discovery(format!("malformed registry response: {}", e)))?;

    let mut urls = Vec::new();
    for app in registry.applications.application.into_vec() {
        if !app.name.contains(service) {
            continue;
        }
        for instance in app.instance.into_vec() {
            let raw = instance_url(&instance, path_suffix);
            urls.push(parse_target_url(&raw, urls.len() + 1)?);
        }
    }
    if urls.is_empty() {
        return Err(ConfigError::Discovery(format!(
            "no instances found for service '{}'",
            service
        )));
    }
    Ok(urls)
}

fn instance_url(instance: &Instance, path_suffix: &str) -> String {
    let plain = instance.port.as_ref().filter(|p| p.enabled());
    let secure = instance.secure_port.as_ref().filter(|p| p.enabled());

    let mut raw = instance.host_name.clone();
    if !raw.starts_with("http") {
        if plain.is_some() {
            raw = format!("http://{}", raw);
        } else if secure.is_some() {
            raw = format!("https://{}", raw);
        }
    }
    if let Some(port) = plain.or(secure) {
        raw = format!("{}:{}", raw, port.number());
    }
    raw.push_str(path_suffix);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"{
      "applications": {
        "versions__delta": "1",
        "application": [
          {
            "name": "ORDERS-API",
            "instance": [
              {
                "hostName": "orders-1.internal",
                "status": "UP",
                "port": { "$": 8080, "@enabled": "true" },
                "securePort": { "$": 443, "@enabled": "false" }
              },
              {
                "hostName": "orders-2.internal",
                "status": "UP",
                "port": { "$": 8080, "@enabled": "false" },
                "securePort": { "$": "8443", "@enabled": "true" }
              }
            ]
          },
          {
            "name": "BILLING",
            "instance": {
              "hostName": "billing.internal",
              "port": { "$": 9000, "@enabled": "true" }
            }
          }
        ]
      }
    }"#;

    #[test]
    fn test_parse_registry_filters_by_service() {
        let urls = parse_registry(REGISTRY, "ORDERS", "/ping").unwrap();
        let urls: Vec<_> = urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "http://orders-1.internal:8080/ping",
                "https://orders-2.internal:8443/ping"
            ]
        );
    }

    #[test]
    fn test_parse_registry_single_instance_object() {
        let urls = parse_registry(REGISTRY, "BILL", "").unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].as_str(), "http://billing.internal:9000/");
    }

    #[test]
    fn test_parse_registry_no_match() {
        let err = parse_registry(REGISTRY, "INVENTORY", "").unwrap_err();
        assert!(matches!(err, ConfigError::Discovery(_)));
    }

    #[test]
    fn test_parse_registry_malformed() {
        let err = parse_registry("<applications/>", "X", "").unwrap_err();
        assert!(err.to_string().contains("malformed registry response"));
    }

    #[test]
    fn test_host_with_scheme_is_kept() {
        let instance = Instance {
            host_name: "https://edge.internal".into(),
            port: None,
            secure_port: Some(Port {
                value: Value::from(443),
                enabled: Value::from(true),
            }),
        };
        assert_eq!(instance_url(&instance, ""), "https://edge.internal:443");
    }
}
