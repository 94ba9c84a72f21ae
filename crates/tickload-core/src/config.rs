use crate::error::ConfigError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub load: LoadConfig,
    pub request: RequestConfig,
    pub report: ReportConfig,
    pub hash: HashConfig,
    pub metrics: MetricsConfig,
    pub discovery: Option<DiscoveryConfig>,
    pub script: Option<ScriptConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject settings that would make the run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load.qps < 1 {
            return Err(ConfigError::InvalidQps);
        }
        if self.load.concurrency < 1 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.load.interval_ms == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if self.hash.sample_rate.is_nan() {
            return Err(ConfigError::InvalidSampleRate(self.hash.sample_rate));
        }
        if reqwest::Method::from_bytes(self.request.method.as_bytes()).is_err() {
            return Err(ConfigError::InvalidMethod(self.request.method.clone()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.load.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Requests per second issued by each worker
    pub qps: u32,
    /// Number of workers
    pub concurrency: u32,
    /// Reporting interval in milliseconds
    pub interval_ms: u64,
    /// Stop after this many intervals (0 runs until interrupted)
    pub iterations: u64,
    /// Stop once this many requests have been issued (0 disables the cap)
    pub total_requests: u64,
    /// Seed for host selection and hash sampling; random when absent
    pub seed: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            qps: 1,
            concurrency: 1,
            interval_ms: 10_000,
            iterations: 0,
            total_requests: 0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub method: String,
    /// Host header overrides, one picked at random per request
    pub hosts: Vec<String>,
    pub headers: BTreeMap<String, String>,
    /// Request body; `@path` reads a file and `@-` reads stdin
    pub data: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    pub compress: bool,
    /// Open a new connection for every request
    pub no_reuse: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            hosts: Vec::new(),
            headers: BTreeMap::new(),
            data: String::new(),
            timeout_ms: 10_000,
            compress: false,
            no_reuse: false,
        }
    }
}

impl RequestConfig {
    pub fn body(&self) -> Result<Bytes, ConfigError> {
        load_data(&self.data)
    }

    /// Host overrides with blanks removed.
    pub fn host_overrides(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub latency_unit: LatencyUnit,
    /// Print the cumulative quantile summary when the run stops
    pub latency_summary: bool,
    /// Write the cumulative latency distribution as CSV
    pub csv_path: Option<PathBuf>,
    /// Write the run report as JSON
    pub json_path: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            latency_unit: LatencyUnit::Millis,
            latency_summary: true,
            csv_path: None,
            json_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Expected FNV-1a 64 hash of response bodies
    pub expected: u64,
    /// Fraction of responses to verify, in [0.0, 1.0]
    pub sample_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address to bind the metrics endpoint (e.g., "127.0.0.1:9100")
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Substring an application name must contain
    pub service: String,
    /// Appended to every discovered base URL
    pub path_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub path: PathBuf,
    #[serde(default = "default_script_pool")]
    pub pool_size: usize,
}

fn default_script_pool() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyUnit {
    #[serde(rename = "ms")]
    Millis,
    #[serde(rename = "us")]
    Micros,
    #[serde(rename = "ns")]
    Nanos,
}

impl LatencyUnit {
    pub fn as_nanos(self) -> u64 {
        match self {
            LatencyUnit::Millis => 1_000_000,
            LatencyUnit::Micros => 1_000,
            LatencyUnit::Nanos => 1,
        }
    }

    /// Whole units contained in `d`, truncated.
    pub fn convert(self, d: Duration) -> u64 {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        nanos / self.as_nanos()
    }

    /// Number of units in a day, the histogram's upper bound.
    pub fn day(self) -> u64 {
        self.convert(Duration::from_secs(24 * 60 * 60))
    }
}

impl FromStr for LatencyUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ms" => Ok(LatencyUnit::Millis),
            "us" => Ok(LatencyUnit::Micros),
            "ns" => Ok(LatencyUnit::Nanos),
            other => Err(ConfigError::InvalidLatencyUnit(other.to_string())),
        }
    }
}

impl fmt::Display for LatencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LatencyUnit::Millis => "ms",
            LatencyUnit::Micros => "us",
            LatencyUnit::Nanos => "ns",
        };
        f.write_str(s)
    }
}

/// Parse a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidHeader(raw.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidHeader(raw.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Resolve a body argument: literal text, `@path`, or `@-` for stdin.
pub fn load_data(data: &str) -> Result<Bytes, ConfigError> {
    let Some(path) = data.strip_prefix('@') else {
        return Ok(Bytes::copy_from_slice(data.as_bytes()));
    };
    let read = if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin().lock().read_to_end(&mut buf).map(|_| buf)
    } else {
        std::fs::read(path)
    };
    let buf = read.map_err(|source| ConfigError::Unreadable {
        path: PathBuf::from(path),
        source,
    })?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[load]
qps = 100
concurrency = 4
interval_ms = 1000
iterations = 3
seed = 42

[request]
method = "POST"
hosts = ["a.example", "b.example"]
data = "hello"

[request.headers]
"X-Trace" = "on"

[report]
latency_unit = "us"
csv_path = "latencies.csv"

[hash]
expected = 12345
sample_rate = 0.25

[metrics]
bind = "127.0.0.1:9100"

[discovery]
service = "orders"
path_suffix = "/health"
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.load.qps, 100);
        assert_eq!(config.load.concurrency, 4);
        assert_eq!(config.load.seed, Some(42));
        assert_eq!(config.request.method, "POST");
        assert_eq!(config.request.hosts.len(), 2);
        assert_eq!(config.request.headers["X-Trace"], "on");
        assert_eq!(config.request.timeout_ms, 10_000);
        assert_eq!(config.report.latency_unit, LatencyUnit::Micros);
        assert!(config.report.latency_summary);
        assert_eq!(config.hash.sample_rate, 0.25);
        assert_eq!(config.metrics.bind.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(config.discovery.as_ref().unwrap().service, "orders");
        assert!(config.script.is_none());
        assert_eq!(config.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.load.qps, 1);
        assert_eq!(config.load.concurrency, 1);
        assert_eq!(config.load.interval_ms, 10_000);
        assert_eq!(config.request.method, "GET");
        assert_eq!(config.report.latency_unit, LatencyUnit::Millis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_load() {
        let mut config = Config::default();
        config.load.qps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQps)));

        let mut config = Config::default();
        config.load.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency)
        ));

        let mut config = Config::default();
        config.request.method = "GE T".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_latency_unit_conversion() {
        let d = Duration::from_micros(2_500);
        assert_eq!(LatencyUnit::Millis.convert(d), 2);
        assert_eq!(LatencyUnit::Micros.convert(d), 2_500);
        assert_eq!(LatencyUnit::Nanos.convert(d), 2_500_000);
        assert_eq!(LatencyUnit::Millis.day(), 86_400_000);
        assert!("s".parse::<LatencyUnit>().is_err());
        assert_eq!("ns".parse::<LatencyUnit>().unwrap(), LatencyUnit::Nanos);
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Id:  abc ").unwrap(),
            ("X-Id".to_string(), "abc".to_string())
        );
        assert_eq!(
            parse_header("Authorization: Bearer a:b").unwrap().1,
            "Bearer a:b"
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_load_data_literal_and_file() {
        assert_eq!(load_data("plain").unwrap(), Bytes::from_static(b"plain"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"k\":1}").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(load_data(&arg).unwrap(), Bytes::from_static(b"{\"k\":1}"));

        assert!(matches!(
            load_data("@/definitely/not/here"),
            Err(ConfigError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_host_overrides_skip_blanks() {
        let request = RequestConfig {
            hosts: vec!["".into(), " a.example ".into()],
            ..Default::default()
        };
        assert_eq!(request.host_overrides(), vec!["a.example".to_string()]);
    }
}
