use std::path::PathBuf;
use thiserror::Error;

/// Operator mistakes detected before any traffic is sent.
///
/// The binary maps every variant to the usage exit code.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL on line {line}: '{url}': {reason}")]
    InvalidUrl {
        line: usize,
        url: String,
        reason: String,
    },

    #[error("invalid URL on line {line}: '{url}': Missing scheme")]
    MissingScheme { line: usize, url: String },

    #[error("invalid URL on line {line}: '{url}': Missing host")]
    MissingHost { line: usize, url: String },

    #[error("no target URLs were provided")]
    NoTargets,

    #[error("qps must be at least 1")]
    InvalidQps,

    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("reporting interval must be greater than zero")]
    InvalidInterval,

    #[error("hash sample rate must be a number, got {0}")]
    InvalidSampleRate(f64),

    #[error("latency unit should be [ms | us | ns], got '{0}'")]
    InvalidLatencyUnit(String),

    #[error("invalid header '{0}': expected 'Name: value'")]
    InvalidHeader(String),

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("unable to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("scripting is unavailable: {0}")]
    Script(String),
}

/// Returns true if any error in the chain is a [`ConfigError`].
pub fn is_usage_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ConfigError>())
}
