use crate::error::ConfigError;
use anyhow::Result;
use std::future::Future;
use std::io::Read;
use std::path::PathBuf;
use std::pin::Pin;
use url::Url;

/// Destination endpoint, fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: Url,
    /// Host header overrides, one chosen per request when non-empty
    pub hosts: Vec<String>,
}

impl Target {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            hosts: Vec::new(),
        }
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }
}

pub type TargetsFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Target>>> + Send + 'a>>;

/// Resolves the run's destinations once, at startup.
pub trait TargetProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn targets<'a>(&'a self) -> TargetsFuture<'a>;
}

/// Newline-separated URL list given inline, as `@path`, or as `@-` for stdin.
#[derive(Debug, Clone)]
pub struct StaticTargets {
    list: String,
    hosts: Vec<String>,
}

impl StaticTargets {
    pub fn new(list: impl Into<String>) -> Self {
        Self {
            list: list.into(),
            hosts: Vec::new(),
        }
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    fn read_list(&self) -> Result<String, ConfigError> {
        let Some(path) = self.list.strip_prefix('@') else {
            return Ok(self.list.clone());
        };
        let unreadable = |source| ConfigError::Unreadable {
            path: PathBuf::from(path),
            source,
        };
        if path == "-" {
            let mut list = String::new();
            std::io::stdin()
                .lock()
                .read_to_string(&mut list)
                .map_err(unreadable)?;
            Ok(list)
        } else {
            std::fs::read_to_string(path).map_err(unreadable)
        }
    }
}

impl TargetProvider for StaticTargets {
    fn name(&self) -> &'static str {
        "static"
    }

    fn targets<'a>(&'a self) -> TargetsFuture<'a> {
        Box::pin(async move {
            let list = self.read_list()?;
            let urls = parse_url_list(&list)?;
            Ok(urls
                .into_iter()
                .map(|url| Target::new(url).with_hosts(self.hosts.clone()))
                .collect())
        })
    }
}

/// Parse one absolute URL per line, skipping blank lines.
pub fn parse_url_list(list: &str) -> Result<Vec<Url>, ConfigError> {
    let mut urls = Vec::new();
    for (idx, line) in list.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        urls.push(parse_target_url(line, idx + 1)?);
    }
    if urls.is_empty() {
        return Err(ConfigError::NoTargets);
    }
    Ok(urls)
}

/// `line` is 1-based and only used for error messages.
pub fn parse_target_url(raw: &str, line: usize) -> Result<Url, ConfigError> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Err(ConfigError::MissingScheme {
                line,
                url: raw.to_string(),
            })
        }
        Err(url::ParseError::EmptyHost) => {
            return Err(ConfigError::MissingHost {
                line,
                url: raw.to_string(),
            })
        }
        Err(e) => {
            return Err(ConfigError::InvalidUrl {
                line,
                url: raw.to_string(),
                reason: e.to_string(),
            })
        }
    };
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::MissingHost {
            line,
            url: raw.to_string(),
        });
    }
    Ok(url)
}
