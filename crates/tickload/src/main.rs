use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tickload_core::{
    is_usage_error, parse_header, parse_target_url, serve_metrics, Config, DiscoveryConfig,
    Engine, EurekaTargets, HttpOptions, HttpTransport, LatencyUnit, Metrics, PayloadSource, ScriptConfig,
    StaticTargets, TargetProvider,
};
use tracing::{error, info};

const EXIT_USAGE: u8 = 64;

#[derive(Parser, Debug)]
#[command(name = "tickload")]
#[command(about = "Closed-loop HTTP load tester with per-interval latency reports")]
struct Args {
    /// Target URL, `@file` with one URL per line, `@-` for stdin, or the
    /// registry URL when discovery is enabled
    url: String,

    /// Path to a TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Requests per second issued by each worker
    #[arg(long)]
    qps: Option<u32>,

    /// Number of workers
    #[arg(long)]
    concurrency: Option<u32>,

    /// Stop after this many reporting intervals
    #[arg(long)]
    iterations: Option<u64>,

    /// Stop once this many requests have been issued
    #[arg(long)]
    total_requests: Option<u64>,

    /// Reporting interval (e.g. 10s, 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Per-request timeout (e.g. 10s)
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// HTTP method
    #[arg(long)]
    method: Option<String>,

    /// Host header overrides, comma separated; one is picked per request
    #[arg(long, value_delimiter = ',')]
    host: Vec<String>,

    /// Extra request header as `Name: value`; repeatable
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    /// Request body; `@path` reads a file and `@-` reads stdin
    #[arg(long)]
    data: Option<String>,

    /// Open a new connection for every request
    #[arg(long)]
    no_reuse: bool,

    /// Ask for gzip responses
    #[arg(long)]
    compress: bool,

    /// Do not print the latency summary when the run stops
    #[arg(long)]
    no_latency_summary: bool,

    /// Write the cumulative latency distribution to this CSV file
    #[arg(long)]
    report_latencies_csv: Option<PathBuf>,

    /// Write the run report to this JSON file
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Latency unit: ms, us or ns
    #[arg(long)]
    latency_unit: Option<String>,

    /// Serve metrics on this address (e.g. 127.0.0.1:9100)
    #[arg(long)]
    metric_addr: Option<String>,

    /// Expected FNV-1a 64 hash of response bodies
    #[arg(long)]
    hash_value: Option<u64>,

    /// Fraction of responses whose body hash is checked
    #[arg(long)]
    hash_sample_rate: Option<f64>,

    /// Discover targets from the registry at `url`, keeping applications
    /// whose name contains this value
    #[arg(long)]
    eureka_service: Option<String>,

    /// Path appended to every discovered instance
    #[arg(long)]
    eureka_path_suffix: Option<String>,

    /// JavaScript file defining generate_data(method, url, host, requestId)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Number of script contexts
    #[arg(long)]
    script_pool: Option<usize>,

    /// Seed for host selection and hash sampling
    #[arg(long)]
    seed: Option<u64>,
}

/// Any parse outcome that stops the run is a usage exit, `--help` included.
fn parse_exit_code(_err: &clap::Error) -> u8 {
    EXIT_USAGE
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_code(&e));
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_usage_error(&e) => {
            eprintln!("{:#}", e);
            eprintln!("Try --help for help.");
            ExitCode::from(EXIT_USAGE)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    config.validate()?;

    let targets = resolve_targets(&args.url, &config).await?;
    info!("Loaded {} targets", targets.len());

    let transport = HttpTransport::new(HttpOptions {
        timeout: config.request_timeout(),
        compress: config.request.compress,
        no_reuse: config.request.no_reuse,
        max_idle_per_host: config.load.concurrency as usize,
        headers: config
            .request
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    })
    .context("Failed to create HTTP transport")?;

    let payload = payload_source(&config)?;
    let bind = config.metrics.bind.clone();
    let mut engine = Engine::new(config, targets, Arc::new(transport))?
        .with_source(args.url.trim_start_matches('@'));
    if let Some(payload) = payload {
        engine = engine.with_payload(payload);
    }
    if let Some(bind) = bind {
        let metrics = Arc::new(Metrics::new()?);
        serve_metrics(&bind, Arc::clone(&metrics)).await?;
        engine = engine.with_metrics(metrics);
    }

    engine.run(std::io::stdout()).await?;
    Ok(())
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let load = &mut config.load;
    if let Some(qps) = args.qps {
        load.qps = qps;
    }
    if let Some(concurrency) = args.concurrency {
        load.concurrency = concurrency;
    }
    if let Some(iterations) = args.iterations {
        load.iterations = iterations;
    }
    if let Some(total) = args.total_requests {
        load.total_requests = total;
    }
    if let Some(interval) = args.interval {
        load.interval_ms = interval.as_millis() as u64;
    }
    if args.seed.is_some() {
        load.seed = args.seed;
    }

    let request = &mut config.request;
    if let Some(timeout) = args.timeout {
        request.timeout_ms = timeout.as_millis() as u64;
    }
    if let Some(method) = &args.method {
        request.method = method.to_uppercase();
    }
    if !args.host.is_empty() {
        request.hosts = args.host.clone();
    }
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        request.headers.insert(name, value);
    }
    if let Some(data) = &args.data {
        request.data = data.clone();
    }
    request.no_reuse |= args.no_reuse;
    request.compress |= args.compress;

    let report = &mut config.report;
    if args.no_latency_summary {
        report.latency_summary = false;
    }
    if let Some(path) = &args.report_latencies_csv {
        report.csv_path = Some(path.clone());
    }
    if let Some(path) = &args.report_json {
        report.json_path = Some(path.clone());
    }
    if let Some(unit) = &args.latency_unit {
        report.latency_unit = unit.parse::<LatencyUnit>()?;
    }

    if let Some(expected) = args.hash_value {
        config.hash.expected = expected;
    }
    if let Some(rate) = args.hash_sample_rate {
        config.hash.sample_rate = rate;
    }
    if let Some(bind) = &args.metric_addr {
        config.metrics.bind = Some(bind.clone());
    }

    if let Some(service) = &args.eureka_service {
        let discovery = config.discovery.get_or_insert_with(DiscoveryConfig::default);
        discovery.service = service.clone();
    }
    if let (Some(suffix), Some(discovery)) = (&args.eureka_path_suffix, config.discovery.as_mut()) {
        discovery.path_suffix = suffix.clone();
    }

    if let Some(path) = &args.script {
        config.script = Some(ScriptConfig {
            path: path.clone(),
            pool_size: config.script.as_ref().map_or(4, |s| s.pool_size),
        });
    }
    if let (Some(pool), Some(script)) = (args.script_pool, config.script.as_mut()) {
        script.pool_size = pool;
    }

    Ok(config)
}

async fn resolve_targets(url: &str, config: &Config) -> Result<Vec<tickload_core::Target>> {
    let hosts = config.request.host_overrides();
    let provider: Box<dyn TargetProvider> = match &config.discovery {
        Some(discovery) => {
            let registry = parse_target_url(url, 1)?;
            Box::new(
                EurekaTargets::new(registry, discovery.service.clone(), discovery.path_suffix.clone())?
                    .with_hosts(hosts),
            )
        }
        None => Box::new(StaticTargets::new(url).with_hosts(hosts)),
    };
    info!("Resolving targets ({})", provider.name());
    provider.targets().await
}

#[cfg(feature = "scripting")]
fn payload_source(config: &Config) -> Result<Option<Arc<dyn PayloadSource>>> {
    let Some(script) = &config.script else {
        return Ok(None);
    };
    let payload = tickload_core::ScriptPayload::from_file(&script.path, script.pool_size)?;
    info!("Generating payloads with {:?}", script.path);
    Ok(Some(Arc::new(payload)))
}

#[cfg(not(feature = "scripting"))]
fn payload_source(config: &Config) -> Result<Option<Arc<dyn PayloadSource>>> {
    match &config.script {
        Some(_) => Err(tickload_core::ConfigError::Script("built without the scripting feature".into()).into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickload_core::ConfigError;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("tickload").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "--qps",
            "20",
            "--concurrency",
            "3",
            "--interval",
            "2s",
            "--method",
            "post",
            "--host",
            "a.example,b.example",
            "-H",
            "X-Trace: on",
            "--latency-unit",
            "us",
            "--no-latency-summary",
            "http://localhost:8080/",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.load.qps, 20);
        assert_eq!(config.load.concurrency, 3);
        assert_eq!(config.load.interval_ms, 2000);
        assert_eq!(config.request.method, "POST");
        assert_eq!(config.request.hosts, vec!["a.example", "b.example"]);
        assert_eq!(config.request.headers["X-Trace"], "on");
        assert_eq!(config.report.latency_unit, LatencyUnit::Micros);
        assert!(!config.report.latency_summary);
        assert!(config.discovery.is_none());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "[load]\nqps = 5\nconcurrency = 8\n[script]\npath = \"gen.js\"\npool_size = 2\n").unwrap();
        let path = path.to_string_lossy().to_string();

        let args = parse(&["--config", &path, "--qps", "50", "--script-pool", "6", "http://x/"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.load.qps, 50);
        assert_eq!(config.load.concurrency, 8);
        assert_eq!(config.script.unwrap().pool_size, 6);
    }

    #[test]
    fn test_usage_errors() {
        let args = parse(&["--latency-unit", "s", "http://x/"]);
        assert!(is_usage_error(&build_config(&args).unwrap_err()));

        let args = parse(&["-H", "broken", "http://x/"]);
        assert!(is_usage_error(&build_config(&args).unwrap_err()));

        let args = parse(&["--qps", "0", "http://x/"]);
        let config = build_config(&args).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQps)));

        assert!(Args::try_parse_from(["tickload"]).is_err());
        assert!(Args::try_parse_from(["tickload", "--qps", "ten", "http://x/"]).is_err());
    }

    #[test]
    fn test_help_exits_with_usage_code() {
        let err = Args::try_parse_from(["tickload", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        assert_eq!(parse_exit_code(&err), EXIT_USAGE);

        let err = Args::try_parse_from(["tickload", "--qps", "ten", "http://x/"]).unwrap_err();
        assert_eq!(parse_exit_code(&err), EXIT_USAGE);
    }

    #[test]
    fn test_discovery_flags() {
        let args = parse(&[
            "--eureka-service",
            "orders",
            "--eureka-path-suffix",
            "/ping",
            "http://registry:8761/eureka/v2/apps",
        ]);
        let discovery = build_config(&args).unwrap().discovery.unwrap();
        assert_eq!(discovery.service, "orders");
        assert_eq!(discovery.path_suffix, "/ping");
    }

    #[tokio::test]
    async fn test_resolve_bad_url_is_usage_error() {
        let err = resolve_targets("localhost:4140", &Config::default())
            .await
            .unwrap_err();
        assert!(is_usage_error(&err));
    }
}
