use crate::config::LatencyUnit;
use crate::stats::{LatencyHistogram, Quantiles, RunTotals};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_interval(interval: Duration) -> String {
    humantime::format_duration(interval).to_string()
}

/// One line of the live report.
#[derive(Debug, Clone)]
pub struct IntervalReport {
    pub timestamp: DateTime<Utc>,
    pub iteration: u64,
    pub good: u64,
    pub bad: u64,
    pub failed: u64,
    pub target: u64,
    pub percent_achieved: u64,
    pub interval: Duration,
    pub min: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
    pub hash_failures: u64,
    pub change: &'static str,
}

impl fmt::Display for IntervalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = format!(
            "{} {:4} {:6}/{}/{} {} {:3}% {} {:3} [{:3} {:3} {:3} {:4} ] {:4} {:6} {}",
            format_timestamp(self.timestamp),
            self.iteration,
            self.good,
            self.bad,
            self.failed,
            self.target,
            self.percent_achieved,
            format_interval(self.interval),
            self.min,
            self.p50,
            self.p95,
            self.p99,
            self.p999,
            self.max,
            self.hash_failures,
            self.change,
        );
        f.write_str(line.trim_end())
    }
}

/// Opening line describing the load about to be sent.
pub fn banner(method: &str, qps: u32, concurrency: u32, targets: &[String], source: &str) -> String {
    let total = u64::from(qps) * u64::from(concurrency);
    match targets {
        [single] => format!(
            "# sending {} {} req/s with concurrency={} to {} ...",
            total, method, concurrency, single
        ),
        _ => format!(
            "# sending {} {} req/s with concurrency={} using url list {} ...",
            total, method, concurrency, source
        ),
    }
}

/// Column legend aligned with [`IntervalReport`] lines.
pub fn column_header(interval: Duration) -> String {
    let time_len = format_timestamp(Utc::now()).len();
    let time_pad = " ".repeat(time_len.saturating_sub(2));
    let int_pad = " ".repeat(format_interval(interval).len().saturating_sub(2));
    format!(
        "# {} iter   good/b/f t   goal% {} min [p50 p95 p99  p999]  max bhash change",
        time_pad, int_pad
    )
}

/// Pretty JSON of the cumulative quantiles.
pub fn latency_summary(quantiles: &Quantiles) -> Result<String> {
    Ok(serde_json::to_string_pretty(quantiles)?)
}

/// One `from, to, count` line per recorded bucket.
pub fn write_latency_csv(path: &Path, histogram: &LatencyHistogram) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Unable to create latency CSV {:?}", path))?;
    let mut out = BufWriter::new(file);
    for bucket in histogram.distribution() {
        writeln!(out, "{}, {}, {}", bucket.from, bucket.to, bucket.count)?;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCalls {
    pub url: String,
    pub calls: u64,
}

/// Machine readable record of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub iterations: u64,
    pub latency_unit: LatencyUnit,
    pub totals: RunTotals,
    pub quantiles: Quantiles,
    pub achieved_rps: u64,
    pub targets: Vec<TargetCalls>,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Unable to write run report {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_report(change: &'static str) -> IntervalReport {
        IntervalReport {
            timestamp: Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
            iteration: 3,
            good: 98,
            bad: 1,
            failed: 1,
            target: 100,
            percent_achieved: 99,
            interval: Duration::from_secs(10),
            min: 1,
            p50: 4,
            p95: 9,
            p99: 12,
            p999: 40,
            max: 41,
            hash_failures: 0,
            change,
        }
    }

    #[test]
    fn test_interval_line_format() {
        assert_eq!(
            sample_report("++").to_string(),
            "2026-10-18T12:00:00Z    3     98/1/1 100  99% 10s   1 [  4   9  12   40 ]   41      0 ++"
        );
        assert!(sample_report("").to_string().ends_with("     0"));
    }

    #[test]
    fn test_banner() {
        let one = vec!["http://localhost:4140/".to_string()];
        assert_eq!(
            banner("GET", 10, 4, &one, "http://localhost:4140/"),
            "# sending 40 GET req/s with concurrency=4 to http://localhost:4140/ ..."
        );
        let many = vec!["http://a/".to_string(), "http://b/".to_string()];
        assert_eq!(
            banner("POST", 1, 1, &many, "urls.txt"),
            "# sending 1 POST req/s with concurrency=1 using url list urls.txt ..."
        );
    }

    #[test]
    fn test_column_header_alignment() {
        let header = column_header(Duration::from_secs(10));
        assert!(header.starts_with("# "));
        assert!(header.contains("good/b/f"));
        assert!(header.ends_with("bhash change"));
    }

    #[test]
    fn test_latency_summary_json() {
        let q = Quantiles {
            p50: 1,
            p75: 2,
            p90: 3,
            p95: 4,
            p99: 5,
            p999: 6,
        };
        let json: serde_json::Value = serde_json::from_str(&latency_summary(&q).unwrap()).unwrap();
        assert_eq!(json["p50"], 1);
        assert_eq!(json["p999"], 6);
    }

    #[test]
    fn test_write_latency_csv() {
        let mut hist = LatencyHistogram::new(LatencyUnit::Millis).unwrap();
        hist.record(5);
        hist.record(5);
        hist.record(17);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");

        write_latency_csv(&path, &hist).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["5, 5, 2", "17, 17, 1"]);
    }

    #[test]
    fn test_run_report_json() {
        let report = RunReport {
            started_at: "2026-10-18T12:00:00Z".into(),
            finished_at: "2026-10-18T12:00:10Z".into(),
            duration_ms: 10_000,
            iterations: 1,
            latency_unit: LatencyUnit::Micros,
            totals: RunTotals::default(),
            quantiles: Quantiles::default(),
            achieved_rps: 0,
            targets: vec![TargetCalls {
                url: "http://a/".into(),
                calls: 3,
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        report.write_json(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["latency_unit"], "us");
        assert_eq!(json["targets"][0]["calls"], 3);
    }
}
