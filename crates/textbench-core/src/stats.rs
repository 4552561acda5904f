//! Post-run latency statistics over the recorded log.

use crate::error::{HarnessError, Result};
use crate::outcome::Method;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// One persisted latency log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub timestamp: i64,
    pub method: Method,
    pub latency_nanos: u64,
    pub status_code: u16,
}

impl LatencySample {
    pub fn latency_ms(&self) -> f64 {
        self.latency_nanos as f64 / NANOS_PER_MILLI
    }
}

impl FromStr for LatencySample {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != 4 {
            return Err(format!("expected 4 fields, found {}", fields.len()));
        }
        Ok(Self {
            timestamp: fields[0]
                .parse()
                .map_err(|e| format!("bad timestamp {:?}: {}", fields[0], e))?,
            method: fields[1].parse()?,
            latency_nanos: fields[2]
                .parse()
                .map_err(|e| format!("bad latency {:?}: {}", fields[2], e))?,
            status_code: fields[3]
                .parse()
                .map_err(|e| format!("bad status {:?}: {}", fields[3], e))?,
        })
    }
}

/// Descriptive statistics of one run, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl RunStatistics {
    /// Compute the statistics; `None` for an empty sample set.
    ///
    /// Samples are ordered descending and p99 is the element at index
    /// `floor(n / 100)`, so for fewer than 100 samples p99 equals the maximum.
    /// Existing reports use this definition, keep it.
    pub fn from_latencies_ms(latencies: &[f64]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }

        let mut sorted = latencies.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));

        let n = sorted.len();
        let mean_ms = sorted.iter().sum::<f64>() / n as f64;
        let median_ms = if n % 2 == 0 {
            (sorted[n / 2] + sorted[n / 2 - 1]) / 2.0
        } else {
            sorted[n / 2]
        };

        Some(Self {
            count: n,
            mean_ms,
            median_ms,
            p99_ms: sorted[n / 100],
            max_ms: sorted[0],
        })
    }

    pub fn from_samples(samples: &[LatencySample]) -> Option<Self> {
        let latencies: Vec<f64> = samples.iter().map(LatencySample::latency_ms).collect();
        Self::from_latencies_ms(&latencies)
    }
}

/// Parse every record of a latency log. Blank lines are ignored.
pub fn parse_log(path: &Path, contents: &str) -> Result<Vec<LatencySample>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            line.parse().map_err(|reason| HarnessError::Analyze {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            })
        })
        .collect()
}

/// Read a flushed latency log once and summarize it.
pub async fn analyze_log(path: impl AsRef<Path>) -> Result<Option<RunStatistics>> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await?;
    let samples = parse_log(path, &contents)?;
    Ok(RunStatistics::from_samples(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_sample_set() {
        let stats = RunStatistics::from_latencies_ms(&[3.0, 1.0, 5.0, 2.0, 4.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean_ms, 3.0);
        assert_eq!(stats.median_ms, 3.0);
        // floor(5 / 100) = 0 in descending order is the maximum.
        assert_eq!(stats.p99_ms, 5.0);
        assert_eq!(stats.max_ms, 5.0);
    }

    #[test]
    fn test_hundred_samples_p99() {
        let latencies: Vec<f64> = (1..=100).map(f64::from).collect();
        let stats = RunStatistics::from_latencies_ms(&latencies).unwrap();
        assert_eq!(stats.p99_ms, 99.0);
        assert_eq!(stats.max_ms, 100.0);
        assert_eq!(stats.mean_ms, 50.5);
        assert_eq!(stats.median_ms, 50.5);
    }

    #[test]
    fn test_even_median_averages_middle_pair() {
        let stats = RunStatistics::from_latencies_ms(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stats.median_ms, 2.5);
    }

    #[test]
    fn test_empty_has_no_statistics() {
        assert!(RunStatistics::from_latencies_ms(&[]).is_none());
    }

    #[test]
    fn test_parse_log_converts_nanos() {
        let contents = "100,POST,1000000,200\n200,GET,3000000,404\n\n";
        let samples = parse_log(Path::new("statistics.csv"), contents).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].method, Method::Get);
        assert_eq!(samples[1].status_code, 404);

        let stats = RunStatistics::from_samples(&samples).unwrap();
        assert_eq!(stats.mean_ms, 2.0);
        assert_eq!(stats.max_ms, 3.0);
    }

    #[test]
    fn test_parse_log_reports_bad_line() {
        let contents = "100,POST,1000000,200\n100,POST,abc,200\n";
        let err = parse_log(Path::new("statistics.csv"), contents).unwrap_err();
        match err {
            HarnessError::Analyze { line, reason, .. } => {
                assert_eq!(line, 2);
                assert!(reason.contains("latency"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_analyze_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.csv");
        std::fs::write(
            &path,
            "1,POST,1000000,200\n2,POST,2000000,200\n3,POST,3000000,200\n",
        )
        .unwrap();
        let stats = analyze_log(&path).await.unwrap().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.median_ms, 2.0);

        std::fs::write(&path, "").unwrap();
        assert!(analyze_log(&path).await.unwrap().is_none());
    }
}
