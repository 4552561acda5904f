use crate::outcome::OutcomeSummary;
use crate::poller::PollerReport;
use crate::recorder::FlushReport;
use crate::source::SourceSummary;
use crate::stats::RunStatistics;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Counts, statistics and log bookkeeping for one request stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub outcomes: OutcomeSummary,
    pub statistics: Option<RunStatistics>,
    pub recorder: FlushReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub target: String,
    pub workers: usize,
    pub queues: usize,
    pub source: SourceSummary,
    pub post: StreamReport,
    pub wall_time_ms: u64,
    /// Completed write-style requests per second of wall time
    pub throughput: f64,
    pub get: Option<StreamReport>,
    pub poller: Option<PollerReport>,
}

/// Requests per second, `1000 * requests / wall_ms`.
pub fn throughput(requests: u64, wall_time: Duration) -> f64 {
    let wall_ms = wall_time.as_nanos() as f64 / 1_000_000.0;
    if wall_ms > 0.0 {
        1000.0 * requests as f64 / wall_ms
    } else {
        0.0
    }
}

fn write_counts(f: &mut fmt::Formatter<'_>, stream: &StreamReport) -> fmt::Result {
    writeln!(
        f,
        "Total number of successful requests: {}",
        stream.outcomes.succeeded
    )?;
    writeln!(
        f,
        "Total number of unsuccessful requests: {}",
        stream.outcomes.failed
    )?;
    match &stream.statistics {
        Some(stats) => {
            writeln!(f, "Mean response time : {:.4} ms", stats.mean_ms)?;
            writeln!(f, "Median response time : {:.4} ms", stats.median_ms)?;
            writeln!(f, "99th Percentile response time : {:.4} ms", stats.p99_ms)?;
            writeln!(f, "Max response time : {:.4} ms", stats.max_ms)?;
        }
        None => writeln!(f, "No latency samples recorded")?,
    }
    if stream.recorder.dropped > 0 {
        writeln!(
            f,
            "WARNING: {} latency samples were dropped",
            stream.recorder.dropped
        )?;
    }
    Ok(())
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const RULE: &str = "-----------------------------------------------------";

        writeln!(f, "All {} threads processing completed!", self.workers)?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "------------------------STATS------------------------")?;
        write_counts(f, &self.post)?;
        writeln!(f, "Total wall time: {} ms", self.wall_time_ms)?;
        writeln!(f, "Throughput: {:.2}", self.throughput)?;
        if self.source.skipped_empty > 0 {
            writeln!(f, "Empty lines skipped: {}", self.source.skipped_empty)?;
        }
        for err in &self.source.read_errors {
            writeln!(f, "WARNING: input read stopped early: {err}")?;
        }
        writeln!(f, "{RULE}")?;
        if let Some(get) = &self.get {
            writeln!(f, "GET requests results")?;
            write_counts(f, get)?;
        }
        Ok(())
    }
}
