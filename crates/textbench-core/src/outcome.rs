use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            other => Err(format!("unknown method {other:?}")),
        }
    }
}

/// Result of one completed request, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub succeeded: bool,
    /// HTTP status, 0 when the request never produced one
    pub status_code: u16,
    pub latency_nanos: u64,
    /// Wall-clock start of the request in nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub method: Method,
}

impl RequestOutcome {
    /// One latency log record: `timestamp_nanos,METHOD,latency_nanos,status_code\n`
    pub fn to_log_line(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.timestamp, self.method, self.latency_nanos, self.status_code
        )
    }
}

/// Success/failure tally shared by every worker of one request stream.
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl OutcomeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count exactly one of success or failure for a finished request.
    pub fn record(&self, outcome: &RequestOutcome) {
        if outcome.succeeded {
            self.mark_success();
        } else {
            self.mark_failure();
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary {
            succeeded: self.succeeded(),
            failed: self.failed(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub succeeded: u64,
    pub failed: u64,
}

impl OutcomeSummary {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}
