//! Error types for textbench-core

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Malformed command line input, raised before any task starts
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Invalid configuration file or value
    #[error("configuration error: {0}")]
    Config(String),

    /// The input stream could not be read
    #[error("failed to read input {path:?}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single request failed. Workers fold this into an outcome.
    #[error("request failed: {0}")]
    Request(#[from] RequestError),

    /// The latency recorder could not persist or close its log
    #[error("latency recorder failure: {0}")]
    RecorderWrite(String),

    /// A rendezvous party failed, left, or timed out
    #[error("coordination failure: {0}")]
    Coordination(#[from] CoordinationError),

    /// The latency log could not be analyzed
    #[error("failed to analyze {path:?} line {line}: {reason}")]
    Analyze {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The target service could not be reached at all
    #[error("target service unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the blocking waits that tie the run together.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// Another party broke the rendezvous before everyone arrived
    #[error("rendezvous '{0}' is broken")]
    Broken(String),

    #[error("timed out after {after:?} waiting for {what}")]
    TimedOut { what: String, after: Duration },

    /// A worker's queue lost its producer before delivering a terminator
    #[error("queue for worker {worker} closed without a terminator")]
    QueueClosed { worker: usize },

    /// A spawned task panicked or was cancelled
    #[error("task '{0}' did not finish")]
    TaskFailed(String),
}

/// Why one request against the target service failed before producing a status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, HarnessError>;
