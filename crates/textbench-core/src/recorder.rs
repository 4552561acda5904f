//! Asynchronous latency log sink.
//!
//! Callers hand a [`RequestOutcome`] to [`LatencyRecorder::submit`] and move on;
//! a fixed pool of appender tasks drains the sample queue into the log file.

use crate::error::{CoordinationError, HarnessError, Result};
use crate::outcome::RequestOutcome;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RequestOutcome>>>;
type SharedWriter = Arc<tokio::sync::Mutex<BufWriter<File>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub written: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Tally {
    written: AtomicU64,
    dropped: AtomicU64,
}

enum State {
    Running {
        appenders: Vec<JoinHandle<()>>,
        writer: SharedWriter,
    },
    Flushed(FlushReport),
    /// A drain or close failed; appenders may still hold the file.
    Failed(String),
}

pub struct LatencyRecorder {
    path: PathBuf,
    ingress: Mutex<Option<mpsc::UnboundedSender<RequestOutcome>>>,
    tally: Arc<Tally>,
    state: tokio::sync::Mutex<State>,
}

impl LatencyRecorder {
    /// Create (or truncate) the log at `path` and start `pool_size` appenders.
    pub async fn create(path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await.map_err(|e| {
            HarnessError::RecorderWrite(format!("cannot create {}: {}", path.display(), e))
        })?;

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(BufWriter::new(file)));
        let (tx, rx) = mpsc::unbounded_channel();
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let tally = Arc::new(Tally::default());

        let appenders = (0..pool_size.max(1))
            .map(|idx| {
                tokio::spawn(run_appender(
                    idx,
                    rx.clone(),
                    writer.clone(),
                    tally.clone(),
                    path.clone(),
                ))
            })
            .collect();

        debug!(path = %path.display(), pool_size, "latency recorder started");

        Ok(Self {
            path,
            ingress: Mutex::new(Some(tx)),
            tally,
            state: tokio::sync::Mutex::new(State::Running { appenders, writer }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one sample for appending. Never waits on I/O.
    pub fn submit(&self, outcome: RequestOutcome) -> Result<()> {
        let ingress = self.ingress.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match ingress.as_ref() {
            Some(tx) => tx.send(outcome),
            None => Err(mpsc::error::SendError(outcome)),
        };
        sent.map_err(|mpsc::error::SendError(outcome)| {
            self.tally.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                path = %self.path.display(),
                timestamp = outcome.timestamp,
                method = %outcome.method,
                status = outcome.status_code,
                "sample submitted after flush; dropped"
            );
            HarnessError::RecorderWrite(format!("{} is already flushed", self.path.display()))
        })
    }

    /// Wait until every submitted sample has been appended, then close the log.
    ///
    /// Calling this again returns the first report without touching the file.
    /// A failed flush is final: later calls fail too.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<FlushReport> {
        let mut state = self.state.lock().await;
        let (appenders, writer) = match &mut *state {
            State::Flushed(report) => return Ok(*report),
            State::Failed(reason) => {
                return Err(HarnessError::RecorderWrite(format!(
                    "{} failed to flush earlier: {}",
                    self.path.display(),
                    reason
                )))
            }
            State::Running { appenders, writer } => (std::mem::take(appenders), writer.clone()),
        };

        // Closing the ingress lets the appenders drain the queue and exit.
        self.ingress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match self.drain_and_close(appenders, &writer, timeout).await {
            Ok(report) => {
                info!(
                    path = %self.path.display(),
                    written = report.written,
                    dropped = report.dropped,
                    "latency log flushed"
                );
                *state = State::Flushed(report);
                Ok(report)
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "latency log flush failed");
                *state = State::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn drain_and_close(
        &self,
        appenders: Vec<JoinHandle<()>>,
        writer: &SharedWriter,
        timeout: Option<Duration>,
    ) -> Result<FlushReport> {
        let drained = join_appenders(appenders);
        match timeout {
            Some(after) => tokio::time::timeout(after, drained).await.map_err(|_| {
                CoordinationError::TimedOut {
                    what: format!("latency recorder {} to drain", self.path.display()),
                    after,
                }
            })??,
            None => drained.await?,
        }

        let mut writer = writer.lock().await;
        writer.flush().await?;
        writer.get_mut().sync_all().await?;

        Ok(FlushReport {
            written: self.tally.written.load(Ordering::Acquire),
            dropped: self.tally.dropped.load(Ordering::Acquire),
        })
    }
}

async fn join_appenders(appenders: Vec<JoinHandle<()>>) -> Result<()> {
    for (idx, handle) in appenders.into_iter().enumerate() {
        handle
            .await
            .map_err(|_| CoordinationError::TaskFailed(format!("latency appender {idx}")))?;
    }
    Ok(())
}

async fn run_appender(
    idx: usize,
    rx: SharedReceiver,
    writer: SharedWriter,
    tally: Arc<Tally>,
    path: PathBuf,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(outcome) = next else {
            debug!(appender = idx, "sample queue closed");
            return;
        };

        let line = outcome.to_log_line();
        let appended = {
            let mut writer = writer.lock().await;
            writer.write_all(line.as_bytes()).await
        };
        match appended {
            Ok(()) => {
                tally.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tally.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    path = %path.display(),
                    timestamp = outcome.timestamp,
                    method = %outcome.method,
                    status = outcome.status_code,
                    error = %e,
                    "failed to append latency sample"
                );
            }
        }
    }
}
