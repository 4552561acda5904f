//! Work source: reads input lines and distributes them over bounded queues.

use crate::error::{CoordinationError, HarnessError, Result};
use crate::rendezvous::Party;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// What travels through a work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Line(String),
    /// Tells exactly one worker that no more work will arrive
    Terminator,
}

/// Consumer end of a work queue, shared by the workers of one shard.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
}

impl SharedQueue {
    /// Wait for the next item; `None` once every producer is gone and the queue is empty.
    pub async fn take(&self) -> Option<QueueItem> {
        self.rx.lock().await.recv().await
    }
}

/// Create one bounded work queue.
pub fn work_queue(capacity: usize) -> (mpsc::Sender<QueueItem>, SharedQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        SharedQueue {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Split `workers` into shards of at most `workers_per_queue` workers.
pub fn shard_sizes(workers: usize, workers_per_queue: usize) -> Vec<usize> {
    let per_queue = workers_per_queue.max(1);
    let mut remaining = workers;
    let mut sizes = Vec::with_capacity(workers.div_ceil(per_queue));
    while remaining > 0 {
        let size = remaining.min(per_queue);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

/// Index of the queue that worker `worker_idx` reads from.
pub fn shard_of(worker_idx: usize, workers_per_queue: usize) -> usize {
    worker_idx / workers_per_queue.max(1)
}

/// Count the lines of a file so queues can hold the whole input.
///
/// Works on raw bytes: content that later fails to decode still counts, so
/// sizing never fails where the read loop would only stop early.
pub async fn count_lines(path: &Path) -> Result<usize> {
    let source_read = |source: std::io::Error| HarnessError::SourceRead {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(source_read)?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut count = 0usize;
    loop {
        line.clear();
        if reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(source_read)?
            == 0
        {
            return Ok(count);
        }
        count += 1;
    }
}

/// Line reader shared by every work source of a run.
pub struct LineReader<R> {
    lines: Mutex<Lines<R>>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }

    pub async fn next_line(&self) -> std::io::Result<Option<String>> {
        self.lines.lock().await.next_line().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub shard: usize,
    pub enqueued: u64,
    pub skipped_empty: u64,
    pub terminators: usize,
    /// Set when reading stopped early because of an I/O error
    pub read_error: Option<String>,
}

/// Totals over every shard's [`SourceReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub enqueued: u64,
    pub skipped_empty: u64,
    pub read_errors: Vec<String>,
}

impl SourceSummary {
    pub fn from_reports(reports: &[SourceReport]) -> Self {
        Self {
            enqueued: reports.iter().map(|r| r.enqueued).sum(),
            skipped_empty: reports.iter().map(|r| r.skipped_empty).sum(),
            read_errors: reports.iter().filter_map(|r| r.read_error.clone()).collect(),
        }
    }
}

/// Producer for one shard's queue.
pub struct WorkSource<R> {
    shard: usize,
    reader: Arc<LineReader<R>>,
    queue: mpsc::Sender<QueueItem>,
    terminators: usize,
    wait_timeout: Option<Duration>,
}

impl<R> WorkSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(
        shard: usize,
        reader: Arc<LineReader<R>>,
        queue: mpsc::Sender<QueueItem>,
        terminators: usize,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shard,
            reader,
            queue,
            terminators,
            wait_timeout,
        }
    }

    /// Enqueue every non-empty line, then one terminator per shard worker.
    ///
    /// A read error ends the read loop early but the terminators are still
    /// sent. When `ready` is given, arrive there after the last terminator.
    pub async fn run(self, ready: Option<Party>) -> Result<SourceReport> {
        let mut report = SourceReport {
            shard: self.shard,
            ..SourceReport::default()
        };

        loop {
            let line = match self.reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(shard = self.shard, error = %e, "error reading input; ending read loop");
                    report.read_error = Some(e.to_string());
                    break;
                }
            };
            if line.is_empty() {
                report.skipped_empty += 1;
                continue;
            }
            self.put(QueueItem::Line(line)).await?;
            report.enqueued += 1;
        }

        for _ in 0..self.terminators {
            self.put(QueueItem::Terminator).await?;
            report.terminators += 1;
        }
        info!(
            shard = self.shard,
            enqueued = report.enqueued,
            skipped_empty = report.skipped_empty,
            terminators = report.terminators,
            "work source finished"
        );

        if let Some(party) = ready {
            party.arrive().await?;
        }
        Ok(report)
    }

    async fn put(&self, item: QueueItem) -> Result<()> {
        let sent = match self.wait_timeout {
            Some(after) => tokio::time::timeout(after, self.queue.send(item))
                .await
                .map_err(|_| CoordinationError::TimedOut {
                    what: format!("space in work queue {}", self.shard),
                    after,
                })?,
            None => self.queue.send(item).await,
        };
        sent.map_err(|_| {
            debug!(shard = self.shard, "work queue has no consumers left");
            HarnessError::Coordination(CoordinationError::Broken(format!(
                "work queue {}",
                self.shard
            )))
        })
    }
}
