use crate::error::{CoordinationError, RequestError, Result};
use crate::outcome::{Method, OutcomeCounters, RequestOutcome};
use crate::recorder::LatencyRecorder;
use crate::rendezvous::Party;
use crate::source::{QueueItem, SharedQueue};
use crate::target::TargetService;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Status recorded when the request timed out on the client side.
pub const TIMEOUT_STATUS: u16 = 408;

/// Issue one request and classify it. Never fails: errors become failed outcomes.
pub async fn issue_request(
    target: &dyn TargetService,
    method: Method,
    payload: &str,
) -> RequestOutcome {
    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let start = Instant::now();
    let result = match method {
        Method::Post => target.analyze(payload).await,
        Method::Get => target.lookup(payload).await,
    };
    let latency_nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

    let (succeeded, status_code) = match result {
        Ok(response) => {
            if !response.is_success() {
                warn!(
                    %method,
                    status = response.status,
                    body = %response.body,
                    "request rejected"
                );
            }
            (response.is_success(), response.status)
        }
        Err(RequestError::Timeout) => {
            warn!(%method, "request timed out");
            (false, TIMEOUT_STATUS)
        }
        Err(RequestError::Transport(e)) => {
            warn!(%method, error = %e, "request failed");
            (false, 0)
        }
    };

    RequestOutcome {
        succeeded,
        status_code,
        latency_nanos,
        timestamp,
        method,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub requests: u64,
    pub skipped_empty: u64,
}

/// One request worker: drains its shard's queue until it takes a terminator.
pub struct RequestWorker {
    id: usize,
    queue: SharedQueue,
    target: Arc<dyn TargetService>,
    counters: Arc<OutcomeCounters>,
    recorder: Arc<LatencyRecorder>,
    wait_timeout: Option<Duration>,
}

impl RequestWorker {
    pub fn new(
        id: usize,
        queue: SharedQueue,
        target: Arc<dyn TargetService>,
        counters: Arc<OutcomeCounters>,
        recorder: Arc<LatencyRecorder>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            queue,
            target,
            counters,
            recorder,
            wait_timeout,
        }
    }

    /// Process items until a terminator, then arrive at `completion`.
    ///
    /// Losing the queue or timing out on it drops `completion` unarrived,
    /// which breaks the rendezvous for everyone else.
    pub async fn run(self, completion: Party) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            worker: self.id,
            ..WorkerReport::default()
        };

        loop {
            let line = match self.next_item().await? {
                QueueItem::Terminator => break,
                QueueItem::Line(line) => line,
            };
            if line.is_empty() {
                report.skipped_empty += 1;
                continue;
            }

            let outcome = issue_request(self.target.as_ref(), Method::Post, &line).await;
            debug!(
                worker = self.id,
                status = outcome.status_code,
                latency_ns = outcome.latency_nanos,
                "request complete"
            );
            self.counters.record(&outcome);
            if let Err(e) = self.recorder.submit(outcome) {
                warn!(worker = self.id, error = %e, "latency sample not recorded");
            }
            report.requests += 1;
        }

        debug!(worker = self.id, requests = report.requests, "terminator taken");
        completion.arrive().await?;
        Ok(report)
    }

    async fn next_item(&self) -> Result<QueueItem> {
        let item = match self.wait_timeout {
            Some(after) => tokio::time::timeout(after, self.queue.take())
                .await
                .map_err(|_| {
                    error!(worker = self.id, ?after, "timed out waiting for work");
                    CoordinationError::TimedOut {
                        what: format!("work for worker {}", self.id),
                        after,
                    }
                })?,
            None => self.queue.take().await,
        };
        item.ok_or_else(|| {
            error!(worker = self.id, "work queue closed without a terminator");
            CoordinationError::QueueClosed { worker: self.id }.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::error::HarnessError;
    use crate::rendezvous::{BarrierState, Rendezvous};
    use crate::source::work_queue;
    use crate::target::MockTarget;

    fn mock(failure_rate: f64) -> Arc<MockTarget> {
        Arc::new(MockTarget::new(MockConfig {
            delay_ms: 0,
            failure_rate,
            seed: 1,
        }))
    }

    async fn recorder(dir: &tempfile::TempDir) -> Arc<LatencyRecorder> {
        Arc::new(
            LatencyRecorder::create(dir.path().join("post.csv"), 2)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_worker_counts_and_records_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(&dir).await;
        let counters = Arc::new(OutcomeCounters::new());
        let target = mock(0.0);
        let (tx, queue) = work_queue(8);
        for item in [
            QueueItem::Line("hello".into()),
            QueueItem::Line(String::new()),
            QueueItem::Line("world".into()),
            QueueItem::Terminator,
            QueueItem::Line("never read".into()),
        ] {
            tx.send(item).await.unwrap();
        }

        let completion = Arc::new(Rendezvous::new("completion", 1, None));
        let worker = RequestWorker::new(
            0,
            queue,
            target.clone(),
            counters.clone(),
            recorder.clone(),
            None,
        );
        let report = worker.run(completion.party()).await.unwrap();

        assert_eq!(report.requests, 2);
        assert_eq!(report.skipped_empty, 1);
        assert_eq!(counters.succeeded(), 2);
        assert_eq!(counters.failed(), 0);
        assert_eq!(target.analyzed(), 2);
        assert_eq!(completion.state(), BarrierState::Released);
        assert_eq!(recorder.flush(None).await.unwrap().written, 2);
    }

    #[tokio::test]
    async fn test_failed_requests_do_not_stop_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(&dir).await;
        let counters = Arc::new(OutcomeCounters::new());
        let (tx, queue) = work_queue(8);
        for line in ["a", "b", "c"] {
            tx.send(QueueItem::Line(line.into())).await.unwrap();
        }
        tx.send(QueueItem::Terminator).await.unwrap();

        let completion = Arc::new(Rendezvous::new("completion", 1, None));
        RequestWorker::new(0, queue, mock(1.0), counters.clone(), recorder.clone(), None)
            .run(completion.party())
            .await
            .unwrap();

        assert_eq!(counters.succeeded(), 0);
        assert_eq!(counters.failed(), 3);
        recorder.flush(None).await.unwrap();
        let log = std::fs::read_to_string(recorder.path()).unwrap();
        assert!(log.lines().all(|l| l.ends_with(",500")));
    }

    #[tokio::test]
    async fn test_unrecorded_samples_still_count() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(&dir).await;
        recorder.flush(None).await.unwrap();
        let counters = Arc::new(OutcomeCounters::new());
        let (tx, queue) = work_queue(4);
        tx.send(QueueItem::Line("late".into())).await.unwrap();
        tx.send(QueueItem::Terminator).await.unwrap();

        let completion = Arc::new(Rendezvous::new("completion", 1, None));
        let report = RequestWorker::new(
            0,
            queue,
            mock(0.0),
            counters.clone(),
            recorder.clone(),
            None,
        )
        .run(completion.party())
        .await
        .unwrap();

        assert_eq!(report.requests, 1);
        assert_eq!(counters.succeeded(), 1);
        assert!(std::fs::read_to_string(recorder.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_breaks_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, queue) = work_queue(2);
        drop(tx);

        let completion = Arc::new(Rendezvous::new("completion", 2, None));
        let err = RequestWorker::new(
            3,
            queue,
            mock(0.0),
            Arc::new(OutcomeCounters::new()),
            recorder(&dir).await,
            None,
        )
        .run(completion.party())
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            HarnessError::Coordination(CoordinationError::QueueClosed { worker: 3 })
        ));
        assert_eq!(completion.state(), BarrierState::Broken);
        assert!(completion.party().arrive().await.is_err());
    }

    #[tokio::test]
    async fn test_dequeue_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, queue) = work_queue(2);
        let completion = Arc::new(Rendezvous::new("completion", 2, None));
        let err = RequestWorker::new(
            0,
            queue,
            mock(0.0),
            Arc::new(OutcomeCounters::new()),
            recorder(&dir).await,
            Some(Duration::from_millis(20)),
        )
        .run(completion.party())
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            HarnessError::Coordination(CoordinationError::TimedOut { .. })
        ));
        assert_eq!(completion.state(), BarrierState::Broken);
    }
}
