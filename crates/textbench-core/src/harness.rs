//! Run driver: wires work sources, request workers, the poller and the
//! recorders together and turns the flushed logs into a [`RunReport`].

use crate::config::HarnessConfig;
use crate::error::{CoordinationError, HarnessError, Result};
use crate::outcome::OutcomeCounters;
use crate::poller::{Poller, PollerReport, StopSignal};
use crate::recorder::LatencyRecorder;
use crate::rendezvous::Rendezvous;
use crate::report::{throughput, RunReport, StreamReport};
use crate::source::{
    count_lines, shard_of, shard_sizes, work_queue, LineReader, SourceReport, SourceSummary,
    WorkSource,
};
use crate::stats::analyze_log;
use crate::target::{build_target, TargetService};
use crate::worker::{RequestWorker, WorkerReport};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pieces of a running secondary poller the driver needs to stop and drain it.
struct PollerRun {
    recorder: Arc<LatencyRecorder>,
    counters: Arc<OutcomeCounters>,
    stop: Arc<StopSignal>,
    done: Arc<Rendezvous>,
    handle: JoinHandle<Result<PollerReport>>,
}

pub struct Harness {
    config: HarnessConfig,
    target: Arc<dyn TargetService>,
}

impl Harness {
    pub fn new(config: HarnessConfig, target: Arc<dyn TargetService>) -> Self {
        Self { config, target }
    }

    /// Validate `config` and build the target adapter it selects.
    pub fn from_config(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let target = build_target(&config)?;
        Ok(Self::new(config, target))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Drive one complete run over the lines of `input` with `workers` workers.
    pub async fn run(&self, input: &Path, workers: usize) -> Result<RunReport> {
        if workers == 0 {
            return Err(HarnessError::Argument(
                "worker count must be a positive integer".into(),
            ));
        }
        self.config.validate()?;

        let file = tokio::fs::File::open(input)
            .await
            .map_err(|source| HarnessError::SourceRead {
                path: input.to_path_buf(),
                source,
            })?;

        self.target
            .preflight()
            .await
            .map_err(|e| HarnessError::Unreachable(e.to_string()))?;

        let cfg = &self.config;
        let wait = cfg.coordination.wait_timeout();
        let per_queue = cfg.queues.workers_per_queue;
        let shards = shard_sizes(workers, per_queue);
        let whole_input = if cfg.queues.await_ready {
            Some(count_lines(input).await?)
        } else {
            None
        };

        info!(
            service = self.target.name(),
            workers,
            queues = shards.len(),
            input = %input.display(),
            "starting run"
        );

        let post_recorder = Arc::new(
            LatencyRecorder::create(&cfg.recorder.post_log, cfg.recorder.pool_size).await?,
        );
        let post_counters = Arc::new(OutcomeCounters::new());

        // Work sources: one per shard, all pulling from the same reader.
        let reader = Arc::new(LineReader::new(BufReader::new(file)));
        let ready = whole_input
            .map(|_| Arc::new(Rendezvous::new("queues ready", shards.len() + 1, wait)));
        let mut queues = Vec::with_capacity(shards.len());
        let mut sources = Vec::with_capacity(shards.len());
        for (shard, &size) in shards.iter().enumerate() {
            let capacity = match whole_input {
                Some(lines) => lines + size,
                None => cfg.queues.capacity.unwrap_or(size),
            };
            let (tx, queue) = work_queue(capacity);
            queues.push(queue);
            let source = WorkSource::new(shard, reader.clone(), tx, size, wait);
            let party = ready.as_ref().map(|r| r.party());
            sources.push(tokio::spawn(source.run(party)));
        }

        if let Some(ready) = &ready {
            if let Err(e) = ready.party().arrive_untimed().await {
                return Err(root_cause(sources, e).await);
            }
            info!("work queues populated");
        }

        let poller = if cfg.poller.enabled {
            let recorder = Arc::new(
                LatencyRecorder::create(&cfg.recorder.get_log, cfg.recorder.pool_size).await?,
            );
            let counters = Arc::new(OutcomeCounters::new());
            let stop = Arc::new(StopSignal::new());
            let done = Arc::new(Rendezvous::new("poller", 2, wait));
            let poller = Poller::new(
                self.target.clone(),
                cfg.poller.probes.clone(),
                cfg.poller.interval(),
                counters.clone(),
                recorder.clone(),
                stop.clone(),
            );
            let handle = tokio::spawn(poller.run(done.party()));
            Some(PollerRun {
                recorder,
                counters,
                stop,
                done,
                handle,
            })
        } else {
            None
        };

        let completion = Arc::new(Rendezvous::new("completion", workers + 1, wait));
        let started_at = chrono::Utc::now();
        let start = Instant::now();

        let mut worker_handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = RequestWorker::new(
                id,
                queues[shard_of(id, per_queue)].clone(),
                self.target.clone(),
                post_counters.clone(),
                post_recorder.clone(),
                wait,
            );
            worker_handles.push(tokio::spawn(worker.run(completion.party())));
        }
        drop(queues);

        // The driver's wait spans the whole run; stalls surface through the
        // workers' own timed waits.
        if let Err(e) = completion.party().arrive_untimed().await {
            error!(error = %e, "run did not complete");
            if let Some(poller) = &poller {
                poller.stop.stop();
                poller.handle.abort();
            }
            let cause = root_cause(worker_handles, e).await;
            return Err(root_cause(sources, cause).await);
        }
        let wall_time = start.elapsed();
        info!(wall_time_ms = wall_time.as_millis() as u64, "all workers finished");

        // Only now may the poller stop, so its window covers the whole run.
        let poller_result = match poller {
            Some(PollerRun {
                recorder,
                counters,
                stop,
                done,
                handle,
            }) => {
                stop.stop();
                done.party().arrive_untimed().await?;
                let report = join(handle, "poller").await?;
                Some((recorder, counters, report))
            }
            None => None,
        };

        let mut worker_reports = Vec::with_capacity(workers);
        for (id, handle) in worker_handles.into_iter().enumerate() {
            worker_reports.push(join(handle, &format!("worker {id}")).await?);
        }
        let mut source_reports = Vec::with_capacity(shards.len());
        for (shard, handle) in sources.into_iter().enumerate() {
            source_reports.push(join(handle, &format!("work source {shard}")).await?);
        }
        check_accounting(&post_counters, &worker_reports, &source_reports);

        let post_flush = post_recorder.flush(wait).await?;
        let post = StreamReport {
            outcomes: post_counters.summary(),
            statistics: analyze_log(post_recorder.path()).await?,
            recorder: post_flush,
        };
        if post_flush.dropped > 0 {
            warn!(
                dropped = post_flush.dropped,
                "latency samples were dropped; statistics are incomplete"
            );
        }

        let (get, poller_report) = match poller_result {
            Some((recorder, counters, report)) => {
                let flush = recorder.flush(wait).await?;
                let stream = StreamReport {
                    outcomes: counters.summary(),
                    statistics: analyze_log(recorder.path()).await?,
                    recorder: flush,
                };
                (Some(stream), Some(report))
            }
            None => (None, None),
        };

        let outcomes = post.outcomes;
        Ok(RunReport {
            started_at: started_at.to_rfc3339(),
            target: self.target.name().to_string(),
            workers,
            queues: shards.len(),
            source: SourceSummary::from_reports(&source_reports),
            post,
            wall_time_ms: wall_time.as_millis() as u64,
            throughput: throughput(outcomes.total(), wall_time),
            get,
            poller: poller_report,
        })
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>, name: &str) -> Result<T> {
    handle
        .await
        .map_err(|_| CoordinationError::TaskFailed(name.to_string()))?
}

/// Stop the given tasks and prefer the first real failure among them over
/// the generic coordination error that surfaced it.
async fn root_cause<T>(
    handles: Vec<JoinHandle<Result<T>>>,
    surfaced: impl Into<HarnessError>,
) -> HarnessError {
    let surfaced = surfaced.into();
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        match handle.await {
            Ok(Err(HarnessError::Coordination(CoordinationError::Broken(_)))) | Ok(Ok(_)) => {}
            Ok(Err(err)) => return err,
            Err(join_err) if join_err.is_panic() => {
                return CoordinationError::TaskFailed(join_err.to_string()).into();
            }
            Err(_) => {}
        }
    }
    surfaced
}

/// Successes plus failures must equal the lines the workers dispatched.
fn check_accounting(
    counters: &OutcomeCounters,
    workers: &[WorkerReport],
    sources: &[SourceReport],
) {
    let dispatched: u64 = workers.iter().map(|w| w.requests).sum();
    let enqueued: u64 = sources.iter().map(|s| s.enqueued).sum();
    let counted = counters.summary().total();
    if counted != dispatched || dispatched != enqueued {
        error!(counted, dispatched, enqueued, "outcome accounting mismatch");
    }
}
