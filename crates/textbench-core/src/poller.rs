use crate::error::Result;
use crate::outcome::{Method, OutcomeCounters};
use crate::recorder::LatencyRecorder;
use crate::rendezvous::Party;
use crate::target::TargetService;
use crate::worker::issue_request;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Cooperative stop flag, set once by the driver.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the signal had already been raised.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::AcqRel);
        if !first {
            warn!("stop signal raised more than once");
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerReport {
    pub batches: u64,
    pub requests: u64,
}

/// Issues the probe lookups on a timer until stopped.
pub struct Poller {
    target: Arc<dyn TargetService>,
    probes: Vec<String>,
    interval: Duration,
    counters: Arc<OutcomeCounters>,
    recorder: Arc<LatencyRecorder>,
    stop: Arc<StopSignal>,
}

impl Poller {
    pub fn new(
        target: Arc<dyn TargetService>,
        probes: Vec<String>,
        interval: Duration,
        counters: Arc<OutcomeCounters>,
        recorder: Arc<LatencyRecorder>,
        stop: Arc<StopSignal>,
    ) -> Self {
        Self {
            target,
            probes,
            interval,
            counters,
            recorder,
            stop,
        }
    }

    /// Loop until the stop signal is observed, then arrive at `done`.
    pub async fn run(self, done: Party) -> Result<PollerReport> {
        let mut report = PollerReport::default();
        info!(
            probes = self.probes.len(),
            interval_ms = self.interval.as_millis() as u64,
            "poller started"
        );

        while !self.stop.is_stopped() {
            sleep(self.interval).await;
            for probe in &self.probes {
                let outcome = issue_request(self.target.as_ref(), Method::Get, probe).await;
                self.counters.record(&outcome);
                if let Err(e) = self.recorder.submit(outcome) {
                    warn!(error = %e, "latency sample not recorded");
                }
                report.requests += 1;
            }
            report.batches += 1;
            debug!(batch = report.batches, "probe batch complete");
        }

        info!(
            batches = report.batches,
            requests = report.requests,
            "poller stopped"
        );
        done.arrive().await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::rendezvous::Rendezvous;
    use crate::target::MockTarget;

    #[test]
    fn test_stop_signal_reports_first_raise() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert!(signal.stop());
        assert!(!signal.stop());
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_poller_runs_until_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(
            LatencyRecorder::create(dir.path().join("get.csv"), 2)
                .await
                .unwrap(),
        );
        let counters = Arc::new(OutcomeCounters::new());
        let stop = Arc::new(StopSignal::new());
        let target = Arc::new(MockTarget::new(MockConfig {
            delay_ms: 0,
            ..MockConfig::default()
        }));
        let probes = vec!["lock".to_string(), String::new()];

        let done = Arc::new(Rendezvous::new("poller", 2, None));
        let poller = Poller::new(
            target.clone(),
            probes,
            Duration::from_millis(10),
            counters.clone(),
            recorder.clone(),
            stop.clone(),
        );
        let handle = tokio::spawn(poller.run(done.party()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());

        stop.stop();
        done.party().arrive().await.unwrap();
        let report = handle.await.unwrap().unwrap();

        assert!(report.batches >= 1);
        assert_eq!(report.requests, report.batches * 2);
        // The empty probe is a 404 lookup.
        assert_eq!(counters.succeeded(), report.batches);
        assert_eq!(counters.failed(), report.batches);
        assert_eq!(target.looked_up(), report.requests);

        let flushed = recorder.flush(None).await.unwrap();
        assert_eq!(flushed.written, report.requests);
        let log = std::fs::read_to_string(recorder.path()).unwrap();
        assert!(log.lines().all(|l| l.split(',').nth(1) == Some("GET")));
    }
}
