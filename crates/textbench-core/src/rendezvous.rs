//! Multi-party rendezvous with an observable BROKEN state.
//!
//! Unlike `tokio::sync::Barrier`, a party that leaves (its [`Party`] is dropped
//! without arriving) or a wait that exceeds the configured timeout breaks the
//! rendezvous and releases every other waiter with an error.

use crate::error::CoordinationError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Waiting,
    Released,
    Broken,
}

#[derive(Debug, Clone, Copy, Default)]
struct Phase {
    generation: u64,
    released: bool,
    broken: bool,
}

#[derive(Debug)]
pub struct Rendezvous {
    name: String,
    parties: usize,
    timeout: Option<Duration>,
    arrived: Mutex<usize>,
    phase: watch::Sender<Phase>,
}

impl Rendezvous {
    pub fn new(name: impl Into<String>, parties: usize, timeout: Option<Duration>) -> Self {
        let (phase, _) = watch::channel(Phase::default());
        Self {
            name: name.into(),
            parties: parties.max(1),
            timeout,
            arrived: Mutex::new(0),
            phase,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Hand out a party handle that breaks the rendezvous if dropped unused.
    pub fn party(self: &Arc<Self>) -> Party {
        Party {
            rendezvous: Arc::clone(self),
            arrived: false,
        }
    }

    pub fn state(&self) -> BarrierState {
        let arrived = *self.arrived.lock().unwrap_or_else(PoisonError::into_inner);
        let phase = *self.phase.borrow();
        if phase.broken {
            BarrierState::Broken
        } else if arrived == 0 && phase.released {
            BarrierState::Released
        } else {
            BarrierState::Waiting
        }
    }

    /// Block until all parties have arrived.
    ///
    /// Returns `true` for exactly one party per generation (the last to
    /// arrive). Fails if the rendezvous is or becomes broken, or if the
    /// configured timeout elapses first, which also breaks it.
    pub async fn arrive_and_wait(&self) -> Result<bool, CoordinationError> {
        self.wait(self.timeout).await
    }

    /// Like [`Rendezvous::arrive_and_wait`] but ignores the configured timeout.
    /// Still fails as soon as the rendezvous breaks.
    pub async fn arrive_and_wait_untimed(&self) -> Result<bool, CoordinationError> {
        self.wait(None).await
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<bool, CoordinationError> {
        let (mut rx, generation) = {
            let mut arrived = self.arrived.lock().unwrap_or_else(PoisonError::into_inner);
            let phase = *self.phase.borrow();
            if phase.broken {
                return Err(CoordinationError::Broken(self.name.clone()));
            }
            *arrived += 1;
            if *arrived == self.parties {
                *arrived = 0;
                self.phase.send_modify(|p| {
                    p.generation += 1;
                    p.released = true;
                });
                debug!(rendezvous = %self.name, parties = self.parties, "released");
                return Ok(true);
            }
            (self.phase.subscribe(), phase.generation)
        };

        let released = async {
            rx.wait_for(|p| p.broken || p.generation != generation)
                .await
                .map(|p| p.generation != generation)
        };

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, released).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(rendezvous = %self.name, ?after, "rendezvous wait timed out");
                    self.break_barrier();
                    return Err(CoordinationError::TimedOut {
                        what: format!("rendezvous '{}'", self.name),
                        after,
                    });
                }
            },
            None => released.await,
        };

        match outcome {
            Ok(true) => Ok(false),
            _ => Err(CoordinationError::Broken(self.name.clone())),
        }
    }

    /// Mark the rendezvous broken and wake every waiter.
    pub fn break_barrier(&self) {
        let _arrived = self.arrived.lock().unwrap_or_else(PoisonError::into_inner);
        self.phase.send_if_modified(|p| {
            if p.broken {
                false
            } else {
                p.broken = true;
                true
            }
        });
    }

    /// Return a broken rendezvous to a fresh WAITING state.
    pub fn reset(&self) {
        let mut arrived = self.arrived.lock().unwrap_or_else(PoisonError::into_inner);
        *arrived = 0;
        self.phase.send_modify(|p| {
            p.broken = false;
            p.released = false;
            p.generation += 1;
        });
    }
}

/// One expected participant of a [`Rendezvous`].
#[derive(Debug)]
pub struct Party {
    rendezvous: Arc<Rendezvous>,
    arrived: bool,
}

impl Party {
    pub async fn arrive(mut self) -> Result<bool, CoordinationError> {
        let result = self.rendezvous.arrive_and_wait().await;
        self.arrived = true;
        result
    }

    /// Arrive without the stall timeout, for a party whose wait spans the
    /// whole run rather than a single step of it.
    pub async fn arrive_untimed(mut self) -> Result<bool, CoordinationError> {
        let result = self.rendezvous.arrive_and_wait_untimed().await;
        self.arrived = true;
        result
    }
}

impl Drop for Party {
    fn drop(&mut self) {
        if !self.arrived {
            error!(rendezvous = %self.rendezvous.name, "party left without arriving");
            self.rendezvous.break_barrier();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_releases_only_when_all_arrive() {
        let rendezvous = Arc::new(Rendezvous::new("completion", 5, None));
        let passed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let party = rendezvous.party();
            let passed = passed.clone();
            handles.push(tokio::spawn(async move {
                let leader = party.arrive().await.unwrap();
                passed.fetch_add(1, Ordering::SeqCst);
                leader
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        assert_eq!(rendezvous.state(), BarrierState::Waiting);

        let driver_leader = rendezvous.party().arrive().await.unwrap();
        let mut leaders = usize::from(driver_leader);
        for h in handles {
            leaders += usize::from(h.await.unwrap());
        }
        assert_eq!(passed.load(Ordering::SeqCst), 4);
        assert_eq!(leaders, 1);
        assert_eq!(rendezvous.state(), BarrierState::Released);
    }

    #[tokio::test]
    async fn test_reusable_across_generations() {
        let rendezvous = Arc::new(Rendezvous::new("cycle", 2, None));
        for _ in 0..3 {
            let other = rendezvous.party();
            let h = tokio::spawn(async move { other.arrive().await });
            rendezvous.party().arrive().await.unwrap();
            h.await.unwrap().unwrap();
        }
        assert_eq!(rendezvous.state(), BarrierState::Released);
    }

    #[tokio::test]
    async fn test_timeout_breaks_and_releases_others() {
        let rendezvous = Arc::new(Rendezvous::new(
            "short",
            3,
            Some(Duration::from_millis(50)),
        ));

        let waiter = rendezvous.party();
        let h = tokio::spawn(async move { waiter.arrive().await });

        let err = rendezvous.party().arrive().await.unwrap_err();
        let other = h.await.unwrap().unwrap_err();

        let timed_out = matches!(err, CoordinationError::TimedOut { .. })
            || matches!(other, CoordinationError::TimedOut { .. });
        assert!(timed_out);
        assert_eq!(rendezvous.state(), BarrierState::Broken);

        // Late arrivals fail fast instead of hanging.
        let late = rendezvous.party().arrive().await.unwrap_err();
        assert_eq!(late, CoordinationError::Broken("short".into()));
    }

    #[tokio::test]
    async fn test_dropped_party_breaks_rendezvous() {
        let rendezvous = Arc::new(Rendezvous::new("completion", 3, None));

        let waiter = rendezvous.party();
        let h = tokio::spawn(async move { waiter.arrive().await });

        let vanished = rendezvous.party();
        drop(vanished);

        let err = h.await.unwrap().unwrap_err();
        assert_eq!(err, CoordinationError::Broken("completion".into()));
        assert_eq!(rendezvous.state(), BarrierState::Broken);

        rendezvous.reset();
        assert_eq!(rendezvous.state(), BarrierState::Waiting);
    }

    #[tokio::test]
    async fn test_untimed_arrival_outlives_the_timeout() {
        let rendezvous = Arc::new(Rendezvous::new(
            "completion",
            2,
            Some(Duration::from_millis(20)),
        ));

        let late = rendezvous.party();
        let h = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            late.arrive().await
        });

        assert!(!rendezvous.party().arrive_untimed().await.unwrap());
        assert!(h.await.unwrap().unwrap());
        assert_eq!(rendezvous.state(), BarrierState::Released);
    }

    #[tokio::test]
    async fn test_untimed_arrival_still_sees_breakage() {
        let rendezvous = Arc::new(Rendezvous::new("completion", 3, None));
        let vanished = rendezvous.party();
        let h = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(vanished);
        });

        let err = rendezvous.party().arrive_untimed().await.unwrap_err();
        assert_eq!(err, CoordinationError::Broken("completion".into()));
        h.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_party_passes_immediately() {
        let rendezvous = Arc::new(Rendezvous::new("solo", 1, None));
        assert!(rendezvous.party().arrive().await.unwrap());
    }
}
