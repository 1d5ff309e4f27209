//! Two independent concurrency gates shared by every job.
//!
//! * [`Gate::Accelerator`] bounds simultaneous recognition calls. The model
//!   runtime, not the CPU, is the bottleneck, so this is usually small.
//! * [`Gate::Job`] bounds whole-job pipelines in flight. A job holds its
//!   permit from the moment it leaves `queued` until it reaches a terminal
//!   state, including the time its pages spend waiting on the other gate.
//!
//! Permits are RAII guards ([`GatePermit`]): dropping one returns it to its
//! gate, so release happens exactly once on every exit path, including
//! cancellation of the future that held it.

use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Which of the two gates a permit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Accelerator,
    Job,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Accelerator => write!(f, "accelerator"),
            Gate::Job => write!(f, "job"),
        }
    }
}

/// A held permit on one gate. Returned to the gate on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Gate,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn gate(&self) -> Gate {
        self.gate
    }
}

#[derive(Debug)]
struct GateState {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    timeout: Option<Duration>,
}

impl GateState {
    fn new(capacity: usize, timeout: Option<Duration>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
        }
    }
}

/// The accelerator and job gates.
///
/// Cheap to clone; clones share the same underlying counters.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    accelerator: Arc<GateState>,
    jobs: Arc<GateState>,
}

impl ResourceLimiter {
    /// Build both gates. Capacities are validated by the config builder.
    pub fn new(
        accelerator_capacity: usize,
        job_capacity: usize,
        accelerator_timeout: Option<Duration>,
        job_timeout: Option<Duration>,
    ) -> Self {
        Self {
            accelerator: Arc::new(GateState::new(accelerator_capacity, accelerator_timeout)),
            jobs: Arc::new(GateState::new(job_capacity, job_timeout)),
        }
    }

    fn state(&self, gate: Gate) -> &GateState {
        match gate {
            Gate::Accelerator => &self.accelerator,
            Gate::Job => &self.jobs,
        }
    }

    /// Wait for a permit on `gate`.
    ///
    /// Suspends until a permit frees up. If the gate has a wait ceiling and
    /// it elapses first, returns [`JobError::ResourceExhausted`]. Dropping the
    /// returned future while it waits takes no permit.
    pub async fn acquire(&self, gate: Gate) -> Result<GatePermit, JobError> {
        let state = self.state(gate);
        let start = Instant::now();
        let acquire = Arc::clone(&state.semaphore).acquire_owned();

        let permit = match state.timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(p) => p,
                Err(_) => {
                    let waited_ms = start.elapsed().as_millis() as u64;
                    warn!("{} gate: no permit after {}ms", gate, waited_ms);
                    return Err(JobError::ResourceExhausted { gate, waited_ms });
                }
            },
            None => acquire.await,
        };

        // The semaphores are never closed, so this only fails on a bug.
        let permit = permit.map_err(|e| JobError::Internal {
            detail: format!("{gate} gate closed: {e}"),
        })?;
        debug!(
            "{} gate: permit acquired after {:?} ({} left)",
            gate,
            start.elapsed(),
            state.semaphore.available_permits()
        );
        Ok(GatePermit {
            gate,
            _permit: permit,
        })
    }

    /// Configured ceiling of `gate`.
    pub fn capacity(&self, gate: Gate) -> usize {
        self.state(gate).capacity
    }

    /// Permits not currently held on `gate`.
    pub fn available(&self, gate: Gate) -> usize {
        self.state(gate).semaphore.available_permits()
    }

    /// Permits currently held on `gate`.
    pub fn in_use(&self, gate: Gate) -> usize {
        self.capacity(gate).saturating_sub(self.available(gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_released_on_drop() {
        let limiter = ResourceLimiter::new(1, 2, None, None);
        let p = limiter.acquire(Gate::Accelerator).await.unwrap();
        assert_eq!(p.gate(), Gate::Accelerator);
        assert_eq!(limiter.available(Gate::Accelerator), 0);
        assert_eq!(limiter.in_use(Gate::Accelerator), 1);
        drop(p);
        assert_eq!(limiter.available(Gate::Accelerator), 1);
    }

    #[tokio::test]
    async fn gates_are_independent() {
        let limiter = ResourceLimiter::new(1, 1, None, None);
        let _a = limiter.acquire(Gate::Accelerator).await.unwrap();
        let _j = limiter.acquire(Gate::Job).await.unwrap();
        assert_eq!(limiter.available(Gate::Accelerator), 0);
        assert_eq!(limiter.available(Gate::Job), 0);
    }

    #[tokio::test]
    async fn timeout_reports_resource_exhausted() {
        let limiter = ResourceLimiter::new(1, 1, None, Some(Duration::from_millis(20)));
        let _held = limiter.acquire(Gate::Job).await.unwrap();
        let err = limiter.acquire(Gate::Job).await.unwrap_err();
        match err {
            JobError::ResourceExhausted { gate, waited_ms } => {
                assert_eq!(gate, Gate::Job);
                assert!(waited_ms >= 15, "waited {waited_ms}ms");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiter_wakes_when_permit_freed() {
        let limiter = ResourceLimiter::new(1, 1, None, None);
        let held = limiter.acquire(Gate::Accelerator).await.unwrap();

        let l2 = limiter.clone();
        let waiter = tokio::spawn(async move { l2.acquire(Gate::Accelerator).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.available(Gate::Accelerator), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_takes_no_permit() {
        let limiter = ResourceLimiter::new(1, 1, None, None);
        let held = limiter.acquire(Gate::Job).await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(10), limiter.acquire(Gate::Job)).await;
        assert!(res.is_err());
        drop(held);
        assert_eq!(limiter.available(Gate::Job), 1);
    }
}
