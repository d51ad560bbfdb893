//! In-flight stage accounting and graceful drain.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    draining: AtomicBool,
    started: AtomicU64,
}

/// Process-wide count of stage executions in flight.
///
/// Cheap to clone; all clones share one counter.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTracker {
    inner: Arc<TrackerInner>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution. The count drops when the guard is dropped,
    /// whichever way the execution ends.
    pub fn begin(&self) -> ExecutionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.inner.started.fetch_add(1, Ordering::Relaxed);
        ExecutionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Admit an execution unless the tracker is draining.
    ///
    /// The count is raised before the draining flag is read, so a
    /// concurrent [`DrainController::drain`] either sees this execution or
    /// this call sees the drain.
    pub fn try_begin(&self) -> Option<ExecutionGuard> {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        if self.is_draining() {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        self.inner.started.fetch_add(1, Ordering::Relaxed);
        Some(ExecutionGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Executions currently in flight.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Executions started since process start.
    pub fn total_started(&self) -> u64 {
        self.inner.started.load(Ordering::Relaxed)
    }

    /// Stop admitting new stages. In-flight ones run to completion.
    pub fn start_draining(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            info!(active = self.active(), "Drain started; no new stages will begin");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct ExecutionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of waiting for in-flight executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Count reached zero.
    Drained,
    /// Max wait elapsed with executions still running.
    TimedOut { active: usize },
}

impl DrainOutcome {
    /// Express a timeout as the error the shutdown path reports.
    pub fn into_result(self) -> Result<(), PipelineError> {
        match self {
            DrainOutcome::Drained => Ok(()),
            DrainOutcome::TimedOut { active } => Err(PipelineError::ShutdownInterrupted { active }),
        }
    }
}

/// Blocks shutdown until in-flight executions finish or a deadline passes.
#[derive(Debug, Clone)]
pub struct DrainController {
    tracker: ExecutionTracker,
    poll_interval: Duration,
    max_wait: Duration,
}

impl DrainController {
    pub fn new(tracker: ExecutionTracker, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            tracker,
            poll_interval,
            max_wait,
        }
    }

    pub fn from_config(tracker: ExecutionTracker, config: &PipelineConfig) -> Self {
        Self::new(tracker, config.drain_poll_interval(), config.drain_max_wait())
    }

    /// Refuse new stages, then poll the counter until it reaches zero.
    ///
    /// Instances still running at the deadline keep their last checkpoint
    /// and are picked up by `resume_interrupted` on the next start.
    pub async fn drain(&self) -> DrainOutcome {
        self.tracker.start_draining();
        let deadline = Instant::now() + self.max_wait;

        loop {
            let active = self.tracker.active();
            if active == 0 {
                info!("Drain complete");
                return DrainOutcome::Drained;
            }
            if Instant::now() >= deadline {
                warn!(
                    active,
                    max_wait_ms = self.max_wait.as_millis(),
                    "Drain timed out; shutting down with stages in flight"
                );
                return DrainOutcome::TimedOut { active };
            }
            info!(active, "Waiting for in-flight stages");
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}
