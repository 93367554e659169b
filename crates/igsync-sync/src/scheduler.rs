use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{SyncError, UpdateCycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    /// A cycle failed; the scheduler never runs again.
    Failed,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to update media: {0}")]
    Cycle(#[from] SyncError),
    #[error("scheduler cannot start while {0:?}")]
    InvalidState(SchedulerState),
}

struct Lifecycle {
    state: SchedulerState,
    stop: Option<CancellationToken>,
}

/// Runs update cycles back to back on a fixed interval until stopped or until one fails.
pub struct Scheduler {
    cycle: Arc<dyn UpdateCycle>,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    pub fn new(cycle: Arc<dyn UpdateCycle>) -> Self {
        Self {
            cycle,
            lifecycle: Mutex::new(Lifecycle {
                state: SchedulerState::Idle,
                stop: None,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.lifecycle().state
    }

    /// Run cycles until [`Scheduler::stop`] is called or a cycle fails.
    ///
    /// The first cycle starts immediately. A failed cycle is returned as is and
    /// leaves the scheduler in [`SchedulerState::Failed`].
    pub async fn start(&self, interval: Duration) -> Result<(), SchedulerError> {
        self.start_with(interval, CancellationToken::new()).await
    }

    /// Like [`Scheduler::start`], but also ends after the cycle during which
    /// `token` is cancelled. Cancellation is never dropped, even when it
    /// happens before this call is first polled. [`Scheduler::stop`] cancels
    /// `token` itself, so hand in a child token when the parent is shared.
    pub async fn start_with(
        &self,
        interval: Duration,
        token: CancellationToken,
    ) -> Result<(), SchedulerError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != SchedulerState::Idle {
                return Err(SchedulerError::InvalidState(lifecycle.state));
            }
            lifecycle.state = SchedulerState::Running;
            lifecycle.stop = Some(token.clone());
        }

        let result = self.run_until(interval, &token).await;

        let mut lifecycle = self.lifecycle();
        lifecycle.stop = None;
        lifecycle.state = if result.is_ok() {
            SchedulerState::Idle
        } else {
            SchedulerState::Failed
        };
        result
    }

    /// Ask a running loop to finish after its current cycle.
    ///
    /// Never blocks. Without a running loop the request is dropped, not queued.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != SchedulerState::Running {
            debug!(state = ?lifecycle.state, "stop requested with no running scheduler; ignored");
            return;
        }
        if let Some(token) = &lifecycle.stop {
            token.cancel();
        }
        lifecycle.state = SchedulerState::Stopping;
        info!("scheduler stop requested");
    }

    /// The cycle loop. `token` is only consulted between cycles; an in-flight
    /// cycle always runs to completion.
    pub async fn run_until(
        &self,
        interval: Duration,
        token: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        info!(interval_secs = interval.as_secs_f64(), "scheduler starting");

        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick resolves immediately.
        ticker.tick().await;

        loop {
            info!("updating media");
            self.cycle.run_cycle().await?;

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
