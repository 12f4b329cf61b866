//! Per-coordinator step state.
//!
//! The step task, the event loop and the telemetry timer all look at the
//! same [`StepTracker`]. State changes are published through a watch
//! channel, so waiting for the ready signal or for the previous step to
//! finish is a plain `wait_for` with a timeout.

use crate::error::{AppResult, DaqError};
use crate::experiment::StepId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Where a coordinator is in the measurement of its current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No step seen yet
    Idle,
    /// Step accepted, instruments being configured
    StepReceived,
    /// Configured, waiting for `step_ready_for_measurement`
    AwaitingReady,
    /// Taking datapoints
    Sampling,
    /// Writing and reporting results
    Persisting,
    /// Results reported
    Done,
    /// Given up
    Failed,
}

impl Phase {
    /// True while a step is being worked on.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::StepReceived | Phase::AwaitingReady | Phase::Sampling | Phase::Persisting
        )
    }
}

/// Snapshot of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerState {
    /// Step the phase refers to
    pub step_id: Option<StepId>,
    /// Phase of that step
    pub phase: Phase,
    /// Latest step released for measurement
    pub ready: Option<StepId>,
    /// Latest step the dispatcher gave up on
    pub abandoned: Option<StepId>,
}

/// Shared handle on a coordinator's step state.
#[derive(Debug, Clone)]
pub struct StepTracker {
    state: Arc<watch::Sender<TrackerState>>,
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTracker {
    /// Idle tracker.
    pub fn new() -> Self {
        let (state, _) = watch::channel(TrackerState {
            step_id: None,
            phase: Phase::Idle,
            ready: None,
            abandoned: None,
        });
        Self {
            state: Arc::new(state),
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> TrackerState {
        *self.state.borrow()
    }

    /// Phase of `step_id` if it is the step being worked on.
    pub fn active_phase(&self, step_id: StepId) -> Option<Phase> {
        let state = self.snapshot();
        (state.step_id == Some(step_id) && state.phase.is_active()).then_some(state.phase)
    }

    /// Whether `step_id` was measured and reported by this coordinator.
    pub fn has_completed(&self, step_id: StepId) -> bool {
        let state = self.snapshot();
        state.step_id == Some(step_id) && state.phase == Phase::Done
    }

    /// Waits until no other step is active.
    ///
    /// A step that is itself the active one (a retried task) passes at once.
    pub async fn wait_until_idle(&self, step_id: StepId, timeout: Duration) -> AppResult<()> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.step_id == Some(step_id) || !s.phase.is_active()),
        )
        .await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            _ => Err(DaqError::PreviousStepTimeout {
                previous: self.snapshot().step_id.unwrap_or(step_id),
                waited: timeout,
            }),
        }
    }

    /// Makes `step_id` the current step.
    pub fn begin(&self, step_id: StepId) {
        self.state.send_modify(|s| {
            if s.ready != Some(step_id) {
                s.ready = None;
            }
            s.step_id = Some(step_id);
            s.phase = Phase::StepReceived;
        });
        debug!(%step_id, "step received");
    }

    /// Moves the current step to `phase`.
    pub fn set_phase(&self, phase: Phase) {
        self.state.send_modify(|s| s.phase = phase);
        trace!(?phase, "phase changed");
    }

    /// Records `step_ready_for_measurement`.
    pub fn mark_ready(&self, step_id: StepId) {
        self.state.send_modify(|s| s.ready = Some(step_id));
        debug!(%step_id, "step released for measurement");
    }

    /// Records `step_abandoned`.
    pub fn mark_abandoned(&self, step_id: StepId) {
        self.state.send_modify(|s| s.abandoned = Some(step_id));
        debug!(%step_id, "step abandoned by dispatcher");
    }

    /// Whether the dispatcher gave up on `step_id`.
    pub fn is_abandoned(&self, step_id: StepId) -> bool {
        self.snapshot().abandoned == Some(step_id)
    }

    /// Errors with [`DaqError::StepAbandoned`] if the dispatcher gave up on `step_id`.
    pub fn ensure_not_abandoned(&self, step_id: StepId) -> AppResult<()> {
        if self.is_abandoned(step_id) {
            return Err(DaqError::StepAbandoned(step_id));
        }
        Ok(())
    }

    /// Waits until `step_id` is released for measurement or abandoned.
    pub async fn wait_for_ready(&self, step_id: StepId, timeout: Duration) -> AppResult<()> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.ready == Some(step_id) || s.abandoned == Some(step_id)),
        )
        .await;
        match waited {
            Ok(Ok(state)) if state.abandoned == Some(step_id) => {
                Err(DaqError::StepAbandoned(step_id))
            }
            Ok(Ok(_)) => Ok(()),
            _ => Err(DaqError::HandshakeTimeout {
                step_id,
                waited: timeout,
            }),
        }
    }

    /// Ends `step_id` in `phase` (`Done` or `Failed`); ignored for any other step.
    pub fn finish(&self, step_id: StepId, phase: Phase) {
        self.state.send_if_modified(|s| {
            if s.step_id == Some(step_id) {
                s.phase = phase;
                true
            } else {
                false
            }
        });
    }
}
