//! Step coordinators.
//!
//! Each station process runs one coordinator. Instrument work is submitted
//! to a [`WorkerQueue`](crate::queue::WorkerQueue) as a closed task enum and
//! executed one task at a time; protocol signals that need no instrument
//! (`step_ready_for_measurement`, `get_queue_size`) are handled directly by
//! the event loop in [`client`].
//!
//! ```text
//! next_step ──▶ queue ──▶ apply ──▶ is_step_ready ──▶ (wait for ready)
//!                                                         │
//!      mark_step_as_done ◀── got_step_results ◀── sample × n
//! ```

pub mod client;
pub mod cryo;
pub mod magnetism;
pub mod runner;
pub mod tracker;

pub use client::{run_client, EventHandler};
pub use cryo::{CryoCoordinator, CryoTask};
pub use magnetism::{MagnetismCoordinator, MagnetismTask};
pub use runner::{StepRunner, StepStation};
pub use tracker::{Phase, StepTracker, TrackerState};

use crate::error::{AppResult, DaqError};
use crate::error_recovery::{handle_recoverable_error, RetryPolicy};
use crate::experiment::Step;
use crate::protocol::{Event, QueueSizeReport, Role};
use crate::queue::QueueHandle;
use crate::transport::ClientLink;
use tracing::{debug, warn};

/// Decides what to do with a `next_step` for a step that may already be underway.
///
/// Returns true when the step has to be queued.
fn should_queue_step(tracker: &StepTracker, link: &ClientLink, step: &Step) -> bool {
    match tracker.active_phase(step.id) {
        None => true,
        Some(Phase::AwaitingReady) => {
            debug!(step_id = %step.id, "step redispatched while waiting, signalling ready again");
            if let Err(err) = link.emit(Event::IsStepReady(step.id)) {
                warn!(step_id = %step.id, error = %err, "could not signal ready");
            }
            false
        }
        Some(phase) => {
            debug!(step_id = %step.id, ?phase, "step already in progress");
            false
        }
    }
}

fn submit<T>(queue: &QueueHandle<T>, task: T) {
    if let Err(err) = queue.submit(task) {
        warn!(queue = queue.name(), error = %err, "could not queue task");
    }
}

fn report_queue_size<T>(link: &ClientLink, role: Role, queue: &QueueHandle<T>) {
    let report = QueueSizeReport {
        role,
        size: queue.size(),
    };
    if let Err(err) = link.emit(Event::QueueSize(report)) {
        debug!(error = %err, "could not report queue size");
    }
}

/// Cycles the connection for transport faults; instrument faults need no recovery.
async fn recover_link(
    link: &mut ClientLink,
    policy: &RetryPolicy,
    error: &DaqError,
) -> AppResult<()> {
    match error {
        DaqError::NotConnected | DaqError::Transport(_) => handle_recoverable_error(link, policy).await,
        _ => Ok(()),
    }
}
