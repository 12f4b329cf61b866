//! Cryogenics coordinator.

use super::client::EventHandler;
use super::runner::StepRunner;
use super::tracker::StepTracker;
use super::{recover_link, report_queue_size, should_queue_step, submit};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::Step;
use crate::protocol::{Event, Role};
use crate::queue::{QueueHandle, TaskHandler, WorkerQueue};
use crate::station::CryoStation;
use crate::storage::ResultRecorder;
use crate::transport::ClientLink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Work the cryogenics queue executes.
#[derive(Debug, Clone, PartialEq)]
pub enum CryoTask {
    /// Measure a step
    ProcessStep(Step),
    /// Take one sample for the dashboard
    ReadTemperatures,
}

struct CryoHandler {
    runner: StepRunner<CryoStation>,
    station: Arc<CryoStation>,
    link: ClientLink,
    policy: RetryPolicy,
}

#[async_trait]
impl TaskHandler<CryoTask> for CryoHandler {
    async fn handle(&mut self, task: &CryoTask) -> AppResult<()> {
        match task {
            CryoTask::ProcessStep(step) => self.runner.process_step(step).await,
            CryoTask::ReadTemperatures => {
                let sample = self.station.sample_once("dashboard").await?;
                self.link.emit(Event::CryoTelemetry(sample))
            }
        }
    }

    async fn recover(&mut self, error: &DaqError) -> AppResult<()> {
        recover_link(&mut self.link, &self.policy, error).await
    }

    async fn abandon(&mut self, task: CryoTask, error: DaqError) {
        match task {
            CryoTask::ProcessStep(step) => self.runner.fail_step(&step, &error),
            CryoTask::ReadTemperatures => {
                warn!(error = %error, "temperature read abandoned");
            }
        }
    }
}

/// Cryogenics side of the step protocol.
///
/// Owns the worker queue and the background temperature poll; both stop
/// when the coordinator is dropped.
pub struct CryoCoordinator {
    queue: QueueHandle<CryoTask>,
    tracker: StepTracker,
    link: ClientLink,
    worker: JoinHandle<()>,
    telemetry: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CryoCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryoCoordinator")
            .field("queue_size", &self.queue.size())
            .field("tracker", &self.tracker.snapshot())
            .finish()
    }
}

impl CryoCoordinator {
    /// Starts the queue worker and the temperature poll on the current runtime.
    pub fn start(station: Arc<CryoStation>, link: ClientLink, settings: &Settings) -> Self {
        let policy = settings.queue.retry_policy();
        let tracker = StepTracker::new();
        let (queue, worker) = WorkerQueue::new("cryo", policy.clone());

        let handler = CryoHandler {
            runner: StepRunner::new(
                station.clone(),
                tracker.clone(),
                link.clone(),
                ResultRecorder::new(&settings.application.data_dir),
                settings.protocol.clone(),
            ),
            station: station.clone(),
            link: link.clone(),
            policy,
        };
        let worker = tokio::spawn(worker.run(handler));
        let telemetry = settings
            .protocol
            .telemetry_interval()
            .map(|every| tokio::spawn(poll_temperatures(station, link.clone(), every)));

        Self {
            queue,
            tracker,
            link,
            worker,
            telemetry,
        }
    }

    /// The step state.
    pub fn tracker(&self) -> &StepTracker {
        &self.tracker
    }

    /// Pending plus in-flight tasks.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }
}

impl EventHandler for CryoCoordinator {
    fn handle_event(&self, event: Event) {
        match event {
            Event::NextStep(step) => {
                if should_queue_step(&self.tracker, &self.link, &step) {
                    submit(&self.queue, CryoTask::ProcessStep(step));
                }
            }
            Event::StepReadyForMeasurement(step_id) => self.tracker.mark_ready(step_id),
            Event::StepAbandoned(step_id) => self.tracker.mark_abandoned(step_id),
            Event::GetTemperatures => submit(&self.queue, CryoTask::ReadTemperatures),
            Event::GetQueueSize => report_queue_size(&self.link, Role::Cryo, &self.queue),
            other => debug!(event = other.name(), "ignored by cryo coordinator"),
        }
    }
}

impl Drop for CryoCoordinator {
    fn drop(&mut self) {
        if let Some(telemetry) = self.telemetry.take() {
            telemetry.abort();
        }
        self.worker.abort();
    }
}

/// Samples outside the queue so temperatures keep flowing during long steps.
async fn poll_temperatures(station: Arc<CryoStation>, link: ClientLink, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !link.is_connected() {
            continue;
        }
        match station.sample_once("telemetry").await {
            Ok(sample) => {
                if let Err(err) = link.emit(Event::CryoTelemetry(sample)) {
                    debug!(error = %err, "telemetry not sent");
                }
            }
            Err(err) => warn!(error = %err, "telemetry sample failed"),
        }
    }
}
