//! Magnetism coordinator.

use super::client::EventHandler;
use super::runner::StepRunner;
use super::tracker::StepTracker;
use super::{recover_link, report_queue_size, should_queue_step, submit};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::Step;
use crate::protocol::{Event, LockInConfig, Role, SignalGeneratorConfig};
use crate::queue::{QueueHandle, TaskHandler, WorkerQueue};
use crate::station::MagnetismStation;
use crate::storage::ResultRecorder;
use crate::transport::ClientLink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Work the magnetism queue executes.
#[derive(Debug, Clone, PartialEq)]
pub enum MagnetismTask {
    /// Power up the signal generator and set up the scope
    Initialize,
    /// Measure a step
    ProcessStep(Step),
    /// Capture and publish a magnet current trace
    MagnetTrace,
    /// Read and publish the DC field
    DcField,
    /// Command the magnet (debounced)
    SetMagnetField(f64),
    /// Reconfigure the signal generator
    SetSignalGenerator(SignalGeneratorConfig),
    /// Reconfigure the lock-in
    SetLockIn(LockInConfig),
    /// Publish the instrument settings
    ReportInstrumentConfig,
}

struct MagnetismHandler {
    runner: StepRunner<MagnetismStation>,
    station: Arc<MagnetismStation>,
    link: ClientLink,
    policy: RetryPolicy,
}

impl MagnetismHandler {
    async fn report_config(&self) -> AppResult<()> {
        let config = self.station.instrument_config().await?;
        self.link.emit(Event::InstrumentConfig(config))
    }
}

#[async_trait]
impl TaskHandler<MagnetismTask> for MagnetismHandler {
    async fn handle(&mut self, task: &MagnetismTask) -> AppResult<()> {
        match task {
            MagnetismTask::Initialize => self.station.initialize().await,
            MagnetismTask::ProcessStep(step) => self.runner.process_step(step).await,
            MagnetismTask::MagnetTrace => {
                let (trace, rms) = self.station.magnet_trace().await?;
                self.link.emit(Event::MagnetRms(rms))?;
                self.link.emit(Event::MagnetTrace(trace))
            }
            MagnetismTask::DcField => {
                let field = self.station.dc_field().await?;
                self.link.emit(Event::DcField(field))
            }
            MagnetismTask::SetMagnetField(tesla) => {
                let written = self.station.set_magnet_field(*tesla).await?;
                info!(tesla, written, "magnet set from dashboard");
                self.report_config().await
            }
            MagnetismTask::SetSignalGenerator(config) => {
                self.station.configure_signal_generator(*config).await?;
                self.report_config().await
            }
            MagnetismTask::SetLockIn(config) => {
                self.station.configure_lock_in(*config).await?;
                self.report_config().await
            }
            MagnetismTask::ReportInstrumentConfig => self.report_config().await,
        }
    }

    async fn recover(&mut self, error: &DaqError) -> AppResult<()> {
        recover_link(&mut self.link, &self.policy, error).await
    }

    async fn abandon(&mut self, task: MagnetismTask, error: DaqError) {
        match task {
            MagnetismTask::ProcessStep(step) => self.runner.fail_step(&step, &error),
            other => warn!(task = ?other, error = %error, "magnetism task abandoned"),
        }
    }
}

/// Magnetism side of the step protocol.
///
/// Owns the worker queue and the periodic magnet trace; both stop when the
/// coordinator is dropped.
pub struct MagnetismCoordinator {
    queue: QueueHandle<MagnetismTask>,
    tracker: StepTracker,
    link: ClientLink,
    worker: JoinHandle<()>,
    telemetry: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MagnetismCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagnetismCoordinator")
            .field("queue_size", &self.queue.size())
            .field("tracker", &self.tracker.snapshot())
            .finish()
    }
}

impl MagnetismCoordinator {
    /// Starts the queue worker, queues instrument initialization and starts
    /// the periodic trace.
    pub fn start(station: Arc<MagnetismStation>, link: ClientLink, settings: &Settings) -> Self {
        let policy = settings.queue.retry_policy();
        let tracker = StepTracker::new();
        let (queue, worker) = WorkerQueue::new("magnetism", policy.clone());

        let handler = MagnetismHandler {
            runner: StepRunner::new(
                station.clone(),
                tracker.clone(),
                link.clone(),
                ResultRecorder::new(&settings.application.data_dir),
                settings.protocol.clone(),
            ),
            station,
            link: link.clone(),
            policy,
        };
        submit(&queue, MagnetismTask::Initialize);
        let worker = tokio::spawn(worker.run(handler));
        let telemetry = settings
            .protocol
            .telemetry_interval()
            .map(|every| tokio::spawn(poll_magnet_trace(queue.clone(), link.clone(), every)));

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

impl EventHandler for MagnetismCoordinator {
    fn handle_event(&self, event: Event) {
        match event {
            Event::NextStep(step) => {
                if should_queue_step(&self.tracker, &self.link, &step) {
                    submit(&self.queue, MagnetismTask::ProcessStep(step));
                }
            }
            Event::StepReadyForMeasurement(step_id) => self.tracker.mark_ready(step_id),
            Event::StepAbandoned(step_id) => self.tracker.mark_abandoned(step_id),
            Event::GetMagnetTrace => submit(&self.queue, MagnetismTask::MagnetTrace),
            Event::GetDcField => submit(&self.queue, MagnetismTask::DcField),
            Event::SetMagnetField(tesla) => {
                submit(&self.queue, MagnetismTask::SetMagnetField(tesla));
            }
            Event::SetSignalGenerator(config) => {
                submit(&self.queue, MagnetismTask::SetSignalGenerator(config));
            }
            Event::SetLockIn(config) => submit(&self.queue, MagnetismTask::SetLockIn(config)),
            Event::GetInstrumentConfig => {
                submit(&self.queue, MagnetismTask::ReportInstrumentConfig);
            }
            Event::GetQueueSize => report_queue_size(&self.link, Role::Magnetism, &self.queue),
            other => debug!(event = other.name(), "ignored by magnetism coordinator"),
        }
    }
}

impl Drop for MagnetismCoordinator {
    fn drop(&mut self) {
        if let Some(telemetry) = self.telemetry.take() {
            telemetry.abort();
        }
        self.worker.abort();
    }
}

/// Queues a trace capture on every tick while the queue is otherwise idle.
async fn poll_magnet_trace(queue: QueueHandle<MagnetismTask>, link: ClientLink, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !link.is_connected() || queue.size() > 0 {
            trace!("skipping magnet trace");
            continue;
        }
        submit(&queue, MagnetismTask::MagnetTrace);
    }
}
