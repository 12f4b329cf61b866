//! Step measurement shared by both coordinators.

use super::tracker::{Phase, StepTracker};
use crate::config::ProtocolConfig;
use crate::error::{AppResult, DaqError};
use crate::experiment::{CryoSample, MagnetismAcquisition, Step, StepOutcome, StepResults};
use crate::protocol::{Event, Role, StepFailure, StepResultsReport};
use crate::station::{CryoStation, MagnetismStation};
use crate::storage::ResultRecorder;
use crate::transport::ClientLink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a station contributes to the step protocol.
#[async_trait]
pub trait StepStation: Send + Sync + 'static {
    /// Role the station reports as.
    const ROLE: Role;
    /// One datapoint.
    type Sample: Send + Sync;

    /// Pushes the step's instrument configuration.
    async fn apply_step(&self, step: &Step) -> AppResult<()>;
    /// Takes one datapoint.
    async fn take_sample(&self, step: &Step) -> AppResult<Self::Sample>;
    /// Results reported with `got_step_results`.
    fn to_results(samples: &[Self::Sample]) -> StepResults;
    /// Appends the raw data to the local result files.
    fn record(recorder: &mut ResultRecorder, step: &Step, samples: &[Self::Sample])
        -> AppResult<()>;
}

#[async_trait]
impl StepStation for CryoStation {
    const ROLE: Role = Role::Cryo;
    type Sample = CryoSample;

    async fn apply_step(&self, step: &Step) -> AppResult<()> {
        self.apply_step_configuration(step).await
    }

    async fn take_sample(&self, step: &Step) -> AppResult<CryoSample> {
        self.sample_once(&format!("step {}", step.id)).await
    }

    fn to_results(samples: &[CryoSample]) -> StepResults {
        StepResults::Cryogenics {
            samples: samples.to_vec(),
        }
    }

    fn record(recorder: &mut ResultRecorder, step: &Step, samples: &[CryoSample]) -> AppResult<()> {
        recorder.record_cryo(step, samples)
    }
}

#[async_trait]
impl StepStation for MagnetismStation {
    const ROLE: Role = Role::Magnetism;
    type Sample = MagnetismAcquisition;

    async fn apply_step(&self, step: &Step) -> AppResult<()> {
        self.apply_step_configuration(step).await
    }

    async fn take_sample(&self, step: &Step) -> AppResult<MagnetismAcquisition> {
        self.sample_once(step).await
    }

    fn to_results(samples: &[MagnetismAcquisition]) -> StepResults {
        StepResults::Magnetism {
            samples: samples.iter().map(|a| a.sample).collect(),
        }
    }

    fn record(
        recorder: &mut ResultRecorder,
        step: &Step,
        samples: &[MagnetismAcquisition],
    ) -> AppResult<()> {
        recorder.record_magnetism(step, samples)
    }
}

/// Drives one step through configure, handshake, sampling and reporting.
pub struct StepRunner<S: StepStation> {
    station: Arc<S>,
    tracker: StepTracker,
    link: ClientLink,
    recorder: ResultRecorder,
    protocol: ProtocolConfig,
    last_report: Option<(Step, StepResultsReport)>,
}

impl<S: StepStation> StepRunner<S> {
    /// Runner measuring on `station` and reporting over `link`.
    pub fn new(
        station: Arc<S>,
        tracker: StepTracker,
        link: ClientLink,
        recorder: ResultRecorder,
        protocol: ProtocolConfig,
    ) -> Self {
        Self {
            station,
            tracker,
            link,
            recorder,
            protocol,
            last_report: None,
        }
    }

    /// Measures `step` and reports its results.
    ///
    /// A step this coordinator already reported is acknowledged again from
    /// the cached report instead of being measured twice.
    pub async fn process_step(&mut self, step: &Step) -> AppResult<()> {
        if self.tracker.has_completed(step.id) {
            if let Some((done, report)) = self.last_report.as_ref().filter(|(s, _)| s.id == step.id)
            {
                info!(role = %S::ROLE, step_id = %step.id, "step already measured, acknowledging again");
                self.link.emit(Event::GotStepResults(report.clone()))?;
                self.link.emit(Event::MarkStepAsDone(done.clone()))?;
                return Ok(());
            }
        }

        self.tracker.ensure_not_abandoned(step.id)?;
        self.tracker
            .wait_until_idle(step.id, self.protocol.previous_step_timeout())
            .await?;
        self.tracker.begin(step.id);
        info!(
            role = %S::ROLE,
            step_id = %step.id,
            magnet_field = step.settings.magnet_field,
            signal_amplitude = step.settings.signal_amplitude,
            signal_frequency = step.settings.signal_frequency,
            "processing step"
        );

        self.station.apply_step(step).await?;
        self.tracker.set_phase(Phase::AwaitingReady);
        self.link.emit(Event::IsStepReady(step.id))?;
        self.tracker
            .wait_for_ready(step.id, self.protocol.ready_timeout())
            .await?;

        self.tracker.set_phase(Phase::Sampling);
        let samples = self.measure(step).await?;

        self.tracker.set_phase(Phase::Persisting);
        match S::record(&mut self.recorder, step, &samples) {
            Ok(()) => {}
            Err(DaqError::FeatureNotEnabled(feature)) => {
                debug!(%feature, "local result files disabled");
            }
            Err(err) => warn!(step_id = %step.id, error = %err, "failed to write local result file"),
        }

        let report = StepResultsReport {
            step_id: step.id,
            results: S::to_results(&samples),
        };
        let done = Step {
            done: true,
            outcome: StepOutcome::Completed,
            ..step.clone()
        };
        self.tracker.finish(step.id, Phase::Done);
        self.last_report = Some((done.clone(), report.clone()));

        self.link.emit(Event::GotStepResults(report))?;
        self.link.emit(Event::MarkStepAsDone(done))?;
        info!(role = %S::ROLE, step_id = %step.id, samples = samples.len(), "step done");
        Ok(())
    }

    async fn measure(&self, step: &Step) -> AppResult<Vec<S::Sample>> {
        let count = step.settings.data_points_per_measurement as usize;
        let wait = Duration::try_from_secs_f64(step.settings.data_wait_before_measuring)
            .map_err(|e| DaqError::SampleFailed(format!("invalid settle time: {e}")))?;

        let mut samples = Vec::with_capacity(count);
        for index in 0..count {
            tokio::time::sleep(wait).await;
            self.tracker.ensure_not_abandoned(step.id)?;
            samples.push(self.station.take_sample(step).await?);
            debug!(step_id = %step.id, index, "datapoint taken");
        }
        Ok(samples)
    }

    /// Marks `step` failed and tells the server, unless the server already
    /// gave up on it.
    pub fn fail_step(&mut self, step: &Step, error: &DaqError) {
        self.tracker.finish(step.id, Phase::Failed);
        if let DaqError::StepAbandoned(_) = error {
            info!(role = %S::ROLE, step_id = %step.id, "step dropped");
            return;
        }
        warn!(role = %S::ROLE, step_id = %step.id, error = %error, "step failed");
        let failure = StepFailure {
            step_id: step.id,
            role: S::ROLE,
            reason: error.to_string(),
        };
        if let Err(err) = self.link.emit(Event::StepFailed(failure)) {
            warn!(step_id = %step.id, error = %err, "could not report failed step");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::experiment::{StepId, StepSettings, SweepId};
    use crate::protocol::ClientIdentity;
    use tokio::sync::mpsc;

    fn step(id: i64) -> Step {
        Step {
            id: StepId(id),
            sweep_id: SweepId(1),
            done: false,
            outcome: StepOutcome::Pending,
            settings: StepSettings {
                lockin_sensitivity: 1e-6,
                lockin_frequency: 1000.0,
                lockin_buffer_size: 10,
                signal_frequency: 1000.0,
                signal_amplitude: 0.5,
                magnet_field: 0.0,
                resistor: 1.0,
                data_wait_before_measuring: 0.0,
                data_points_per_measurement: 2,
            },
        }
    }

    fn runner(
        dir: &std::path::Path,
    ) -> (
        StepRunner<CryoStation>,
        StepTracker,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let mut settings = Settings::default();
        settings.simulation.latency_ms = 0;
        settings.protocol.ready_timeout_secs = 1.0;
        let link = ClientLink::new(
            ClientIdentity::new(Role::Cryo, "test"),
            Duration::from_millis(10),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        link.attach(tx);
        let tracker = StepTracker::new();
        let runner = StepRunner::new(
            Arc::new(CryoStation::simulated(&settings)),
            tracker.clone(),
            link,
            ResultRecorder::new(dir),
            settings.protocol.clone(),
        );
        (runner, tracker, rx)
    }

    #[tokio::test]
    async fn step_reports_results_then_done() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, tracker, mut events) = runner(dir.path());
        let step = step(4);

        // a release that arrives before the step starts is kept
        tracker.mark_ready(StepId(4));
        runner.process_step(&step).await.unwrap();

        assert_eq!(events.recv().await, Some(Event::IsStepReady(StepId(4))));
        match events.recv().await {
            Some(Event::GotStepResults(report)) => {
                assert_eq!(report.step_id, StepId(4));
                assert_eq!(report.results.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match events.recv().await {
            Some(Event::MarkStepAsDone(done)) => {
                assert!(done.done);
                assert_eq!(done.outcome, StepOutcome::Completed);
            }
            other => panic!("unexpected {other:?}"),
        }

        // a redispatch is answered from the cache
        runner.process_step(&step).await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::GotStepResults(_))));
        assert!(matches!(events.recv().await, Some(Event::MarkStepAsDone(_))));
    }

    #[tokio::test]
    async fn missing_ready_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, tracker, mut events) = runner(dir.path());
        runner.protocol.ready_timeout_secs = 0.02;
        let step = step(5);

        let err = runner.process_step(&step).await.unwrap_err();
        assert!(matches!(err, DaqError::HandshakeTimeout { .. }));
        assert!(!err.is_retryable());

        runner.fail_step(&step, &err);
        assert_eq!(events.recv().await, Some(Event::IsStepReady(StepId(5))));
        match events.recv().await {
            Some(Event::StepFailed(failure)) => {
                assert_eq!(failure.step_id, StepId(5));
                assert_eq!(failure.role, Role::Cryo);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracker.snapshot().phase, Phase::Failed);
    }
}
