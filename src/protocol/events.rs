//! Event definitions.

use super::identity::Role;
use crate::experiment::{
    CryoSample, Step, StepId, StepResults, SweepConfiguration, SweepId, SweepProgress,
};
use serde::{Deserialize, Serialize};

/// `got_step_results` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResultsReport {
    /// Step the samples belong to
    pub step_id: StepId,
    /// Samples by kind
    pub results: StepResults,
}

/// `step_failed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    /// Step that could not be measured
    pub step_id: StepId,
    /// Station that gave up
    pub role: Role,
    /// Human readable reason
    pub reason: String,
}

/// `experiment_configuration_saved` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSaved {
    /// New sweep
    pub sweep_id: SweepId,
    /// Steps generated for it
    pub steps: u64,
}

/// Downsampled scope trace for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnetTrace {
    /// Sample times (s)
    pub times: Vec<f64>,
    /// Current (A)
    pub current: Vec<f64>,
}

/// Signal generator output settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalGeneratorConfig {
    /// Output amplitude (V)
    pub amplitude: f64,
    /// Output frequency (Hz)
    pub frequency: f64,
}

/// Lock-in buffer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockInConfig {
    /// Sensitivity (V)
    pub sensitivity: f64,
    /// Buffer sample rate (Hz)
    pub frequency: f64,
    /// Buffer size (points)
    pub buffer_size: u32,
}

/// `instrument_config` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfigReport {
    /// Signal generator state
    pub signal_generator: SignalGeneratorConfig,
    /// Lock-in state
    pub lock_in: LockInConfig,
    /// Field read back from the magnet supply (T)
    pub magnet_field: f64,
}

/// `queue_size` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSizeReport {
    /// Reporting station
    pub role: Role,
    /// Pending plus in-flight tasks
    pub size: usize,
}

/// Every message exchanged on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Server: request identification (`None`). Client: answer with `role_hwid`.
    Idn(Option<String>),

    // Step protocol
    /// Dispatcher to coordinators: measure this step
    NextStep(Step),
    /// Coordinator to dispatcher: instruments configured for this step
    IsStepReady(StepId),
    /// Dispatcher to coordinators: both sides are configured, start sampling
    StepReadyForMeasurement(StepId),
    /// Coordinator to dispatcher: finished this step
    MarkStepAsDone(Step),
    /// Coordinator to dispatcher: samples for this step
    GotStepResults(StepResultsReport),
    /// Coordinator to dispatcher, then dispatcher to browsers: step abandoned
    StepFailed(StepFailure),
    /// Dispatcher to coordinators: stop working on this step
    StepAbandoned(StepId),

    // Sweep management
    /// Browser: submit a sweep
    SetExperimentConfig(SweepConfiguration),
    /// Browser: ask for the latest sweep
    GetLatestExperimentConfig,
    /// Reply to `get_latest_experiment_config`
    LatestExperimentConfig(SweepConfiguration),
    /// Sweep stored and its steps generated
    ExperimentConfigurationSaved(SweepSaved),
    /// Browser: ask for progress of the latest sweep
    GetProgress,
    /// Progress of the latest sweep
    Progress(SweepProgress),

    // Telemetry
    /// Browser to cryo: read temperatures now
    GetTemperatures,
    /// Cryo to browsers: one sample outside the step protocol
    CryoTelemetry(CryoSample),
    /// Browser to magnetism: capture a scope trace
    GetMagnetTrace,
    /// Magnetism to browsers: downsampled trace
    MagnetTrace(MagnetTrace),
    /// Magnetism to browsers: RMS of the latest trace (A)
    MagnetRms(f64),
    /// Browser to magnetism: read the DC field
    GetDcField,
    /// Magnetism to browsers: DC field (T)
    DcField(f64),

    // Instrument configuration
    /// Browser to magnetism: command the magnet
    SetMagnetField(f64),
    /// Browser to magnetism: configure the signal generator
    SetSignalGenerator(SignalGeneratorConfig),
    /// Browser to magnetism: configure the lock-in
    SetLockIn(LockInConfig),
    /// Browser to magnetism: report instrument settings
    GetInstrumentConfig,
    /// Magnetism to browsers: instrument settings
    InstrumentConfig(InstrumentConfigReport),

    // Operations
    /// Browser to coordinators: report queue depth
    GetQueueSize,
    /// Coordinator to browsers: queue depth
    QueueSize(QueueSizeReport),
}

impl Event {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Idn(_) => "idn",
            Event::NextStep(_) => "next_step",
            Event::IsStepReady(_) => "is_step_ready",
            Event::StepReadyForMeasurement(_) => "step_ready_for_measurement",
            Event::MarkStepAsDone(_) => "mark_step_as_done",
            Event::GotStepResults(_) => "got_step_results",
            Event::StepFailed(_) => "step_failed",
            Event::StepAbandoned(_) => "step_abandoned",
            Event::SetExperimentConfig(_) => "set_experiment_config",
            Event::GetLatestExperimentConfig => "get_latest_experiment_config",
            Event::LatestExperimentConfig(_) => "latest_experiment_config",
            Event::ExperimentConfigurationSaved(_) => "experiment_configuration_saved",
            Event::GetProgress => "get_progress",
            Event::Progress(_) => "progress",
            Event::GetTemperatures => "get_temperatures",
            Event::CryoTelemetry(_) => "cryo_telemetry",
            Event::GetMagnetTrace => "get_magnet_trace",
            Event::MagnetTrace(_) => "magnet_trace",
            Event::MagnetRms(_) => "magnet_rms",
            Event::GetDcField => "get_dc_field",
            Event::DcField(_) => "dc_field",
            Event::SetMagnetField(_) => "set_magnet_field",
            Event::SetSignalGenerator(_) => "set_signal_generator",
            Event::SetLockIn(_) => "set_lock_in",
            Event::GetInstrumentConfig => "get_instrument_config",
            Event::InstrumentConfig(_) => "instrument_config",
            Event::GetQueueSize => "get_queue_size",
            Event::QueueSize(_) => "queue_size",
        }
    }

    /// Encodes the event as one JSON line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes one JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_adjacently_tagged() {
        let json = serde_json::to_value(Event::IsStepReady(StepId(12))).unwrap();
        assert_eq!(json, serde_json::json!({"event": "is_step_ready", "data": 12}));

        let json = serde_json::to_value(Event::GetProgress).unwrap();
        assert_eq!(json["event"], "get_progress");
    }

    #[test]
    fn name_matches_wire_tag() {
        let events = [
            Event::Idn(None),
            Event::StepReadyForMeasurement(StepId(1)),
            Event::StepAbandoned(StepId(2)),
            Event::GetQueueSize,
            Event::MagnetRms(0.3),
            Event::SetLockIn(LockInConfig {
                sensitivity: 1e-6,
                frequency: 512.0,
                buffer_size: 64,
            }),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn decodes_idn_answer() {
        let event = Event::from_line("{\"event\":\"idn\",\"data\":\"cryo_host\"}\n").unwrap();
        assert_eq!(event, Event::Idn(Some("cryo_host".to_string())));
    }
}
