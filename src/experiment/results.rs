//! Measurement results and the views built on top of them.

use super::step::{Step, StepId, SweepId};
use super::sweep::SweepConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One magnetism datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagnetismSample {
    /// RMS of the AC field current trace (A)
    pub ac_rms_field: f64,
    /// DC field read back from the magnet supply (T)
    pub dc_field: f64,
    /// Mean lock-in channel 1 over the buffer
    pub lockin_amplitude: f64,
    /// Mean lock-in channel 2 over the buffer
    pub lockin_phase: f64,
}

/// One resistance bridge channel reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    /// Bridge multiplexer channel
    pub channel: u8,
    /// Measured resistance (ohm), `None` when unavailable
    pub resistance: Option<f64>,
    /// Calibrated temperature (K), `None` when unavailable
    pub temperature: Option<f64>,
    /// True when the value was carried over from an earlier reading
    #[serde(default)]
    pub stale: bool,
}

/// One cryogenics datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryoSample {
    /// Seconds since the coordinator started
    pub elapsed_secs: f64,
    /// Wall clock time of the sample
    pub timestamp: DateTime<Utc>,
    /// Pressure gauge readings (mbar)
    pub pressures: Vec<f64>,
    /// Bridge readings for the monitored channels
    pub temperatures: Vec<ChannelReading>,
}

/// Results a coordinator reports with `got_step_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepResults {
    /// Magnetism station samples in sample-index order
    Magnetism {
        /// Samples
        samples: Vec<MagnetismSample>,
    },
    /// Cryogenics station samples in sample-index order
    Cryogenics {
        /// Samples
        samples: Vec<CryoSample>,
    },
}

impl StepResults {
    /// Number of samples carried.
    pub fn len(&self) -> usize {
        match self {
            StepResults::Magnetism { samples } => samples.len(),
            StepResults::Cryogenics { samples } => samples.len(),
        }
    }

    /// True when no sample was taken.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One magnetism datapoint together with the raw lock-in buffers it was reduced from.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetismAcquisition {
    /// Reduced sample
    pub sample: MagnetismSample,
    /// Lock-in channel 1 buffer
    pub lockin_amplitudes: Vec<f64>,
    /// Lock-in channel 2 buffer
    pub lockin_phases: Vec<f64>,
}

/// Measurement record of one step with both result kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointExport {
    /// Storage id
    pub id: i64,
    /// Magnetism rows, ordered by sample index
    pub magnetism: Vec<MagnetismSample>,
    /// Cryogenics rows, ordered by sample index
    pub cryogenics: Vec<CryoSample>,
}

/// A step with its data point, if it was ever dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExport {
    /// Step
    #[serde(flatten)]
    pub step: Step,
    /// Data point
    pub data_point: Option<DataPointExport>,
}

/// Nested export of a whole sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepExport {
    /// Storage id
    pub id: SweepId,
    /// Submission time
    pub created: DateTime<Utc>,
    /// Submitted configuration
    pub configuration: SweepConfiguration,
    /// Steps in dispatch order
    pub steps: Vec<StepExport>,
}

/// Points taken versus points total for a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepProgress {
    /// Sweep, `None` when nothing was ever submitted
    pub sweep_id: Option<SweepId>,
    /// Steps that left the pending state
    pub taken: u64,
    /// Steps in the sweep
    pub total: u64,
}

/// Per-step means, the shape the dashboard plots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Step
    pub step_id: StepId,
    /// Signal generator frequency (Hz)
    pub signal_frequency: f64,
    /// Signal generator amplitude (V)
    pub signal_amplitude: f64,
    /// Magnet set point (T)
    pub magnet_field: f64,
    /// Mean AC RMS field
    pub mean_ac_rms_field: Option<f64>,
    /// Mean DC field
    pub mean_dc_field: Option<f64>,
    /// Mean lock-in amplitude
    pub mean_lockin_amplitude: Option<f64>,
    /// Mean lock-in phase
    pub mean_lockin_phase: Option<f64>,
    /// Mean temperature per bridge channel, ignoring unavailable readings
    pub mean_temperatures: BTreeMap<u8, f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Mean of a buffer, `None` for an empty one.
pub fn buffer_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

impl StepSummary {
    /// Reduces a step's samples to means.
    pub fn from_samples(step: &Step, magnetism: &[MagnetismSample], cryo: &[CryoSample]) -> Self {
        let mut per_channel: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
        for sample in cryo {
            for reading in &sample.temperatures {
                if let Some(temperature) = reading.temperature {
                    per_channel
                        .entry(reading.channel)
                        .or_default()
                        .push(temperature);
                }
            }
        }
        let mean_temperatures = per_channel
            .into_iter()
            .filter_map(|(channel, temps)| mean(temps.into_iter()).map(|m| (channel, m)))
            .collect();

        Self {
            step_id: step.id,
            signal_frequency: step.settings.signal_frequency,
            signal_amplitude: step.settings.signal_amplitude,
            magnet_field: step.settings.magnet_field,
            mean_ac_rms_field: mean(magnetism.iter().map(|m| m.ac_rms_field)),
            mean_dc_field: mean(magnetism.iter().map(|m| m.dc_field)),
            mean_lockin_amplitude: mean(magnetism.iter().map(|m| m.lockin_amplitude)),
            mean_lockin_phase: mean(magnetism.iter().map(|m| m.lockin_phase)),
            mean_temperatures,
        }
    }
}
