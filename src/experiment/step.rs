//! Steps and their identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage id of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub i64);

/// Storage id of a sweep configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SweepId(pub i64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SweepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a step left the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Not yet measured
    Pending,
    /// Both stations reported done
    Completed,
    /// Superseded by a newer sweep before it was measured
    Abandoned,
    /// A station gave up on it
    Failed,
}

impl StepOutcome {
    /// Label stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Pending => "pending",
            StepOutcome::Completed => "completed",
            StepOutcome::Abandoned => "abandoned",
            StepOutcome::Failed => "failed",
        }
    }

    /// Every outcome except `Pending` counts as done.
    pub fn is_done(&self) -> bool {
        !matches!(self, StepOutcome::Pending)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepOutcome::Pending),
            "completed" => Ok(StepOutcome::Completed),
            "abandoned" => Ok(StepOutcome::Abandoned),
            "failed" => Ok(StepOutcome::Failed),
            other => Err(format!("unknown step outcome '{other}'")),
        }
    }
}

/// Every instrument value both stations need to measure one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSettings {
    /// Lock-in sensitivity (V)
    pub lockin_sensitivity: f64,
    /// Lock-in buffer sample rate (Hz)
    pub lockin_frequency: f64,
    /// Lock-in buffer size (points)
    pub lockin_buffer_size: u32,
    /// Signal generator frequency (Hz)
    pub signal_frequency: f64,
    /// Signal generator amplitude (V)
    pub signal_amplitude: f64,
    /// Magnet field set point (T)
    pub magnet_field: f64,
    /// Shunt resistor (ohm)
    pub resistor: f64,
    /// Settle time before every datapoint (s)
    pub data_wait_before_measuring: f64,
    /// Datapoints to collect
    pub data_points_per_measurement: u32,
}

/// A persisted step, as sent to the coordinators with `next_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Storage id
    pub id: StepId,
    /// Owning sweep
    #[serde(rename = "experiment_configuration_id")]
    pub sweep_id: SweepId,
    /// True once the step left the pending state
    pub done: bool,
    /// Outcome label
    pub outcome: StepOutcome,
    /// Instrument configuration
    #[serde(flatten)]
    pub settings: StepSettings,
}

impl Step {
    /// Seconds the lock-in needs to fill its buffer once.
    pub fn lockin_fill_secs(&self) -> f64 {
        f64::from(self.settings.lockin_buffer_size) / self.settings.lockin_frequency
    }
}
