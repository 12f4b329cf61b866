//! Sweep ranges and Cartesian step generation.

use super::step::StepSettings;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Hard ceiling on the number of steps a sweep may expand into.
pub const MAX_SWEEP_STEPS: usize = 1_000_000;

/// One-dimensional parameter range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    /// First value
    pub min: f64,
    /// Last value
    pub max: f64,
    /// Number of points between `min` and `max`, inclusive
    pub steps: u32,
}

impl SweepRange {
    /// Creates a range.
    pub fn new(min: f64, max: f64, steps: u32) -> Self {
        Self { min, max, steps }
    }

    /// Single-valued range.
    pub fn fixed(value: f64) -> Self {
        Self::new(value, value, 1)
    }

    /// Number of values [`values`](Self::values) yields, without allocating.
    pub fn point_count(&self) -> usize {
        if self.min == self.max {
            1
        } else {
            (self.steps as usize).max(1)
        }
    }

    /// Values visited by this range.
    ///
    /// A degenerate range (`min == max`) yields just `max`, whatever `steps`
    /// says. Otherwise `steps` evenly spaced values with both ends included.
    pub fn values(&self) -> Vec<f64> {
        if self.min == self.max {
            return vec![self.max];
        }
        if self.steps <= 1 {
            return vec![self.min];
        }
        let n = self.steps as usize;
        let delta = (self.max - self.min) / (n - 1) as f64;
        (0..n)
            .map(|i| if i == n - 1 { self.max } else { self.min + delta * i as f64 })
            .collect()
    }

    fn validate(&self, name: &str, max_steps: usize) -> AppResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(DaqError::Configuration(format!(
                "{name} range must be finite"
            )));
        }
        if self.steps == 0 {
            return Err(DaqError::Configuration(format!(
                "{name} range needs at least one step"
            )));
        }
        if self.point_count() > max_steps {
            return Err(DaqError::Configuration(format!(
                "{name} range has {} steps, at most {max_steps} allowed",
                self.steps
            )));
        }
        Ok(())
    }
}

/// A submitted parameter sweep.
///
/// Immutable once stored; a newer submission supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfiguration {
    /// Lock-in sensitivity (V)
    pub lockin_sensitivity: f64,
    /// Lock-in buffer sample rate (Hz)
    pub lockin_frequency: f64,
    /// Lock-in buffer size (points)
    pub lockin_buffer_size: u32,
    /// Signal generator frequency range (Hz)
    pub signal_frequency: SweepRange,
    /// Signal generator amplitude range (V)
    pub signal_amplitude: SweepRange,
    /// Magnet field range (T)
    pub magnet_field: SweepRange,
    /// Shunt resistor used to turn the scope voltage into a current (ohm)
    pub resistor: f64,
    /// Settle time before every datapoint (s)
    pub data_wait_before_measuring: f64,
    /// Datapoints sampled per step
    pub data_points_per_measurement: u32,
}

impl Default for SweepConfiguration {
    fn default() -> Self {
        Self {
            lockin_sensitivity: 1e-6,
            lockin_frequency: 1000.0,
            lockin_buffer_size: 256,
            signal_frequency: SweepRange::fixed(1000.0),
            signal_amplitude: SweepRange::fixed(0.5),
            magnet_field: SweepRange::new(5.0, 6.0, 10),
            resistor: 1.0,
            data_wait_before_measuring: 1.0,
            data_points_per_measurement: 10,
        }
    }
}

impl SweepConfiguration {
    /// Rejects sweeps that cannot be measured, or that expand into more
    /// than [`MAX_SWEEP_STEPS`] steps.
    pub fn validate(&self) -> AppResult<()> {
        self.validate_within(MAX_SWEEP_STEPS)
    }

    /// Like [`validate`](Self::validate) with a tighter step limit.
    pub fn validate_within(&self, max_steps: usize) -> AppResult<()> {
        let max_steps = max_steps.min(MAX_SWEEP_STEPS);
        self.signal_frequency.validate("signal_frequency", max_steps)?;
        self.signal_amplitude.validate("signal_amplitude", max_steps)?;
        self.magnet_field.validate("magnet_field", max_steps)?;
        match self.checked_step_count() {
            Some(total) if total <= max_steps => {}
            _ => {
                return Err(DaqError::Configuration(format!(
                    "sweep expands into more than {max_steps} steps"
                )))
            }
        }

        if self.lockin_frequency <= 0.0 || !self.lockin_frequency.is_finite() {
            return Err(DaqError::Configuration(format!(
                "lockin_frequency must be positive, got {}",
                self.lockin_frequency
            )));
        }
        if self.lockin_buffer_size == 0 {
            return Err(DaqError::Configuration(
                "lockin_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.resistor <= 0.0 || !self.resistor.is_finite() {
            return Err(DaqError::Configuration(format!(
                "resistor must be positive, got {}",
                self.resistor
            )));
        }
        if self.data_wait_before_measuring < 0.0 || !self.data_wait_before_measuring.is_finite() {
            return Err(DaqError::Configuration(
                "data_wait_before_measuring must be a non-negative number".to_string(),
            ));
        }
        if self.data_points_per_measurement == 0 {
            return Err(DaqError::Configuration(
                "data_points_per_measurement must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn checked_step_count(&self) -> Option<usize> {
        self.magnet_field
            .point_count()
            .checked_mul(self.signal_amplitude.point_count())?
            .checked_mul(self.signal_frequency.point_count())
    }

    /// Total number of steps this sweep expands into, saturating at `usize::MAX`.
    pub fn step_count(&self) -> usize {
        self.checked_step_count().unwrap_or(usize::MAX)
    }

    /// Expands the Cartesian product of the ranges.
    ///
    /// Field is the outermost axis, then amplitude, then frequency. Only call
    /// this on a sweep that passed [`validate`](Self::validate).
    pub fn generate_steps(&self) -> Vec<StepSettings> {
        let fields = self.magnet_field.values();
        let amplitudes = self.signal_amplitude.values();
        let frequencies = self.signal_frequency.values();

        let mut steps = Vec::with_capacity(self.step_count().min(MAX_SWEEP_STEPS));
        for &field in &fields {
            for &amplitude in &amplitudes {
                for &frequency in &frequencies {
                    steps.push(StepSettings {
                        lockin_sensitivity: self.lockin_sensitivity,
                        lockin_frequency: self.lockin_frequency,
                        lockin_buffer_size: self.lockin_buffer_size,
                        signal_frequency: frequency,
                        signal_amplitude: amplitude,
                        magnet_field: field,
                        resistor: self.resistor,
                        data_wait_before_measuring: self.data_wait_before_measuring,
                        data_points_per_measurement: self.data_points_per_measurement,
                    });
                }
            }
        }
        steps
    }
}
