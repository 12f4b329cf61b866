//! Magnetism station: magnet supply, AC field coil and lock-in amplifier.

use super::{rms, sim_clock};
use crate::config::{MagnetismConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::experiment::{buffer_mean, MagnetismAcquisition, MagnetismSample, Step};
use crate::instrument::sim::{SimLockIn, SimMagnetSupply, SimOscilloscope, SimSignalGenerator};
use crate::instrument::{LockInAmplifier, MagnetSupply, Oscilloscope, SignalGenerator};
use crate::protocol::{InstrumentConfigReport, LockInConfig, MagnetTrace, SignalGeneratorConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Every n-th trace point is sent to the dashboard.
const TRACE_DECIMATION: usize = 10;

/// Scope, magnet supply, signal generator and lock-in of the magnetometry setup.
pub struct MagnetismStation {
    scope: Arc<dyn Oscilloscope>,
    magnet: Arc<dyn MagnetSupply>,
    signal: Arc<dyn SignalGenerator>,
    lockin: Arc<dyn LockInAmplifier>,
    config: MagnetismConfig,
    resistor: Mutex<f64>,
}

impl std::fmt::Debug for MagnetismStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagnetismStation")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Whether two field values are equal within the magnet tolerances.
pub fn fields_close(a: f64, b: f64, rel_tolerance: f64, abs_tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= (rel_tolerance * scale).max(abs_tolerance)
}

impl MagnetismStation {
    /// Station over the given instruments.
    pub fn new(
        scope: Arc<dyn Oscilloscope>,
        magnet: Arc<dyn MagnetSupply>,
        signal: Arc<dyn SignalGenerator>,
        lockin: Arc<dyn LockInAmplifier>,
        config: MagnetismConfig,
    ) -> Self {
        Self {
            scope,
            magnet,
            signal,
            lockin,
            config,
            resistor: Mutex::new(1.0),
        }
    }

    /// Station over simulated instruments.
    pub fn simulated(settings: &Settings) -> Self {
        let clock = sim_clock(&settings.simulation);
        let signal = Arc::new(SimSignalGenerator::new(clock.clone()));
        let scope = SimOscilloscope::new(clock.clone(), settings.simulation.trace_len, signal.clone());
        Self::new(
            Arc::new(scope),
            Arc::new(SimMagnetSupply::new(clock.clone(), 0.0)),
            signal,
            Arc::new(SimLockIn::new(clock)),
            settings.magnetism.clone(),
        )
    }

    /// Turns the signal generator on and sets up the scope.
    pub async fn initialize(&self) -> AppResult<()> {
        self.signal
            .configure(SignalGeneratorConfig {
                amplitude: self.config.startup_amplitude,
                frequency: self.config.startup_frequency,
            })
            .await?;
        self.scope
            .set_horizontal_scale(self.config.horizontal_scale)
            .await?;
        info!(
            amplitude = self.config.startup_amplitude,
            frequency = self.config.startup_frequency,
            "Magnetism station initialized"
        );
        Ok(())
    }

    fn resistor(&self) -> f64 {
        *self.resistor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands the magnet unless it already sits within tolerance of `tesla`.
    ///
    /// Returns whether a hardware write happened.
    pub async fn set_magnet_field(&self, tesla: f64) -> AppResult<bool> {
        let current = self.magnet.field().await?;
        if fields_close(
            tesla,
            current,
            self.config.magnet_rel_tolerance,
            self.config.magnet_abs_tolerance,
        ) {
            debug!(requested = tesla, current, "magnet already at set point");
            return Ok(false);
        }
        self.magnet.set_field(tesla).await?;
        info!(from = current, to = tesla, "magnet field commanded");
        Ok(true)
    }

    /// Applies the magnet, signal generator and lock-in settings of a step.
    pub async fn apply_step_configuration(&self, step: &Step) -> AppResult<()> {
        let s = &step.settings;
        self.set_magnet_field(s.magnet_field).await?;
        self.configure_signal_generator(SignalGeneratorConfig {
            amplitude: s.signal_amplitude,
            frequency: s.signal_frequency,
        })
        .await?;
        self.configure_lock_in(LockInConfig {
            sensitivity: s.lockin_sensitivity,
            frequency: s.lockin_frequency,
            buffer_size: s.lockin_buffer_size,
        })
        .await?;
        *self.resistor.lock().unwrap_or_else(|e| e.into_inner()) = s.resistor;
        Ok(())
    }

    /// Sets the signal generator output.
    pub async fn configure_signal_generator(&self, config: SignalGeneratorConfig) -> AppResult<()> {
        self.signal.configure(config).await
    }

    /// Sets the lock-in buffer parameters.
    pub async fn configure_lock_in(&self, config: LockInConfig) -> AppResult<()> {
        self.lockin.configure(config).await
    }

    /// One datapoint: scope RMS, DC field and a lock-in buffer, acquired concurrently.
    pub async fn sample_once(&self, step: &Step) -> AppResult<MagnetismAcquisition> {
        let (ac_rms_field, dc_field, (lockin_amplitudes, lockin_phases)) = tokio::try_join!(
            self.ac_rms_field(step.settings.resistor),
            self.magnet.field(),
            self.lockin_buffers(step),
        )?;

        let empty = || DaqError::SampleFailed("lock-in returned an empty buffer".to_string());
        let lockin_amplitude = buffer_mean(&lockin_amplitudes).ok_or_else(empty)?;
        let lockin_phase = buffer_mean(&lockin_phases).ok_or_else(empty)?;

        Ok(MagnetismAcquisition {
            sample: MagnetismSample {
                ac_rms_field,
                dc_field,
                lockin_amplitude,
                lockin_phase,
            },
            lockin_amplitudes,
            lockin_phases,
        })
    }

    async fn ac_rms_field(&self, resistor: f64) -> AppResult<f64> {
        let trace = self.scope.capture_trace().await?;
        rms(&trace)
            .map(|volts| volts / resistor)
            .ok_or_else(|| DaqError::SampleFailed("oscilloscope returned an empty trace".to_string()))
    }

    async fn lockin_buffers(&self, step: &Step) -> AppResult<(Vec<f64>, Vec<f64>)> {
        self.lockin.buffer_reset().await?;
        self.lockin.buffer_start().await?;

        let fill = step.lockin_fill_secs();
        let wait = fill + fill.min(self.config.lockin_settle_cap_secs);
        let wait = Duration::try_from_secs_f64(wait).map_err(|e| {
            DaqError::SampleFailed(format!("invalid lock-in fill time {wait}: {e}"))
        })?;
        tokio::time::sleep(wait).await;

        self.lockin.buffer_pause().await?;
        let (mut amplitudes, mut phases) = self.lockin.read_buffers().await?;
        let size = step.settings.lockin_buffer_size as usize;
        amplitudes.truncate(size);
        phases.truncate(size);
        Ok((amplitudes, phases))
    }

    /// Captures a scope trace and converts it to coil current.
    ///
    /// Returns the decimated trace and the RMS current of the full trace.
    pub async fn magnet_trace(&self) -> AppResult<(MagnetTrace, f64)> {
        let resistor = self.resistor();
        let volts = self.scope.capture_trace().await?;
        let current: Vec<f64> = volts.iter().map(|v| v / resistor).collect();
        let rms_current = rms(&current)
            .ok_or_else(|| DaqError::Instrument("oscilloscope returned an empty trace".to_string()))?;

        let dt = 10.0 * self.scope.horizontal_scale() / current.len() as f64;
        let trace = MagnetTrace {
            times: (0..current.len())
                .step_by(TRACE_DECIMATION)
                .map(|i| i as f64 * dt)
                .collect(),
            current: current.iter().step_by(TRACE_DECIMATION).copied().collect(),
        };
        Ok((trace, rms_current))
    }

    /// Field read back from the magnet supply.
    pub async fn dc_field(&self) -> AppResult<f64> {
        self.magnet.field().await
    }

    /// Current signal generator, lock-in and magnet state.
    pub async fn instrument_config(&self) -> AppResult<InstrumentConfigReport> {
        let (signal_generator, lock_in, magnet_field) =
            tokio::try_join!(self.signal.config(), self.lockin.config(), self.magnet.field())?;
        Ok(InstrumentConfigReport {
            signal_generator,
            lock_in,
            magnet_field,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{StepId, StepOutcome, StepSettings, SweepId};
    use crate::instrument::sim::SimClock;

    struct Rig {
        station: MagnetismStation,
        magnet: Arc<SimMagnetSupply>,
    }

    fn rig() -> Rig {
        let clock = SimClock::new(Duration::ZERO, 11);
        let signal = Arc::new(SimSignalGenerator::new(clock.clone()));
        let magnet = Arc::new(SimMagnetSupply::new(clock.clone(), 0.0));
        let config = MagnetismConfig {
            horizontal_scale: 1e-5,
            ..MagnetismConfig::default()
        };
        let station = MagnetismStation::new(
            Arc::new(SimOscilloscope::new(clock.clone(), 200, signal.clone())),
            magnet.clone(),
            signal,
            Arc::new(SimLockIn::new(clock)),
            config,
        );
        Rig { station, magnet }
    }

    fn step(field: f64) -> Step {
        Step {
            id: StepId(1),
            sweep_id: SweepId(1),
            done: false,
            outcome: StepOutcome::Pending,
            settings: StepSettings {
                lockin_sensitivity: 1e-6,
                lockin_frequency: 1000.0,
                lockin_buffer_size: 20,
                signal_frequency: 1000.0,
                signal_amplitude: 0.5,
                magnet_field: field,
                resistor: 2.0,
                data_wait_before_measuring: 0.0,
                data_points_per_measurement: 1,
            },
        }
    }

    #[test]
    fn tolerance_is_relative_and_absolute() {
        assert!(fields_close(5.0, 5.04, 0.01, 1e-4));
        assert!(!fields_close(5.0, 5.1, 0.01, 1e-4));
        assert!(fields_close(0.0, 5e-5, 0.01, 1e-4));
        assert!(!fields_close(0.0, 1e-3, 0.01, 1e-4));
    }

    #[tokio::test]
    async fn magnet_write_is_debounced() {
        let rig = rig();
        assert!(rig.station.set_magnet_field(5.0).await.unwrap());
        assert!(!rig.station.set_magnet_field(5.02).await.unwrap());
        assert_eq!(rig.magnet.writes(), 1);
    }

    #[tokio::test]
    async fn sample_reduces_lockin_buffers() {
        let rig = rig();
        rig.station.initialize().await.unwrap();
        let step = step(1.0);
        rig.station.apply_step_configuration(&step).await.unwrap();

        let acquisition = rig.station.sample_once(&step).await.unwrap();
        assert_eq!(acquisition.lockin_amplitudes.len(), 20);
        assert_eq!(acquisition.lockin_phases.len(), 20);
        assert_eq!(acquisition.sample.dc_field, 1.0);
        assert!(acquisition.sample.ac_rms_field > 0.0);

        let config = rig.station.instrument_config().await.unwrap();
        assert_eq!(config.lock_in.buffer_size, 20);
        assert_eq!(config.signal_generator.amplitude, 0.5);
    }

    #[tokio::test]
    async fn trace_is_decimated() {
        let rig = rig();
        rig.station.initialize().await.unwrap();
        let (trace, rms_current) = rig.station.magnet_trace().await.unwrap();
        assert_eq!(trace.current.len(), 20);
        assert_eq!(trace.times.len(), 20);
        assert!(rms_current > 0.0);
    }
}
