//! Configuration system using Figment
//!
//! Configuration is layered, lowest to highest precedence:
//! 1. Compiled defaults ([`Settings::default`])
//! 2. A TOML file (`cryomag.toml` unless `--config` names another)
//! 3. Environment variables prefixed with `CRYOMAG_`, using `__` for nesting
//!
//! ```text
//! CRYOMAG_APPLICATION__LOG_LEVEL=debug
//! CRYOMAG_SERVER__HTTP_ADDR=0.0.0.0:8080
//! CRYOMAG_PROTOCOL__READY_TIMEOUT_SECS=120
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cryomag_daq::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("event bus on {}", settings.server.event_addr);
//! # Ok::<(), cryomag_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::MAX_SWEEP_STEPS;
use crate::instrument::CalibrationCurve;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cryomag.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Server process settings (event bus, HTTP, database)
    pub server: ServerConfig,
    /// Coordinator client settings
    pub client: ClientConfig,
    /// Step protocol timing
    pub protocol: ProtocolConfig,
    /// Worker queue retry policy
    pub queue: QueueConfig,
    /// Cryogenics station settings
    pub cryo: CryoConfig,
    /// Magnetism station settings
    pub magnetism: MagnetismConfig,
    /// Simulated instrument behaviour
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Directory for local result files
    pub data_dir: PathBuf,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, coloured when attached to a terminal
    Pretty,
    /// One JSON object per line
    Json,
}

/// Server process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the event bus listens on
    pub event_addr: String,
    /// Address the HTTP surface listens on
    pub http_addr: String,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Index page served at `/`, read once at startup
    pub index_page: PathBuf,
    /// Largest sweep (in steps) a client may submit
    pub max_sweep_steps: usize,
}

/// Coordinator client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Event bus address of the server
    pub server_addr: String,
    /// Hardware id used in the idn string; defaults to the host name
    pub hardware_id: Option<String>,
    /// Delay between reconnection attempts
    pub reconnect_delay_ms: u64,
    /// How long a failed task waits for the connection to come back
    pub reconnect_timeout_secs: f64,
}

/// Step protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a newly received step may wait for the previous one to finish
    pub previous_step_timeout_secs: f64,
    /// How long a configured coordinator waits for `step_ready_for_measurement`
    pub ready_timeout_secs: f64,
    /// Background telemetry polling interval (0 disables it)
    pub telemetry_interval_secs: f64,
}

/// Worker queue retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum attempts per task, including the first
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound for the backoff
    pub max_backoff_ms: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
}

/// What to do when a bridge channel stays overranged after every retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReadingPolicy {
    /// Keep the last good reading for that channel (NaN if there is none) and warn
    UseLastReading,
    /// Fail the sample, which fails the step
    FailSample,
}

/// Cryogenics station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryoConfig {
    /// Resistance bridge multiplexer channels sampled every datapoint
    pub bridge_channels: Vec<u8>,
    /// Maximum wait for exclusive access to the bridge
    pub bridge_lock_timeout_ms: u64,
    /// Overrange retries per channel read
    pub bridge_max_retries: u32,
    /// Delay between overrange retries
    pub bridge_retry_delay_ms: u64,
    /// Behaviour once the retries are exhausted
    pub stale_reading_policy: StaleReadingPolicy,
    /// Number of pressure channels exposed by the gauges
    pub pressure_channels: usize,
    /// Resistance to temperature curves, one per bridge channel
    pub calibrations: Vec<ChannelCalibration>,
}

/// Calibration curve bound to one bridge channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Bridge channel
    pub channel: u8,
    /// Sensor label, informational
    pub sensor: String,
    /// Curve points as `[resistance_ohm, temperature_k]`
    pub curve: CalibrationCurve,
}

/// Magnetism station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MagnetismConfig {
    /// Relative tolerance below which the magnet is not re-commanded
    pub magnet_rel_tolerance: f64,
    /// Absolute tolerance below which the magnet is not re-commanded
    pub magnet_abs_tolerance: f64,
    /// Signal generator amplitude applied at startup (V)
    pub startup_amplitude: f64,
    /// Signal generator frequency applied at startup (Hz)
    pub startup_frequency: f64,
    /// Oscilloscope horizontal scale (s/div)
    pub horizontal_scale: f64,
    /// Cap on the extra time given to a lock-in buffer fill (s)
    pub lockin_settle_cap_secs: f64,
}

/// Simulated instrument behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Artificial latency per device command
    pub latency_ms: u64,
    /// Seed for the noise generators
    pub seed: u64,
    /// Every n-th bridge read reports overrange (0 disables)
    pub overrange_every: u32,
    /// Number of samples in a simulated oscilloscope trace
    pub trace_len: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "cryomag".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            event_addr: "127.0.0.1:8765".to_string(),
            http_addr: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("dashboard.db"),
            index_page: PathBuf::from("index.html"),
            max_sweep_steps: 100_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8765".to_string(),
            hardware_id: None,
            reconnect_delay_ms: 1000,
            reconnect_timeout_secs: 30.0,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            previous_step_timeout_secs: 600.0,
            ready_timeout_secs: 600.0,
            telemetry_interval_secs: 5.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for CryoConfig {
    fn default() -> Self {
        Self {
            bridge_channels: vec![1, 2, 3],
            bridge_lock_timeout_ms: 30_000,
            bridge_max_retries: 20,
            bridge_retry_delay_ms: 1000,
            stale_reading_policy: StaleReadingPolicy::UseLastReading,
            pressure_channels: 10,
            calibrations: vec![
                ChannelCalibration {
                    channel: 1,
                    sensor: "still".to_string(),
                    curve: CalibrationCurve::ruo2_default(),
                },
                ChannelCalibration {
                    channel: 2,
                    sensor: "mixing_chamber_1".to_string(),
                    curve: CalibrationCurve::ruo2_default(),
                },
                ChannelCalibration {
                    channel: 3,
                    sensor: "mixing_chamber_2".to_string(),
                    curve: CalibrationCurve::ruo2_default(),
                },
            ],
        }
    }
}

impl Default for MagnetismConfig {
    fn default() -> Self {
        Self {
            magnet_rel_tolerance: 0.01,
            magnet_abs_tolerance: 1e-4,
            startup_amplitude: 0.5,
            startup_frequency: 1000.0,
            horizontal_scale: 100e-5,
            lockin_settle_cap_secs: 1.0,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_ms: 5,
            seed: 7,
            overrange_every: 0,
            trace_len: 4096,
        }
    }
}

impl ClientConfig {
    /// Pause between connection attempts.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Bound on waiting for a reconnect before a task counts as failed.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_timeout_secs)
    }
}

impl ProtocolConfig {
    /// Previous-step wait as a `Duration`.
    pub fn previous_step_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.previous_step_timeout_secs)
    }

    /// Ready handshake wait as a `Duration`.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ready_timeout_secs)
    }

    /// Telemetry interval, `None` when polling is disabled.
    pub fn telemetry_interval(&self) -> Option<Duration> {
        (self.telemetry_interval_secs > 0.0)
            .then(|| Duration::from_secs_f64(self.telemetry_interval_secs))
    }
}

impl QueueConfig {
    /// Retry policy for the worker queue.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

impl CryoConfig {
    /// Calibration curve for a bridge channel.
    pub fn calibration_for(&self, channel: u8) -> Option<&CalibrationCurve> {
        self.calibrations
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| &c.curve)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from defaults, a TOML file and the environment.
    ///
    /// With `path == None` the default file is used when it exists. A file that
    /// was named explicitly must exist.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(DaqError::Configuration(format!(
                        "configuration file {} does not exist",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        let settings: Settings = figment
            .merge(Env::prefixed("CRYOMAG_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.queue.max_attempts == 0 {
            return Err(DaqError::Configuration(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.backoff_multiplier < 1.0 {
            return Err(DaqError::Configuration(format!(
                "queue.backoff_multiplier {} must be >= 1.0",
                self.queue.backoff_multiplier
            )));
        }

        if self.server.max_sweep_steps == 0 || self.server.max_sweep_steps > MAX_SWEEP_STEPS {
            return Err(DaqError::Configuration(format!(
                "server.max_sweep_steps must be between 1 and {MAX_SWEEP_STEPS}, got {}",
                self.server.max_sweep_steps
            )));
        }

        for (name, value) in [
            ("protocol.previous_step_timeout_secs", self.protocol.previous_step_timeout_secs),
            ("protocol.ready_timeout_secs", self.protocol.ready_timeout_secs),
            ("protocol.telemetry_interval_secs", self.protocol.telemetry_interval_secs),
            ("client.reconnect_timeout_secs", self.client.reconnect_timeout_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DaqError::Configuration(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.cryo.bridge_channels {
            if !seen.insert(channel) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate bridge channel {channel}"
                )));
            }
            if *channel > 7 {
                return Err(DaqError::Configuration(format!(
                    "Bridge channel {channel} out of range 0-7"
                )));
            }
            if self.cryo.calibration_for(*channel).is_none() {
                return Err(DaqError::Configuration(format!(
                    "Bridge channel {channel} has no calibration curve"
                )));
            }
        }

        if self.magnetism.magnet_rel_tolerance < 0.0 || self.magnetism.magnet_abs_tolerance < 0.0 {
            return Err(DaqError::Configuration(
                "magnet tolerances must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}
