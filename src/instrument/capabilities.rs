use crate::error::AppResult;
use crate::protocol::{LockInConfig, SignalGeneratorConfig};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of one resistance bridge conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BridgeReading {
    /// Resistance in ohm
    Resistance(f64),
    /// Value outside the selected range
    Overrange,
}

/// Capability for multi-channel pressure gauge controllers.
#[async_trait]
pub trait PressureGauge: Send + Sync {
    /// Reads every channel, in channel order (mbar).
    async fn read_pressures(&self) -> AppResult<Vec<f64>>;
}

/// Capability for multiplexed resistance bridges.
#[async_trait]
pub trait ResistanceBridge: Send + Sync {
    /// Switches the multiplexer to `channel`.
    async fn select_channel(&self, channel: u8) -> AppResult<()>;
    /// Time the bridge needs after a channel switch before a read is valid.
    fn settle_time(&self) -> Duration;
    /// Reads the currently selected channel.
    async fn read_resistance(&self) -> AppResult<BridgeReading>;
}

/// Capability for oscilloscopes capturing the AC field current.
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Sets the horizontal scale (s/div).
    async fn set_horizontal_scale(&self, secs_per_div: f64) -> AppResult<()>;
    /// Current horizontal scale (s/div).
    fn horizontal_scale(&self) -> f64;
    /// Forces a trigger, waits for the sweep and returns channel 1 (V).
    async fn capture_trace(&self) -> AppResult<Vec<f64>>;
}

/// Capability for superconducting magnet power supplies.
#[async_trait]
pub trait MagnetSupply: Send + Sync {
    /// Field read back from the supply (T).
    async fn field(&self) -> AppResult<f64>;
    /// Commands a new field (T).
    async fn set_field(&self, tesla: f64) -> AppResult<()>;
}

/// Capability for the low-frequency signal generator.
#[async_trait]
pub trait SignalGenerator: Send + Sync {
    /// Turns the output on with the given amplitude and frequency.
    async fn configure(&self, config: SignalGeneratorConfig) -> AppResult<()>;
    /// Current output settings.
    async fn config(&self) -> AppResult<SignalGeneratorConfig>;
}

/// Capability for buffered lock-in amplifiers.
#[async_trait]
pub trait LockInAmplifier: Send + Sync {
    /// Applies sensitivity, buffer rate and size.
    async fn configure(&self, config: LockInConfig) -> AppResult<()>;
    /// Current settings.
    async fn config(&self) -> AppResult<LockInConfig>;
    /// Clears both channel buffers.
    async fn buffer_reset(&self) -> AppResult<()>;
    /// Starts filling the buffers at the configured rate.
    async fn buffer_start(&self) -> AppResult<()>;
    /// Stops filling the buffers.
    async fn buffer_pause(&self) -> AppResult<()>;
    /// Reads both channel buffers.
    async fn read_buffers(&self) -> AppResult<(Vec<f64>, Vec<f64>)>;
}
