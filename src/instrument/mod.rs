//! Instrument capabilities and their simulated implementations.
//!
//! Stations only talk to instruments through the capability traits in
//! [`capabilities`]. The resistance bridge is additionally wrapped in a
//! [`SharedBridge`] because the step task and the background temperature
//! poll both use it.

pub mod calibration;
pub mod capabilities;
pub mod shared_bridge;
pub mod sim;

pub use calibration::{CalibrationCurve, CalibrationPoint};
pub use capabilities::{
    BridgeReading, LockInAmplifier, MagnetSupply, Oscilloscope, PressureGauge, ResistanceBridge,
    SignalGenerator,
};
pub use shared_bridge::{BridgeGuard, SharedBridge};
