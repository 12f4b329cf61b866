//! Station aggregations.
//!
//! A station bundles the instruments one coordinator drives and exposes the
//! operations of the step protocol on top of them: applying a step's
//! configuration and taking one sample. Stations hold instruments behind the
//! capability traits, so the same code runs against real drivers and the
//! simulated devices in [`crate::instrument::sim`].

pub mod cryo;
pub mod magnetism;

pub use cryo::CryoStation;
pub use magnetism::MagnetismStation;

use crate::config::SimulationConfig;
use crate::instrument::sim::SimClock;
use std::time::Duration;

/// Root-mean-square of a trace, `None` for an empty one.
pub fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    Some((sum_sq / values.len() as f64).sqrt())
}

fn sim_clock(sim: &SimulationConfig) -> SimClock {
    SimClock::new(Duration::from_millis(sim.latency_ms), sim.seed)
}
