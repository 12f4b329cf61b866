//! Sweep and step data model.
//!
//! A [`SweepConfiguration`] is a set of one-dimensional parameter ranges. Its
//! Cartesian product is expanded into an ordered list of [`StepSettings`],
//! which the store turns into persisted [`Step`]s. Each step is measured by
//! both stations and yields [`MagnetismSample`]s and [`CryoSample`]s.
//!
//! ```
//! use cryomag_daq::experiment::{SweepConfiguration, SweepRange};
//!
//! let mut sweep = SweepConfiguration::default();
//! sweep.magnet_field = SweepRange::new(0.0, 2.0, 3);
//! assert_eq!(sweep.generate_steps().len(), 3);
//! ```

pub mod results;
pub mod step;
pub mod sweep;

pub use results::{
    buffer_mean, ChannelReading, CryoSample, DataPointExport, MagnetismAcquisition,
    MagnetismSample, StepExport, StepResults, StepSummary, SweepExport, SweepProgress,
};
pub use step::{Step, StepId, StepOutcome, StepSettings, SweepId};
pub use sweep::{SweepConfiguration, SweepRange, MAX_SWEEP_STEPS};
