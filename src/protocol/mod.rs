//! Event bus vocabulary shared by the server and the coordinators.
//!
//! Every message is an [`Event`], serialized as `{"event": "<name>", "data": ...}`.

pub mod events;
pub mod identity;

pub use events::{
    Event, InstrumentConfigReport, LockInConfig, MagnetTrace, QueueSizeReport,
    SignalGeneratorConfig, StepFailure, StepResultsReport, SweepSaved,
};
pub use identity::{ClientIdentity, ConnectionId, Role};
