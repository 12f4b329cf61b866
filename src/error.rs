//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that occur while sequencing a sweep, from configuration
//! and storage issues to instrument faults and protocol timeouts.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment load errors and semantic validation errors.
//! - **`Io`**, **`Serialization`**, **`Csv`**, **`Storage`**: wrapped library errors.
//! - **`Instrument`**, **`InstrumentTimeout`**, **`Overrange`**, **`DeviceBusy`**: faults raised
//!   while talking to a device. These are transient and the worker queue retries them.
//! - **`NotConnected`**, **`Transport`**: event bus faults, also transient.
//! - **`HandshakeTimeout`**, **`PreviousStepTimeout`**, **`SampleFailed`**: step-level failures
//!   that end the step with an explicit `step_failed` outcome instead of a retry.
//!
//! [`DaqError::is_retryable`] is what the worker queue consults before requeueing a task.

use crate::experiment::StepId;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Instrument '{instrument}' did not respond within {after:?}")]
    InstrumentTimeout { instrument: String, after: Duration },

    #[error("Bridge channel {channel} still overranged after {attempts} attempts")]
    Overrange { channel: u8, attempts: u32 },

    #[error("Device '{device}' is busy (held by '{holder}')")]
    DeviceBusy { device: String, holder: String },

    #[error("Not connected to the event bus")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid client identity '{0}'")]
    InvalidIdentity(String),

    #[error("Step {step_id} was not released for measurement within {waited:?}")]
    HandshakeTimeout { step_id: StepId, waited: Duration },

    #[error("Step {0} was abandoned by the dispatcher")]
    StepAbandoned(StepId),

    #[error("Previous step {previous} did not finish within {waited:?}")]
    PreviousStepTimeout { previous: StepId, waited: Duration },

    #[error("Sampling failed: {0}")]
    SampleFailed(String),

    #[error("Worker queue is closed")]
    QueueClosed,

    #[error("Server actor has stopped")]
    ServerStopped,

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether the worker queue should requeue a task that failed with this error.
    ///
    /// Transport and device I/O faults are worth another attempt after the
    /// connection has been cycled. Protocol timeouts and failed samples are not:
    /// repeating them would only stall the sweep further.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaqError::Io(_)
                | DaqError::Instrument(_)
                | DaqError::InstrumentTimeout { .. }
                | DaqError::DeviceBusy { .. }
                | DaqError::NotConnected
                | DaqError::Transport(_)
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<rusqlite::Error> for DaqError {
    fn from(err: rusqlite::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("lock-in did not echo".to_string());
        assert_eq!(err.to_string(), "Instrument error: lock-in did not echo");
    }

    #[test]
    fn test_retry_classification() {
        assert!(DaqError::NotConnected.is_retryable());
        assert!(DaqError::Transport("reset".into()).is_retryable());
        assert!(!DaqError::SampleFailed("overrange".into()).is_retryable());
        assert!(!DaqError::HandshakeTimeout {
            step_id: StepId(4),
            waited: Duration::from_secs(1)
        }
        .is_retryable());
    }
}
