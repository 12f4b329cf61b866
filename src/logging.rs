//! Structured logging setup.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber for this process.
///
/// Fails if a subscriber has already been installed.
pub fn init_tracing(app: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cryomag_daq={0},cryomag={0},{0}", app.log_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true);

    let result = match app.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };

    result.map_err(|e| DaqError::Configuration(format!("logging already initialised: {e}")))
}
