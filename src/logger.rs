//! Log output for the ragcag harness.
//!
//! The library only emits `tracing` events (ingest, cache hits, degraded
//! queries). [`init`] is called once by the binary after the config profile
//! is loaded.

use std::path::Path;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Directives added to every filter. The HTTP embedding client's transport
/// crates log per request at debug level.
const TRANSPORT_DIRECTIVES: &[&str] = &["hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Install the global subscriber.
///
/// `level` is a filter such as `"info"` or `"ragcag=debug,warn"`. With
/// `prefer_level` it wins over `RUST_LOG`, which is then only a fallback for
/// an unparsable `level`; without it the order is reversed. Events go to
/// stderr, or are appended to `log_file`.
pub fn init(level: &str, prefer_level: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let filter = if prefer_level {
        match EnvFilter::try_new(level) {
            Ok(filter) => filter,
            Err(level_err) => EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })?,
        }
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))?
    };
    let filter = quiet_transport(filter);

    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AppError::Logger(format!("failed to open log file '{}': {e}", path.display())))?;
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

fn quiet_transport(filter: EnvFilter) -> EnvFilter {
    TRANSPORT_DIRECTIVES
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(filter, EnvFilter::add_directive)
}
