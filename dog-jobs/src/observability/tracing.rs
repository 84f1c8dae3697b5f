//! Subscriber setup for binaries and tests that do not bring their own.

use crate::{EngineError, EngineResult};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,dog_jobs=debug";

/// Install a global fmt subscriber filtered by `RUST_LOG`.
/// `json` switches to one JSON object per line.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(json: bool) -> EngineResult<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::Config(format!("cannot install tracing subscriber: {e}")))
}

/// Without the `tracing-basic` feature the application installs its own subscriber
#[cfg(not(feature = "tracing-basic"))]
pub fn init_tracing(_json: bool) -> EngineResult<()> {
    Err(EngineError::Config(
        "init_tracing requires the `tracing-basic` feature".to_string(),
    ))
}
