//! Tracing setup for the recorder binary.
//!
//! `RUST_LOG` overrides the default filter. Production emits one JSON object
//! per line; other environments use the human readable formatter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Environment;

/// Filter applied when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,txnscope_recorder=debug";

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(environment: Environment) -> Result<(), tracing_subscriber::util::TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter());

    match environment {
        Environment::Production => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        Environment::Local | Environment::Development => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
            .try_init(),
    }
}
