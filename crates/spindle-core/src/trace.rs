use std::sync::Once;

use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once. `RUST_LOG` overrides the default
/// `info` filter; `log_format` picks human-readable text or JSON lines.
///
/// Later calls are no-ops, as is a call made after some other subscriber was
/// installed (tests, embedding applications).
pub fn init(log_format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .compact()
                        .with_filter(env_filter),
                )
                .try_init(),
            LogFormat::Json => tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .json()
                        .with_filter(env_filter),
                )
                .try_init(),
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "tracing subscriber already installed");
        }
    });
}
