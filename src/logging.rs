//! Tracing subscriber setup shared by the binaries.

use tracing::warn;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global subscriber. `RUST_LOG` wins over `fallback_level`.
/// Output goes to stderr so a client's stdout stays clean.
pub fn init_tracing(fallback_level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(ChronoUtc::rfc_3339());

    let result = match format {
        LogFormat::Text => builder.with_target(false).try_init(),
        LogFormat::Json => builder
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
    };
    if let Err(err) = result {
        warn!("Tracing already initialised, skipping duplicate subscriber registration: {err}");
    }
}
