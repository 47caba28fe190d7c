//! Tracing subscriber installation.
//!
//! Both entry points are idempotent: the first successful call installs the
//! global subscriber and later calls leave it in place.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs with timestamps, filtered by `RUST_LOG`.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();

    tracing::debug!("tracing initialized");
}

/// Compact human-readable logs routed through the libtest capture, so output
/// only shows up for failing tests. Infra logs at `debug` unless `RUST_LOG` says otherwise.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn,stockroom_infra=debug"))
        .compact()
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_is_harmless() {
        init_for_tests();
        init_for_tests();
        init();
        tracing::info!(attempt = 1, "still logging after re-init");
    }
}
