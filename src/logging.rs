//! Tracing setup for tests and embedding binaries.
//!
//! The library only emits `tracing` events. Installing a subscriber is the
//! caller's business; these helpers cover the common cases.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "tidemark=info";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Installs a global formatting subscriber honouring `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter(DEFAULT_FILTER))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Installs a subscriber that writes through the test harness capture.
/// Safe to call from every test; only the first call has an effect.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("tidemark=debug"))
        .with_test_writer()
        .try_init();
}
