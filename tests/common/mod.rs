#![allow(dead_code)]
//! Shared integration test utilities.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Default seed for seed-driven schedulers in tests.
pub const DEFAULT_TEST_SEED: u64 = 0xDEAD_BEEF;

/// Initialises test logging once per process. A no-op unless the
/// `tracing-integration` feature is enabled on the crate under test; the
/// subscriber is still installed so `RUST_LOG` works in dev runs.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
