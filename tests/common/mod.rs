//! Helpers shared by the integration tests.

#![allow(dead_code)]

pub mod mock;

use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the fan-out and the test suite.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to only see what the connection pools are doing:
///   RUST_LOG=domain_fanout::pool=TRACE
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
