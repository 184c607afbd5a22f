//! Integration test infrastructure for Quarry.
//!
//! Shared fixtures and helpers for cross-crate scenario tests against the
//! in-memory adapters.
//!
//! ```ignore
//! use quarry_tests::{fixtures, init_test_logging};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     init_test_logging();
//!     let harness = fixtures::ServiceHarness::new().await;
//!     // harness.service.submit(...)
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,quarry_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
