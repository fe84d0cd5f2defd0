//! Shared test utilities.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ...
//! }
//! ```
//!
//! # Configuration
//!
//! - `RUST_LOG`: filter directives (e.g. `klsm=debug`)
//! - `KLSM_LOG_CONSOLE`: set to `0` to silence console output

#![allow(dead_code)]

use std::env;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Ensures the subscriber is installed once across all tests.
static INIT: Once = Once::new();

/// Install a console tracing subscriber driven by `RUST_LOG`.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        if env::var("KLSM_LOG_CONSOLE").is_ok_and(|v| v == "0") {
            return;
        }

        let filter: EnvFilter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{}", Level::INFO)));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .try_init();
    });
}

/// Deterministic pseudo-random u64 stream for workload generation
/// (splitmix64; no external seeding, reproducible across runs).
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}
