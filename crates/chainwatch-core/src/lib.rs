//! # Chainwatch
//!
//! Rate-governed state-diff polling for NFT collections and wallets.
//!
//! Chainwatch watches two kinds of targets: collection supply counts that
//! should alert once when they reach a threshold, and wallets that should
//! alert on every newly held item. Every upstream call goes through a shared
//! request governor so the process stays inside third-party rate limits.
//!
//! ## Architecture
//!
//! - **Governor**: token bucket, concurrency limiter and backoff retrier
//! - **Provider**: snapshot sources (HTTP provider APIs)
//! - **Alerting**: snapshot diffing, latching, dedup, delivery and the poller
//! - **Store**: tracked targets and their latch flags
//!
//! ## Quick Start
//!
//! ```bash
//! # Poll until Ctrl+C
//! chainwatch run
//!
//! # One pass over every target
//! chainwatch once
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod config;
pub mod error;
pub mod governor;
pub mod models;
pub mod provider;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertSink, CycleReport, StateDiffPoller};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::governor::RequestGovernor;
    pub use crate::models::*;
    pub use crate::provider::SnapshotSource;
    pub use crate::store::TargetStore;
}
