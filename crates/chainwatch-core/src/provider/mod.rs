//! Snapshot sources: where a target's remote state comes from

mod http;

pub use http::HttpSnapshotSource;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Snapshot, Target};

/// Supplies the current remote state of a target on one chain.
///
/// Implementations must be idempotent: the governor may call
/// `fetch_snapshot` several times for one tick.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current snapshot of `target` on `chain`
    async fn fetch_snapshot(&self, target: &Target, chain: &str) -> Result<Snapshot>;

    /// Whether this source can serve `chain` at all
    fn supports_chain(&self, _chain: &str) -> bool {
        true
    }
}
