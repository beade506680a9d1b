//! Record store for tracked targets
//!
//! The poller only lists targets and writes back latch flags; everything else
//! about how targets are persisted belongs to the store implementation.

mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Target;

/// Access to tracked targets
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// All tracked targets
    async fn list_targets(&self) -> Result<Vec<Target>>;

    /// Set or clear the threshold latch of a target
    async fn set_latch(&self, target_id: &str, latched: bool) -> Result<()>;
}
