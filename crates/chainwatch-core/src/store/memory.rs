//! In-process target store

use async_trait::async_trait;
use parking_lot::RwLock;

use super::TargetStore;
use crate::error::{Error, Result};
use crate::models::Target;

/// Targets held in memory; used for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    targets: RwLock<Vec<Target>>,
}

impl MemoryStore {
    /// Create a store holding `targets`
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Insert or replace a target by id
    pub fn upsert(&self, target: Target) {
        let mut targets = self.targets.write();
        match targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => *existing = target,
            None => targets.push(target),
        }
    }

    /// Remove a target; returns whether it existed
    pub fn remove(&self, target_id: &str) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t.id != target_id);
        targets.len() != before
    }

    /// Get a target by id
    pub fn get(&self, target_id: &str) -> Option<Target> {
        self.targets.read().iter().find(|t| t.id == target_id).cloned()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(self.targets.read().clone())
    }

    async fn set_latch(&self, target_id: &str, latched: bool) -> Result<()> {
        let mut targets = self.targets.write();
        let target = targets
            .iter_mut()
            .find(|t| t.id == target_id)
            .ok_or_else(|| Error::not_found("target", target_id))?;
        target.latched = latched;
        Ok(())
    }
}
