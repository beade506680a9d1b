//! JSON file target store
//!
//! The file is the source of truth. Every read goes back to disk and every
//! mutation re-reads the document, changes the one target it touches and
//! writes the result through a temp file and rename, so edits made by
//! another process (such as `chainwatch reset-alerts`) are picked up by a
//! running poller instead of being overwritten. Mutations within one process
//! are serialized; concurrent writers in different processes are not.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::TargetStore;
use crate::error::{Error, Result};
use crate::models::Target;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    targets: Vec<Target>,
}

/// Targets persisted as a single JSON document
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };

        match store.read_document().await? {
            Some(doc) => {
                debug!(path = %store.path.display(), targets = doc.targets.len(), "Opened target store");
            }
            None => info!(path = %store.path.display(), "Target store not found, starting empty"),
        }
        Ok(store)
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a target by id
    pub async fn upsert(&self, target: Target) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        match doc.targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => *existing = target,
            None => doc.targets.push(target),
        }
        self.save(&doc).await
    }

    /// Remove a target; returns whether it existed
    pub async fn remove(&self, target_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let before = doc.targets.len();
        doc.targets.retain(|t| t.id != target_id);
        if doc.targets.len() == before {
            return Ok(false);
        }
        self.save(&doc).await?;
        Ok(true)
    }

    async fn read_document(&self) -> Result<Option<Document>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Some(Document::default())),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self) -> Result<Document> {
        Ok(self.read_document().await?.unwrap_or_default())
    }

    async fn save(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(doc)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for JsonFileStore {
    async fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(self.load().await?.targets)
    }

    async fn set_latch(&self, target_id: &str, latched: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let target = doc
            .targets
            .iter_mut()
            .find(|t| t.id == target_id)
            .ok_or_else(|| Error::not_found("target", target_id))?;
        if target.latched == latched {
            return Ok(());
        }
        target.latched = latched;
        self.save(&doc).await
    }
}
