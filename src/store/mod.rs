//! Crash-safe JSON document stores.
//!
//! Every store instance owns one file and one mutex. All access goes through
//! the mutex as a read-modify-write of the whole document, and every write is
//! atomic (write to `.tmp`, then rename), so a reader never sees a partial
//! file.
//!
//! A file that exists but does not parse is treated as lost data: the store
//! logs a warning and carries on with an empty document. Availability wins
//! over strict durability here.

pub mod schedules;
pub mod subagents;
pub mod tasks;

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use schedules::DynamicScheduleStore;
pub use subagents::SubAgentStore;
pub use tasks::TaskStore;

/// A top-level document persisted by a [`JsonStore`].
pub trait Document:
    Serialize + DeserializeOwned + Default + Clone + PartialEq + Send + Sync + 'static
{
    /// Called right before a changed document is written.
    fn touch(&mut self, _now: DateTime<Utc>) {}
}

pub struct JsonStore<D: Document> {
    path: PathBuf,
    lock: Mutex<()>,
    _doc: PhantomData<fn() -> D>,
}

impl<D: Document> JsonStore<D> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Snapshot of the current document.
    pub async fn load(&self) -> D {
        let _guard = self.lock.lock().await;
        self.load_unlocked().await
    }

    /// Run `f` against the document under the store lock.
    ///
    /// The document is written back only when `f` succeeds and actually
    /// changed it, so a no-op mutation never touches the file.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut D) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_unlocked().await;
        let before = doc.clone();
        let out = f(&mut doc)?;
        if doc != before {
            doc.touch(Utc::now());
            self.save_unlocked(&doc).await?;
        }
        Ok(out)
    }

    async fn load_unlocked(&self) -> D {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return D::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Store file unreadable, using empty document");
                return D::default();
            }
        };
        if text.trim().is_empty() {
            return D::default();
        }
        match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Store file is corrupt, using empty document (previous contents will be replaced on next write)"
                );
                D::default()
            }
        }
    }

    async fn save_unlocked(&self, doc: &D) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(doc).context("failed to serialize store document")?;

        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)
                .await
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())
                .await
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;

        debug!(path = %self.path.display(), bytes = json.len(), "store saved");
        Ok(())
    }
}
