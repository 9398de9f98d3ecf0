//! Tier 3: local disk-backed map.
//!
//! Single-replica fallback with no external dependency; survives restarts
//! via a JSON snapshot. Mutations mark the map dirty and a background
//! writer flushes after ~1 s of quiescence, so a burst of configuration
//! pushes costs one write instead of one per mutation. Crash exposure is
//! bounded to roughly one debounce interval; shutdown calls [`FileStore::flush`].

use super::{TenantConfig, TenantStore};
use crate::errors::{SwitchboardError, SwitchboardResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

const DEBOUNCE: Duration = Duration::from_secs(1);

type TenantMap = HashMap<String, TenantConfig>;

pub struct FileStore {
    path: PathBuf,
    map: Arc<RwLock<TenantMap>>,
    dirty_tx: mpsc::UnboundedSender<()>,
}

impl FileStore {
    /// Open (or create) the snapshot at `path` and start the debounced
    /// writer task.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map: TenantMap = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read tenant snapshot {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("corrupt tenant snapshot {}", path.display()))?
        } else {
            TenantMap::new()
        };

        let map = Arc::new(RwLock::new(map));
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();

        let writer_map = Arc::clone(&map);
        let writer_path = path.clone();
        tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                // Coalesce further marks until one debounce interval of quiet.
                while tokio::time::timeout(DEBOUNCE, dirty_rx.recv())
                    .await
                    .is_ok_and(|mark| mark.is_some())
                {}
                if let Err(e) = write_snapshot(&writer_path, &writer_map).await {
                    warn!("tenant snapshot write failed: {}", e);
                }
            }
        });

        Ok(Self { path, map, dirty_tx })
    }

    fn mark_dirty(&self) {
        // Writer task gone means we're shutting down; flush() covers that.
        let _ = self.dirty_tx.send(());
    }

    /// Write the snapshot immediately, bypassing the debounce. Called on
    /// shutdown signals.
    pub async fn flush(&self) -> Result<()> {
        write_snapshot(&self.path, &self.map).await
    }
}

async fn write_snapshot(path: &Path, map: &Arc<RwLock<TenantMap>>) -> Result<()> {
    let serialized = {
        let map = map.read().await;
        serde_json::to_string_pretty(&*map).context("failed to serialize tenant snapshot")?
    };
    atomic_write(path, &serialized)?;
    debug!("tenant snapshot written to {}", path.display());
    Ok(())
}

/// Write content atomically via tempfile + rename: the snapshot is either
/// fully written or untouched.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().context("snapshot path has no parent directory")?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(content.as_bytes())
        .context("failed to write temp snapshot")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to rename snapshot into {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl TenantStore for FileStore {
    fn tier(&self) -> &'static str {
        "file"
    }

    async fn save(&self, config: &TenantConfig) -> SwitchboardResult<()> {
        self.map
            .write()
            .await
            .insert(config.tenant_id.clone(), config.clone());
        self.mark_dirty();
        Ok(())
    }

    async fn load(&self, tenant_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        Ok(self.map.read().await.get(tenant_id).cloned())
    }

    async fn load_by_team(&self, team_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        Ok(self
            .map
            .read()
            .await
            .values()
            .find(|c| c.team_id.as_deref() == Some(team_id))
            .cloned())
    }

    async fn delete(&self, tenant_id: &str) -> SwitchboardResult<()> {
        if self.map.write().await.remove(tenant_id).is_none() {
            return Err(SwitchboardError::Store {
                tier: "file",
                message: format!("tenant {} not present", tenant_id),
            });
        }
        self.mark_dirty();
        Ok(())
    }

    async fn count(&self) -> SwitchboardResult<u64> {
        Ok(self.map.read().await.len() as u64)
    }
}
