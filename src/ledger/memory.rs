//! In-memory ledger with optional JSON snapshot persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::{Ledger, LedgerError, ManagedResource, ResourceKey, ResourceKind, ResourceStatus};
use crate::clock::{Clock, SystemClock};

/// Ledger kept in a map ordered by unique key.
///
/// When opened with a path, every mutation rewrites the snapshot file
/// (write to a temporary sibling, then rename).
pub struct MemoryLedger {
    rows: RwLock<BTreeMap<ResourceKey, ManagedResource>>,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            path: None,
            clock,
        }
    }

    /// Open a snapshot-backed ledger, loading existing rows if the file exists
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let mut rows = BTreeMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let stored: Vec<ManagedResource> = serde_json::from_slice(&bytes)?;
                for row in stored {
                    rows.insert(row.key(), row);
                }
                debug!(path = %path.display(), rows = rows.len(), "Loaded ledger snapshot");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(LedgerError::Io { path, source }),
        }

        Ok(Self {
            rows: RwLock::new(rows),
            path: Some(path),
            clock,
        })
    }

    /// Copy of every row, ordered by key
    pub fn snapshot(&self) -> Vec<ManagedResource> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ResourceKey, ManagedResource>> {
        self.rows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ResourceKey, ManagedResource>> {
        self.rows.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| LedgerError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })
    }

    fn update_by_id<F>(&self, id: &str, apply: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut ManagedResource),
    {
        let now = self.clock.now();
        let mut rows = self.write();
        let row = rows
            .values_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        apply(row);
        row.updated_at = now;
        Ok(())
    }

    fn orphans_before<F>(&self, cutoff: DateTime<Utc>, filter: F) -> Vec<ManagedResource>
    where
        F: Fn(&ManagedResource) -> bool,
    {
        let mut rows: Vec<ManagedResource> = self
            .read()
            .values()
            .filter(|r| r.status == ResourceStatus::Orphaned && r.updated_at <= cutoff && filter(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        rows
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn list_by_kind_and_status(
        &self,
        kind: ResourceKind,
        statuses: &[ResourceStatus],
    ) -> Result<Vec<ManagedResource>, LedgerError> {
        Ok(self
            .read()
            .values()
            .filter(|r| r.kind() == kind && statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn upsert_by_unique_key(
        &self,
        mut resource: ManagedResource,
    ) -> Result<ManagedResource, LedgerError> {
        let now = self.clock.now();
        let key = resource.key();
        {
            let mut rows = self.write();
            match rows.get(&key) {
                Some(existing) => {
                    resource.id = existing.id.clone();
                    resource.created_at = existing.created_at;
                }
                None => {
                    if resource.id.is_empty() {
                        resource.id = uuid::Uuid::new_v4().to_string();
                    }
                    resource.created_at = now;
                }
            }
            resource.updated_at = now;
            rows.insert(key, resource.clone());
        }
        self.persist().await?;
        Ok(resource)
    }

    async fn set_status(&self, id: &str, status: ResourceStatus) -> Result<(), LedgerError> {
        self.update_by_id(id, |row| row.status = status)?;
        self.persist().await
    }

    async fn set_error(
        &self,
        id: &str,
        status: ResourceStatus,
        message: &str,
    ) -> Result<(), LedgerError> {
        self.update_by_id(id, |row| {
            row.status = status;
            row.last_error = Some(message.to_string());
        })?;
        self.persist().await
    }

    async fn delete(&self, id: &str) -> Result<(), LedgerError> {
        {
            let mut rows = self.write();
            let key = rows
                .iter()
                .find(|(_, r)| r.id == id)
                .map(|(k, _)| k.clone())
                .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            rows.remove(&key);
        }
        self.persist().await
    }

    async fn list_orphaned_past_remove_delay(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ManagedResource>, LedgerError> {
        Ok(self.orphans_before(cutoff, |r| r.cleanup_enabled))
    }

    async fn list_orphaned_past_orphan_ttl(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ManagedResource>, LedgerError> {
        Ok(self.orphans_before(cutoff, |r| !r.cleanup_enabled))
    }
}
