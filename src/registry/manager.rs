use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::document::RegistryDocument;
use super::{TerminalStatus, UnitError, UnitOutcome, UnitRecord, UnitStatus};
use crate::error::{CoordinatorError, IoResultExt, Result};
use crate::storage::{write_json_atomic, FileLock, StateLayout};

/// How the document was obtained, which decides whether it may become the backup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadSource {
    Missing,
    Clean,
    Recovered,
}

/// Lock-guarded access to `registry.json`
#[derive(Debug, Clone)]
pub struct RegistryManager {
    path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    max_parallel: usize,
    api_limit: usize,
}

impl RegistryManager {
    pub fn new(
        layout: &StateLayout,
        max_parallel: usize,
        api_limit: usize,
        lock_timeout: Duration,
    ) -> Self {
        let path = layout.registry_file();
        Self {
            backup_path: backup_path(&path),
            path,
            lock_path: layout.registry_lock(),
            lock_timeout,
            max_parallel,
            api_limit,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Admit `id`, failing with `ResourceExhausted` when all slots are taken
    pub async fn register(&self, id: &str, desired_branch: &str) -> Result<UnitRecord> {
        let record = self
            .mutate(|doc| doc.register(id, desired_branch))
            .await?;
        info!(
            "Registered unit {} on branch {} (queued at {:?})",
            id, desired_branch, record.queued_at
        );
        Ok(record)
    }

    /// Move `id` to its terminal list; absent ids are a no-op
    pub async fn deregister(&self, id: &str, status: TerminalStatus) -> Result<Option<UnitRecord>> {
        self.deregister_with_error(id, status, None).await
    }

    pub async fn deregister_with_error(
        &self,
        id: &str,
        status: TerminalStatus,
        error: Option<UnitError>,
    ) -> Result<Option<UnitRecord>> {
        let removed = self
            .mutate(|doc| Ok(doc.deregister(id, status, error)))
            .await?;
        match &removed {
            Some(_) => info!("Deregistered unit {} as {:?}", id, status),
            None => debug!("Deregister of unknown unit {} ignored", id),
        }
        Ok(removed)
    }

    pub async fn update_status(&self, id: &str, status: UnitStatus) -> Result<UnitRecord> {
        self.update_record(id, |record| record.status = status).await
    }

    /// Apply `update` to the active record for `id`
    pub async fn update_record<F>(&self, id: &str, update: F) -> Result<UnitRecord>
    where
        F: FnOnce(&mut UnitRecord),
    {
        self.mutate(|doc| {
            let record = doc.record_mut(id)?;
            update(record);
            Ok(record.clone())
        })
        .await
    }

    /// Refresh `tokens_held` on every active record from pool counts
    pub async fn set_tokens_held(&self, held: &HashMap<String, usize>) -> Result<()> {
        self.mutate(|doc| {
            for (id, record) in doc.active.iter_mut() {
                record.tokens_held = held.get(id).copied().unwrap_or(0);
            }
            Ok(())
        })
        .await
    }

    pub async fn enqueue(&self, id: &str) -> Result<()> {
        self.mutate(|doc| doc.enqueue(id)).await?;
        info!("Queued unit {}", id);
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<UnitRecord>> {
        self.read(|doc| doc.active.values().cloned().collect()).await
    }

    pub async fn get(&self, id: &str) -> Result<UnitRecord> {
        self.read(|doc| doc.active.get(id).cloned())
            .await?
            .ok_or_else(|| CoordinatorError::not_found(format!("active unit '{id}'")))
    }

    pub async fn outcome(&self, id: &str) -> Result<Option<UnitOutcome>> {
        self.read(|doc| doc.outcomes.get(id).cloned()).await
    }

    pub async fn queued(&self) -> Result<Vec<String>> {
        self.read(|doc| doc.queued.clone()).await
    }

    pub async fn can_admit(&self) -> Result<bool> {
        self.read(|doc| doc.has_capacity()).await
    }

    /// Store the limits a running coordinator enforces
    ///
    /// Other managers read these limits and never write their own.
    pub async fn set_limits(&self, max_parallel: usize, api_limit: usize) -> Result<()> {
        self.mutate(|doc| {
            doc.max_parallel = max_parallel;
            doc.api_limit = api_limit;
            Ok(())
        })
        .await?;
        debug!(
            "Registry limits set to max_parallel={}, api_limit={}",
            max_parallel, api_limit
        );
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<RegistryDocument> {
        self.read(|doc| doc.clone()).await
    }

    async fn read<T>(&self, view: impl FnOnce(&RegistryDocument) -> T) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let (doc, _) = self.load_locked().await?;
        Ok(view(&doc))
    }

    /// Read-modify-write under the registry lock
    ///
    /// Nothing is written when `change` fails.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RegistryDocument) -> Result<T>,
    ) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let (mut doc, source) = self.load_locked().await?;
        let output = change(&mut doc)?;
        self.save_locked(&doc, source).await?;
        Ok(output)
    }

    async fn load_locked(&self) -> Result<(RegistryDocument, LoadSource)> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((self.fresh_document(), LoadSource::Missing));
            }
            Err(e) => return Err(CoordinatorError::io(&self.path, e)),
        };

        match self.parse(&bytes) {
            Ok(doc) => Ok((doc, LoadSource::Clean)),
            Err(e) => {
                let doc = self.recover(&e).await?;
                Ok((doc, LoadSource::Recovered))
            }
        }
    }

    fn parse(&self, bytes: &[u8]) -> Result<RegistryDocument> {
        let doc: RegistryDocument = serde_json::from_slice(bytes)
            .map_err(|e| CoordinatorError::registry_corruption(&self.path, e.to_string()))?;
        if doc.version > super::REGISTRY_VERSION {
            return Err(CoordinatorError::registry_corruption(
                &self.path,
                format!("unsupported registry version {}", doc.version),
            ));
        }
        Ok(doc)
    }

    /// Preserve the corrupt file, then fall back to the backup or an empty document
    async fn recover(&self, cause: &CoordinatorError) -> Result<RegistryDocument> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let preserved = self
            .path
            .with_file_name(format!("registry.json.corrupt-{stamp}"));
        warn!(
            "Registry is corrupt ({}); preserving it as {}",
            cause,
            preserved.display()
        );
        tokio::fs::rename(&self.path, &preserved)
            .await
            .with_path(&preserved)?;

        let doc = match self.read_backup().await {
            Some(doc) => {
                warn!("Recovered registry from {}", self.backup_path.display());
                doc
            }
            None => {
                warn!("No valid registry backup; reinitializing an empty registry");
                self.fresh_document()
            }
        };

        // Readers after us must not find the registry missing
        write_json_atomic(&self.path, &doc).await?;
        Ok(doc)
    }

    async fn read_backup(&self) -> Option<RegistryDocument> {
        match tokio::fs::read(&self.backup_path).await {
            Ok(bytes) => match self.parse(&bytes) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!("Registry backup is unusable: {}", e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read registry backup: {}", e);
                None
            }
        }
    }

    async fn save_locked(&self, doc: &RegistryDocument, source: LoadSource) -> Result<()> {
        // Only a document that parsed cleanly is worth keeping as the backup
        if source == LoadSource::Clean {
            tokio::fs::copy(&self.path, &self.backup_path)
                .await
                .with_path(&self.backup_path)?;
        }
        write_json_atomic(&self.path, doc).await
    }

    fn fresh_document(&self) -> RegistryDocument {
        RegistryDocument::new(self.max_parallel, self.api_limit)
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}
