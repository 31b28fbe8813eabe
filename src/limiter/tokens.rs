//! Shared API token pool
//!
//! `tokens.json` lists current holders; `tokens.lock` serializes access across
//! processes. Each acquisition hands out a [`TokenGuard`] that releases its
//! token exactly once, on [`TokenGuard::release`] or on drop.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::storage::{write_json_atomic, write_json_atomic_blocking, FileLock, StateLayout};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenHolder {
    pub token_id: Uuid,
    pub owner_pid: u32,
    pub unit_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolDocument {
    #[serde(default)]
    holders: Vec<TokenHolder>,
}

#[derive(Debug, Clone)]
pub struct TokenPool {
    path: PathBuf,
    lock_path: PathBuf,
    limit: usize,
    lock_timeout: Duration,
}

impl TokenPool {
    pub fn new(layout: &StateLayout, limit: usize, lock_timeout: Duration) -> Self {
        Self {
            path: layout.tokens_file(),
            lock_path: layout.tokens_lock(),
            limit,
            lock_timeout,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait up to `timeout` for a free token
    ///
    /// # Errors
    /// `ResourceExhausted` when no token frees up in time.
    pub async fn acquire(&self, unit_id: &str, timeout: Duration) -> Result<TokenGuard> {
        let started = Instant::now();
        let mut delay = INITIAL_BACKOFF;

        loop {
            match self.try_acquire_as(unit_id, std::process::id()).await {
                Ok(Some(guard)) => return Ok(guard),
                Ok(None) => {}
                // Lock contention counts against the same deadline
                Err(e) if e.is_transient() => debug!("Token pool busy: {}", e),
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(CoordinatorError::resource_exhausted(format!(
                    "no API token available for unit {unit_id} after {elapsed:?} (limit {})",
                    self.limit
                )));
            }

            tokio::time::sleep(apply_jitter(delay).min(timeout - elapsed)).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    /// Single attempt; `Ok(None)` when the pool is full
    pub async fn try_acquire(&self, unit_id: &str) -> Result<Option<TokenGuard>> {
        self.try_acquire_as(unit_id, std::process::id()).await
    }

    async fn try_acquire_as(&self, unit_id: &str, owner_pid: u32) -> Result<Option<TokenGuard>> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let mut doc = self.load().await?;

        if doc.holders.len() >= self.limit {
            return Ok(None);
        }

        let holder = TokenHolder {
            token_id: Uuid::new_v4(),
            owner_pid,
            unit_id: unit_id.to_string(),
            acquired_at: Utc::now(),
        };
        doc.holders.push(holder.clone());
        write_json_atomic(&self.path, &doc).await?;

        debug!(
            "Unit {} acquired token {} ({}/{})",
            unit_id,
            holder.token_id,
            doc.holders.len(),
            self.limit
        );
        Ok(Some(TokenGuard {
            pool: self.clone(),
            holder,
            released: false,
        }))
    }

    /// Remove a token; returns `false` if it was already gone
    pub async fn release(&self, token_id: Uuid) -> Result<bool> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let mut doc = self.load().await?;
        let removed = remove_holders(&mut doc, |h| h.token_id == token_id);
        if removed > 0 {
            write_json_atomic(&self.path, &doc).await?;
        }
        Ok(removed > 0)
    }

    fn release_blocking(&self, token_id: Uuid) -> Result<bool> {
        let _lock = FileLock::acquire_blocking(&self.lock_path, self.lock_timeout)?;
        let mut doc = match std::fs::read(&self.path) {
            Ok(bytes) => parse_pool(&bytes, &self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CoordinatorError::io(&self.path, e)),
        };
        let removed = remove_holders(&mut doc, |h| h.token_id == token_id);
        if removed > 0 {
            write_json_atomic_blocking(&self.path, &doc)?;
        }
        Ok(removed > 0)
    }

    /// Drop tokens whose owning process is gone; returns the reclaimed holders
    pub async fn reconcile(&self, is_alive: impl Fn(u32) -> bool) -> Result<Vec<TokenHolder>> {
        self.remove_where(|holder| !is_alive(holder.owner_pid)).await
    }

    /// Drop every token held on behalf of `unit_id`
    pub async fn release_unit(&self, unit_id: &str) -> Result<Vec<TokenHolder>> {
        self.remove_where(|holder| holder.unit_id == unit_id).await
    }

    /// Drop every token (shutdown)
    pub async fn release_all(&self) -> Result<Vec<TokenHolder>> {
        self.remove_where(|_| true).await
    }

    async fn remove_where(
        &self,
        predicate: impl Fn(&TokenHolder) -> bool,
    ) -> Result<Vec<TokenHolder>> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let mut doc = self.load().await?;

        let (removed, kept): (Vec<_>, Vec<_>) =
            doc.holders.drain(..).partition(|holder| predicate(holder));
        doc.holders = kept;

        if !removed.is_empty() {
            write_json_atomic(&self.path, &doc).await?;
            for holder in &removed {
                info!(
                    "Reclaimed token {} of unit {} (pid {})",
                    holder.token_id, holder.unit_id, holder.owner_pid
                );
            }
        }
        Ok(removed)
    }

    pub async fn holders(&self) -> Result<Vec<TokenHolder>> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        Ok(self.load().await?.holders)
    }

    /// Token counts per unit
    pub async fn held_by_unit(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for holder in self.holders().await? {
            *counts.entry(holder.unit_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn load(&self) -> Result<PoolDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(parse_pool(&bytes, &self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PoolDocument::default()),
            Err(e) => Err(CoordinatorError::io(&self.path, e)),
        }
    }
}

/// An unreadable pool is reset to empty
fn parse_pool(bytes: &[u8], path: &std::path::Path) -> PoolDocument {
    serde_json::from_slice(bytes).unwrap_or_else(|e| {
        warn!("Token pool {} is corrupt ({}); resetting", path.display(), e);
        PoolDocument::default()
    })
}

fn remove_holders(doc: &mut PoolDocument, predicate: impl Fn(&TokenHolder) -> bool) -> usize {
    let before = doc.holders.len();
    doc.holders.retain(|holder| !predicate(holder));
    before - doc.holders.len()
}

fn apply_jitter(delay: Duration) -> Duration {
    let jitter_range = delay.as_secs_f64() * 0.25;
    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
}

/// Scoped ownership of one API token
#[derive(Debug)]
pub struct TokenGuard {
    pool: TokenPool,
    holder: TokenHolder,
    released: bool,
}

impl TokenGuard {
    pub fn token_id(&self) -> Uuid {
        self.holder.token_id
    }

    pub fn holder(&self) -> &TokenHolder {
        &self.holder
    }

    /// Release now instead of on drop
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if !self.pool.release(self.holder.token_id).await? {
            warn!(
                "Token {} was already reclaimed before release",
                self.holder.token_id
            );
        }
        Ok(())
    }
}

impl Drop for TokenGuard {
    /// Inside a runtime the release runs as a spawned task so no executor
    /// thread sleeps on the pool lock; outside one it blocks.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let token_id = self.holder.token_id;

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            runtime.spawn(async move {
                match pool.release(token_id).await {
                    Ok(_) => debug!("Released token {} on drop", token_id),
                    Err(e) => warn!("Failed to release token {} on drop: {}", token_id, e),
                }
            });
            return;
        }

        match self.pool.release_blocking(token_id) {
            Ok(_) => debug!("Released token {} on drop", token_id),
            Err(e) => warn!("Failed to release token {} on drop: {}", token_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool(temp_dir: &TempDir, limit: usize) -> TokenPool {
        let layout = StateLayout::new(temp_dir.path());
        TokenPool::new(&layout, limit, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_acquire_release_balanced() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 2);

        let a = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire("billing", Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.holders().await.unwrap().len(), 2);

        a.release().await.unwrap();
        assert_eq!(pool.holders().await.unwrap().len(), 1);

        drop(b);
        wait_for_holders(&pool, 0).await;
    }

    async fn wait_for_holders(pool: &TokenPool, expected: usize) {
        for _ in 0..200 {
            if pool.holders().await.unwrap().len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {expected} holders");
    }

    #[tokio::test]
    async fn test_drop_does_not_block_on_a_busy_pool_lock() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 1);
        let guard = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();

        // Someone else is in the middle of a pool update
        let busy = FileLock::try_acquire(&StateLayout::new(temp_dir.path()).tokens_lock())
            .unwrap()
            .unwrap();

        let started = Instant::now();
        drop(guard);
        assert!(started.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(busy);
        wait_for_holders(&pool, 0).await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_full() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 1);

        let _held = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();
        let started = Instant::now();
        let err = pool
            .acquire("billing", Duration::from_millis(200))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_waiter_gets_token_after_release() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 1);

        let held = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool
                .acquire("billing", Duration::from_secs(5))
                .await
                .map(|guard| guard.holder().unit_id.clone())
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        held.release().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "billing");
    }

    #[tokio::test]
    async fn test_reconcile_reclaims_dead_owners() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 2);

        // Two workers "crash" while holding tokens
        let crashed_a = pool.try_acquire_as("auth", 999_001).await.unwrap().unwrap();
        let crashed_b = pool.try_acquire_as("billing", 999_002).await.unwrap().unwrap();
        std::mem::forget(crashed_a);
        std::mem::forget(crashed_b);

        assert!(pool.try_acquire("search").await.unwrap().is_none());

        let reclaimed = pool.reconcile(|pid| pid == std::process::id()).await.unwrap();
        assert_eq!(reclaimed.len(), 2);
        assert!(pool.holders().await.unwrap().len() <= pool.limit());

        let guard = pool.try_acquire("search").await.unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn test_release_after_reclaim_is_harmless() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 1);

        let guard = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();
        pool.release_unit("auth").await.unwrap();
        guard.release().await.unwrap();
        assert!(pool.holders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_by_unit() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 3);

        let _a1 = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();
        let _a2 = pool.acquire("auth", Duration::from_secs(1)).await.unwrap();
        let _b = pool.acquire("billing", Duration::from_secs(1)).await.unwrap();

        let counts = pool.held_by_unit().await.unwrap();
        assert_eq!(counts.get("auth"), Some(&2));
        assert_eq!(counts.get("billing"), Some(&1));
    }

    #[tokio::test]
    async fn test_corrupt_pool_resets() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, 1);
        std::fs::write(temp_dir.path().join("tokens.json"), b"garbage").unwrap();

        let guard = pool.try_acquire("auth").await.unwrap();
        assert!(guard.is_some());
    }
}
