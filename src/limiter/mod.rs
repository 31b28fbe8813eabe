//! Admission and API rate limiting
//!
//! Two independent limits apply: at most `max_parallel` active units (checked
//! against the registry) and at most `api_limit` concurrent agent invocations
//! (the token pool). Only token acquisition ever waits.

pub mod tokens;

pub use tokens::{TokenGuard, TokenHolder, TokenPool};

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::RegistryManager;
use crate::storage::is_process_running;

#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    registry: RegistryManager,
    tokens: TokenPool,
}

impl ResourceLimiter {
    pub fn new(registry: RegistryManager, tokens: TokenPool) -> Self {
        Self { registry, tokens }
    }

    /// Whether another unit may become active right now
    ///
    /// Never waits beyond the registry lock timeout; an unreadable registry
    /// reads as "not now".
    pub async fn can_admit(&self) -> bool {
        match self.registry.can_admit().await {
            Ok(admit) => admit,
            Err(e) => {
                warn!("Admission check failed, deferring: {}", e);
                false
            }
        }
    }

    /// Block up to `timeout` for an API token
    pub async fn acquire_token(&self, unit_id: &str, timeout: Duration) -> Result<TokenGuard> {
        self.tokens.acquire(unit_id, timeout).await
    }

    pub async fn release(&self, token: TokenGuard) -> Result<()> {
        token.release().await
    }

    /// Reclaim tokens held by dead processes; returns the number reclaimed
    pub async fn reconcile(&self) -> Result<usize> {
        let reclaimed = self.tokens.reconcile(is_process_running).await?;
        if !reclaimed.is_empty() {
            debug!("Reclaimed {} orphaned token(s)", reclaimed.len());
        }
        Ok(reclaimed.len())
    }

    pub async fn tokens_by_unit(&self) -> Result<HashMap<String, usize>> {
        self.tokens.held_by_unit().await
    }

    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TerminalStatus;
    use crate::storage::StateLayout;
    use tempfile::TempDir;

    fn limiter(temp_dir: &TempDir, max_parallel: usize, api_limit: usize) -> ResourceLimiter {
        let layout = StateLayout::new(temp_dir.path());
        let registry =
            RegistryManager::new(&layout, max_parallel, api_limit, Duration::from_secs(2));
        let tokens = TokenPool::new(&layout, api_limit, Duration::from_secs(2));
        ResourceLimiter::new(registry, tokens)
    }

    #[tokio::test]
    async fn test_can_admit_tracks_active_count() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir, 1, 1);

        assert!(limiter.can_admit().await);
        limiter.registry.register("a", "a").await.unwrap();
        assert!(!limiter.can_admit().await);

        limiter
            .registry
            .deregister("a", TerminalStatus::Completed)
            .await
            .unwrap();
        assert!(limiter.can_admit().await);
    }

    #[tokio::test]
    async fn test_scoped_token_is_released() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir, 2, 1);

        {
            let _token = limiter
                .acquire_token("a", Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(limiter.tokens_by_unit().await.unwrap().get("a"), Some(&1));
        }

        let token = limiter
            .acquire_token("b", Duration::from_millis(200))
            .await
            .unwrap();
        limiter.release(token).await.unwrap();
        assert!(limiter.tokens_by_unit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_live_holders() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir, 2, 2);

        let _live = limiter
            .acquire_token("a", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(limiter.reconcile().await.unwrap(), 0);
        assert_eq!(limiter.tokens().holders().await.unwrap().len(), 1);
    }
}
