//! In-memory [`BuildCache`] implementation for testing and embedding.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Every transition takes the
//! write lock for the whole check-and-set, which is what makes
//! [`try_begin_build`](BuildCache::try_begin_build) atomic. Lock hold times
//! are a handful of map operations, so the single store-wide lock does not
//! introduce meaningful cross-key contention.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    BuildStatus, BundleMeta, CacheEntry, CacheKey, ContextBundle, Failure, FailureCause,
};

use super::BuildCache;

/// In-memory build cache.
pub struct InMemoryBuildCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryBuildCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<CacheKey, CacheEntry>>> {
        self.entries
            .read()
            .map_err(|_| anyhow!("build cache lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>>> {
        self.entries
            .write()
            .map_err(|_| anyhow!("build cache lock poisoned"))
    }
}

impl Default for InMemoryBuildCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildCache for InMemoryBuildCache {
    async fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn try_begin_build(&self, key: &CacheKey) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.write()?;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), now));
        if !entry.status.can_start_build() {
            return Ok(false);
        }
        entry.status = BuildStatus::Building;
        entry.updated_at = now;
        Ok(true)
    }

    async fn mark_pending(&self, key: &CacheKey) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.write()?;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), now));
        if entry.status == BuildStatus::Building {
            return Ok(false);
        }
        entry.status = BuildStatus::Pending;
        entry.updated_at = now;
        Ok(true)
    }

    async fn reset_pending(&self, key: &CacheKey) -> Result<bool> {
        let mut entries = self.write()?;
        match entries.get_mut(key) {
            Some(entry) if entry.status == BuildStatus::Pending => {
                entry.status = BuildStatus::None;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save(&self, key: &CacheKey, bundle: &ContextBundle, meta: &BundleMeta) -> Result<()> {
        let mut entries = self.write()?;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), bundle.built_at));
        store_ready(entry, bundle, meta);
        Ok(())
    }

    async fn save_override(
        &self,
        key: &CacheKey,
        bundle: &ContextBundle,
        meta: &BundleMeta,
    ) -> Result<bool> {
        let mut entries = self.write()?;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), bundle.built_at));
        if entry.status == BuildStatus::Building {
            return Ok(false);
        }
        store_ready(entry, bundle, meta);
        Ok(true)
    }

    async fn mark_unavailable(
        &self,
        key: &CacheKey,
        reason: &str,
        cause: FailureCause,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.write()?;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), now));
        if cause == FailureCause::Cleared {
            if entry.status == BuildStatus::Building {
                return Ok(false);
            }
            entry.bundle = None;
            entry.meta = None;
        }
        entry.status = BuildStatus::Failed;
        entry.failure = Some(Failure {
            reason: reason.to_string(),
            cause,
        });
        entry.built_at = Some(now);
        entry.updated_at = now;
        Ok(true)
    }

    async fn expire_builds(&self, started_before: DateTime<Utc>, reason: &str) -> Result<usize> {
        let now = Utc::now();
        let mut expired = 0;
        for entry in self.write()?.values_mut() {
            if entry.status == BuildStatus::Building && entry.updated_at < started_before {
                entry.status = BuildStatus::Failed;
                entry.failure = Some(Failure {
                    reason: reason.to_string(),
                    cause: FailureCause::Timeout,
                });
                entry.built_at = Some(now);
                entry.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.reference_time() >= cutoff);
        Ok(before - entries.len())
    }
}

fn store_ready(entry: &mut CacheEntry, bundle: &ContextBundle, meta: &BundleMeta) {
    entry.status = BuildStatus::Ready;
    entry.bundle = Some(bundle.clone());
    entry.meta = Some(meta.clone());
    entry.failure = None;
    entry.built_at = Some(bundle.built_at);
    entry.updated_at = Utc::now();
}
