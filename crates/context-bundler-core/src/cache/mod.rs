//! Build cache abstraction.
//!
//! The [`BuildCache`] trait stores one [`CacheEntry`] per [`CacheKey`] and
//! is the only shared, mutable resource in the bundling pipeline. Its
//! `status` field doubles as the per-key mutex: a build may only run after
//! [`try_begin_build`](BuildCache::try_begin_build) atomically moves the
//! entry from `NONE`, `PENDING` or `FAILED` into `BUILDING`.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # State machine
//!
//! ```text
//! NONE ──trigger──▶ PENDING ──debounce + CAS──▶ BUILDING ──ok──▶ READY
//!   ▲                 │                            │
//!   └─────cancel──────┘                            └──error──▶ FAILED
//!
//! READY ──force rebuild / clear──▶ PENDING       FAILED ──trigger──▶ PENDING
//! ```
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`entry`](BuildCache::entry) | Raw entry lookup |
//! | [`try_begin_build`](BuildCache::try_begin_build) | CAS into `BUILDING` |
//! | [`mark_pending`](BuildCache::mark_pending) | Any idle state → `PENDING` |
//! | [`reset_pending`](BuildCache::reset_pending) | `PENDING` → `NONE` |
//! | [`save`](BuildCache::save) | Store a bundle, → `READY` |
//! | [`mark_unavailable`](BuildCache::mark_unavailable) | → `FAILED` with a reason |
//! | [`expire_builds`](BuildCache::expire_builds) | Abandoned `BUILDING` → `FAILED` |
//! | [`purge_before`](BuildCache::purge_before) | Delete entries older than a cutoff |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    BuildStatus, BundleMeta, CacheEntry, CacheKey, ContextBundle, FailureCause, StatusSnapshot,
};

#[async_trait]
pub trait BuildCache: Send + Sync {
    /// Returns the entry for `key`, or `None` if it was never referenced
    /// (or has been purged).
    async fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Atomically moves the entry from `NONE`, `PENDING` or `FAILED` into
    /// `BUILDING`, creating it if absent.
    ///
    /// Returns `false` without changing anything when the entry is in any
    /// other state. At most one caller can win per key.
    async fn try_begin_build(&self, key: &CacheKey) -> Result<bool>;

    /// Moves the entry into `PENDING` from any state except `BUILDING`,
    /// creating it if absent. Returns `false` when the entry is building.
    async fn mark_pending(&self, key: &CacheKey) -> Result<bool>;

    /// Moves a `PENDING` entry back to `NONE`. Returns `false` for any
    /// other state.
    async fn reset_pending(&self, key: &CacheKey) -> Result<bool>;

    /// Upserts the bundle, sets `READY`, stamps `built_at` from
    /// `bundle.built_at` and clears any failure.
    async fn save(&self, key: &CacheKey, bundle: &ContextBundle, meta: &BundleMeta) -> Result<()>;

    /// Like [`save`](Self::save), but only when the entry is not
    /// `BUILDING`, checked and written atomically. Returns `false` without
    /// changing anything while a build holds the key.
    async fn save_override(
        &self,
        key: &CacheKey,
        bundle: &ContextBundle,
        meta: &BundleMeta,
    ) -> Result<bool>;

    /// Sets `FAILED` with `reason` and stamps the build time.
    ///
    /// [`FailureCause::Cleared`] also drops the stored bundle and never
    /// applies to a `BUILDING` entry; the in-flight build will replace the
    /// bundle when it finishes. Returns whether the entry was changed.
    async fn mark_unavailable(
        &self,
        key: &CacheKey,
        reason: &str,
        cause: FailureCause,
    ) -> Result<bool>;

    /// Fails every `BUILDING` entry whose last transition is before
    /// `started_before` with [`FailureCause::Timeout`]. Recovers keys left
    /// building by a process that exited mid-build.
    async fn expire_builds(&self, started_before: DateTime<Utc>, reason: &str) -> Result<usize>;

    /// Deletes every entry, whatever its status, whose reference time
    /// (build time, or last transition if never built) is before `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Status, metadata and age for `key`. Unknown keys report `NONE`.
    async fn get_status(&self, key: &CacheKey) -> Result<StatusSnapshot> {
        Ok(match self.entry(key).await? {
            Some(entry) => StatusSnapshot::from_entry(&entry, Utc::now()),
            None => StatusSnapshot::none(),
        })
    }

    /// The stored bundle, if the entry is `READY` and no older than
    /// `staleness_ttl` (when given).
    async fn get(
        &self,
        key: &CacheKey,
        staleness_ttl: Option<chrono::Duration>,
    ) -> Result<Option<ContextBundle>> {
        let Some(entry) = self.entry(key).await? else {
            return Ok(None);
        };
        if entry.status != BuildStatus::Ready {
            return Ok(None);
        }
        if let (Some(ttl), Some(age)) = (staleness_ttl, entry.age(Utc::now())) {
            if age > ttl {
                return Ok(None);
            }
        }
        Ok(entry.bundle)
    }

    /// Purges entries older than `max_age_hours`.
    async fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX);
        let cutoff = chrono::Duration::try_hours(hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.purge_before(cutoff).await
    }
}
