//! Per-key build scheduling.
//!
//! [`BuildScheduler`] owns the debounce timers and runs builds against the
//! [`BuildCache`]. Three entry points drive the state machine:
//!
//! | Method | Effect |
//! |--------|--------|
//! | [`trigger`](BuildScheduler::trigger) | `PENDING`, build after `delay`; re-triggering restarts the delay |
//! | [`cancel`](BuildScheduler::cancel) | Abort a sleeping timer, `PENDING` → `NONE` |
//! | [`run_now`](BuildScheduler::run_now) | Skip the delay, CAS into `BUILDING` and wait for the result |
//!
//! Timers are spawned tokio tasks kept in a per-key map together with a
//! generation token. A timer only builds if its token is still the one in
//! the map when it wakes, so a replaced or cancelled timer never starts a
//! build even if it was already past its sleep.
//!
//! Once an entry is `BUILDING` the build always finishes: it runs in its
//! own task (dropping the caller does not abort it) and the fetch and
//! assembly phase is bounded by the optional build timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use context_bundler_core::builder::ContextBuilder;
use context_bundler_core::cache::BuildCache;
use context_bundler_core::models::{
    BuildStatus, BundleMeta, CacheEntry, CacheKey, ContextBundle, FailureCause, MetadataWeights,
    ModelCategory, ScoringTargets, TokenAllocation,
};
use context_bundler_core::score::PriorityScorer;
use context_bundler_core::source::{ConfigProvider, DocumentSource};
use context_bundler_core::tokens::TokenEstimator;
use context_bundler_core::{BundleError, Result};

/// Configuration values resolved for one build or overflow check.
#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub category: ModelCategory,
    pub allocation: TokenAllocation,
    pub weights: MetadataWeights,
    pub targets: ScoringTargets,
    /// Context share of the category's window, in tokens.
    pub token_budget: usize,
}

impl BuildInputs {
    /// Reads everything a build needs from `config`. `model_category`
    /// defaults to the provider's default category.
    pub async fn load(config: &dyn ConfigProvider, model_category: Option<&str>) -> Result<Self> {
        let categories = config
            .model_categories()
            .await
            .map_err(BundleError::upstream)?;
        let name = match model_category {
            Some(name) => name.to_string(),
            None => config
                .default_model_category()
                .await
                .map_err(BundleError::upstream)?,
        };
        let category = categories
            .get(&name)
            .cloned()
            .ok_or_else(|| BundleError::validation(format!("unknown model category: {}", name)))?;
        if category.max_tokens == 0 {
            return Err(BundleError::validation(format!(
                "model category {} has max_tokens = 0",
                name
            )));
        }

        let allocation = config
            .token_allocation()
            .await
            .map_err(BundleError::upstream)?;
        allocation.validate()?;
        let weights = config
            .metadata_weights()
            .await
            .map_err(BundleError::upstream)?;
        weights.validate()?;
        let targets = config
            .scoring_targets()
            .await
            .map_err(BundleError::upstream)?;

        let token_budget = allocation.context_budget(&category);
        Ok(Self {
            category,
            allocation,
            weights,
            targets,
            token_budget,
        })
    }

    /// A scorer measuring recency against today's date.
    pub fn scorer(&self) -> PriorityScorer {
        PriorityScorer::new(self.weights, &self.targets, Utc::now().date_naive())
    }
}

/// Outcome of an immediate build, read back from the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSummary {
    pub status: BuildStatus,
    pub build_id: Option<String>,
    pub total_tokens: usize,
    pub included_ids: Vec<String>,
    pub excluded_ids: Vec<String>,
    pub oversized_ids: Vec<String>,
    pub failure_reason: Option<String>,
}

impl BuildSummary {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        let ready = entry.status == BuildStatus::Ready;
        let bundle = entry.bundle.as_ref().filter(|_| ready);
        let meta = entry.meta.as_ref().filter(|_| ready);
        Self {
            status: entry.status,
            build_id: meta.map(|m| m.build_id.clone()),
            total_tokens: bundle.map(|b| b.total_tokens).unwrap_or(0),
            included_ids: bundle.map(|b| b.included_ids.clone()).unwrap_or_default(),
            excluded_ids: bundle.map(|b| b.excluded_ids.clone()).unwrap_or_default(),
            oversized_ids: meta.map(|m| m.oversized_ids.clone()).unwrap_or_default(),
            failure_reason: entry.failure.as_ref().map(|f| f.reason.clone()),
        }
    }
}

struct ScheduledBuild {
    handle: JoinHandle<()>,
    token: u64,
}

struct Inner {
    cache: Arc<dyn BuildCache>,
    source: Arc<dyn DocumentSource>,
    config: Arc<dyn ConfigProvider>,
    estimator: Arc<dyn TokenEstimator>,
    build_timeout: Option<Duration>,
    timers: Mutex<HashMap<CacheKey, ScheduledBuild>>,
    next_token: AtomicU64,
}

/// Debounced, single-flight build runner. Cheap to clone.
#[derive(Clone)]
pub struct BuildScheduler {
    inner: Arc<Inner>,
}

impl BuildScheduler {
    pub fn new(
        cache: Arc<dyn BuildCache>,
        source: Arc<dyn DocumentSource>,
        config: Arc<dyn ConfigProvider>,
        estimator: Arc<dyn TokenEstimator>,
        build_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                source,
                config,
                estimator,
                build_timeout,
                timers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Marks the key `PENDING` and (re)starts its debounce timer.
    ///
    /// Returns `false` without scheduling anything while the key is
    /// `BUILDING`.
    pub async fn trigger(&self, key: &CacheKey, delay: Duration) -> Result<bool> {
        let marked = self
            .inner
            .cache
            .mark_pending(key)
            .await
            .map_err(BundleError::upstream)?;
        if !marked {
            debug!(
                project = %key.project,
                document_type = %key.document_type,
                "build in progress, trigger ignored"
            );
            return Ok(false);
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.inner.lock_timers()?;
        let inner = self.inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(task_key, token).await;
        });
        let replaced = timers.insert(key.clone(), ScheduledBuild { handle, token });
        if let Some(previous) = replaced {
            previous.handle.abort();
        }
        drop(timers);

        debug!(
            project = %key.project,
            document_type = %key.document_type,
            delay_ms = delay.as_millis() as u64,
            "build scheduled"
        );
        Ok(true)
    }

    /// Aborts the key's pending timer and returns the entry to `NONE`.
    ///
    /// Returns `false` when no timer was pending. A build that already
    /// started is unaffected.
    pub async fn cancel(&self, key: &CacheKey) -> Result<bool> {
        let Some(scheduled) = self.inner.take_timer(key)? else {
            return Ok(false);
        };
        scheduled.handle.abort();
        self.inner
            .cache
            .reset_pending(key)
            .await
            .map_err(BundleError::upstream)?;
        info!(
            project = %key.project,
            document_type = %key.document_type,
            "pending build cancelled"
        );
        Ok(true)
    }

    /// Builds immediately, superseding any pending timer, and waits for
    /// the result.
    ///
    /// Fails with [`BundleError::BuildInProgress`] when another build holds
    /// the key. If the key became `READY` in the meantime, the existing
    /// bundle is summarized instead.
    pub async fn run_now(&self, key: &CacheKey) -> Result<BuildSummary> {
        if let Some(scheduled) = self.inner.take_timer(key)? {
            scheduled.handle.abort();
        }

        let started = self
            .inner
            .cache
            .try_begin_build(key)
            .await
            .map_err(BundleError::upstream)?;
        if !started {
            let entry = self
                .inner
                .cache
                .entry(key)
                .await
                .map_err(BundleError::upstream)?;
            return match entry {
                Some(entry) if entry.status != BuildStatus::Building => {
                    Ok(BuildSummary::from_entry(&entry))
                }
                _ => Err(BundleError::BuildInProgress {
                    project: key.project.clone(),
                    document_type: key.document_type.clone(),
                }),
            };
        }

        let build_id = Uuid::new_v4().to_string();
        let inner = self.inner.clone();
        let task_key = key.clone();
        tokio::spawn(async move { inner.execute(task_key, build_id).await })
            .await
            .map_err(|e| BundleError::upstream(anyhow!("build task failed: {}", e)))??;

        let entry = self
            .inner
            .cache
            .entry(key)
            .await
            .map_err(BundleError::upstream)?
            .ok_or_else(|| BundleError::not_found(format!("cache entry for {} vanished", key)))?;
        Ok(BuildSummary::from_entry(&entry))
    }

    /// Whether a debounce timer is currently pending for `key` in this
    /// process.
    pub fn has_pending(&self, key: &CacheKey) -> bool {
        self.inner
            .timers
            .lock()
            .map(|timers| timers.contains_key(key))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .timers
            .lock()
            .map(|timers| timers.len())
            .unwrap_or(0)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.inner.build_timeout
    }
}

impl Inner {
    fn lock_timers(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, ScheduledBuild>>> {
        self.timers
            .lock()
            .map_err(|_| BundleError::upstream(anyhow!("scheduler timer lock poisoned")))
    }

    fn take_timer(&self, key: &CacheKey) -> Result<Option<ScheduledBuild>> {
        Ok(self.lock_timers()?.remove(key))
    }

    /// Timer callback: builds only if `token` still owns the key's slot.
    async fn fire(self: Arc<Self>, key: CacheKey, token: u64) {
        let current = match self.lock_timers() {
            Ok(mut timers) => match timers.get(&key) {
                Some(scheduled) if scheduled.token == token => timers.remove(&key).is_some(),
                _ => false,
            },
            Err(err) => {
                error!(error = %err, "debounce timer could not claim its slot");
                false
            }
        };
        if !current {
            return;
        }

        match self.cache.try_begin_build(&key).await {
            Ok(true) => {
                let build_id = Uuid::new_v4().to_string();
                if let Err(err) = self.clone().execute(key.clone(), build_id).await {
                    error!(
                        project = %key.project,
                        document_type = %key.document_type,
                        error = %err,
                        "failed to record build result"
                    );
                }
            }
            Ok(false) => debug!(
                project = %key.project,
                document_type = %key.document_type,
                "entry not buildable when timer fired"
            ),
            Err(err) => {
                let reason = format!("{:#}", err);
                error!(
                    project = %key.project,
                    document_type = %key.document_type,
                    error = %reason,
                    "failed to start build"
                );
            }
        }
    }

    /// Runs a build for a key already moved into `BUILDING` and records the
    /// result. Only cache write failures are returned as errors.
    async fn execute(self: Arc<Self>, key: CacheKey, build_id: String) -> Result<()> {
        info!(
            project = %key.project,
            document_type = %key.document_type,
            build_id = %build_id,
            "build started"
        );
        let started = Instant::now();

        let inner = self.clone();
        let task_key = key.clone();
        let task_build_id = build_id.clone();
        let mut work =
            tokio::spawn(async move { inner.assemble(&task_key, &task_build_id).await });

        let joined = match self.build_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut work).await {
                Ok(joined) => joined,
                Err(_) => {
                    work.abort();
                    Ok(Err(BundleError::Timeout {
                        seconds: limit.as_secs(),
                    }))
                }
            },
            None => work.await,
        };
        let result = joined
            .unwrap_or_else(|e| Err(BundleError::upstream(anyhow!("build task failed: {}", e))));

        match result {
            Ok((bundle, meta)) => {
                if let Err(err) = self.cache.save(&key, &bundle, &meta).await {
                    let reason = format!("failed to persist bundle: {:#}", err);
                    error!(
                        project = %key.project,
                        document_type = %key.document_type,
                        build_id = %build_id,
                        error = %reason,
                        "build result lost"
                    );
                    self.cache
                        .mark_unavailable(&key, &reason, FailureCause::BuildError)
                        .await
                        .map_err(BundleError::upstream)?;
                    return Err(BundleError::upstream(err));
                }
                info!(
                    project = %key.project,
                    document_type = %key.document_type,
                    build_id = %build_id,
                    status = %BuildStatus::Ready,
                    tokens = bundle.total_tokens,
                    included = bundle.included_ids.len(),
                    excluded = bundle.excluded_ids.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "build finished"
                );
                Ok(())
            }
            Err(err) => {
                let cause = match err {
                    BundleError::Timeout { .. } => FailureCause::Timeout,
                    _ => FailureCause::BuildError,
                };
                warn!(
                    project = %key.project,
                    document_type = %key.document_type,
                    build_id = %build_id,
                    status = %BuildStatus::Failed,
                    error = %err,
                    "build failed"
                );
                self.cache
                    .mark_unavailable(&key, &err.to_string(), cause)
                    .await
                    .map_err(BundleError::upstream)?;
                Ok(())
            }
        }
    }

    /// Fetches documents and assembles the bundle. Nothing is written here.
    async fn assemble(
        &self,
        key: &CacheKey,
        build_id: &str,
    ) -> Result<(ContextBundle, BundleMeta)> {
        let inputs = BuildInputs::load(self.config.as_ref(), None).await?;
        let documents = self
            .source
            .list(&key.project, &key.document_type)
            .await
            .map_err(BundleError::upstream)?;

        let scorer = inputs.scorer();
        let outcome = ContextBuilder::new(&scorer, self.estimator.as_ref()).build(
            key,
            &documents,
            inputs.token_budget,
            Utc::now(),
        );
        if let Some(overflow) = outcome.overflow_error() {
            warn!(
                project = %key.project,
                document_type = %key.document_type,
                build_id = %build_id,
                oversized = outcome.oversized.len(),
                error = %overflow,
                "documents exceed the token budget on their own"
            );
        }

        let meta = BundleMeta {
            build_id: build_id.to_string(),
            model_category: inputs.category.name.clone(),
            token_budget: inputs.token_budget,
            document_count: documents.len(),
            oversized_ids: outcome.oversized_ids(),
            is_override: false,
            fingerprint: outcome.bundle.fingerprint(),
        };
        Ok((outcome.bundle, meta))
    }
}
