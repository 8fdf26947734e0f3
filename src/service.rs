//! The operations exposed to callers.
//!
//! [`ContextService`] ties the [`BuildCache`], the [`DocumentSource`], the
//! [`ConfigProvider`] and the [`BuildScheduler`] together. It holds no
//! global state: every dependency is passed in, so tests can wire
//! in-memory implementations and the CLI and server wire SQLite and the
//! filesystem via [`ContextService::open`].
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`get_context`](ContextService::get_context) | Cached bundle, or schedule a build |
//! | [`trigger_build`](ContextService::trigger_build) | Debounced or immediate build |
//! | [`cancel_build`](ContextService::cancel_build) | Abort a pending debounce timer |
//! | [`check_overflow`](ContextService::check_overflow) | Ranked budget report |
//! | [`apply_selection`](ContextService::apply_selection) | Persist a manual selection |
//! | [`clear_cache`](ContextService::clear_cache) | Drop a cached bundle |
//! | [`cleanup`](ContextService::cleanup) | Purge old entries |
//! | [`get_build_status`](ContextService::get_build_status) | Status, age and metadata |
//! | [`wait_for_build`](ContextService::wait_for_build) | Poll until a build settles |

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use context_bundler_core::cache::BuildCache;
use context_bundler_core::models::{
    BuildStatus, BundleMeta, CacheEntry, CacheKey, ContextBundle, FailureCause,
};
use context_bundler_core::overflow::{OverflowAnalyzer, OverflowReport};
use context_bundler_core::source::{ConfigProvider, DocumentSource};
use context_bundler_core::tokens::{CharRatioEstimator, TokenEstimator};
use context_bundler_core::{BundleError, Result};

use crate::config::{CacheConfig, Config};
use crate::db;
use crate::migrate;
use crate::scheduler::{BuildInputs, BuildScheduler, BuildSummary};
use crate::source_fs::FsDocumentSource;
use crate::sqlite_cache::SqliteBuildCache;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Delay applied by non-immediate [`trigger_build`](ContextService::trigger_build) calls.
    pub debounce: Duration,
    /// Ceiling on the fetch and assembly phase of a build.
    pub build_timeout: Option<Duration>,
    /// `READY` bundles older than this are rebuilt on read.
    pub staleness_ttl: Option<chrono::Duration>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_cache_config(&CacheConfig::default())
    }
}

impl ServiceSettings {
    pub fn from_cache_config(cache: &CacheConfig) -> Self {
        Self {
            debounce: cache.debounce(),
            build_timeout: Some(cache.build_timeout()),
            staleness_ttl: Some(cache.staleness_ttl()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetContextOptions {
    /// Schedule a rebuild even when a fresh bundle is cached.
    #[serde(default)]
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerOptions {
    /// Build now and wait for the result instead of debouncing.
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextResponse {
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<ContextBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ContextResponse {
    fn ready(bundle: ContextBundle) -> Self {
        Self {
            status: BuildStatus::Ready,
            bundle: Some(bundle),
            failure_reason: None,
        }
    }

    fn waiting(status: BuildStatus) -> Self {
        Self {
            status,
            bundle: None,
            failure_reason: None,
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            status: BuildStatus::Failed,
            bundle: None,
            failure_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerResponse {
    pub status: BuildStatus,
    /// Whether a debounce timer was (re)started.
    pub scheduled: bool,
    /// Result of an immediate build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStatusReport {
    pub status: BuildStatus,
    pub age_secs: Option<i64>,
    pub failure_reason: Option<String>,
    pub failure_cause: Option<FailureCause>,
    pub meta: Option<BundleMeta>,
    /// A debounce timer for the key is pending in this process.
    pub timer_pending: bool,
}

pub struct ContextService {
    cache: Arc<dyn BuildCache>,
    source: Arc<dyn DocumentSource>,
    config: Arc<dyn ConfigProvider>,
    estimator: Arc<dyn TokenEstimator>,
    scheduler: BuildScheduler,
    settings: ServiceSettings,
}

impl ContextService {
    /// Creates a service using the default character-ratio token estimator.
    pub fn new(
        cache: Arc<dyn BuildCache>,
        source: Arc<dyn DocumentSource>,
        config: Arc<dyn ConfigProvider>,
        settings: ServiceSettings,
    ) -> Self {
        Self::with_estimator(
            cache,
            source,
            config,
            Arc::new(CharRatioEstimator::default()),
            settings,
        )
    }

    pub fn with_estimator(
        cache: Arc<dyn BuildCache>,
        source: Arc<dyn DocumentSource>,
        config: Arc<dyn ConfigProvider>,
        estimator: Arc<dyn TokenEstimator>,
        settings: ServiceSettings,
    ) -> Self {
        let scheduler = BuildScheduler::new(
            cache.clone(),
            source.clone(),
            config.clone(),
            estimator.clone(),
            settings.build_timeout,
        );
        Self {
            cache,
            source,
            config,
            estimator,
            scheduler,
            settings,
        }
    }

    /// Wires the SQLite cache and the filesystem source from `config`,
    /// running migrations and failing builds abandoned by an earlier
    /// process.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let source = FsDocumentSource::new(&config.documents)?;

        let service = Self::new(
            Arc::new(SqliteBuildCache::new(pool)),
            Arc::new(source),
            Arc::new(config.clone()),
            ServiceSettings::from_cache_config(&config.cache),
        );
        service.recover_abandoned_builds().await?;
        Ok(service)
    }

    pub fn scheduler(&self) -> &BuildScheduler {
        &self.scheduler
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Returns the cached bundle when it is `READY` and fresh. Otherwise
    /// reports the in-flight status, the failure, or schedules a build and
    /// reports `PENDING`.
    ///
    /// A failed build is reported, not retried; an explicitly cleared entry
    /// is rebuilt.
    pub async fn get_context(
        &self,
        project: &str,
        document_type: &str,
        options: GetContextOptions,
    ) -> Result<ContextResponse> {
        let key = CacheKey::new(project, document_type)?;
        let entry = self.cache.entry(&key).await.map_err(BundleError::upstream)?;
        let status = entry.as_ref().map(|e| e.status).unwrap_or(BuildStatus::None);

        match status {
            BuildStatus::Building => return Ok(ContextResponse::waiting(status)),
            BuildStatus::Pending if self.scheduler.has_pending(&key) => {
                return Ok(ContextResponse::waiting(status))
            }
            _ => {}
        }
        if options.force_rebuild {
            return self.schedule_on_read(&key, "rebuild forced").await;
        }

        match entry {
            Some(entry) if entry.status == BuildStatus::Ready => {
                if self.is_fresh(&entry) {
                    if let Some(bundle) = entry.bundle {
                        return Ok(ContextResponse::ready(bundle));
                    }
                }
                self.schedule_on_read(&key, "bundle stale").await
            }
            Some(CacheEntry {
                status: BuildStatus::Failed,
                failure: Some(failure),
                ..
            }) if failure.cause != FailureCause::Cleared => {
                Ok(ContextResponse::failed(failure.reason))
            }
            _ => self.schedule_on_read(&key, "no bundle").await,
        }
    }

    /// Schedules a build with the configured debounce, or runs one now.
    ///
    /// Debounced triggers while `BUILDING` are no-ops. Immediate triggers
    /// while `BUILDING` fail with [`BundleError::BuildInProgress`].
    pub async fn trigger_build(
        &self,
        project: &str,
        document_type: &str,
        options: TriggerOptions,
    ) -> Result<TriggerResponse> {
        let key = CacheKey::new(project, document_type)?;

        if !options.immediate {
            let scheduled = self.scheduler.trigger(&key, self.settings.debounce).await?;
            return Ok(TriggerResponse {
                status: if scheduled {
                    BuildStatus::Pending
                } else {
                    BuildStatus::Building
                },
                scheduled,
                build: None,
            });
        }

        // READY entries are not buildable until moved back to PENDING
        let marked = self
            .cache
            .mark_pending(&key)
            .await
            .map_err(BundleError::upstream)?;
        if !marked {
            return Err(BundleError::BuildInProgress {
                project: key.project.clone(),
                document_type: key.document_type.clone(),
            });
        }
        let summary = self.scheduler.run_now(&key).await?;
        Ok(TriggerResponse {
            status: summary.status,
            scheduled: false,
            build: Some(summary),
        })
    }

    /// Returns whether a pending timer was cancelled.
    pub async fn cancel_build(&self, project: &str, document_type: &str) -> Result<bool> {
        let key = CacheKey::new(project, document_type)?;
        self.scheduler.cancel(&key).await
    }

    /// Ranks the current corpus against `model_category` (or the default)
    /// and reports where the budget cut line falls.
    pub async fn check_overflow(
        &self,
        project: &str,
        document_type: &str,
        model_category: Option<&str>,
    ) -> Result<OverflowReport> {
        let key = CacheKey::new(project, document_type)?;
        let inputs = BuildInputs::load(self.config.as_ref(), model_category).await?;
        let documents = self
            .source
            .list(&key.project, &key.document_type)
            .await
            .map_err(BundleError::upstream)?;

        let scorer = inputs.scorer();
        let report = OverflowAnalyzer::new(&scorer, self.estimator.as_ref()).check_overflow(
            &documents,
            &inputs.category,
            &inputs.allocation,
        );
        debug!(
            project = %key.project,
            document_type = %key.document_type,
            model_category = %report.model_category,
            tokens = report.total_tokens,
            max_tokens = report.max_context_tokens,
            will_overflow = report.will_overflow,
            "overflow checked"
        );
        Ok(report)
    }

    /// Builds a bundle from exactly the selected documents, in rank order,
    /// and stores it as a `READY` override.
    ///
    /// Fails with [`BundleError::BuildInProgress`] if a build holds the key
    /// at any point before the override is written; the build's result
    /// stands.
    pub async fn apply_selection(
        &self,
        project: &str,
        document_type: &str,
        selected_ids: &[String],
        model_category: Option<&str>,
    ) -> Result<ContextBundle> {
        let key = CacheKey::new(project, document_type)?;
        if selected_ids.is_empty() {
            return Err(BundleError::validation("no documents selected"));
        }
        let status = self
            .cache
            .get_status(&key)
            .await
            .map_err(BundleError::upstream)?
            .status;
        if status == BuildStatus::Building {
            return Err(BundleError::BuildInProgress {
                project: key.project.clone(),
                document_type: key.document_type.clone(),
            });
        }

        let inputs = BuildInputs::load(self.config.as_ref(), model_category).await?;
        let documents = self
            .source
            .list(&key.project, &key.document_type)
            .await
            .map_err(BundleError::upstream)?;
        if documents.is_empty() {
            return Err(BundleError::not_found(format!("no documents for {}", key)));
        }

        let scorer = inputs.scorer();
        let bundle = OverflowAnalyzer::new(&scorer, self.estimator.as_ref()).apply_selection(
            &key,
            selected_ids,
            &documents,
            Utc::now(),
        );
        if bundle.included_ids.is_empty() {
            return Err(BundleError::not_found(format!(
                "none of the selected documents exist for {}",
                key
            )));
        }
        if bundle.total_tokens > inputs.token_budget {
            warn!(
                project = %key.project,
                document_type = %key.document_type,
                tokens = bundle.total_tokens,
                budget = inputs.token_budget,
                "selection exceeds the context budget"
            );
        }

        let meta = BundleMeta {
            build_id: Uuid::new_v4().to_string(),
            model_category: inputs.category.name.clone(),
            token_budget: inputs.token_budget,
            document_count: documents.len(),
            oversized_ids: bundle
                .chunks
                .iter()
                .filter(|c| c.tokens > inputs.token_budget)
                .map(|c| c.document_id.clone())
                .collect(),
            is_override: true,
            fingerprint: bundle.fingerprint(),
        };

        // A pending rebuild would overwrite the selection
        self.scheduler.cancel(&key).await?;
        // A build may have started while the corpus was being read
        let saved = self
            .cache
            .save_override(&key, &bundle, &meta)
            .await
            .map_err(BundleError::upstream)?;
        if !saved {
            return Err(BundleError::BuildInProgress {
                project: key.project.clone(),
                document_type: key.document_type.clone(),
            });
        }
        info!(
            project = %key.project,
            document_type = %key.document_type,
            build_id = %meta.build_id,
            tokens = bundle.total_tokens,
            included = bundle.included_ids.len(),
            "selection applied"
        );
        Ok(bundle)
    }

    /// Drops the cached bundle so the next read rebuilds. Returns `false`
    /// while a build is running; that build's result replaces the bundle.
    pub async fn clear_cache(&self, project: &str, document_type: &str) -> Result<bool> {
        let key = CacheKey::new(project, document_type)?;
        self.scheduler.cancel(&key).await?;
        let cleared = self
            .cache
            .mark_unavailable(&key, "cache cleared", FailureCause::Cleared)
            .await
            .map_err(BundleError::upstream)?;
        if cleared {
            info!(project = %key.project, document_type = %key.document_type, "cache cleared");
        } else {
            debug!(
                project = %key.project,
                document_type = %key.document_type,
                "clear skipped, build in progress"
            );
        }
        Ok(cleared)
    }

    /// Purges entries of any status older than `max_age_hours`.
    pub async fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        let purged = self
            .cache
            .cleanup(max_age_hours)
            .await
            .map_err(BundleError::upstream)?;
        info!(purged, max_age_hours, "cache cleanup finished");
        Ok(purged)
    }

    pub async fn get_build_status(
        &self,
        project: &str,
        document_type: &str,
    ) -> Result<BuildStatusReport> {
        let key = CacheKey::new(project, document_type)?;
        let snapshot = self
            .cache
            .get_status(&key)
            .await
            .map_err(BundleError::upstream)?;
        Ok(BuildStatusReport {
            status: snapshot.status,
            age_secs: snapshot.age_secs,
            failure_reason: snapshot.failure.as_ref().map(|f| f.reason.clone()),
            failure_cause: snapshot.failure.as_ref().map(|f| f.cause),
            meta: snapshot.meta,
            timer_pending: self.scheduler.has_pending(&key),
        })
    }

    /// Polls the key until it leaves `PENDING` and `BUILDING`, failing with
    /// [`BundleError::Timeout`] after `timeout`.
    pub async fn wait_for_build(
        &self,
        project: &str,
        document_type: &str,
        timeout: Duration,
    ) -> Result<BuildStatusReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.get_build_status(project, document_type).await?;
            if !report.status.is_in_flight() {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BundleError::Timeout {
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Fails `BUILDING` entries older than the build timeout. Such entries
    /// can only be left behind by a process that exited mid-build.
    pub async fn recover_abandoned_builds(&self) -> Result<usize> {
        let Some(timeout) = self.settings.build_timeout else {
            return Ok(0);
        };
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| Utc::now().checked_sub_signed(t))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let expired = self
            .cache
            .expire_builds(cutoff, "build abandoned before completion")
            .await
            .map_err(BundleError::upstream)?;
        if expired > 0 {
            warn!(expired, "failed abandoned builds");
        }
        Ok(expired)
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        match (self.settings.staleness_ttl, entry.age(Utc::now())) {
            (Some(ttl), Some(age)) => age <= ttl,
            _ => true,
        }
    }

    async fn schedule_on_read(&self, key: &CacheKey, reason: &str) -> Result<ContextResponse> {
        let scheduled = self.scheduler.trigger(key, Duration::ZERO).await?;
        debug!(
            project = %key.project,
            document_type = %key.document_type,
            reason,
            scheduled,
            "build requested on read"
        );
        Ok(ContextResponse::waiting(if scheduled {
            BuildStatus::Pending
        } else {
            BuildStatus::Building
        }))
    }
}
