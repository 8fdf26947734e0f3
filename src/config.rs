use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use context_bundler_core::models::{
    MetadataWeights, ModelCategory, ScoringTargets, TokenAllocation,
};
use context_bundler_core::source::ConfigProvider;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub allocation: TokenAllocation,
    #[serde(default)]
    pub weights: MetadataWeights,
    #[serde(default)]
    pub scoring: ScoringTargets,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_documents_root() -> PathBuf {
    PathBuf::from("./corpus")
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `READY` bundles older than this are rebuilt on read.
    #[serde(default = "default_staleness_ttl_secs")]
    pub staleness_ttl_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_cleanup_max_age_hours")]
    pub cleanup_max_age_hours: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_ttl_secs: default_staleness_ttl_secs(),
            debounce_ms: default_debounce_ms(),
            build_timeout_secs: default_build_timeout_secs(),
            cleanup_max_age_hours: default_cleanup_max_age_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_staleness_ttl_secs() -> u64 {
    86_400
}
fn default_debounce_ms() -> u64 {
    2_000
}
fn default_build_timeout_secs() -> u64 {
    120
}
fn default_cleanup_max_age_hours() -> u64 {
    168
}
fn default_cleanup_interval_secs() -> u64 {
    3_600
}

impl CacheConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn staleness_ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.staleness_ttl_secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_model")]
    pub default: String,
    pub categories: BTreeMap<String, CategoryConfig>,
}

fn default_model() -> String {
    "medium".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Model categories keyed by name, with the name copied into each value.
    pub fn categories(&self) -> BTreeMap<String, ModelCategory> {
        self.models
            .categories
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    ModelCategory {
                        name: name.clone(),
                        max_tokens: c.max_tokens,
                    },
                )
            })
            .collect()
    }
}

#[async_trait]
impl ConfigProvider for Config {
    async fn model_categories(&self) -> Result<BTreeMap<String, ModelCategory>> {
        Ok(self.categories())
    }

    async fn default_model_category(&self) -> Result<String> {
        Ok(self.models.default.clone())
    }

    async fn token_allocation(&self) -> Result<TokenAllocation> {
        Ok(self.allocation)
    }

    async fn metadata_weights(&self) -> Result<MetadataWeights> {
        Ok(self.weights)
    }

    async fn scoring_targets(&self) -> Result<ScoringTargets> {
        Ok(self.scoring.clone())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .allocation
        .validate()
        .with_context(|| "Invalid [allocation] section")?;
    config
        .weights
        .validate()
        .with_context(|| "Invalid [weights] section")?;

    // Validate models
    if config.models.categories.is_empty() {
        anyhow::bail!("models.categories must define at least one category");
    }
    for (name, category) in &config.models.categories {
        if category.max_tokens == 0 {
            anyhow::bail!("models.categories.{}.max_tokens must be > 0", name);
        }
    }
    if !config.models.categories.contains_key(&config.models.default) {
        anyhow::bail!(
            "models.default '{}' is not a configured category",
            config.models.default
        );
    }

    // Validate cache timings
    if config.cache.debounce_ms == 0 {
        anyhow::bail!("cache.debounce_ms must be > 0");
    }
    if config.cache.staleness_ttl_secs == 0 {
        anyhow::bail!("cache.staleness_ttl_secs must be > 0");
    }
    if config.cache.build_timeout_secs == 0 {
        anyhow::bail!("cache.build_timeout_secs must be > 0");
    }
    if config.cache.cleanup_interval_secs == 0 {
        anyhow::bail!("cache.cleanup_interval_secs must be > 0");
    }

    if config.documents.include_globs.is_empty() {
        anyhow::bail!("documents.include_globs must not be empty");
    }

    Ok(())
}
