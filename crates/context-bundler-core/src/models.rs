//! Core data types shared by the bundling pipeline and the build cache.
//!
//! | Type | Owner |
//! |------|-------|
//! | [`Document`] | the external [`DocumentSource`](crate::source::DocumentSource), read-only here |
//! | [`ContextChunk`], [`ContextBundle`] | created by a build, owned by the cache |
//! | [`ModelCategory`], [`TokenAllocation`], [`MetadataWeights`] | the [`ConfigProvider`](crate::source::ConfigProvider) |
//! | [`CacheEntry`] | the [`BuildCache`](crate::cache::BuildCache) |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BundleError, Result};

const MAX_KEY_PART_LEN: usize = 128;

/// Descriptive metadata attached to a document by the ingestion side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Whether the document concerns the same agency as the project.
    #[serde(default)]
    pub agency_match: bool,
    /// Technology tags (e.g. `"rust"`, `"kubernetes"`).
    #[serde(default)]
    pub technologies: Vec<String>,
    /// Date the document was written or last revised; drives recency.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Curated keywords describing the document.
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A reference document available for bundling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project: String,
    pub document_type: String,
    pub text: String,
    /// Size of the raw document in bytes.
    pub size: u64,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Convenience constructor; `size` is taken from the text length.
    pub fn new(
        id: impl Into<String>,
        project: impl Into<String>,
        document_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            project: project.into(),
            document_type: document_type.into(),
            size: text.len() as u64,
            text,
            metadata: DocumentMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Identifies one cache entry: a `(project, document_type)` pair.
///
/// Deserializing goes through [`CacheKey::new`], so stored or transmitted
/// keys get the same validation as constructed ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawCacheKey")]
pub struct CacheKey {
    pub project: String,
    pub document_type: String,
}

#[derive(Deserialize)]
struct RawCacheKey {
    project: String,
    document_type: String,
}

impl TryFrom<RawCacheKey> for CacheKey {
    type Error = BundleError;

    fn try_from(raw: RawCacheKey) -> Result<Self> {
        CacheKey::new(&raw.project, &raw.document_type)
    }
}

impl CacheKey {
    /// Builds a key, rejecting empty or malformed parts.
    ///
    /// Parts are trimmed; they must be non-empty, at most 128 characters,
    /// not `.` or `..`, and free of path separators and control characters.
    pub fn new(project: &str, document_type: &str) -> Result<Self> {
        Ok(Self {
            project: validate_key_part("project", project)?,
            document_type: validate_key_part("document_type", document_type)?,
        })
    }
}

fn validate_key_part(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BundleError::validation(format!("{} must not be empty", field)));
    }
    if trimmed.chars().count() > MAX_KEY_PART_LEN {
        return Err(BundleError::validation(format!(
            "{} must be at most {} characters",
            field, MAX_KEY_PART_LEN
        )));
    }
    if trimmed == "."
        || trimmed == ".."
        || trimmed
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(BundleError::validation(format!(
            "{} contains invalid characters: {:?}",
            field, trimmed
        )));
    }
    Ok(trimmed.to_string())
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.document_type)
    }
}

/// One document as it appears inside a bundle. Documents are never split,
/// so `text` is always the full document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub document_id: String,
    pub text: String,
    pub tokens: usize,
    pub score: f64,
}

/// The assembled, token-bounded set of documents for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub project: String,
    pub document_type: String,
    /// Included documents in rank order.
    pub chunks: Vec<ContextChunk>,
    pub total_tokens: usize,
    pub included_ids: Vec<String>,
    pub excluded_ids: Vec<String>,
    pub built_at: DateTime<Utc>,
}

impl ContextBundle {
    pub fn empty(key: &CacheKey, built_at: DateTime<Utc>) -> Self {
        Self {
            project: key.project.clone(),
            document_type: key.document_type.clone(),
            chunks: Vec::new(),
            total_tokens: 0,
            included_ids: Vec::new(),
            excluded_ids: Vec::new(),
            built_at,
        }
    }

    /// SHA-256 over the ordered `(id, tokens)` pairs of the included chunks.
    ///
    /// Two bundles with the same fingerprint carry the same documents in the
    /// same order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for chunk in &self.chunks {
            hasher.update(chunk.document_id.as_bytes());
            hasher.update([0u8]);
            hasher.update(chunk.tokens.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Concatenates chunk texts for prompt injection.
    pub fn render(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A named model tier with its maximum context capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCategory {
    pub name: String,
    pub max_tokens: usize,
}

/// How a model's capacity is split between context, generation and buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAllocation {
    pub context_percent: u32,
    pub generation_percent: u32,
    pub buffer_percent: u32,
}

impl Default for TokenAllocation {
    fn default() -> Self {
        Self {
            context_percent: 60,
            generation_percent: 30,
            buffer_percent: 10,
        }
    }
}

impl TokenAllocation {
    /// `floor(max_tokens × context_percent / 100)`.
    pub fn context_budget(&self, category: &ModelCategory) -> usize {
        let budget = category.max_tokens as u128 * self.context_percent as u128 / 100;
        budget as usize
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("context_percent", self.context_percent),
            ("generation_percent", self.generation_percent),
            ("buffer_percent", self.buffer_percent),
        ] {
            if value > 100 {
                return Err(BundleError::validation(format!(
                    "allocation.{} must be in 0..=100, got {}",
                    name, value
                )));
            }
        }
        let sum = self.context_percent + self.generation_percent + self.buffer_percent;
        if sum > 100 {
            return Err(BundleError::validation(format!(
                "allocation percentages sum to {}, which exceeds 100",
                sum
            )));
        }
        Ok(())
    }
}

/// Weights applied to each scoring factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetadataWeights {
    pub agency_match: f64,
    pub technology_match: f64,
    pub recency: f64,
    pub keyword_relevance: f64,
}

impl Default for MetadataWeights {
    fn default() -> Self {
        Self {
            agency_match: 0.4,
            technology_match: 0.2,
            recency: 0.2,
            keyword_relevance: 0.2,
        }
    }
}

impl MetadataWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("agency_match", self.agency_match),
            ("technology_match", self.technology_match),
            ("recency", self.recency),
            ("keyword_relevance", self.keyword_relevance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(BundleError::validation(format!(
                    "weights.{} must be a finite, non-negative number",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// The technologies and keywords a project is looking for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringTargets {
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    None,
    Pending,
    Building,
    Ready,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }

    /// States a build may be started from.
    pub const BUILDABLE: [BuildStatus; 3] = [Self::None, Self::Pending, Self::Failed];

    pub fn can_start_build(&self) -> bool {
        Self::BUILDABLE.contains(self)
    }

    /// `true` while work is queued or running for the key.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Building)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(Self::None),
            "PENDING" => Ok(Self::Pending),
            "BUILDING" => Ok(Self::Building),
            "READY" => Ok(Self::Ready),
            "FAILED" => Ok(Self::Failed),
            other => Err(BundleError::validation(format!(
                "unknown build status: {}",
                other
            ))),
        }
    }
}

/// Why an entry is in the `FAILED` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Fetching documents, reading config or assembling the bundle failed.
    BuildError,
    /// The build exceeded the wall-clock ceiling.
    Timeout,
    /// The cache was explicitly cleared; the next read rebuilds.
    Cleared,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildError => "build_error",
            Self::Timeout => "timeout",
            Self::Cleared => "cleared",
        }
    }
}

impl FromStr for FailureCause {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "build_error" => Ok(Self::BuildError),
            "timeout" => Ok(Self::Timeout),
            "cleared" => Ok(Self::Cleared),
            other => Err(BundleError::validation(format!(
                "unknown failure cause: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,
    pub cause: FailureCause,
}

/// Bookkeeping stored next to a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// UUID of the build (or selection) that produced the bundle.
    pub build_id: String,
    pub model_category: String,
    pub token_budget: usize,
    /// Number of documents the source returned.
    pub document_count: usize,
    /// Documents whose cost alone exceeds the budget.
    #[serde(default)]
    pub oversized_ids: Vec<String>,
    /// Set when the bundle came from a manual selection rather than a build.
    #[serde(default)]
    pub is_override: bool,
    pub fingerprint: String,
}

/// The single shared, mutable record per cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: BuildStatus,
    pub bundle: Option<ContextBundle>,
    pub meta: Option<BundleMeta>,
    pub failure: Option<Failure>,
    pub built_at: Option<DateTime<Utc>>,
    /// Time of the last status transition.
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: BuildStatus::None,
            bundle: None,
            meta: None,
            failure: None,
            built_at: None,
            updated_at: now,
        }
    }

    /// Timestamp used for age checks: the build time, or the last
    /// transition for entries that were never built.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.built_at.unwrap_or(self.updated_at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.built_at.map(|t| now - t)
    }
}

/// Read-only view of an entry's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: BuildStatus,
    pub meta: Option<BundleMeta>,
    pub failure: Option<Failure>,
    /// Seconds since the last build, if the entry was ever built.
    pub age_secs: Option<i64>,
}

impl StatusSnapshot {
    pub fn from_entry(entry: &CacheEntry, now: DateTime<Utc>) -> Self {
        Self {
            status: entry.status,
            meta: entry.meta.clone(),
            failure: entry.failure.clone(),
            age_secs: entry.age(now).map(|d| d.num_seconds().max(0)),
        }
    }

    pub fn none() -> Self {
        Self {
            status: BuildStatus::None,
            meta: None,
            failure: None,
            age_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_trims_and_validates() {
        let key = CacheKey::new("  apollo ", "past_performance").unwrap();
        assert_eq!(key.project, "apollo");
        assert_eq!(key.to_string(), "apollo/past_performance");

        assert!(matches!(
            CacheKey::new("", "resume"),
            Err(BundleError::Validation { .. })
        ));
        assert!(CacheKey::new("a/b", "resume").is_err());
        assert!(CacheKey::new("..", "resume").is_err());
        assert!(CacheKey::new("apollo", "bad\ntype").is_err());
        assert!(CacheKey::new(&"x".repeat(129), "resume").is_err());
    }

    #[test]
    fn test_cache_key_deserialize_validates() {
        let key: CacheKey =
            serde_json::from_str(r#"{"project":" apollo ","document_type":"resume"}"#).unwrap();
        assert_eq!(key, CacheKey::new("apollo", "resume").unwrap());

        assert!(serde_json::from_str::<CacheKey>(r#"{"project":"..","document_type":"resume"}"#)
            .is_err());
        assert!(serde_json::from_str::<CacheKey>(r#"{"project":"a/b","document_type":"x"}"#)
            .is_err());
        assert!(serde_json::from_str::<CacheKey>(r#"{"project":"apollo"}"#).is_err());
    }

    #[test]
    fn test_context_budget_floors() {
        let category = ModelCategory {
            name: "small".into(),
            max_tokens: 8191,
        };
        let alloc = TokenAllocation {
            context_percent: 60,
            generation_percent: 30,
            buffer_percent: 10,
        };
        // 8191 * 0.6 = 4914.6
        assert_eq!(alloc.context_budget(&category), 4914);
    }

    #[test]
    fn test_allocation_validation() {
        assert!(TokenAllocation::default().validate().is_ok());
        let over = TokenAllocation {
            context_percent: 70,
            generation_percent: 30,
            buffer_percent: 10,
        };
        assert!(over.validate().is_err());
        let bad = TokenAllocation {
            context_percent: 101,
            generation_percent: 0,
            buffer_percent: 0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_weights_validation() {
        assert!(MetadataWeights::default().validate().is_ok());
        let bad = MetadataWeights {
            recency: f64::NAN,
            ..MetadataWeights::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BuildStatus::None,
            BuildStatus::Pending,
            BuildStatus::Building,
            BuildStatus::Ready,
            BuildStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_buildable_states() {
        assert!(BuildStatus::None.can_start_build());
        assert!(BuildStatus::Pending.can_start_build());
        assert!(BuildStatus::Failed.can_start_build());
        assert!(!BuildStatus::Building.can_start_build());
        assert!(!BuildStatus::Ready.can_start_build());
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let key = CacheKey::new("p", "t").unwrap();
        let chunk = |id: &str| ContextChunk {
            document_id: id.into(),
            text: String::new(),
            tokens: 10,
            score: 0.0,
        };
        let mut a = ContextBundle::empty(&key, Utc::now());
        a.chunks = vec![chunk("x"), chunk("y")];
        let mut b = a.clone();
        b.chunks.reverse();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
