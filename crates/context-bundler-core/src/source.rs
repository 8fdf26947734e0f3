//! Collaborator traits consumed by the bundling pipeline.
//!
//! | Trait | Supplies |
//! |-------|----------|
//! | [`DocumentSource`] | the corpus for a `(project, document_type)` key |
//! | [`ConfigProvider`] | model categories, token allocation, scoring weights and targets |
//!
//! Both are async (via `async-trait`) so that remote implementations fit
//! without blocking the runtime. The in-memory implementations here are
//! used by tests and by applications that assemble their corpus in-process.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Document, MetadataWeights, ModelCategory, ScoringTargets, TokenAllocation};

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// All documents for the key. An empty corpus is not an error.
    async fn list(&self, project: &str, document_type: &str) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Model categories by name.
    async fn model_categories(&self) -> Result<BTreeMap<String, ModelCategory>>;

    /// Name of the category used for automatic builds.
    async fn default_model_category(&self) -> Result<String>;

    async fn token_allocation(&self) -> Result<TokenAllocation>;

    async fn metadata_weights(&self) -> Result<MetadataWeights>;

    /// Technologies and keywords scored against. Defaults to none.
    async fn scoring_targets(&self) -> Result<ScoringTargets> {
        Ok(ScoringTargets::default())
    }
}

/// Documents held in memory, grouped by key.
#[derive(Default)]
pub struct InMemoryDocumentSource {
    docs: RwLock<HashMap<(String, String), Vec<Document>>>,
}

impl InMemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a source from documents, grouping them by their own
    /// `project` and `document_type`.
    pub fn from_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let source = Self::new();
        for doc in documents {
            source.insert(doc);
        }
        source
    }

    pub fn insert(&self, doc: Document) {
        if let Ok(mut docs) = self.docs.write() {
            docs.entry((doc.project.clone(), doc.document_type.clone()))
                .or_default()
                .push(doc);
        }
    }

    /// Replaces the corpus for one key.
    pub fn replace(&self, project: &str, document_type: &str, documents: Vec<Document>) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert((project.to_string(), document_type.to_string()), documents);
        }
    }
}

#[async_trait]
impl DocumentSource for InMemoryDocumentSource {
    async fn list(&self, project: &str, document_type: &str) -> Result<Vec<Document>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        Ok(docs
            .get(&(project.to_string(), document_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Fixed configuration values.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    pub categories: BTreeMap<String, ModelCategory>,
    pub default_category: String,
    pub allocation: TokenAllocation,
    pub weights: MetadataWeights,
    pub targets: ScoringTargets,
}

impl StaticConfigProvider {
    /// A provider with a single model category, used as the default.
    pub fn single(name: &str, max_tokens: usize) -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            name.to_string(),
            ModelCategory {
                name: name.to_string(),
                max_tokens,
            },
        );
        Self {
            categories,
            default_category: name.to_string(),
            allocation: TokenAllocation::default(),
            weights: MetadataWeights::default(),
            targets: ScoringTargets::default(),
        }
    }

    pub fn with_category(mut self, name: &str, max_tokens: usize) -> Self {
        self.categories.insert(
            name.to_string(),
            ModelCategory {
                name: name.to_string(),
                max_tokens,
            },
        );
        self
    }

    pub fn with_allocation(mut self, allocation: TokenAllocation) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn with_weights(mut self, weights: MetadataWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_targets(mut self, targets: ScoringTargets) -> Self {
        self.targets = targets;
        self
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn model_categories(&self) -> Result<BTreeMap<String, ModelCategory>> {
        Ok(self.categories.clone())
    }

    async fn default_model_category(&self) -> Result<String> {
        Ok(self.default_category.clone())
    }

    async fn token_allocation(&self) -> Result<TokenAllocation> {
        Ok(self.allocation)
    }

    async fn metadata_weights(&self) -> Result<MetadataWeights> {
        Ok(self.weights)
    }

    async fn scoring_targets(&self) -> Result<ScoringTargets> {
        Ok(self.targets.clone())
    }
}
