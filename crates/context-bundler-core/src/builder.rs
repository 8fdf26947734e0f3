//! Greedy, priority-first bundle assembly.
//!
//! # Algorithm
//!
//! 1. Rank documents by [`PriorityScorer`] score, descending (ties on id).
//! 2. Walk the ranked list keeping a running token sum.
//! 3. Include a document in full when `running + cost ≤ budget`; otherwise
//!    skip it and move on to the next-ranked document.
//! 4. Stop after the last document.
//!
//! Documents are never fragmented. The walk is greedy by priority, not by
//! size: a smaller, lower-ranked document can fill space left over by a
//! larger one, but it is never admitted ahead of a higher-ranked document
//! that still fits.
//!
//! # Example
//!
//! ```rust
//! use chrono::{NaiveDate, Utc};
//! use context_bundler_core::builder::ContextBuilder;
//! use context_bundler_core::models::{CacheKey, Document, MetadataWeights, ScoringTargets};
//! use context_bundler_core::score::PriorityScorer;
//! use context_bundler_core::tokens::CharRatioEstimator;
//!
//! let as_of = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
//! let scorer = PriorityScorer::new(MetadataWeights::default(), &ScoringTargets::default(), as_of);
//! let estimator = CharRatioEstimator::default();
//! let builder = ContextBuilder::new(&scorer, &estimator);
//!
//! let key = CacheKey::new("apollo", "resume").unwrap();
//! let docs = vec![Document::new("d1", "apollo", "resume", "x".repeat(40))];
//! let outcome = builder.build(&key, &docs, 100, Utc::now());
//! assert_eq!(outcome.bundle.total_tokens, 10);
//! assert!(outcome.excluded_ids.is_empty());
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::BundleError;
use crate::models::{CacheKey, ContextBundle, ContextChunk, Document};
use crate::score::{rank_documents, PriorityScorer, RankedDocument};
use crate::tokens::TokenEstimator;

/// A document that cannot fit even into an empty bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OversizedDocument {
    pub id: String,
    pub tokens: usize,
}

/// Result of one assembly pass.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub bundle: ContextBundle,
    /// Skipped documents, in rank order.
    pub excluded_ids: Vec<String>,
    /// Skipped documents whose cost alone exceeds the budget.
    pub oversized: Vec<OversizedDocument>,
    pub token_budget: usize,
}

impl BuildOutcome {
    /// The first oversized document as an [`BundleError::Overflow`], for
    /// callers that want to surface it. The bundle itself is still valid.
    pub fn overflow_error(&self) -> Option<BundleError> {
        self.oversized.first().map(|doc| BundleError::Overflow {
            document_id: doc.id.clone(),
            tokens: doc.tokens,
            budget: self.token_budget,
        })
    }

    pub fn oversized_ids(&self) -> Vec<String> {
        self.oversized.iter().map(|d| d.id.clone()).collect()
    }
}

pub struct ContextBuilder<'a> {
    scorer: &'a PriorityScorer,
    estimator: &'a dyn TokenEstimator,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(scorer: &'a PriorityScorer, estimator: &'a dyn TokenEstimator) -> Self {
        Self { scorer, estimator }
    }

    /// Ranks `documents` and assembles them under `token_budget`.
    ///
    /// Empty input yields an empty bundle with zero tokens.
    pub fn build(
        &self,
        key: &CacheKey,
        documents: &[Document],
        token_budget: usize,
        built_at: DateTime<Utc>,
    ) -> BuildOutcome {
        let ranked = rank_documents(documents, self.scorer, self.estimator);
        assemble(key, &ranked, token_budget, built_at)
    }
}

/// Runs the greedy walk over an already-ranked list.
pub fn assemble(
    key: &CacheKey,
    ranked: &[RankedDocument<'_>],
    token_budget: usize,
    built_at: DateTime<Utc>,
) -> BuildOutcome {
    let mut bundle = ContextBundle::empty(key, built_at);
    let mut excluded_ids = Vec::new();
    let mut oversized = Vec::new();
    let mut running: usize = 0;

    for item in ranked {
        let id = &item.document.id;
        match running.checked_add(item.tokens) {
            Some(next) if next <= token_budget => {
                running = next;
                bundle.included_ids.push(id.clone());
                bundle.chunks.push(ContextChunk {
                    document_id: id.clone(),
                    text: item.document.text.clone(),
                    tokens: item.tokens,
                    score: item.score,
                });
            }
            _ => {
                if item.tokens > token_budget {
                    oversized.push(OversizedDocument {
                        id: id.clone(),
                        tokens: item.tokens,
                    });
                }
                excluded_ids.push(id.clone());
            }
        }
    }

    bundle.total_tokens = running;
    bundle.excluded_ids = excluded_ids.clone();

    BuildOutcome {
        bundle,
        excluded_ids,
        oversized,
        token_budget,
    }
}
