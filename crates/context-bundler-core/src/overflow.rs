//! Overflow detection and manual-selection support.
//!
//! [`OverflowAnalyzer::check_overflow`] always returns a complete report,
//! whether or not the corpus fits, so a caller can present every document
//! with its rank, cost and the recommended split and let a user override it.
//!
//! The recommended split is a **cut line**: the longest prefix of the ranked
//! list whose cumulative token sum stays within the budget. Unlike the
//! builder's greedy walk, nothing after the first document that crosses the
//! line is recommended, which keeps the suggestion a simple rank threshold.
//!
//! [`OverflowAnalyzer::apply_selection`] is a pure filter over the ranked
//! corpus. It never reorders or truncates, so a selection taken from the
//! report's `included_ids` always stays within the budget.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    CacheKey, ContextBundle, ContextChunk, Document, ModelCategory, TokenAllocation,
};
use crate::score::{rank_documents, PriorityScorer};
use crate::tokens::TokenEstimator;

/// One row of the ranked breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverflowEntry {
    pub id: String,
    pub rank: usize,
    pub score: f64,
    pub tokens: usize,
    /// Tokens of this document plus every higher-ranked one.
    pub cumulative_tokens: usize,
    /// Whether the document falls inside the cut line.
    pub included: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverflowReport {
    pub model_category: String,
    pub total_tokens: usize,
    pub max_context_tokens: usize,
    pub will_overflow: bool,
    pub documents: Vec<OverflowEntry>,
    pub included_ids: Vec<String>,
    pub excluded_ids: Vec<String>,
    /// Documents whose cost alone exceeds `max_context_tokens`.
    pub oversized_ids: Vec<String>,
}

impl OverflowReport {
    /// Tokens that would have to be dropped to fit the whole corpus.
    pub fn excess_tokens(&self) -> usize {
        self.total_tokens.saturating_sub(self.max_context_tokens)
    }
}

pub struct OverflowAnalyzer<'a> {
    scorer: &'a PriorityScorer,
    estimator: &'a dyn TokenEstimator,
}

impl<'a> OverflowAnalyzer<'a> {
    pub fn new(scorer: &'a PriorityScorer, estimator: &'a dyn TokenEstimator) -> Self {
        Self { scorer, estimator }
    }

    pub fn check_overflow(
        &self,
        documents: &[Document],
        category: &ModelCategory,
        allocation: &TokenAllocation,
    ) -> OverflowReport {
        let max_context_tokens = allocation.context_budget(category);
        let ranked = rank_documents(documents, self.scorer, self.estimator);

        let mut entries = Vec::with_capacity(ranked.len());
        let mut included_ids = Vec::new();
        let mut excluded_ids = Vec::new();
        let mut oversized_ids = Vec::new();
        let mut cumulative: usize = 0;
        let mut below_line = true;

        for (rank, item) in ranked.iter().enumerate() {
            cumulative = cumulative.saturating_add(item.tokens);
            if cumulative > max_context_tokens {
                below_line = false;
            }
            if item.tokens > max_context_tokens {
                oversized_ids.push(item.document.id.clone());
            }
            if below_line {
                included_ids.push(item.document.id.clone());
            } else {
                excluded_ids.push(item.document.id.clone());
            }
            entries.push(OverflowEntry {
                id: item.document.id.clone(),
                rank: rank + 1,
                score: item.score,
                tokens: item.tokens,
                cumulative_tokens: cumulative,
                included: below_line,
            });
        }

        OverflowReport {
            model_category: category.name.clone(),
            total_tokens: cumulative,
            max_context_tokens,
            will_overflow: cumulative > max_context_tokens,
            documents: entries,
            included_ids,
            excluded_ids,
            oversized_ids,
        }
    }

    /// Keeps only the documents in `selected_ids`, in rank order.
    ///
    /// Unknown ids are ignored. Everything not selected is listed in
    /// `excluded_ids`.
    pub fn apply_selection(
        &self,
        key: &CacheKey,
        selected_ids: &[String],
        documents: &[Document],
        built_at: DateTime<Utc>,
    ) -> ContextBundle {
        let selected: HashSet<&str> = selected_ids.iter().map(|s| s.as_str()).collect();
        let ranked = rank_documents(documents, self.scorer, self.estimator);

        let mut bundle = ContextBundle::empty(key, built_at);
        for item in &ranked {
            let id = &item.document.id;
            if selected.contains(id.as_str()) {
                bundle.total_tokens += item.tokens;
                bundle.included_ids.push(id.clone());
                bundle.chunks.push(ContextChunk {
                    document_id: id.clone(),
                    text: item.document.text.clone(),
                    tokens: item.tokens,
                    score: item.score,
                });
            } else {
                bundle.excluded_ids.push(id.clone());
            }
        }
        bundle
    }
}
