//! Deterministic priority scoring and ranking.
//!
//! A document's priority is a weighted sum of four independent factors:
//!
//! | Factor | Raw value | Weight |
//! |--------|-----------|--------|
//! | Agency match | `1.0` or `0.0` | [`MetadataWeights::agency_match`] |
//! | Technology overlap | number of target technologies the document is tagged with | [`MetadataWeights::technology_match`] |
//! | Recency | `1 / (1 + age_days)`, `0.0` without a date | [`MetadataWeights::recency`] |
//! | Keyword relevance | `min(1, keyword hits / target keywords)` | [`MetadataWeights::keyword_relevance`] |
//!
//! The score is a pure function of the document, the weights, the targets
//! and the `as_of` date. Age is measured against `as_of` rather than the
//! wall clock so that identical inputs always produce identical scores.
//!
//! [`rank_documents`] orders by score descending and breaks ties on the
//! document id, so the ranking is stable across runs and input orderings.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Document, MetadataWeights, ScoringTargets};
use crate::tokens::TokenEstimator;

/// Per-factor contributions, already multiplied by their weights.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScoreBreakdown {
    pub agency: f64,
    pub technology: f64,
    pub recency: f64,
    pub keyword: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.agency + self.technology + self.recency + self.keyword
    }
}

#[derive(Debug, Clone)]
pub struct PriorityScorer {
    weights: MetadataWeights,
    technologies: BTreeSet<String>,
    keywords: Vec<String>,
    as_of: NaiveDate,
}

impl PriorityScorer {
    pub fn new(weights: MetadataWeights, targets: &ScoringTargets, as_of: NaiveDate) -> Self {
        let technologies = targets
            .technologies
            .iter()
            .map(|t| normalize_term(t))
            .filter(|t| !t.is_empty())
            .collect();
        let mut keywords: Vec<String> = targets
            .keywords
            .iter()
            .map(|k| normalize_term(k))
            .filter(|k| !k.is_empty())
            .collect();
        keywords.sort();
        keywords.dedup();
        Self {
            weights,
            technologies,
            keywords,
            as_of,
        }
    }

    pub fn weights(&self) -> &MetadataWeights {
        &self.weights
    }

    pub fn score(&self, document: &Document) -> f64 {
        self.breakdown(document).total()
    }

    pub fn breakdown(&self, document: &Document) -> ScoreBreakdown {
        let meta = &document.metadata;
        let agency = if meta.agency_match { 1.0 } else { 0.0 };
        ScoreBreakdown {
            agency: agency * self.weights.agency_match,
            technology: self.technology_overlap(document) as f64 * self.weights.technology_match,
            recency: self.recency(document) * self.weights.recency,
            keyword: self.keyword_relevance(document) * self.weights.keyword_relevance,
        }
    }

    fn technology_overlap(&self, document: &Document) -> usize {
        let tagged: BTreeSet<String> = document
            .metadata
            .technologies
            .iter()
            .map(|t| normalize_term(t))
            .collect();
        tagged.intersection(&self.technologies).count()
    }

    fn recency(&self, document: &Document) -> f64 {
        match document.metadata.date {
            Some(date) => {
                let age_days = (self.as_of - date).num_days().max(0);
                1.0 / (1.0 + age_days as f64)
            }
            None => 0.0,
        }
    }

    /// Term-frequency hits of the target keywords in the document text,
    /// plus one per target keyword listed in the document's own keywords.
    fn keyword_relevance(&self, document: &Document) -> f64 {
        if self.keywords.is_empty() {
            return 0.0;
        }
        let text = document.text.to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let own: BTreeSet<String> = document
            .metadata
            .keywords
            .iter()
            .map(|k| normalize_term(k))
            .collect();

        let mut hits = 0usize;
        for keyword in &self.keywords {
            hits += if keyword.contains(char::is_whitespace) {
                text.matches(keyword.as_str()).count()
            } else {
                words.iter().filter(|&&w| w == keyword.as_str()).count()
            };
            if own.contains(keyword) {
                hits += 1;
            }
        }
        (hits as f64 / self.keywords.len() as f64).min(1.0)
    }
}

fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase()
}

/// A document paired with its score and estimated token cost.
#[derive(Debug, Clone)]
pub struct RankedDocument<'a> {
    pub document: &'a Document,
    pub score: f64,
    pub tokens: usize,
}

/// Scores and sizes every document, then sorts by score descending with
/// the document id as tie-breaker.
pub fn rank_documents<'a>(
    documents: &'a [Document],
    scorer: &PriorityScorer,
    estimator: &dyn TokenEstimator,
) -> Vec<RankedDocument<'a>> {
    let mut ranked: Vec<RankedDocument<'a>> = documents
        .iter()
        .map(|document| RankedDocument {
            document,
            score: scorer.score(document),
            tokens: estimator.estimate(&document.text),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    ranked
}
