//! Approximate token counting.
//!
//! Token counts in this crate are **approximations**, not tokenizer-exact
//! values. The default [`CharRatioEstimator`] assumes roughly 4 characters
//! per token, which is close enough for budgeting prompt context across the
//! common model families. A precise tokenizer can be substituted by
//! implementing [`TokenEstimator`]; nothing in the builder or overflow
//! analysis depends on the ratio.
//!
//! # Monotonicity
//!
//! Every estimator must be monotonic: removing characters from a text never
//! increases its estimate. The builder and overflow analysis rely on this to
//! size documents independently of the order they are combined in.

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimates how many tokens a text span occupies in a prompt.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`, counting Unicode scalar values so that
/// multi-byte text is not over-counted.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    /// A ratio of `0` is treated as `1`.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}
