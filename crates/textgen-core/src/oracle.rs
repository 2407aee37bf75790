use std::future::Future;

use anyhow::Result;

/// Anything that maps a token sequence to scores (logits) for the next position.
///
/// Implementations own all model-specific input shaping; the sampler only ever calls
/// [`ScoreOracle::next_token_scores`] with the full sequence so far (prompt plus generated tokens).
pub trait ScoreOracle {
    /// Vocabulary size. Every score vector returned must have exactly this many entries.
    fn num_vocab(&self) -> usize;

    /// Scores for the position immediately following `tokens`, indexed by token id.
    fn next_token_scores(&self, tokens: &[u32]) -> impl Future<Output = Result<Vec<f32>>> + Send;
}
