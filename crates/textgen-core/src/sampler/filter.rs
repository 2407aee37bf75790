//! Top-k and nucleus (top-p) filtering of a single score vector.
//!
//! Nucleus filtering follows Holtzman et al., "The Curious Case of Neural Text Degeneration"
//! (<http://arxiv.org/abs/1904.09751>).

use itertools::Itertools;

use super::{check_top_p, is_candidate, softmax};
use crate::error::{GenerateError, Result};

/// Value written into suppressed entries.
pub const FILTER_VALUE: f32 = f32::NEG_INFINITY;

/// Suppress every score lower than the `top_k`-th largest one.
///
/// Scores tied with the `top_k`-th largest are all kept, so more than `top_k` entries can survive.
pub fn top_k_filter(scores: &mut [f32], top_k: usize) {
    let top_k = top_k.min(scores.len());
    if top_k == 0 {
        return;
    }

    let mut sorted = scores.to_vec();
    let (_, &mut threshold, _) = sorted.select_nth_unstable_by(top_k - 1, |x, y| y.total_cmp(x));
    scores
        .iter_mut()
        .filter(|x| **x < threshold)
        .for_each(|x| *x = FILTER_VALUE);
}

/// Suppress the tail of the distribution once the mass of the higher-ranked entries exceeds `top_p`.
///
/// The entry that pushes the cumulative mass over `top_p` is kept, hence the highest-scoring entry always survives.
/// Equal scores are ranked by ascending token id.
pub fn top_p_filter(scores: &mut [f32], top_p: f32) -> Result<()> {
    check_top_p(top_p)?;
    if top_p <= 0.0 {
        return Ok(());
    }

    let probs = softmax(scores)?;
    let sorted = probs
        .into_iter()
        .enumerate()
        .sorted_by(|(i, x), (j, y)| y.total_cmp(x).then(i.cmp(j)))
        .collect_vec();

    let mut cum = 0.0;
    for (id, p) in sorted {
        if cum > top_p {
            scores[id] = FILTER_VALUE;
        }
        cum += p;
    }
    Ok(())
}

/// Apply top-k, then nucleus filtering on the survivors.
///
/// With `top_k == 0` and `top_p == 0` the scores are left untouched.
/// Fails with [`GenerateError::DegenerateDistribution`] if no candidate remains.
pub fn top_k_top_p_filter(scores: &mut [f32], top_k: usize, top_p: f32) -> Result<()> {
    check_top_p(top_p)?;
    if top_k == 0 && top_p <= 0.0 {
        return Ok(());
    }

    top_k_filter(scores, top_k);
    top_p_filter(scores, top_p)?;

    match scores.iter().any(|&x| is_candidate(x)) {
        true => Ok(()),
        false => Err(GenerateError::DegenerateDistribution),
    }
}
