use derivative::Derivative;
use itertools::Itertools;
use salvo::oapi::ToSchema;
use serde::{Deserialize, Serialize};

use crate::error::{GenerateError, Result};

pub mod filter;
pub mod penalty;
pub mod sequence;

#[derive(Debug, Clone, Copy, PartialEq, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct SamplerParams {
    /// Keep only the `top_k` highest scores. `0` disables top-k.
    pub top_k: usize,
    /// Keep the smallest head of the distribution whose mass exceeds `top_p`. `0` disables nucleus filtering.
    #[derivative(Default(value = "0.9"))]
    pub top_p: f32,
    /// Divides the scores before filtering. `0` selects greedy decoding.
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    /// Divides the score of every token already in the sequence. `1` disables the penalty.
    #[serde(alias = "repeat_penalty")]
    #[derivative(Default(value = "1.0"))]
    pub repetition_penalty: f32,
}

impl SamplerParams {
    pub fn validate(&self) -> Result<()> {
        let Self {
            top_p,
            temperature,
            repetition_penalty,
            ..
        } = *self;
        check_top_p(top_p)?;
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(GenerateError::InvalidConfiguration(format!(
                "temperature must be a finite value >= 0, got {temperature}"
            )));
        }
        if !repetition_penalty.is_finite() || repetition_penalty < 1.0 {
            return Err(GenerateError::InvalidConfiguration(format!(
                "repetition_penalty must be a finite value >= 1, got {repetition_penalty}"
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }
}

pub(crate) fn check_top_p(top_p: f32) -> Result<()> {
    match (0.0..=1.0).contains(&top_p) {
        true => Ok(()),
        false => Err(GenerateError::InvalidConfiguration(format!(
            "top_p must lie in [0, 1], got {top_p}"
        ))),
    }
}

/// A score that can still be sampled: not suppressed and not NaN.
#[inline]
pub(crate) fn is_candidate(x: f32) -> bool {
    x > f32::NEG_INFINITY
}

/// Numerically stable softmax. Suppressed entries get probability 0.
pub fn softmax(scores: &[f32]) -> Result<Vec<f32>> {
    let max = scores
        .iter()
        .copied()
        .filter(|&x| is_candidate(x))
        .max_by(f32::total_cmp)
        .ok_or(GenerateError::DegenerateDistribution)?;
    if !max.is_finite() {
        return Err(GenerateError::DegenerateDistribution);
    }

    let exp = scores.iter().map(|x| (x - max).exp()).collect_vec();
    let sum: f32 = exp.iter().sum();
    Ok(exp.into_iter().map(|x| x / sum).collect())
}
