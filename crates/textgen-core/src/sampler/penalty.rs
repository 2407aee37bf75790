//! Repetition penalty from CTRL (Keskar et al., <https://arxiv.org/abs/1909.05858>).

use std::collections::HashSet;

/// Divide the score of every distinct token in `tokens` by `penalty`, once per token id.
///
/// Token ids out of the vocabulary range are ignored.
pub fn apply_repetition_penalty(scores: &mut [f32], tokens: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }

    let seen: HashSet<u32> = tokens.iter().copied().collect();
    for token in seen {
        if let Some(score) = scores.get_mut(token as usize) {
            *score /= penalty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_penalty_is_identity() {
        let original = vec![1.0, -2.0, 3.0, 4.0];
        let mut scores = original.clone();
        apply_repetition_penalty(&mut scores, &[0, 1, 2, 2, 3], 1.0);
        assert_eq!(scores, original);
    }

    #[test]
    fn penalty_applies_once_per_distinct_token() {
        let mut scores = vec![1.0, 1.0, 1.0, 8.0, 1.0];
        apply_repetition_penalty(&mut scores, &[3, 0, 3], 2.0);
        // Token 3 appears twice but is halved once, not quartered.
        assert_eq!(scores, vec![0.5, 1.0, 1.0, 4.0, 1.0]);
    }

    #[test]
    fn out_of_range_tokens_are_skipped() {
        let mut scores = vec![2.0, 2.0];
        apply_repetition_penalty(&mut scores, &[1, 99], 2.0);
        assert_eq!(scores, vec![2.0, 1.0]);
    }
}
