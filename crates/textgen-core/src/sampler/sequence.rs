use derivative::Derivative;
use futures_util::future::try_join_all;
use salvo::oapi::ToSchema;
use serde::{Deserialize, Serialize};

use super::{
    filter::top_k_top_p_filter, is_candidate, penalty::apply_repetition_penalty, softmax,
    SamplerParams,
};
use crate::{
    error::{GenerateError, OracleError, Result},
    oracle::ScoreOracle,
};

/// One generation call: `num_samples` continuations of `length` tokens each, all sharing `prompt`.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: Vec<u32>,
    pub length: usize,
    pub num_samples: usize,
    pub params: SamplerParams,
    /// Seed of the random stream. Drawn from the OS when `None`.
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: Vec<u32>, length: usize, params: SamplerParams) -> Self {
        Self {
            prompt,
            length,
            num_samples: 1,
            params,
            seed: None,
        }
    }

    pub fn validate(&self, limits: &GenerationLimits) -> Result<()> {
        if self.num_samples == 0 {
            return Err(GenerateError::InvalidConfiguration(
                "num_samples must be at least 1".into(),
            ));
        }
        if self.num_samples > limits.max_samples {
            return Err(GenerateError::InvalidConfiguration(format!(
                "num_samples must be at most {}, got {}",
                limits.max_samples, self.num_samples
            )));
        }
        if self.length > limits.max_length {
            return Err(GenerateError::InvalidConfiguration(format!(
                "length must be at most {}, got {}",
                limits.max_length, self.length
            )));
        }
        self.params.validate()
    }
}

/// Upper bounds on the size of a single generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct GenerationLimits {
    /// Maximum number of tokens generated per sample.
    #[derivative(Default(value = "4096"))]
    pub max_length: usize,
    /// Maximum number of samples per request.
    #[derivative(Default(value = "64"))]
    pub max_samples: usize,
}

/// Drives the decode loop against a [`ScoreOracle`].
#[derive(Debug)]
pub struct SequenceSampler<'a, O> {
    oracle: &'a O,
    limits: GenerationLimits,
}

impl<'a, O: ScoreOracle + Sync> SequenceSampler<'a, O> {
    pub fn new(oracle: &'a O) -> Self {
        Self {
            oracle,
            limits: Default::default(),
        }
    }

    pub fn with_limits(self, limits: GenerationLimits) -> Self {
        Self { limits, ..self }
    }

    /// Extend the prompt by exactly `request.length` tokens, `request.num_samples` times.
    ///
    /// Every returned sequence starts with the prompt. The loop never stops early.
    pub async fn sample(&self, request: &GenerationRequest) -> Result<Vec<Vec<u32>>> {
        request.validate(&self.limits)?;

        let GenerationRequest {
            prompt,
            length,
            num_samples,
            params,
            seed,
        } = request;
        let mut rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(*seed),
            None => fastrand::Rng::new(),
        };

        let mut sequences: Vec<Vec<u32>> = Vec::new();
        sequences.try_reserve_exact(*num_samples).map_err(|err| {
            GenerateError::InvalidConfiguration(format!("num_samples {num_samples}: {err}"))
        })?;
        sequences.resize(*num_samples, prompt.clone());

        for step in 0..*length {
            let scores = try_join_all(sequences.iter().map(|sequence| self.scores(sequence))).await?;
            for (sequence, scores) in sequences.iter_mut().zip(scores) {
                let token = self.select(scores, sequence, params, &mut rng)?;
                sequence.push(token);
            }
            log::debug!("[generate][step: {}/{}]", step + 1, length);
        }

        Ok(sequences)
    }

    /// Ask the oracle for the next score vector and check its shape.
    async fn scores(&self, sequence: &[u32]) -> Result<Vec<f32>> {
        let scores = self
            .oracle
            .next_token_scores(sequence)
            .await
            .map_err(OracleError::Failed)?;

        let expected = self.oracle.num_vocab();
        if scores.len() != expected {
            return Err(OracleError::VocabMismatch {
                expected,
                found: scores.len(),
            }
            .into());
        }
        if scores.iter().any(|x| x.is_nan()) || !scores.iter().any(|x| x.is_finite()) {
            return Err(OracleError::NonFinite.into());
        }
        Ok(scores)
    }

    fn select(
        &self,
        mut scores: Vec<f32>,
        sequence: &[u32],
        params: &SamplerParams,
        rng: &mut fastrand::Rng,
    ) -> Result<u32> {
        let greedy = params.is_greedy() || !scale_by_temperature(&mut scores, params.temperature);
        apply_repetition_penalty(&mut scores, sequence, params.repetition_penalty);
        top_k_top_p_filter(&mut scores, params.top_k, params.top_p)?;

        let token = match greedy {
            true => argmax(&scores)?,
            false => draw(&softmax(&scores)?, rng)?,
        };
        Ok(token as u32)
    }
}

/// Divide `scores` by `temperature` in place.
///
/// Returns `false` and leaves `scores` untouched if a finite score would overflow to infinity.
/// The distribution is then sharper than `f32` can express, and its limit is the arg-max.
pub fn scale_by_temperature(scores: &mut [f32], temperature: f32) -> bool {
    let overflows = scores
        .iter()
        .any(|&x| x.is_finite() && (x / temperature).is_infinite());
    if overflows {
        return false;
    }
    scores.iter_mut().for_each(|x| *x /= temperature);
    true
}

/// Index of the highest score; ties go to the lowest index.
pub fn argmax(scores: &[f32]) -> Result<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, &x)| is_candidate(x))
        .max_by(|(i, x), (j, y)| x.total_cmp(y).then(j.cmp(i)))
        .map(|(id, _)| id)
        .ok_or(GenerateError::DegenerateDistribution)
}

/// Draw one index with probability proportional to `probs`.
pub fn draw(probs: &[f32], rng: &mut fastrand::Rng) -> Result<usize> {
    let rand = rng.f32();
    let mut cum = 0.0;
    let mut last = None;
    for (id, &p) in probs.iter().enumerate().filter(|(_, &p)| p > 0.0) {
        cum += p;
        last = Some(id);
        if rand < cum {
            return Ok(id);
        }
    }
    // rounding may leave the total mass slightly below `rand`
    last.ok_or(GenerateError::DegenerateDistribution)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    /// Scores every position the same way and counts how often it is asked.
    struct FixedOracle {
        scores: Vec<f32>,
        calls: AtomicUsize,
    }

    impl FixedOracle {
        fn new(scores: Vec<f32>) -> Self {
            Self {
                scores,
                calls: AtomicUsize::new(0),
            }
        }

        fn favouring(token: usize, num_vocab: usize) -> Self {
            let mut scores = vec![0.0; num_vocab];
            scores[token] = 10.0;
            Self::new(scores)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ScoreOracle for FixedOracle {
        fn num_vocab(&self) -> usize {
            self.scores.len()
        }

        async fn next_token_scores(&self, _tokens: &[u32]) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }
    }

    /// Favours the token right after the last one, wrapping around.
    struct CountingOracle(usize);

    impl ScoreOracle for CountingOracle {
        fn num_vocab(&self) -> usize {
            self.0
        }

        async fn next_token_scores(&self, tokens: &[u32]) -> anyhow::Result<Vec<f32>> {
            let next = tokens.last().map(|&x| (x as usize + 1) % self.0).unwrap_or(0);
            let mut scores = vec![-1.0; self.0];
            scores[next] = 1.0;
            Ok(scores)
        }
    }

    struct FailingOracle;

    impl ScoreOracle for FailingOracle {
        fn num_vocab(&self) -> usize {
            8
        }

        async fn next_token_scores(&self, _tokens: &[u32]) -> anyhow::Result<Vec<f32>> {
            bail!("model went away")
        }
    }

    fn greedy() -> SamplerParams {
        SamplerParams {
            top_k: 0,
            top_p: 0.0,
            temperature: 0.0,
            repetition_penalty: 1.0,
        }
    }

    #[tokio::test]
    async fn greedy_follows_the_favoured_token() {
        let oracle = FixedOracle::favouring(7, 50);
        let request = GenerationRequest::new(vec![10, 42], 3, greedy());
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert_eq!(output, vec![vec![10, 42, 7, 7, 7]]);
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn greedy_is_deterministic() {
        let oracle = CountingOracle(16);
        let request = GenerationRequest::new(vec![3], 20, greedy());
        let sampler = SequenceSampler::new(&oracle);
        let first = sampler.sample(&request).await.unwrap();
        let second = sampler.sample(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(&first[0][..4], &[3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn greedy_breaks_ties_by_lowest_id() {
        let oracle = FixedOracle::new(vec![0.0, 2.0, 1.0, 2.0]);
        let request = GenerationRequest::new(vec![0], 2, greedy());
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert_eq!(output, vec![vec![0, 1, 1]]);
    }

    #[tokio::test]
    async fn output_length_is_prompt_plus_length() {
        let oracle = CountingOracle(32);
        for length in [0, 1, 5, 17] {
            let request = GenerationRequest {
                num_samples: 3,
                seed: Some(7),
                ..GenerationRequest::new(vec![1, 2, 3], length, SamplerParams::default())
            };
            let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
            assert_eq!(output.len(), 3);
            for sequence in output {
                assert_eq!(sequence.len(), 3 + length);
                assert_eq!(&sequence[..3], &[1, 2, 3]);
            }
        }
    }

    #[tokio::test]
    async fn zero_length_returns_the_prompt_without_calling_the_oracle() {
        let oracle = FixedOracle::favouring(1, 4);
        let request = GenerationRequest::new(vec![2, 3], 0, greedy());
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert_eq!(output, vec![vec![2, 3]]);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn negative_temperature_is_rejected_before_any_oracle_call() {
        let oracle = FixedOracle::favouring(1, 4);
        let params = SamplerParams {
            temperature: -1.0,
            ..greedy()
        };
        let request = GenerationRequest::new(vec![0], 5, params);
        let result = SequenceSampler::new(&oracle).sample(&request).await;
        assert!(matches!(result, Err(GenerateError::InvalidConfiguration(_))));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn zero_samples_are_rejected() {
        let oracle = FixedOracle::favouring(1, 4);
        let request = GenerationRequest {
            num_samples: 0,
            ..GenerationRequest::new(vec![0], 5, greedy())
        };
        let result = SequenceSampler::new(&oracle).sample(&request).await;
        assert!(matches!(result, Err(GenerateError::InvalidConfiguration(_))));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn oracle_failure_aborts_the_request() {
        let request = GenerationRequest::new(vec![0], 5, greedy());
        let result = SequenceSampler::new(&FailingOracle).sample(&request).await;
        assert!(matches!(
            result,
            Err(GenerateError::Oracle(OracleError::Failed(_)))
        ));
    }

    #[tokio::test]
    async fn wrong_vocab_size_is_an_oracle_error() {
        struct Short;

        impl ScoreOracle for Short {
            fn num_vocab(&self) -> usize {
                10
            }

            async fn next_token_scores(&self, _tokens: &[u32]) -> anyhow::Result<Vec<f32>> {
                Ok(vec![0.0; 9])
            }
        }

        let request = GenerationRequest::new(vec![0], 1, greedy());
        let result = SequenceSampler::new(&Short).sample(&request).await;
        assert!(matches!(
            result,
            Err(GenerateError::Oracle(OracleError::VocabMismatch {
                expected: 10,
                found: 9
            }))
        ));
    }

    #[tokio::test]
    async fn non_finite_scores_are_an_oracle_error() {
        let oracle = FixedOracle::new(vec![f32::NEG_INFINITY; 4]);
        let request = GenerationRequest::new(vec![0], 1, greedy());
        let result = SequenceSampler::new(&oracle).sample(&request).await;
        assert!(matches!(
            result,
            Err(GenerateError::Oracle(OracleError::NonFinite))
        ));

        let oracle = FixedOracle::new(vec![0.0, f32::NAN, 1.0]);
        let result = SequenceSampler::new(&oracle).sample(&request).await;
        assert!(matches!(
            result,
            Err(GenerateError::Oracle(OracleError::NonFinite))
        ));
    }

    #[tokio::test]
    async fn repetition_penalty_steers_greedy_away_from_seen_tokens() {
        // Token 1 narrowly beats token 2 until it shows up in the sequence.
        let oracle = FixedOracle::new(vec![0.0, 4.0, 3.0, 0.0]);
        let params = SamplerParams {
            repetition_penalty: 2.0,
            ..greedy()
        };
        let request = GenerationRequest::new(vec![0], 2, params);
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert_eq!(output, vec![vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn seeded_sampling_is_reproducible() {
        let oracle = FixedOracle::new((0..32).map(|x| (x % 5) as f32).collect());
        let request = GenerationRequest {
            num_samples: 4,
            seed: Some(42),
            ..GenerationRequest::new(vec![0], 12, SamplerParams::default())
        };
        let sampler = SequenceSampler::new(&oracle);
        let first = sampler.sample(&request).await.unwrap();
        let second = sampler.sample(&request).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn sampling_stays_inside_the_top_k_set() {
        let oracle = FixedOracle::new(vec![0.0, 5.0, 1.0, 4.9, 0.5, 4.8]);
        let params = SamplerParams {
            top_k: 2,
            top_p: 0.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
        };
        let request = GenerationRequest {
            num_samples: 8,
            seed: Some(3),
            ..GenerationRequest::new(vec![], 16, params)
        };
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert!(output.iter().flatten().all(|&token| token == 1 || token == 3));
    }

    #[test]
    fn draw_picks_the_only_candidate() {
        let mut rng = fastrand::Rng::with_seed(0);
        for _ in 0..32 {
            assert_eq!(draw(&[0.0, 0.0, 1.0, 0.0], &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn argmax_of_suppressed_scores_is_degenerate() {
        assert!(matches!(
            argmax(&[f32::NEG_INFINITY; 3]),
            Err(GenerateError::DegenerateDistribution)
        ));
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected_before_any_oracle_call() {
        let oracle = FixedOracle::favouring(1, 4);
        let sampler = SequenceSampler::new(&oracle);

        let request = GenerationRequest::new(vec![0], usize::MAX / 2, SamplerParams::default());
        let result = sampler.sample(&request).await;
        assert!(matches!(result, Err(GenerateError::InvalidConfiguration(_))));

        let request = GenerationRequest {
            num_samples: usize::MAX / 2,
            ..GenerationRequest::new(vec![0], 1, SamplerParams::default())
        };
        let result = sampler.sample(&request).await;
        assert!(matches!(result, Err(GenerateError::InvalidConfiguration(_))));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn limits_are_configurable() {
        let oracle = FixedOracle::favouring(1, 4);
        let sampler = SequenceSampler::new(&oracle).with_limits(GenerationLimits {
            max_length: 4,
            max_samples: 2,
        });

        let request = GenerationRequest {
            num_samples: 2,
            ..GenerationRequest::new(vec![0], 4, greedy())
        };
        assert_eq!(sampler.sample(&request).await.unwrap().len(), 2);

        let request = GenerationRequest::new(vec![0], 5, greedy());
        let result = sampler.sample(&request).await;
        assert!(matches!(result, Err(GenerateError::InvalidConfiguration(_))));

        let request = GenerationRequest {
            num_samples: 3,
            ..GenerationRequest::new(vec![0], 1, greedy())
        };
        let result = sampler.sample(&request).await;
        assert!(matches!(result, Err(GenerateError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn tiny_temperature_behaves_like_greedy() {
        let params = SamplerParams {
            temperature: 1e-40,
            ..SamplerParams::default()
        };
        let request = GenerationRequest {
            seed: Some(5),
            ..GenerationRequest::new(vec![0], 3, params)
        };

        let oracle = FixedOracle::new(vec![0.0, 10.0, 5.0]);
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert_eq!(output, vec![vec![0, 1, 1, 1]]);

        let oracle = FixedOracle::new(vec![-10.0, -20.0, -5.0]);
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        assert_eq!(output, vec![vec![0, 2, 2, 2]]);
    }

    #[test]
    fn temperature_scaling_refuses_to_overflow() {
        let mut scores = vec![1.0, f32::NEG_INFINITY, 2.0];
        assert!(scale_by_temperature(&mut scores, 0.5));
        assert_eq!(scores, vec![2.0, f32::NEG_INFINITY, 4.0]);

        let mut scores = vec![1.0, 2.0];
        assert!(!scale_by_temperature(&mut scores, 1e-40));
        assert_eq!(scores, vec![1.0, 2.0]);
    }

    #[test]
    fn draw_follows_the_probabilities() {
        let probs = [0.1, 0.0, 0.2, 0.3, 0.4];
        let mut rng = fastrand::Rng::with_seed(17);
        let mut counts = [0usize; 5];
        let rounds = 20_000;
        for _ in 0..rounds {
            counts[draw(&probs, &mut rng).unwrap()] += 1;
        }
        assert_eq!(counts[1], 0);
        for (count, p) in counts.iter().zip(probs) {
            let freq = *count as f32 / rounds as f32;
            assert!((freq - p).abs() < 0.02, "frequency {freq} too far from {p}");
        }
    }

    #[tokio::test]
    async fn sampling_stays_inside_the_nucleus() {
        // softmax gives roughly [0.717, 0.264, 0.005, 0.005, 0.005, 0.005]:
        // tokens 0 and 1 cover 0.9, the rest lies outside the nucleus.
        let oracle = FixedOracle::new(vec![5.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        let params = SamplerParams {
            top_k: 0,
            top_p: 0.9,
            temperature: 1.0,
            repetition_penalty: 1.0,
        };
        let request = GenerationRequest {
            num_samples: 8,
            seed: Some(11),
            ..GenerationRequest::new(vec![], 16, params)
        };
        let output = SequenceSampler::new(&oracle).sample(&request).await.unwrap();
        let tokens = output.into_iter().flatten().collect::<Vec<_>>();
        assert!(tokens.iter().all(|&token| token == 0 || token == 1));
        assert!(tokens.contains(&0));
        assert!(tokens.contains(&1));
    }
}
