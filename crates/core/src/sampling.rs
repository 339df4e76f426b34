//! Token selection for the generation loop.
//!
//! Logits arrive as a `[batch, vocab]` tensor; each row is processed on the
//! host (repetition penalty, temperature, min-p, top-k, top-p) and a token is
//! drawn from the resulting distribution.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Parameters controlling token sampling behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// 0.0 selects greedy decoding.
    pub temperature: f32,
    /// Nucleus threshold in (0, 1]. 1.0 disables it.
    pub top_p: f32,
    /// 0 disables top-k filtering.
    pub top_k: u32,
    /// 1.0 disables the penalty; values above 1.0 discourage repeats.
    pub repetition_penalty: f32,
    /// Minimum probability relative to the most likely token.
    pub min_p: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            min_p: 0.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

/// Stateful sampler; owns the RNG so a seeded run is reproducible.
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { params, rng }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Apply the penalty and temperature to one row, returning the scores a
    /// caller would report for this step.
    pub fn process_logits(&self, logits: &[f32], history: &[u32]) -> Vec<f32> {
        let mut logits = logits.to_vec();
        if self.params.repetition_penalty != 1.0 {
            apply_repetition_penalty(&mut logits, history, self.params.repetition_penalty);
        }
        if !self.params.is_greedy() && self.params.temperature != 1.0 {
            let inv_temp = 1.0 / self.params.temperature;
            for logit in logits.iter_mut() {
                *logit *= inv_temp;
            }
        }
        logits
    }

    /// Pick the next token from already processed scores.
    pub fn sample_processed(&mut self, scores: &[f32]) -> u32 {
        if self.params.is_greedy() {
            return argmax(scores);
        }
        let vocab_size = scores.len();
        let mut probs = softmax(scores);
        if self.params.min_p > 0.0 {
            apply_min_p(&mut probs, self.params.min_p);
        }
        if self.params.top_k > 0 && (self.params.top_k as usize) < vocab_size {
            apply_top_k(&mut probs, self.params.top_k as usize);
        }
        if self.params.top_p > 0.0 && self.params.top_p < 1.0 {
            apply_top_p(&mut probs, self.params.top_p);
        }
        let sum: f32 = probs.iter().sum();
        if sum > 0.0 && sum != 1.0 {
            let inv_sum = 1.0 / sum;
            for p in probs.iter_mut() {
                *p *= inv_sum;
            }
        }
        sample_from_probs(&probs, &mut self.rng)
    }

    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> u32 {
        let scores = self.process_logits(logits, history);
        self.sample_processed(&scores)
    }

    /// Sample one token per row of a `[batch, vocab]` logits tensor.
    ///
    /// Returns the chosen ids and the processed scores for each row.
    pub fn sample_batch(
        &mut self,
        logits: &Tensor,
        histories: &[Vec<u32>],
    ) -> candle_core::Result<(Vec<u32>, Vec<Vec<f32>>)> {
        let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut tokens = Vec::with_capacity(rows.len());
        let mut scores = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let history = histories.get(i).map(Vec::as_slice).unwrap_or(&[]);
            let processed = self.process_logits(row, history);
            tokens.push(self.sample_processed(&processed));
            scores.push(processed);
        }
        Ok((tokens, scores))
    }
}

fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let mut seen = history.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for token_id in seen {
        let idx = token_id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

fn apply_min_p(probs: &mut [f32], min_p: f32) {
    let max_prob = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = max_prob * min_p;
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff = i + 1;
            break;
        }
    }
    for &(idx, _) in &indexed[cutoff..] {
        probs[idx] = 0.0;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i;
        }
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    last_nonzero as u32
}
