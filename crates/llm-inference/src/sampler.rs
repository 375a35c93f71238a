//! Next-token selection: greedy, or temperature with top-k and nucleus truncation.

use crate::tokenizer::TokenId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Temperatures below this are treated as greedy decoding.
pub const GREEDY_TEMPERATURE: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Candidates kept after sorting. `0` keeps the whole vocabulary.
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            temperature: 0.9,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < GREEDY_TEMPERATURE
    }
}

/// Seeded sampler. The same seed and logits always yield the same token.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    rng: fastrand::Rng,
}

impl Sampler {
    pub fn new(params: SamplingParams, seed: u64) -> Self {
        Self {
            params,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Returns `None` only for an empty logit slice.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        if logits.is_empty() {
            return None;
        }
        if self.params.is_greedy() {
            return argmax(logits);
        }

        let candidates = self.candidates(logits);
        let total: f32 = candidates.iter().map(|(_, p)| p).sum();
        let draw = self.rng.f32() * total;

        let mut cumulative = 0.0;
        for &(id, p) in &candidates {
            cumulative += p;
            if draw < cumulative {
                return Some(id);
            }
        }
        candidates.last().map(|&(id, _)| id)
    }

    /// Kept candidates in descending probability, each with its unnormalized share.
    fn candidates(&self, logits: &[f32]) -> Vec<(TokenId, f32)> {
        let temperature = self.params.temperature;
        let max = logits
            .iter()
            .map(|l| l / temperature)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, l)| (i as TokenId, (l / temperature - max).exp()))
            .collect();
        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        for (_, p) in probs.iter_mut() {
            *p /= sum;
        }

        let k = match self.params.top_k {
            0 => probs.len(),
            k => k.min(probs.len()),
        };
        if k < probs.len() {
            probs.select_nth_unstable_by(k - 1, by_probability);
            probs.truncate(k);
        }
        probs.sort_by(by_probability);

        let kept: f32 = probs.iter().map(|(_, p)| p).sum();
        let mut cumulative = 0.0;
        let mut keep = probs.len();
        for (i, (_, p)) in probs.iter().enumerate() {
            cumulative += p / kept;
            if cumulative >= self.params.top_p {
                keep = i + 1;
                break;
            }
        }
        probs.truncate(keep.max(1));
        probs
    }
}

/// Descending probability, ties broken by ascending token id.
fn by_probability(a: &(TokenId, f32), b: &(TokenId, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

/// Index of the largest logit, lowest index on ties.
pub fn argmax(logits: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        match best {
            Some((_, b)) if l <= b => {}
            _ => best = Some((i, l)),
        }
    }
    best.map(|(i, _)| i as TokenId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_first_maximum() {
        let mut sampler = Sampler::new(SamplingParams::greedy(), 0);
        assert_eq!(sampler.sample(&[0.1, 3.0, 3.0, -1.0]), Some(1));
        assert_eq!(sampler.sample(&[]), None);
    }

    #[test]
    fn same_seed_same_sequence() {
        let logits: Vec<f32> = (0..50).map(|i| ((i * 7) % 13) as f32 * 0.3).collect();
        let params = SamplingParams {
            top_k: 0,
            top_p: 1.0,
            temperature: 1.0,
        };
        let mut a = Sampler::new(params, 42);
        let mut b = Sampler::new(params, 42);
        let first: Vec<_> = (0..20).map(|_| a.sample(&logits)).collect();
        let second: Vec<_> = (0..20).map(|_| b.sample(&logits)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn top_k_one_is_greedy() {
        let logits = [0.5, 2.0, 1.9, 2.0];
        let params = SamplingParams {
            top_k: 1,
            top_p: 1.0,
            temperature: 1.5,
        };
        let mut sampler = Sampler::new(params, 3);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits), Some(1));
        }
    }

    #[test]
    fn tiny_top_p_keeps_one_candidate() {
        let logits = [1.0, 4.0, 3.0];
        let params = SamplingParams {
            top_k: 0,
            top_p: 0.01,
            temperature: 1.0,
        };
        let mut sampler = Sampler::new(params, 8);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits), Some(1));
        }
    }

    #[test]
    fn nucleus_excludes_tail() {
        // softmax of [10, 10, 0, 0] puts almost all mass on the first two
        let logits = [10.0, 10.0, 0.0, 0.0];
        let params = SamplingParams {
            top_k: 0,
            top_p: 0.9,
            temperature: 1.0,
        };
        let sampler = Sampler::new(params, 1);
        let kept: Vec<TokenId> = sampler.candidates(&logits).iter().map(|c| c.0).collect();
        assert_eq!(kept, vec![0, 1]);

        let mut sampler = sampler;
        for _ in 0..50 {
            let token = sampler.sample(&logits).expect("token");
            assert!(token < 2);
        }
    }

    #[test]
    fn top_k_larger_than_vocab_keeps_all() {
        let logits = [0.0, 0.0, 0.0];
        let params = SamplingParams {
            top_k: 10,
            top_p: 1.0,
            temperature: 1.0,
        };
        let sampler = Sampler::new(params, 0);
        let kept: Vec<TokenId> = sampler.candidates(&logits).iter().map(|c| c.0).collect();
        assert_eq!(kept, vec![0, 1, 2]);
    }
}
