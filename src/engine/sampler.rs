//! Token sampling.
//!
//! Each request owns one [`Sampler`] so its random stream is independent of
//! whatever else shares the batch. A row of logits is turned into one token:
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ├── temperature == 0 ──► argmax
//!     │
//!     ▼ Logits / temperature
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize + sample
//! Selected token
//! ```

use candle_core::{DType, IndexOp, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Per-request token sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits (0 = greedy).
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler, seeded from the config when a seed is given.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Build a sampler with an explicit seed, ignoring the config's.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(config)
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Sample one token from a `[vocab_size]` logits row.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        if self.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }

        let logits = if self.temperature != 1.0 {
            (logits / self.temperature as f64)?
        } else {
            logits
        };

        let vocab_size = logits.dim(0)?;
        let (logits, token_ids) = if self.top_k > 0 && self.top_k < vocab_size {
            top_k(&logits, self.top_k)?
        } else {
            (logits, (0..vocab_size as u32).collect())
        };

        let probs: Vec<f32> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1()?;
        let mut candidates: Vec<(u32, f32)> = token_ids.into_iter().zip(probs).collect();
        if self.top_p > 0.0 && self.top_p < 1.0 {
            nucleus(&mut candidates, self.top_p);
        }

        self.draw(&candidates)
    }

    /// Sample one token per row of `[rows, vocab_size]` logits.
    pub fn sample_rows(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let (rows, _) = logits.dims2()?;
        (0..rows).map(|row| self.sample(&logits.i(row)?)).collect()
    }

    fn draw(&mut self, candidates: &[(u32, f32)]) -> Result<u32> {
        let dist = WeightedIndex::new(candidates.iter().map(|&(_, p)| p as f64)).map_err(|e| {
            Error::Tensor(candle_core::Error::Msg(format!(
                "invalid sampling distribution: {e}"
            )))
        })?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

/// Keep the `k` highest logits, returning them with their token ids.
fn top_k(logits: &Tensor, k: usize) -> Result<(Tensor, Vec<u32>)> {
    let mut indexed: Vec<(u32, f32)> = logits
        .to_vec1::<f32>()?
        .into_iter()
        .enumerate()
        .map(|(i, v)| (i as u32, v))
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);

    let (ids, values): (Vec<u32>, Vec<f32>) = indexed.into_iter().unzip();
    let kept = Tensor::from_vec(values, k, logits.device())?;
    Ok((kept, ids))
}

/// Keep the smallest prefix of most-likely tokens whose mass exceeds `p`.
fn nucleus(candidates: &mut Vec<(u32, f32)>, p: f32) {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut cumulative = 0.0f32;
    let mut keep = candidates.len();
    for (i, &(_, prob)) in candidates.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep);
}
