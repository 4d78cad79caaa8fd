//! Next-Token Sampling
//!
//! # Overview
//!
//! Turns a logit vector into the next token id:
//! - **Greedy**: argmax, ties broken toward the lowest index
//! - **Temperature**: softmax then inverse-CDF sampling
//! - **Top-k**: keep the k most probable tokens, renormalize, sample
//! - **Top-p (nucleus)**: keep the smallest prefix of the sorted
//!   distribution with cumulative mass ≥ p, renormalize, sample
//!
//! Edge cases pinned down by the engine's contracts:
//! - temperature ≤ 0 is forced to 1
//! - `k ≥ vocab` degenerates to plain temperature sampling
//! - `p ≥ 1` degenerates to plain temperature sampling
//! - `p = 0` (or a first token already past p) selects the single most
//!   probable token
//!
//! # Determinism
//!
//! Randomness flows through an explicit [`SamplerState`], a 32-bit linear
//! congruential generator (multiplier 1664525, increment 1013904223).
//! Outputs are normalized to `[0, 1)` by masking the sign bit. The same
//! seed always reproduces the same token sequence; seed 0 draws an initial
//! state from the wall clock.

use serde::Serialize;

use crate::errors::{EngineError, EngineResult};

const LCG_MULTIPLIER: u32 = 1_664_525;
const LCG_INCREMENT: u32 = 1_013_904_223;

/// Sampling method selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplingMethod {
    Greedy,
    Temperature,
    TopK,
    TopP,
}

impl std::str::FromStr for SamplingMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "greedy" => Ok(SamplingMethod::Greedy),
            "temperature" => Ok(SamplingMethod::Temperature),
            "top-k" | "topk" => Ok(SamplingMethod::TopK),
            "top-p" | "topp" => Ok(SamplingMethod::TopP),
            other => Err(EngineError::InvalidArgument {
                what: format!("sampling method '{}'", other),
            }),
        }
    }
}

/// Generation parameters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    pub method: SamplingMethod,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    /// PRNG seed; 0 seeds from the wall clock
    pub seed: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 64,
            method: SamplingMethod::Temperature,
            temperature: 1.0,
            top_k: 40,
            top_p: 0.9,
            seed: 0,
        }
    }
}

impl GenerationParams {
    /// Deterministic greedy decoding
    pub fn greedy() -> Self {
        Self {
            method: SamplingMethod::Greedy,
            ..Default::default()
        }
    }
}

/// Explicit sampler PRNG state
///
/// Threaded through generation instead of any global state.
#[derive(Debug, Clone, Copy)]
pub struct SamplerState {
    state: u32,
}

impl SamplerState {
    /// Seed the generator; 0 uses the wall clock
    pub fn new(seed: u32) -> Self {
        let state = if seed == 0 {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0x9E37_79B9);
            nanos | 1
        } else {
            seed
        };
        Self { state }
    }

    /// Advance and return the raw 32-bit state
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }

    /// Advance and return a value in `[0, 1)`
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() & 0x7FFF_FFFF) as f32 / 2_147_483_648.0
    }
}

/// Argmax with ties broken toward the lowest index
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Sample the next token from raw logits
pub fn sample(
    logits: &[f32],
    params: &GenerationParams,
    state: &mut SamplerState,
) -> EngineResult<usize> {
    if logits.is_empty() {
        return Err(EngineError::InvalidArgument {
            what: "empty logits".into(),
        });
    }

    if params.method == SamplingMethod::Greedy {
        return Ok(argmax(logits));
    }

    // Temperature scaling; non-positive temperatures are forced to 1
    let temperature = if params.temperature <= 0.0 {
        1.0
    } else {
        params.temperature
    };
    let probs = softmax_scaled(logits, temperature);

    match params.method {
        SamplingMethod::Greedy => unreachable!("handled above"),
        SamplingMethod::Temperature => Ok(sample_cdf(&probs, state)),
        SamplingMethod::TopK => {
            if params.top_k == 0 || params.top_k >= probs.len() {
                // Degenerates to plain temperature sampling
                return Ok(sample_cdf(&probs, state));
            }
            let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            indexed.truncate(params.top_k);
            Ok(sample_indexed(&indexed, state))
        }
        SamplingMethod::TopP => {
            if params.top_p >= 1.0 {
                return Ok(sample_cdf(&probs, state));
            }
            let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
            indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            // Smallest prefix with cumulative mass >= p; the first token
            // alone covers p = 0 and the already-past-p case
            let mut cutoff = 1;
            let mut cumulative = indexed[0].1;
            while cumulative < params.top_p && cutoff < indexed.len() {
                cumulative += indexed[cutoff].1;
                cutoff += 1;
            }
            indexed.truncate(cutoff);
            Ok(sample_indexed(&indexed, state))
        }
    }
}

/// Softmax of `logits / temperature` with max subtraction
fn softmax_scaled(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut out: Vec<f32> = logits
        .iter()
        .map(|&x| ((x - max) / temperature).exp())
        .collect();
    let sum: f32 = out.iter().sum();
    if sum > 0.0 {
        let inv = 1.0 / sum;
        out.iter_mut().for_each(|p| *p *= inv);
    }
    out
}

/// Inverse-CDF draw over a full distribution
fn sample_cdf(probs: &[f32], state: &mut SamplerState) -> usize {
    let r = state.next_f32();
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    // Rounding slack: fall back to the last non-zero entry
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len() - 1)
}

/// Inverse-CDF draw over a filtered `(index, prob)` list, renormalized
fn sample_indexed(indexed: &[(usize, f32)], state: &mut SamplerState) -> usize {
    let total: f32 = indexed.iter().map(|(_, p)| p).sum();
    if total <= 0.0 {
        return indexed[0].0;
    }
    let r = state.next_f32() * total;
    let mut cumulative = 0.0f32;
    for &(idx, p) in indexed {
        cumulative += p;
        if r < cumulative {
            return idx;
        }
    }
    indexed.last().expect("non-empty").0
}
