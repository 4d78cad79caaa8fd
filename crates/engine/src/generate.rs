//! Autoregressive Generation Loop
//!
//! # Overview
//!
//! Drives the model token by token:
//!
//! ```text
//! 1. Seed the sampler from params.seed (wall clock when 0)
//! 2. Start from the prompt ids, or <bos> when the prompt is empty
//! 3. Loop: forward over the last min(len, context) ids,
//!          sample the next id, append
//! 4. Stop on <eos>, the token limit, or the generation buffer cap
//! ```
//!
//! Rnn models are stepped through the prompt one id at a time to build up
//! their recurrent state before sampling begins.

use std::time::Instant;

use serde::Serialize;

use crate::errors::EngineResult;
use crate::model::{Model, ModelKind};
use crate::sampling::{sample, GenerationParams, SamplerState};
use crate::tokenizer::{BOS_ID, EOS_ID};

/// Hard cap on the token buffer, prompt included
pub const GENERATION_BUFFER_CAP: usize = 4096;

/// Counters for one generation call
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub forward_calls: u64,
    pub elapsed_ns: u64,
}

/// Generation driver bound to one model
pub struct Generator<'m> {
    model: &'m mut Model,
    stats: GenerationStats,
}

impl<'m> Generator<'m> {
    pub fn new(model: &'m mut Model) -> Self {
        Self {
            model,
            stats: GenerationStats::default(),
        }
    }

    pub fn stats(&self) -> GenerationStats {
        self.stats
    }

    /// Generate a continuation of `prompt_ids`
    ///
    /// Returns the full token buffer (prompt plus continuation, including
    /// the terminating `<eos>` when one was sampled).
    pub fn generate(
        &mut self,
        prompt_ids: &[u32],
        params: &GenerationParams,
    ) -> EngineResult<Vec<u32>> {
        self.generate_stream(prompt_ids, params, |_| {})
    }

    /// Generate, invoking `on_token` for every newly sampled id
    pub fn generate_stream<F>(
        &mut self,
        prompt_ids: &[u32],
        params: &GenerationParams,
        mut on_token: F,
    ) -> EngineResult<Vec<u32>>
    where
        F: FnMut(u32),
    {
        let started = Instant::now();
        let mut state = SamplerState::new(params.seed);
        self.stats = GenerationStats {
            prompt_tokens: prompt_ids.len(),
            ..GenerationStats::default()
        };

        let mut tokens: Vec<u32> = if prompt_ids.is_empty() {
            vec![BOS_ID]
        } else {
            prompt_ids.to_vec()
        };

        let context = self.model.context_size();
        let limit = (tokens.len() + params.max_tokens).min(GENERATION_BUFFER_CAP);
        let mut logits = vec![0.0f32; self.model.vocab_size()];

        // Rnn models consume one id per step; replay the prompt first
        if self.model.kind() == ModelKind::Rnn {
            self.model.reset_state();
            for &id in &tokens[..tokens.len() - 1] {
                self.model.forward(&[id], &mut logits)?;
                self.stats.forward_calls += 1;
            }
        }

        while tokens.len() < limit {
            let window_start = tokens.len().saturating_sub(context);
            self.model.forward(&tokens[window_start..], &mut logits)?;
            self.stats.forward_calls += 1;

            let next = sample(&logits, params, &mut state)? as u32;
            tokens.push(next);
            self.stats.generated_tokens += 1;
            on_token(next);

            if next == EOS_ID {
                break;
            }
        }

        self.stats.elapsed_ns = started.elapsed().as_nanos() as u64;
        tracing::info!(
            prompt = self.stats.prompt_tokens,
            generated = self.stats.generated_tokens,
            "generation finished"
        );
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{LayerArch, LayerWeights, ModelArch};
    use crate::model::LayerKind;
    use crate::quantize::{DenseMatrixF32, QuantizedMatrix4};
    use crate::simd::Kernels;
    use crate::tables::Activation;

    /// Model whose output always prefers a fixed token
    fn constant_model(preferred: usize, vocab: usize) -> Model {
        let h = 2;
        let arch = ModelArch {
            model_kind: crate::model::ModelKind::Transformer,
            hidden_size: h,
            context_size: 4,
            layers: vec![
                LayerArch {
                    kind: LayerKind::Embedding,
                    input_size: vocab,
                    output_size: h,
                    activation: Activation::None,
                },
                LayerArch {
                    kind: LayerKind::Output,
                    input_size: h,
                    output_size: vocab,
                    activation: Activation::None,
                },
            ],
        };

        let embedding = QuantizedMatrix4::quantize(
            &DenseMatrixF32::new(vocab, h, vec![0.5; vocab * h]).unwrap(),
        )
        .unwrap();
        let output = QuantizedMatrix4::quantize(
            &DenseMatrixF32::new(vocab, h, vec![0.0; vocab * h]).unwrap(),
        )
        .unwrap();
        let mut out_bias = vec![0.0f32; vocab];
        out_bias[preferred] = 10.0;

        let weights = vec![
            LayerWeights {
                matrix: embedding,
                bias: vec![0.0; h],
            },
            LayerWeights {
                matrix: output,
                bias: out_bias,
            },
        ];
        Model::from_parts(&arch, weights, Kernels::detect()).unwrap()
    }

    #[test]
    fn test_generation_stops_at_limit() {
        let mut model = constant_model(5, 8);
        let mut generator = Generator::new(&mut model);
        let params = GenerationParams {
            max_tokens: 3,
            ..GenerationParams::greedy()
        };

        let tokens = generator.generate(&[4, 5], &params).unwrap();
        assert_eq!(tokens, vec![4, 5, 5, 5, 5]);
        assert_eq!(generator.stats().generated_tokens, 3);
    }

    #[test]
    fn test_empty_prompt_starts_with_bos() {
        let mut model = constant_model(6, 8);
        let mut generator = Generator::new(&mut model);
        let params = GenerationParams {
            max_tokens: 2,
            ..GenerationParams::greedy()
        };

        let tokens = generator.generate(&[], &params).unwrap();
        assert_eq!(tokens[0], BOS_ID);
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_generation_stops_on_eos() {
        let mut model = constant_model(EOS_ID as usize, 8);
        let mut generator = Generator::new(&mut model);
        let params = GenerationParams {
            max_tokens: 50,
            ..GenerationParams::greedy()
        };

        let tokens = generator.generate(&[4], &params).unwrap();
        assert_eq!(tokens, vec![4, EOS_ID]);
        assert_eq!(generator.stats().generated_tokens, 1);
    }

    #[test]
    fn test_stream_callback_sees_new_tokens_only() {
        let mut model = constant_model(3, 8);
        let mut generator = Generator::new(&mut model);
        let params = GenerationParams {
            max_tokens: 2,
            ..GenerationParams::greedy()
        };

        let mut seen = Vec::new();
        generator
            .generate_stream(&[4, 5], &params, |t| seen.push(t))
            .unwrap();
        assert_eq!(seen, vec![3, 3]);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let params = GenerationParams {
            max_tokens: 8,
            method: crate::sampling::SamplingMethod::Temperature,
            seed: 1234,
            ..Default::default()
        };

        let mut model_a = constant_model(2, 8);
        let a = Generator::new(&mut model_a).generate(&[4], &params).unwrap();
        let mut model_b = constant_model(2, 8);
        let b = Generator::new(&mut model_b).generate(&[4], &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_window_clamps_to_context() {
        let mut model = constant_model(5, 8);
        let context = model.context_size();
        let mut generator = Generator::new(&mut model);
        let params = GenerationParams {
            max_tokens: 4,
            ..GenerationParams::greedy()
        };

        // Prompt longer than the context: forward must window, not fail
        let prompt = vec![4u32; context + 3];
        let tokens = generator.generate(&prompt, &params).unwrap();
        assert_eq!(tokens.len(), prompt.len() + 4);
    }
}
