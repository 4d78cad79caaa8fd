//! Model Runner
//!
//! # Overview
//!
//! Wires token ids through the full inference pipeline:
//!
//! ```text
//! input ids
//!     │
//!     ▼
//! ┌─────────────────┐
//! │ Embedding       │  quantized row gather, dequantizes only the
//! └────────┬────────┘  requested rows
//!          ▼
//! ┌─────────────────┐
//! │ Layer loop      │  attention / dense / layernorm (transformer)
//! │                 │  recurrent single-step (rnn)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ Output          │  logits for the last position over the vocabulary
//! └─────────────────┘
//! ```
//!
//! Activations flow through two ping-pong buffers owned by the model, each
//! sized `context_size * hidden_size`; the active-buffer index flips after
//! every layer that produces a new activation tensor.
//!
//! # Layer Records
//!
//! Each layer carries the parameters its kind needs. Weight matrices are
//! output-major `(output_size, input_size)` except the embedding, which is
//! `(vocab, hidden)` for row gather. Two kinds overload the declared sizes:
//!
//! - **Attention**: `output_size = 4 * hidden`; the packed matrix holds
//!   W_Q, W_K, W_V, W_O stacked row-wise and the bias holds the four bias
//!   vectors back to back. The logical output is `hidden` wide.
//! - **LayerNorm**: `output_size = 2 * hidden`; the bias holds the scale
//!   entries first, then the shifts. Normalization uses epsilon `1e-5`.
//! - **Rnn**: `input_size = feature_in + output_size`; the packed matrix
//!   multiplies the concatenation `[x; h]` for the single-step update
//!   `h' = act(W·[x; h] + b)`.

use std::path::Path;
use std::sync::Arc;

use crate::attention::{AttentionParams, AttentionWeights, SelfAttention};
use crate::errors::{EngineError, EngineResult};
use crate::format::{self, LayerWeights, ModelArch};
use crate::quantize::QuantizedMatrix4;
use crate::simd::Kernels;
use crate::tables::Activation;
use crate::tokenizer::Vocabulary;

/// Layernorm stabilization epsilon
pub const LAYERNORM_EPS: f32 = 1e-5;

/// Head width attention layers default to when the hidden size allows it
const DEFAULT_HEAD_DIM: usize = 64;

/// Model kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ModelKind {
    Rnn,
    Transformer,
}

impl ModelKind {
    pub fn to_u32(self) -> u32 {
        match self {
            ModelKind::Rnn => 0,
            ModelKind::Transformer => 1,
        }
    }

    pub fn from_u32(v: u32) -> EngineResult<Self> {
        match v {
            0 => Ok(ModelKind::Rnn),
            1 => Ok(ModelKind::Transformer),
            other => Err(EngineError::InvalidArgument {
                what: format!("model kind {}", other),
            }),
        }
    }
}

/// Layer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LayerKind {
    Embedding,
    Dense,
    Rnn,
    Attention,
    LayerNorm,
    Output,
}

impl LayerKind {
    pub fn to_u32(self) -> u32 {
        match self {
            LayerKind::Embedding => 0,
            LayerKind::Dense => 1,
            LayerKind::Rnn => 2,
            LayerKind::Attention => 3,
            LayerKind::LayerNorm => 4,
            LayerKind::Output => 5,
        }
    }

    pub fn from_u32(v: u32) -> EngineResult<Self> {
        match v {
            0 => Ok(LayerKind::Embedding),
            1 => Ok(LayerKind::Dense),
            2 => Ok(LayerKind::Rnn),
            3 => Ok(LayerKind::Attention),
            4 => Ok(LayerKind::LayerNorm),
            5 => Ok(LayerKind::Output),
            other => Err(EngineError::InvalidArgument {
                what: format!("layer kind {}", other),
            }),
        }
    }
}

/// One model layer
pub struct Layer {
    pub kind: LayerKind,
    pub input_size: usize,
    pub output_size: usize,
    pub activation: Activation,
    pub weights: QuantizedMatrix4,
    pub bias: Option<Vec<f32>>,
}

/// Per-layer runtime state the plain record cannot hold
enum LayerState {
    Plain,
    Attention(Box<SelfAttention>),
    Rnn { hidden: Vec<f32> },
}

/// Loaded model ready for inference
pub struct Model {
    kind: ModelKind,
    hidden_size: usize,
    context_size: usize,
    vocab_size: usize,
    layers: Vec<Layer>,
    states: Vec<LayerState>,
    kernels: Kernels,
    /// Ping-pong activation buffers, each `context_size * hidden_size`
    buffers: [Vec<f32>; 2],
    active: usize,
    tokenizer: Option<Arc<Vocabulary>>,
}

impl Model {
    /// Load a model from its architecture and weights files
    pub fn load(arch_path: &Path, weights_path: &Path, kernels: Kernels) -> EngineResult<Self> {
        let arch = format::read_arch_file(arch_path)?;
        let weights = format::read_weights_file(weights_path, &arch)?;
        let model = Self::from_parts(&arch, weights, kernels)?;
        tracing::info!(
            kind = ?model.kind,
            hidden = model.hidden_size,
            context = model.context_size,
            vocab = model.vocab_size,
            layers = model.layers.len(),
            "model loaded"
        );
        Ok(model)
    }

    /// Assemble a model from parsed parts
    ///
    /// Validates the full layer stack; nothing is retained on failure.
    pub fn from_parts(
        arch: &ModelArch,
        weights: Vec<LayerWeights>,
        kernels: Kernels,
    ) -> EngineResult<Self> {
        if weights.len() != arch.layers.len() {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "{} weight records for {} layers",
                    weights.len(),
                    arch.layers.len()
                ),
            });
        }
        if arch.layers.len() < 2 {
            return Err(EngineError::InvalidShape {
                context: "a model needs at least an embedding and an output layer".into(),
            });
        }

        let hidden = arch.hidden_size;
        let first = &arch.layers[0];
        let last = arch.layers.last().expect("checked non-empty");
        if first.kind != LayerKind::Embedding {
            return Err(EngineError::InvalidShape {
                context: format!("first layer is {:?}, expected embedding", first.kind),
            });
        }
        if last.kind != LayerKind::Output {
            return Err(EngineError::InvalidShape {
                context: format!("last layer is {:?}, expected output", last.kind),
            });
        }
        if first.output_size != hidden {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "embedding width {} does not match hidden size {}",
                    first.output_size, hidden
                ),
            });
        }
        let vocab = first.input_size;
        if last.input_size != hidden || last.output_size != vocab {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "output layer {}x{}, expected {}x{}",
                    last.input_size, last.output_size, hidden, vocab
                ),
            });
        }

        let mut layers = Vec::with_capacity(arch.layers.len());
        let mut states = Vec::with_capacity(arch.layers.len());
        let mut prev_width = hidden;
        for (i, (meta, lw)) in arch.layers.iter().zip(weights.into_iter()).enumerate() {
            let state = match meta.kind {
                LayerKind::Embedding | LayerKind::Output => LayerState::Plain,
                LayerKind::Dense => {
                    if arch.model_kind == ModelKind::Transformer
                        && (meta.input_size != hidden || meta.output_size != hidden)
                    {
                        return Err(EngineError::InvalidShape {
                            context: format!(
                                "dense layer {} is {}x{}, expected {}x{}",
                                i, meta.input_size, meta.output_size, hidden, hidden
                            ),
                        });
                    }
                    LayerState::Plain
                }
                LayerKind::LayerNorm => {
                    if meta.input_size != hidden || meta.output_size != 2 * hidden {
                        return Err(EngineError::InvalidShape {
                            context: format!(
                                "layernorm layer {} declares {}x{}, expected {}x{}",
                                i,
                                meta.input_size,
                                meta.output_size,
                                hidden,
                                2 * hidden
                            ),
                        });
                    }
                    LayerState::Plain
                }
                LayerKind::Attention => {
                    if arch.model_kind != ModelKind::Transformer {
                        return Err(EngineError::NotImplemented {
                            what: "attention layers outside transformer models".into(),
                        });
                    }
                    if meta.input_size != hidden || meta.output_size != 4 * hidden {
                        return Err(EngineError::InvalidShape {
                            context: format!(
                                "attention layer {} declares {}x{}, expected {}x{}",
                                i,
                                meta.input_size,
                                meta.output_size,
                                hidden,
                                4 * hidden
                            ),
                        });
                    }
                    let block =
                        build_attention(&lw, hidden, arch.context_size, kernels)?;
                    LayerState::Attention(Box::new(block))
                }
                LayerKind::Rnn => {
                    if arch.model_kind != ModelKind::Rnn {
                        return Err(EngineError::NotImplemented {
                            what: "recurrent layers outside rnn models".into(),
                        });
                    }
                    if meta.input_size != prev_width + meta.output_size {
                        return Err(EngineError::InvalidShape {
                            context: format!(
                                "rnn layer {} declares input {}, expected features {} + state {}",
                                i, meta.input_size, prev_width, meta.output_size
                            ),
                        });
                    }
                    LayerState::Rnn {
                        hidden: vec![0.0; meta.output_size],
                    }
                }
            };

            prev_width = logical_output(meta.kind, meta.input_size, meta.output_size);
            layers.push(Layer {
                kind: meta.kind,
                input_size: meta.input_size,
                output_size: meta.output_size,
                activation: meta.activation,
                weights: lw.matrix,
                bias: Some(lw.bias),
            });
            states.push(state);
        }

        let buf_len = arch.context_size * hidden;
        Ok(Self {
            kind: arch.model_kind,
            hidden_size: hidden,
            context_size: arch.context_size,
            vocab_size: vocab,
            layers,
            states,
            kernels,
            buffers: [vec![0.0; buf_len], vec![0.0; buf_len]],
            active: 0,
            tokenizer: None,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Attach a shared vocabulary (the model does not own it)
    pub fn set_tokenizer(&mut self, tokenizer: Arc<Vocabulary>) {
        self.tokenizer = Some(tokenizer);
    }

    pub fn tokenizer(&self) -> Option<&Arc<Vocabulary>> {
        self.tokenizer.as_ref()
    }

    /// Clear recurrent state (rnn models)
    pub fn reset_state(&mut self) {
        for state in &mut self.states {
            if let LayerState::Rnn { hidden } = state {
                hidden.iter_mut().for_each(|v| *v = 0.0);
            }
        }
    }

    /// Run one forward pass
    ///
    /// Transformer models receive the whole window of ids and produce
    /// logits for the last position; rnn models consume the last id as a
    /// single recurrent step.
    pub fn forward(&mut self, input_ids: &[u32], logits: &mut [f32]) -> EngineResult<()> {
        if input_ids.is_empty() || input_ids.len() > self.context_size {
            return Err(EngineError::InvalidArgument {
                what: format!(
                    "{} input ids for context size {}",
                    input_ids.len(),
                    self.context_size
                ),
            });
        }
        if logits.len() != self.vocab_size {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "logits buffer {} for vocabulary {}",
                    logits.len(),
                    self.vocab_size
                ),
            });
        }
        for &id in input_ids {
            if id as usize >= self.vocab_size {
                return Err(EngineError::InvalidArgument {
                    what: format!("token id {} outside vocabulary {}", id, self.vocab_size),
                });
            }
        }

        match self.kind {
            ModelKind::Transformer => self.forward_transformer(input_ids, logits),
            ModelKind::Rnn => self.forward_rnn(*input_ids.last().expect("non-empty"), logits),
        }
    }

    fn forward_transformer(&mut self, input_ids: &[u32], logits: &mut [f32]) -> EngineResult<()> {
        let h = self.hidden_size;
        let s = input_ids.len();

        // Embedding: gather only the requested rows
        let embedding = &self.layers[0];
        for (pos, &id) in input_ids.iter().enumerate() {
            embedding
                .weights
                .row_values(id as usize, &mut self.buffers[self.active][pos * h..(pos + 1) * h])?;
        }

        for i in 1..self.layers.len() - 1 {
            let (src, dst) = split_buffers(&mut self.buffers, self.active);
            let layer = &self.layers[i];
            match layer.kind {
                LayerKind::Dense => {
                    for pos in 0..s {
                        let x = &src[pos * h..(pos + 1) * h];
                        let out = &mut dst[pos * h..(pos + 1) * h];
                        self.kernels.matmul_q4_vec(out, &layer.weights, x)?;
                        if let Some(bias) = &layer.bias {
                            self.kernels.bias_add_inplace(out, bias)?;
                        }
                        self.kernels.activate_inplace(out, layer.activation);
                    }
                }
                LayerKind::LayerNorm => {
                    let bias = layer.bias.as_ref().ok_or_else(|| EngineError::InvalidShape {
                        context: "layernorm without scale/shift parameters".into(),
                    })?;
                    let (scale, shift) = bias.split_at(h);
                    for pos in 0..s {
                        layer_norm(
                            &src[pos * h..(pos + 1) * h],
                            scale,
                            shift,
                            &mut dst[pos * h..(pos + 1) * h],
                        );
                    }
                }
                LayerKind::Attention => {
                    match &mut self.states[i] {
                        LayerState::Attention(block) => {
                            block.forward(&src[..s * h], &mut dst[..s * h])?;
                        }
                        _ => {
                            return Err(EngineError::InvalidArgument {
                                what: format!("layer {} has no attention state", i),
                            })
                        }
                    }
                }
                other => {
                    return Err(EngineError::NotImplemented {
                        what: format!("{:?} inside the transformer layer loop", other),
                    })
                }
            }
            self.active = 1 - self.active;
        }

        // Logits from the output layer's row for the last position
        let output = self.layers.last().expect("validated");
        let last = &self.buffers[self.active][(s - 1) * h..s * h];
        self.kernels.matmul_q4_vec(logits, &output.weights, last)?;
        if let Some(bias) = &output.bias {
            self.kernels.bias_add_inplace(logits, bias)?;
        }
        Ok(())
    }

    fn forward_rnn(&mut self, input_id: u32, logits: &mut [f32]) -> EngineResult<()> {
        let h = self.hidden_size;

        let embedding = &self.layers[0];
        let mut x = vec![0.0f32; h];
        embedding.weights.row_values(input_id as usize, &mut x)?;

        for i in 1..self.layers.len() - 1 {
            let layer = &self.layers[i];
            match layer.kind {
                LayerKind::Rnn => {
                    let state = match &mut self.states[i] {
                        LayerState::Rnn { hidden } => hidden,
                        _ => {
                            return Err(EngineError::InvalidArgument {
                                what: format!("layer {} has no recurrent state", i),
                            })
                        }
                    };
                    // Packed input [x; h], packed matrix [W | U]
                    let mut packed = Vec::with_capacity(layer.input_size);
                    packed.extend_from_slice(&x);
                    packed.extend_from_slice(state);
                    let mut next = vec![0.0f32; layer.output_size];
                    self.kernels
                        .matmul_q4_vec(&mut next, &layer.weights, &packed)?;
                    if let Some(bias) = &layer.bias {
                        self.kernels.bias_add_inplace(&mut next, bias)?;
                    }
                    self.kernels.activate_inplace(&mut next, layer.activation);
                    state.copy_from_slice(&next);
                    x = next;
                }
                LayerKind::Dense => {
                    let mut next = vec![0.0f32; layer.output_size];
                    self.kernels.matmul_q4_vec(&mut next, &layer.weights, &x)?;
                    if let Some(bias) = &layer.bias {
                        self.kernels.bias_add_inplace(&mut next, bias)?;
                    }
                    self.kernels.activate_inplace(&mut next, layer.activation);
                    x = next;
                }
                other => {
                    return Err(EngineError::NotImplemented {
                        what: format!("{:?} inside the rnn layer loop", other),
                    })
                }
            }
        }

        let output = self.layers.last().expect("validated");
        self.kernels.matmul_q4_vec(logits, &output.weights, &x)?;
        if let Some(bias) = &output.bias {
            self.kernels.bias_add_inplace(logits, bias)?;
        }
        Ok(())
    }
}

/// Logical activation width a layer hands to its successor
fn logical_output(kind: LayerKind, input_size: usize, output_size: usize) -> usize {
    match kind {
        // Declared sizes are storage shapes for these kinds
        LayerKind::Attention | LayerKind::LayerNorm => input_size,
        _ => output_size,
    }
}

/// Split the packed QKVO record into a ready attention block
fn build_attention(
    lw: &LayerWeights,
    hidden: usize,
    context: usize,
    kernels: Kernels,
) -> EngineResult<SelfAttention> {
    let mut heads = (hidden / DEFAULT_HEAD_DIM).max(1);
    while hidden % heads != 0 {
        heads -= 1;
    }
    let params = AttentionParams::new(context, heads, hidden / heads, true)?;
    let mut block = SelfAttention::new(params, kernels)?;

    let m = &lw.matrix;
    let b = &lw.bias;
    block.set_weights(AttentionWeights {
        wq: m.slice_rows(0, hidden)?,
        wk: m.slice_rows(hidden, 2 * hidden)?,
        wv: m.slice_rows(2 * hidden, 3 * hidden)?,
        wo: m.slice_rows(3 * hidden, 4 * hidden)?,
        bq: Some(b[..hidden].to_vec()),
        bk: Some(b[hidden..2 * hidden].to_vec()),
        bv: Some(b[2 * hidden..3 * hidden].to_vec()),
        bo: Some(b[3 * hidden..4 * hidden].to_vec()),
    })?;
    Ok(block)
}

/// Borrow the active buffer immutably and the other mutably
fn split_buffers(buffers: &mut [Vec<f32>; 2], active: usize) -> (&[f32], &mut [f32]) {
    let (a, b) = buffers.split_at_mut(1);
    if active == 0 {
        (&a[0], &mut b[0])
    } else {
        (&b[0], &mut a[0])
    }
}

/// Layernorm over one position
///
/// Mean and variance over the last dimension, learnable scale and shift.
fn layer_norm(x: &[f32], scale: &[f32], shift: &[f32], out: &mut [f32]) {
    let n = x.len();
    let mean = x.iter().sum::<f32>() / n as f32;
    let var = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
    let inv_std = 1.0 / (var + LAYERNORM_EPS).sqrt();
    for i in 0..n {
        out[i] = (x[i] - mean) * inv_std * scale[i] + shift[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::LayerArch;
    use crate::quantize::DenseMatrixF32;

    /// Quantize an f32 matrix laid out `(rows, cols)`
    fn q(rows: usize, cols: usize, data: Vec<f32>) -> QuantizedMatrix4 {
        QuantizedMatrix4::quantize(&DenseMatrixF32::new(rows, cols, data).unwrap()).unwrap()
    }

    fn identity(n: usize) -> Vec<f32> {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        data
    }

    /// Minimal transformer: embedding, layernorm, attention, dense, output
    fn tiny_transformer() -> Model {
        let h = 2;
        let vocab = 4;
        let arch = ModelArch {
            model_kind: ModelKind::Transformer,
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
                    kind: LayerKind::Attention,
                    input_size: h,
                    output_size: 4 * h,
                    activation: Activation::None,
                },
                LayerArch {
                    kind: LayerKind::Dense,
                    input_size: h,
                    output_size: h,
                    activation: Activation::Relu,
                },
                LayerArch {
                    kind: LayerKind::Output,
                    input_size: h,
                    output_size: vocab,
                    activation: Activation::None,
                },
            ],
        };

        // Embedding rows: one-hot-ish distinct vectors on the quantization grid
        let embedding = q(
            vocab,
            h,
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        );
        // Attention: four identity projections stacked
        let mut qkvo = Vec::new();
        for _ in 0..4 {
            qkvo.extend(identity(h));
        }
        let attention = q(4 * h, h, qkvo);
        let dense = q(h, h, identity(h));
        // Output: maps hidden straight onto the first rows of the vocab
        let output = q(
            vocab,
            h,
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0],
        );

        let weights = vec![
            LayerWeights {
                matrix: embedding,
                bias: vec![0.0; h],
            },
            LayerWeights {
                matrix: attention,
                bias: vec![0.0; 4 * h],
            },
            LayerWeights {
                matrix: dense,
                bias: vec![0.0; h],
            },
            LayerWeights {
                matrix: output,
                bias: vec![0.0; vocab],
            },
        ];
        Model::from_parts(&arch, weights, Kernels::detect()).unwrap()
    }

    #[test]
    fn test_kind_wire_roundtrip() {
        for k in [
            LayerKind::Embedding,
            LayerKind::Dense,
            LayerKind::Rnn,
            LayerKind::Attention,
            LayerKind::LayerNorm,
            LayerKind::Output,
        ] {
            assert_eq!(LayerKind::from_u32(k.to_u32()).unwrap(), k);
        }
        assert!(LayerKind::from_u32(42).is_err());
        assert!(ModelKind::from_u32(7).is_err());
    }

    #[test]
    fn test_layer_norm_reference() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let scale = vec![1.0; 4];
        let shift = vec![0.0; 4];
        let mut out = vec![0.0; 4];
        layer_norm(&x, &scale, &shift, &mut out);

        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        // Shift moves the mean
        let shift = vec![2.0; 4];
        layer_norm(&x, &scale, &shift, &mut out);
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!((mean - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_transformer_forward_produces_logits() {
        let mut model = tiny_transformer();
        let mut logits = vec![0.0; model.vocab_size()];
        model.forward(&[1, 2], &mut logits).unwrap();
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_deterministic() {
        let mut model = tiny_transformer();
        let mut a = vec![0.0; model.vocab_size()];
        let mut b = vec![0.0; model.vocab_size()];
        model.forward(&[1, 2, 3], &mut a).unwrap();
        model.forward(&[1, 2, 3], &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_forward_validates_inputs() {
        let mut model = tiny_transformer();
        let vocab = model.vocab_size();

        let mut logits = vec![0.0; vocab];
        assert!(model.forward(&[], &mut logits).is_err());
        assert!(model.forward(&[99], &mut logits).is_err());
        assert!(model.forward(&[0; 5], &mut logits).is_err()); // context is 4

        let mut short = vec![0.0; vocab - 1];
        assert!(model.forward(&[1], &mut short).is_err());
    }

    #[test]
    fn test_from_parts_rejects_bad_stacks() {
        let h = 2;
        let arch = ModelArch {
            model_kind: ModelKind::Transformer,
            hidden_size: h,
            context_size: 4,
            layers: vec![LayerArch {
                kind: LayerKind::Dense,
                input_size: h,
                output_size: h,
                activation: Activation::None,
            }],
        };
        let weights = vec![LayerWeights {
            matrix: q(h, h, identity(h)),
            bias: vec![0.0; h],
        }];
        assert!(Model::from_parts(&arch, weights, Kernels::detect()).is_err());
    }

    #[test]
    fn test_rnn_single_step() {
        let h = 2;
        let vocab = 3;
        let arch = ModelArch {
            model_kind: ModelKind::Rnn,
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
                    kind: LayerKind::Rnn,
                    input_size: h + h,
                    output_size: h,
                    activation: Activation::Tanh,
                },
                LayerArch {
                    kind: LayerKind::Output,
                    input_size: h,
                    output_size: vocab,
                    activation: Activation::None,
                },
            ],
        };
        // [W | U] both identity: h' = tanh(x + h)
        let mut packed = Vec::new();
        for r in 0..h {
            let mut row = vec![0.0; 2 * h];
            row[r] = 1.0;
            row[h + r] = 1.0;
            packed.extend(row);
        }
        let weights = vec![
            LayerWeights {
                matrix: q(vocab, h, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0]),
                bias: vec![0.0; h],
            },
            LayerWeights {
                matrix: q(h, 2 * h, packed),
                bias: vec![0.0; h],
            },
            LayerWeights {
                matrix: q(vocab, h, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
                bias: vec![0.0; vocab],
            },
        ];
        let mut model = Model::from_parts(&arch, weights, Kernels::detect()).unwrap();

        let mut logits1 = vec![0.0; vocab];
        model.forward(&[1], &mut logits1).unwrap();
        // Recurrent state advanced: same input now yields different logits
        let mut logits2 = vec![0.0; vocab];
        model.forward(&[1], &mut logits2).unwrap();
        assert_ne!(logits1, logits2);

        // Reset restores the initial step exactly
        model.reset_state();
        let mut logits3 = vec![0.0; vocab];
        model.forward(&[1], &mut logits3).unwrap();
        assert_eq!(logits1, logits3);
    }
}
