//! End-to-end pipeline tests
//!
//! Exercises the full flow against real files: write architecture,
//! weights, and vocabulary to disk, load them back, and generate.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use infercore::format::{
    self, LayerArch, LayerWeights, MatrixPayload, ModelArch, WeightsFile,
};
use infercore::generate::Generator;
use infercore::loader::{LoaderConfig, ProgressiveLoader};
use infercore::model::{LayerKind, Model, ModelKind};
use infercore::quantize::{DenseMatrixF32, QuantizedMatrix4};
use infercore::sampling::{GenerationParams, SamplingMethod};
use infercore::simd::Kernels;
use infercore::tables::Activation;
use infercore::tokenizer::Vocabulary;

const HIDDEN: usize = 4;
const VOCAB: usize = 8;
const CONTEXT: usize = 6;

/// Deterministic pseudo-weights on a fixed pattern
fn pattern(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 + phase) * 0.37).sin()).collect()
}

fn test_arch() -> ModelArch {
    ModelArch {
        model_kind: ModelKind::Transformer,
        hidden_size: HIDDEN,
        context_size: CONTEXT,
        layers: vec![
            LayerArch {
                kind: LayerKind::Embedding,
                input_size: VOCAB,
                output_size: HIDDEN,
                activation: Activation::None,
            },
            LayerArch {
                kind: LayerKind::LayerNorm,
                input_size: HIDDEN,
                output_size: 2 * HIDDEN,
                activation: Activation::None,
            },
            LayerArch {
                kind: LayerKind::Attention,
                input_size: HIDDEN,
                output_size: 4 * HIDDEN,
                activation: Activation::None,
            },
            LayerArch {
                kind: LayerKind::Dense,
                input_size: HIDDEN,
                output_size: HIDDEN,
                activation: Activation::Gelu,
            },
            LayerArch {
                kind: LayerKind::Output,
                input_size: HIDDEN,
                output_size: VOCAB,
                activation: Activation::None,
            },
        ],
    }
}

fn test_weights(arch: &ModelArch) -> Vec<LayerWeights> {
    arch.layers
        .iter()
        .enumerate()
        .map(|(i, l)| {
            let n = l.input_size * l.output_size;
            let (rows, cols) = match l.kind {
                LayerKind::Embedding => (l.input_size, l.output_size),
                _ => (l.output_size, l.input_size),
            };
            let dense = DenseMatrixF32::new(rows, cols, pattern(n, i as f32)).unwrap();
            let mut bias = pattern(l.output_size, (i * 7) as f32);
            if l.kind == LayerKind::LayerNorm {
                // Scale entries near 1, shifts near 0
                for b in bias.iter_mut().take(HIDDEN) {
                    *b = 1.0 + *b * 0.1;
                }
            }
            LayerWeights {
                matrix: QuantizedMatrix4::quantize(&dense).unwrap(),
                bias,
            }
        })
        .collect()
}

fn write_fixture(dir: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
    let arch = test_arch();
    let weights = test_weights(&arch);

    let arch_path = dir.path().join("model.arch");
    let weights_path = dir.path().join("model.weights");
    let vocab_path = dir.path().join("model.vocab");

    format::write_arch_file(&arch_path, &arch).unwrap();
    format::write_weights_file(&weights_path, &arch, &weights).unwrap();
    std::fs::write(
        &vocab_path,
        "# test vocab\nalpha 10\nbeta 8\ngamma 5\ndelta 2\n",
    )
    .unwrap();

    (arch_path, weights_path, vocab_path)
}

#[test]
fn full_pipeline_loads_and_generates() {
    let dir = TempDir::new().unwrap();
    let (arch_path, weights_path, vocab_path) = write_fixture(&dir);

    let mut model = Model::load(&arch_path, &weights_path, Kernels::detect()).unwrap();
    let vocab = Arc::new(Vocabulary::load_file(&vocab_path).unwrap());
    assert_eq!(vocab.len(), VOCAB);
    model.set_tokenizer(Arc::clone(&vocab));

    let prompt = vocab.encode("alpha beta");
    assert_eq!(prompt, vec![4, 5]);

    let params = GenerationParams {
        max_tokens: 5,
        ..GenerationParams::greedy()
    };
    let mut generator = Generator::new(&mut model);
    let tokens = generator.generate(&prompt, &params).unwrap();

    assert!(tokens.len() > prompt.len());
    assert!(tokens.iter().all(|&t| (t as usize) < VOCAB));
    assert!(generator.stats().generated_tokens > 0);
}

#[test]
fn repeated_forward_is_bit_identical() {
    let dir = TempDir::new().unwrap();
    let (arch_path, weights_path, _) = write_fixture(&dir);
    let mut model = Model::load(&arch_path, &weights_path, Kernels::detect()).unwrap();

    let mut a = vec![0.0f32; VOCAB];
    let mut b = vec![0.0f32; VOCAB];
    model.forward(&[4, 5, 6], &mut a).unwrap();
    model.forward(&[4, 5, 6], &mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn same_seed_reproduces_token_sequence() {
    let dir = TempDir::new().unwrap();
    let (arch_path, weights_path, _) = write_fixture(&dir);

    let params = GenerationParams {
        max_tokens: 12,
        method: SamplingMethod::TopK,
        top_k: 3,
        temperature: 0.9,
        seed: 777,
        ..Default::default()
    };

    let mut run = || {
        let mut model = Model::load(&arch_path, &weights_path, Kernels::detect()).unwrap();
        Generator::new(&mut model).generate(&[4], &params).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn progressive_loader_feeds_model_assembly() {
    let dir = TempDir::new().unwrap();
    let (arch_path, weights_path, _) = write_fixture(&dir);
    let arch = format::read_arch_file(&arch_path).unwrap();

    // Budget fits two layers at a time; the loader shuttles them in and out
    let file = WeightsFile::open(&weights_path, &arch).unwrap();
    let max_record = (0..file.layer_count())
        .map(|i| file.layer_byte_size(i))
        .max()
        .unwrap();
    let mut loader = ProgressiveLoader::new(
        file,
        LoaderConfig {
            budget_bytes: 2 * max_record,
            ..LoaderConfig::default()
        },
    );

    let mut collected = Vec::new();
    for i in 0..loader.layer_count() {
        let w = loader.load_layer(i).unwrap();
        collected.push(LayerWeights {
            matrix: w.matrix.clone(),
            bias: w.bias.clone(),
        });
        assert!(loader.loaded_bytes() <= 2 * max_record);
        loader.maybe_prefetch().unwrap();
    }
    assert!(loader.stats().evictions > 0);

    let mut model = Model::from_parts(&arch, collected, Kernels::detect()).unwrap();
    let mut logits = vec![0.0f32; VOCAB];
    model.forward(&[1, 4], &mut logits).unwrap();
    assert!(logits.iter().all(|v| v.is_finite()));
}

#[test]
fn standalone_matrix_file_roundtrips_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("standalone.mat");

    let dense = DenseMatrixF32::new(5, 3, pattern(15, 2.0)).unwrap();
    let q = QuantizedMatrix4::quantize(&dense).unwrap();
    format::write_matrix_file(&path, &MatrixPayload::Int4(q.clone())).unwrap();

    let first = std::fs::read(&path).unwrap();
    match format::read_matrix_file(&path).unwrap() {
        MatrixPayload::Int4(back) => {
            assert_eq!(back, q);
            // Writing the reloaded matrix reproduces the file byte-for-byte
            let path2 = dir.path().join("standalone2.mat");
            format::write_matrix_file(&path2, &MatrixPayload::Int4(back)).unwrap();
            assert_eq!(first, std::fs::read(&path2).unwrap());
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn corrupt_weights_report_schema_mismatch() {
    let dir = TempDir::new().unwrap();
    let (arch_path, weights_path, _) = write_fixture(&dir);
    let arch = format::read_arch_file(&arch_path).unwrap();

    // Flip a layer kind inside the second record header
    let mut bytes = std::fs::read(&weights_path).unwrap();
    // First record starts at 12; kind field of record 0
    bytes[12] ^= 0x01;
    let broken = dir.path().join("broken.weights");
    std::fs::write(&broken, &bytes).unwrap();

    let mut wf = WeightsFile::open(&broken, &arch).unwrap();
    match wf.read_layer(0) {
        Err(infercore::EngineError::SchemaMismatch { .. }) => {}
        other => panic!("unexpected: {:?}", other),
    }
}
