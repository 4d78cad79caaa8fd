//! Infercore: Memory-Budgeted On-Device Inference
//!
//! # Overview
//!
//! An inference engine for small neural networks (transformer language
//! models, convolutional image models) built to run under tight memory
//! budgets. Three subsystems carry the engineering weight:
//!
//! - **4-bit block-quantized weights** with SIMD-accelerated matrix,
//!   attention, and convolution kernels, dispatched by runtime CPU feature
//!   detection with scalar reference fallbacks
//! - **A memory-optimized execution core**: a dependency-graph layer
//!   scheduler with activation checkpointing and tensor reuse, backed by a
//!   progressive loader that streams layer weights under a byte budget
//! - **The attention forward path**: projection, scaled dot-product,
//!   numerically stable softmax, weighted value combination, and output
//!   projection over multi-head tensors
//!
//! # Data Flow
//!
//! ```text
//! token ids → embedding row gather → layer loop (attention/dense/norm)
//!           → output projection → logits → sampling → next token
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use infercore::model::Model;
//! use infercore::generate::Generator;
//! use infercore::sampling::GenerationParams;
//! use infercore::simd::Kernels;
//! use std::path::Path;
//!
//! let kernels = Kernels::detect();
//! let mut model = Model::load(
//!     Path::new("model.arch"),
//!     Path::new("model.weights"),
//!     kernels,
//! )?;
//! let tokens = Generator::new(&mut model)
//!     .generate(&[1, 42, 7], &GenerationParams::greedy())?;
//! # Ok::<(), infercore::errors::EngineError>(())
//! ```

pub mod attention;
pub mod conv;
pub mod errors;
pub mod format;
pub mod generate;
pub mod hybrid;
pub mod loader;
pub mod memory;
pub mod model;
pub mod quantize;
pub mod sampling;
pub mod scheduler;
pub mod simd;
pub mod tables;
pub mod tensor;
pub mod tokenizer;

pub use errors::{EngineError, EngineResult};
pub use model::Model;
pub use simd::{KernelTier, Kernels};
