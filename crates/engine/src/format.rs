//! Persisted Model and Matrix Layouts
//!
//! # Overview
//!
//! Binary little-endian readers and writers for the three on-disk formats:
//!
//! ## Architecture file
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────
//! 0       4     magic (0x4D494E54)
//! 4       4     version
//! 8       4     model_kind (0 = rnn, 1 = transformer)
//! 12      4     hidden_size
//! 16      4     context_size
//! 20      4     layer_count
//! then per layer:
//!         4     kind
//!         4     input_size
//!         4     output_size
//!         4     activation
//! ```
//!
//! ## Weights file
//!
//! ```text
//! 0       4     magic (0x4D494E54)
//! 4       4     version
//! 8       4     layer_count (must equal the architecture file's)
//! then per layer:
//!         4     kind          ┐ must match the architecture file
//!         4     input_size    │ exactly; any difference is a
//!         4     output_size   ┘ SchemaMismatch
//!         4     scale (f32)
//!         4     zero_point (f32)
//!         ceil(input_size * output_size / 2)   packed 4-bit data
//!         4 * output_size                      f32 biases
//! ```
//!
//! Per-layer records have computable sizes, so [`WeightsFile`] can seek to
//! any layer without touching the rest of the file; the progressive loader
//! relies on this.
//!
//! ## Standalone quantized matrix
//!
//! ```text
//! 0       4     magic (0x4D51544E)
//! 4       4     precision (0 = f32, 1 = int8, 2 = int4)
//! 8       4     rows
//! 12      4     cols
//! then for quantized kinds: f32 scale, f32 zero_point
//! then raw bytes (ceil(rows*cols/2) int4, rows*cols int8, rows*cols*4 f32)
//! ```
//!
//! Only zero-point int4 matrices have a standalone layout; blocked matrices
//! carry a scale vector this header has no room for.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::{EngineError, EngineResult};
use crate::model::{LayerKind, ModelKind};
use crate::quantize::{packed_len, DenseMatrixF32, QuantizedMatrix4, QuantizedMatrix8, ScaleScheme};
use crate::tables::Activation;

/// Magic for architecture and weights files
pub const MODEL_MAGIC: u32 = 0x4D49_4E54;

/// Magic for standalone matrix files
pub const MATRIX_MAGIC: u32 = 0x4D51_544E;

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// One layer as declared by the architecture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerArch {
    pub kind: LayerKind,
    pub input_size: usize,
    pub output_size: usize,
    pub activation: Activation,
}

/// Parsed architecture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArch {
    pub model_kind: ModelKind,
    pub hidden_size: usize,
    pub context_size: usize,
    pub layers: Vec<LayerArch>,
}

/// One layer's weights as stored in the weights file
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub matrix: QuantizedMatrix4,
    pub bias: Vec<f32>,
}

/// Write an architecture file
pub fn write_arch_file(path: &Path, arch: &ModelArch) -> EngineResult<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_u32(&mut w, MODEL_MAGIC)?;
    write_u32(&mut w, FORMAT_VERSION)?;
    write_u32(&mut w, arch.model_kind.to_u32())?;
    write_u32(&mut w, arch.hidden_size as u32)?;
    write_u32(&mut w, arch.context_size as u32)?;
    write_u32(&mut w, arch.layers.len() as u32)?;
    for layer in &arch.layers {
        write_u32(&mut w, layer.kind.to_u32())?;
        write_u32(&mut w, layer.input_size as u32)?;
        write_u32(&mut w, layer.output_size as u32)?;
        write_u32(&mut w, layer.activation.to_u32())?;
    }
    w.flush()?;
    Ok(())
}

/// Read an architecture file
pub fn read_arch_file(path: &Path) -> EngineResult<ModelArch> {
    let mut r = BufReader::new(File::open(path)?);

    let magic = read_u32(&mut r)?;
    if magic != MODEL_MAGIC {
        return Err(EngineError::SchemaMismatch {
            context: format!("architecture magic {:#010x}", magic),
        });
    }
    let version = read_u32(&mut r)?;
    if version != FORMAT_VERSION {
        return Err(EngineError::SchemaMismatch {
            context: format!("architecture version {}", version),
        });
    }

    let model_kind = ModelKind::from_u32(read_u32(&mut r)?)?;
    let hidden_size = read_u32(&mut r)? as usize;
    let context_size = read_u32(&mut r)? as usize;
    let layer_count = read_u32(&mut r)? as usize;
    if hidden_size == 0 || context_size == 0 || layer_count == 0 {
        return Err(EngineError::SchemaMismatch {
            context: format!(
                "degenerate architecture: hidden {} context {} layers {}",
                hidden_size, context_size, layer_count
            ),
        });
    }

    let mut layers = Vec::with_capacity(layer_count);
    for _ in 0..layer_count {
        let kind = LayerKind::from_u32(read_u32(&mut r)?)?;
        let input_size = read_u32(&mut r)? as usize;
        let output_size = read_u32(&mut r)? as usize;
        let activation = Activation::from_u32(read_u32(&mut r)?)?;
        layers.push(LayerArch {
            kind,
            input_size,
            output_size,
            activation,
        });
    }

    Ok(ModelArch {
        model_kind,
        hidden_size,
        context_size,
        layers,
    })
}

/// Byte size of one weights-file layer record
fn record_size(layer: &LayerArch) -> u64 {
    // kind + in + out + scale + zero_point
    let header = 5 * 4u64;
    let packed = packed_len(layer.input_size * layer.output_size) as u64;
    let bias = 4 * layer.output_size as u64;
    header + packed + bias
}

/// Write a weights file
///
/// Matrices must use the zero-point scheme (the file stores a single
/// scale/zero-point pair per layer) and match the architecture dimensions.
pub fn write_weights_file(
    path: &Path,
    arch: &ModelArch,
    layers: &[LayerWeights],
) -> EngineResult<()> {
    if layers.len() != arch.layers.len() {
        return Err(EngineError::InvalidShape {
            context: format!(
                "{} weight records for {} architecture layers",
                layers.len(),
                arch.layers.len()
            ),
        });
    }

    let mut w = BufWriter::new(File::create(path)?);
    write_u32(&mut w, MODEL_MAGIC)?;
    write_u32(&mut w, FORMAT_VERSION)?;
    write_u32(&mut w, arch.layers.len() as u32)?;

    for (meta, weights) in arch.layers.iter().zip(layers.iter()) {
        let (scale, zero_point) = match weights.matrix.scheme {
            ScaleScheme::ZeroPoint { scale, zero_point } => (scale, zero_point),
            ScaleScheme::Blocked { .. } => {
                return Err(EngineError::InvalidArgument {
                    what: "weights file stores zero-point matrices only".into(),
                })
            }
        };
        let expected = packed_len(meta.input_size * meta.output_size);
        if weights.matrix.byte_len() != expected || weights.bias.len() != meta.output_size {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "layer {:?}: {} packed bytes (expected {}), {} biases (expected {})",
                    meta.kind,
                    weights.matrix.byte_len(),
                    expected,
                    weights.bias.len(),
                    meta.output_size
                ),
            });
        }

        write_u32(&mut w, meta.kind.to_u32())?;
        write_u32(&mut w, meta.input_size as u32)?;
        write_u32(&mut w, meta.output_size as u32)?;
        write_f32(&mut w, scale)?;
        write_f32(&mut w, zero_point)?;
        w.write_all(&weights.matrix.data)?;
        for &b in &weights.bias {
            write_f32(&mut w, b)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Weights file opened for per-layer random access
///
/// Validates the header at open time and each per-layer header at read
/// time. Used directly by the progressive loader.
#[derive(Debug)]
pub struct WeightsFile {
    file: File,
    arch_layers: Vec<LayerArch>,
    offsets: Vec<u64>,
}

impl WeightsFile {
    /// Open and validate against an architecture
    pub fn open(path: &Path, arch: &ModelArch) -> EngineResult<Self> {
        let mut file = File::open(path)?;

        let magic = read_u32(&mut file)?;
        if magic != MODEL_MAGIC {
            return Err(EngineError::SchemaMismatch {
                context: format!("weights magic {:#010x}", magic),
            });
        }
        let version = read_u32(&mut file)?;
        if version != FORMAT_VERSION {
            return Err(EngineError::SchemaMismatch {
                context: format!("weights version {}", version),
            });
        }
        let layer_count = read_u32(&mut file)? as usize;
        if layer_count != arch.layers.len() {
            return Err(EngineError::SchemaMismatch {
                context: format!(
                    "weights file has {} layers, architecture has {}",
                    layer_count,
                    arch.layers.len()
                ),
            });
        }

        let mut offsets = Vec::with_capacity(layer_count);
        let mut off = 12u64;
        for layer in &arch.layers {
            offsets.push(off);
            off += record_size(layer);
        }
        let actual = file.metadata()?.len();
        if actual != off {
            return Err(EngineError::SchemaMismatch {
                context: format!("weights file is {} bytes, expected {}", actual, off),
            });
        }

        Ok(Self {
            file,
            arch_layers: arch.layers.clone(),
            offsets,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.arch_layers.len()
    }

    /// Bytes occupied by layer `i`'s record
    pub fn layer_byte_size(&self, i: usize) -> usize {
        record_size(&self.arch_layers[i]) as usize
    }

    /// Read one layer's weights
    ///
    /// Matrix orientation depends on the kind: embedding matrices are
    /// `(input_size, output_size)` for row gather by token id; all other
    /// kinds are output-major `(output_size, input_size)`.
    pub fn read_layer(&mut self, i: usize) -> EngineResult<LayerWeights> {
        let meta = self
            .arch_layers
            .get(i)
            .ok_or_else(|| EngineError::InvalidArgument {
                what: format!("layer index {}", i),
            })?
            .clone();
        self.file.seek(SeekFrom::Start(self.offsets[i]))?;

        let kind = read_u32(&mut self.file)?;
        let input_size = read_u32(&mut self.file)? as usize;
        let output_size = read_u32(&mut self.file)? as usize;
        if kind != meta.kind.to_u32()
            || input_size != meta.input_size
            || output_size != meta.output_size
        {
            return Err(EngineError::SchemaMismatch {
                context: format!(
                    "layer {}: weights record ({}, {}, {}) vs architecture ({}, {}, {})",
                    i,
                    kind,
                    input_size,
                    output_size,
                    meta.kind.to_u32(),
                    meta.input_size,
                    meta.output_size
                ),
            });
        }

        let scale = read_f32(&mut self.file)?;
        let zero_point = read_f32(&mut self.file)?;

        let mut data = vec![0u8; packed_len(input_size * output_size)];
        self.file.read_exact(&mut data)?;

        let mut bias = vec![0.0f32; output_size];
        for b in bias.iter_mut() {
            *b = read_f32(&mut self.file)?;
        }

        let (rows, cols) = match meta.kind {
            LayerKind::Embedding => (input_size, output_size),
            _ => (output_size, input_size),
        };
        Ok(LayerWeights {
            matrix: QuantizedMatrix4 {
                rows,
                cols,
                data,
                scheme: ScaleScheme::ZeroPoint { scale, zero_point },
            },
            bias,
        })
    }
}

/// Read every layer of a weights file in order
pub fn read_weights_file(path: &Path, arch: &ModelArch) -> EngineResult<Vec<LayerWeights>> {
    let mut wf = WeightsFile::open(path, arch)?;
    (0..wf.layer_count()).map(|i| wf.read_layer(i)).collect()
}

/// Standalone matrix payload
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixPayload {
    F32(DenseMatrixF32),
    Int8(QuantizedMatrix8),
    Int4(QuantizedMatrix4),
}

/// Write a standalone matrix file
pub fn write_matrix_file(path: &Path, payload: &MatrixPayload) -> EngineResult<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_u32(&mut w, MATRIX_MAGIC)?;
    match payload {
        MatrixPayload::F32(m) => {
            write_u32(&mut w, 0)?;
            write_u32(&mut w, m.rows as u32)?;
            write_u32(&mut w, m.cols as u32)?;
            for &x in &m.data {
                write_f32(&mut w, x)?;
            }
        }
        MatrixPayload::Int8(m) => {
            write_u32(&mut w, 1)?;
            write_u32(&mut w, m.rows as u32)?;
            write_u32(&mut w, m.cols as u32)?;
            write_f32(&mut w, m.scale)?;
            write_f32(&mut w, m.zero_point)?;
            w.write_all(&m.data)?;
        }
        MatrixPayload::Int4(m) => {
            let (scale, zero_point) = match m.scheme {
                ScaleScheme::ZeroPoint { scale, zero_point } => (scale, zero_point),
                ScaleScheme::Blocked { .. } => {
                    return Err(EngineError::InvalidArgument {
                        what: "standalone layout stores zero-point matrices only".into(),
                    })
                }
            };
            write_u32(&mut w, 2)?;
            write_u32(&mut w, m.rows as u32)?;
            write_u32(&mut w, m.cols as u32)?;
            write_f32(&mut w, scale)?;
            write_f32(&mut w, zero_point)?;
            w.write_all(&m.data)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Read a standalone matrix file
pub fn read_matrix_file(path: &Path) -> EngineResult<MatrixPayload> {
    let mut r = BufReader::new(File::open(path)?);

    let magic = read_u32(&mut r)?;
    if magic != MATRIX_MAGIC {
        return Err(EngineError::SchemaMismatch {
            context: format!("matrix magic {:#010x}", magic),
        });
    }
    let precision = read_u32(&mut r)?;
    let rows = read_u32(&mut r)? as usize;
    let cols = read_u32(&mut r)? as usize;
    if rows == 0 || cols == 0 {
        return Err(EngineError::SchemaMismatch {
            context: format!("matrix {}x{}", rows, cols),
        });
    }

    match precision {
        0 => {
            let mut data = vec![0.0f32; rows * cols];
            for x in data.iter_mut() {
                *x = read_f32(&mut r)?;
            }
            Ok(MatrixPayload::F32(DenseMatrixF32 { rows, cols, data }))
        }
        1 => {
            let scale = read_f32(&mut r)?;
            let zero_point = read_f32(&mut r)?;
            let mut data = vec![0u8; rows * cols];
            r.read_exact(&mut data)?;
            Ok(MatrixPayload::Int8(QuantizedMatrix8 {
                rows,
                cols,
                data,
                scale,
                zero_point,
            }))
        }
        2 => {
            let scale = read_f32(&mut r)?;
            let zero_point = read_f32(&mut r)?;
            let mut data = vec![0u8; packed_len(rows * cols)];
            r.read_exact(&mut data)?;
            Ok(MatrixPayload::Int4(QuantizedMatrix4 {
                rows,
                cols,
                data,
                scheme: ScaleScheme::ZeroPoint { scale, zero_point },
            }))
        }
        other => Err(EngineError::SchemaMismatch {
            context: format!("matrix precision tag {}", other),
        }),
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> EngineResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> EngineResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> EngineResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> EngineResult<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}
