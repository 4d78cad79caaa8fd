//! Quantized Matrix Representations
//!
//! # Overview
//!
//! This module implements the weight storage formats used by the engine:
//! 4-bit and 8-bit quantized matrices plus the dense f32 matrix used for
//! activations and as a dequantization target. 4-bit storage packs two
//! weights per byte and cuts weight memory 8x against f32.
//!
//! # Quantization Schemes
//!
//! Two conventions exist and are **not** interchangeable; every matrix
//! carries a tag and dequantization honors it.
//!
//! ## Zero-point (asymmetric, whole-matrix)
//!
//! ```text
//! z = min(M)
//! s = (max(M) - min(M)) / 15        (s = 1 when max == min)
//! q = clamp(round((x - z) / s), 0, 15)
//! x ≈ q * s + z
//! ```
//!
//! ## Blocked (symmetric, per-block scale)
//!
//! ```text
//! per block of 256 values:
//! s_b = max(|x|) / 7                (s_b = 1 when the block is all zero)
//! q   = clamp(round(x / s_b), -8, 7) + 8     (biased to [0, 15] for packing)
//! x ≈ (q - 8) * s_b
//! ```
//!
//! # Packing Layout
//!
//! Row-major element order; two elements per byte:
//!
//! ```text
//! byte k:  ┌──── high nibble ────┬──── low nibble ────┐
//!          │   element 2k + 1    │    element 2k      │
//!          └─────────────────────┴────────────────────┘
//! ```
//!
//! When the element count is odd, the final byte's high nibble is zero and
//! unpacking never reads past the element count.
//!
//! # Numerical Policy
//!
//! Rounding is half-away-from-zero (`f32::round`). When `max == min` every
//! packed nibble is 0 and dequantization yields `z` exactly.

use crate::errors::{EngineError, EngineResult};

/// Default block size for the blocked scheme (elements per scale)
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Number of packed bytes needed for `elems` 4-bit values
#[inline]
pub fn packed_len(elems: usize) -> usize {
    (elems + 1) / 2
}

/// Row-major dense f32 matrix
///
/// Used for activations and as the dequantization target.
/// Invariant: `data.len() == rows * cols`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrixF32 {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl DenseMatrixF32 {
    /// Create a matrix from existing data
    ///
    /// # Errors
    ///
    /// `InvalidShape` when a dimension is zero or the data length does not
    /// match `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> EngineResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::InvalidShape {
                context: format!("dense matrix {}x{}", rows, cols),
            });
        }
        if data.len() != rows * cols {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "dense matrix {}x{} with {} elements",
                    rows,
                    cols,
                    data.len()
                ),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Create a zero-filled matrix
    pub fn zeros(rows: usize, cols: usize) -> EngineResult<Self> {
        Self::new(rows, cols, vec![0.0; rows * cols])
    }

    /// Total element count
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow one row
    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }
}

/// Scale metadata attached to a quantized matrix
///
/// Tags which quantization convention produced the stored nibbles/bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleScheme {
    /// One `(scale, zero_point)` pair for the whole matrix
    ZeroPoint { scale: f32, zero_point: f32 },

    /// One scale per fixed-size block of elements
    Blocked { scales: Vec<f32>, block_size: usize },
}

/// 4-bit quantized matrix, two weights per byte
///
/// Created during quantization or model load; immutable thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix4 {
    pub rows: usize,
    pub cols: usize,
    /// Packed nibbles, `ceil(rows * cols / 2)` bytes
    pub data: Vec<u8>,
    pub scheme: ScaleScheme,
}

impl QuantizedMatrix4 {
    /// Quantize a dense matrix with the zero-point scheme
    pub fn quantize(m: &DenseMatrixF32) -> EngineResult<Self> {
        if m.rows == 0 || m.cols == 0 {
            return Err(EngineError::InvalidShape {
                context: format!("quantize {}x{}", m.rows, m.cols),
            });
        }

        let (min, max) = min_max(&m.data);
        let zero_point = min;
        let scale = if max == min { 1.0 } else { (max - min) / 15.0 };

        let mut data = vec![0u8; packed_len(m.len())];
        for (i, &x) in m.data.iter().enumerate() {
            let q = (((x - zero_point) / scale).round()).clamp(0.0, 15.0) as u8;
            pack_nibble(&mut data, i, q);
        }

        Ok(Self {
            rows: m.rows,
            cols: m.cols,
            data,
            scheme: ScaleScheme::ZeroPoint { scale, zero_point },
        })
    }

    /// Quantize a dense matrix with the blocked scheme
    ///
    /// The flat element sequence is partitioned into blocks of `block_size`
    /// (the last block may be short); each block gets its own scale.
    pub fn quantize_blocked(m: &DenseMatrixF32, block_size: usize) -> EngineResult<Self> {
        if m.rows == 0 || m.cols == 0 {
            return Err(EngineError::InvalidShape {
                context: format!("quantize {}x{}", m.rows, m.cols),
            });
        }
        if block_size == 0 {
            return Err(EngineError::InvalidArgument {
                what: "block_size must be non-zero".into(),
            });
        }

        let n = m.len();
        let num_blocks = (n + block_size - 1) / block_size;
        let mut scales = Vec::with_capacity(num_blocks);
        let mut data = vec![0u8; packed_len(n)];

        for b in 0..num_blocks {
            let start = b * block_size;
            let end = (start + block_size).min(n);
            let block = &m.data[start..end];

            let max_abs = block.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
            let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 7.0 };
            scales.push(scale);

            for (off, &x) in block.iter().enumerate() {
                let q = ((x / scale).round()).clamp(-8.0, 7.0) as i8;
                pack_nibble(&mut data, start + off, (q + 8) as u8);
            }
        }

        Ok(Self {
            rows: m.rows,
            cols: m.cols,
            data,
            scheme: ScaleScheme::Blocked {
                scales,
                block_size,
            },
        })
    }

    /// Dequantize the whole matrix
    pub fn dequantize(&self) -> DenseMatrixF32 {
        let n = self.rows * self.cols;
        let mut out = vec![0.0f32; n];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.value(i);
        }
        DenseMatrixF32 {
            rows: self.rows,
            cols: self.cols,
            data: out,
        }
    }

    /// Raw nibble at flat index `i`
    #[inline]
    pub fn nibble(&self, i: usize) -> u8 {
        let byte = self.data[i / 2];
        if i % 2 == 0 {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    /// Dequantized value at flat index `i`
    ///
    /// Honors the matrix's scale scheme tag.
    #[inline]
    pub fn value(&self, i: usize) -> f32 {
        let q = self.nibble(i);
        match &self.scheme {
            ScaleScheme::ZeroPoint { scale, zero_point } => q as f32 * scale + zero_point,
            ScaleScheme::Blocked { scales, block_size } => {
                let s = scales[i / block_size];
                (q as i32 - 8) as f32 * s
            }
        }
    }

    /// Dequantize one row into `out`
    ///
    /// Used by the embedding layer to gather only the requested rows.
    ///
    /// # Errors
    ///
    /// `InvalidShape` when `out.len() != cols` or the row is out of range.
    pub fn row_values(&self, row: usize, out: &mut [f32]) -> EngineResult<()> {
        if row >= self.rows || out.len() != self.cols {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "row {} of {}x{} into buffer of {}",
                    row,
                    self.rows,
                    self.cols,
                    out.len()
                ),
            });
        }
        let base = row * self.cols;
        for (c, slot) in out.iter_mut().enumerate() {
            *slot = self.value(base + c);
        }
        Ok(())
    }

    /// Packed byte count
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Extract rows `r0..r1` into a new matrix
    ///
    /// Repacks nibbles so the result is self-contained even when the slice
    /// starts at an odd flat index. Zero-point matrices only; blocked
    /// scales are tied to flat offsets in the parent and do not survive
    /// slicing.
    pub fn slice_rows(&self, r0: usize, r1: usize) -> EngineResult<QuantizedMatrix4> {
        if r0 >= r1 || r1 > self.rows {
            return Err(EngineError::InvalidArgument {
                what: format!("row slice {}..{} of {} rows", r0, r1, self.rows),
            });
        }
        let (scale, zero_point) = match self.scheme {
            ScaleScheme::ZeroPoint { scale, zero_point } => (scale, zero_point),
            ScaleScheme::Blocked { .. } => {
                return Err(EngineError::InvalidArgument {
                    what: "cannot slice a block-quantized matrix".into(),
                })
            }
        };

        let rows = r1 - r0;
        let n = rows * self.cols;
        let start = r0 * self.cols;
        let mut data = vec![0u8; packed_len(n)];
        for i in 0..n {
            pack_nibble(&mut data, i, self.nibble(start + i));
        }
        Ok(QuantizedMatrix4 {
            rows,
            cols: self.cols,
            data,
            scheme: ScaleScheme::ZeroPoint { scale, zero_point },
        })
    }
}

/// 8-bit quantized matrix, one byte per weight
///
/// Zero-point scheme over the 8-bit range:
///
/// ```text
/// z = min(M), s = (max(M) - min(M)) / 254
/// q = clamp(round((x - z) / s), 0, 254)
/// x ≈ q * s + z
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix8 {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u8>,
    pub scale: f32,
    pub zero_point: f32,
}

impl QuantizedMatrix8 {
    /// Quantize a dense matrix to 8-bit
    pub fn quantize(m: &DenseMatrixF32) -> EngineResult<Self> {
        if m.rows == 0 || m.cols == 0 {
            return Err(EngineError::InvalidShape {
                context: format!("quantize {}x{}", m.rows, m.cols),
            });
        }

        let (min, max) = min_max(&m.data);
        let zero_point = min;
        let scale = if max == min { 1.0 } else { (max - min) / 254.0 };

        let data = m
            .data
            .iter()
            .map(|&x| (((x - zero_point) / scale).round()).clamp(0.0, 254.0) as u8)
            .collect();

        Ok(Self {
            rows: m.rows,
            cols: m.cols,
            data,
            scale,
            zero_point,
        })
    }

    /// Dequantize the whole matrix
    pub fn dequantize(&self) -> DenseMatrixF32 {
        let data = self
            .data
            .iter()
            .map(|&q| q as f32 * self.scale + self.zero_point)
            .collect();
        DenseMatrixF32 {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }
}

/// Write a nibble into the packed buffer at flat element index `i`
#[inline]
fn pack_nibble(data: &mut [u8], i: usize, q: u8) {
    debug_assert!(q <= 0x0F);
    let byte = &mut data[i / 2];
    if i % 2 == 0 {
        *byte = (*byte & 0xF0) | q;
    } else {
        *byte = (*byte & 0x0F) | (q << 4);
    }
}

fn min_max(data: &[f32]) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &x in data {
        min = min.min(x);
        max = max.max(x);
    }
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_dim_rejected() {
        assert!(DenseMatrixF32::new(0, 4, vec![]).is_err());
        assert!(DenseMatrixF32::new(4, 0, vec![]).is_err());
    }

    #[test]
    fn test_packed_len() {
        assert_eq!(packed_len(0), 0);
        assert_eq!(packed_len(1), 1);
        assert_eq!(packed_len(2), 1);
        assert_eq!(packed_len(3), 2);
        assert_eq!(packed_len(16), 8);
    }

    #[test]
    fn test_quantize_roundtrip_bound() {
        let m = DenseMatrixF32::new(2, 3, vec![-1.0, -0.4, 0.0, 0.3, 0.7, 1.0]).unwrap();
        let q = QuantizedMatrix4::quantize(&m).unwrap();
        let d = q.dequantize();

        // Elementwise error bounded by one quantization step
        let step = (1.0 - (-1.0)) / 15.0;
        for (a, b) in m.data.iter().zip(d.data.iter()) {
            assert!((a - b).abs() <= step + 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_quantize_three_element_vector() {
        // [-1, 0, 1] under zero-point: s = 2/15, z = -1
        let m = DenseMatrixF32::new(1, 3, vec![-1.0, 0.0, 1.0]).unwrap();
        let q = QuantizedMatrix4::quantize(&m).unwrap();

        match q.scheme {
            ScaleScheme::ZeroPoint { scale, zero_point } => {
                assert!((scale - 2.0 / 15.0).abs() < 1e-6);
                assert!((zero_point - (-1.0)).abs() < 1e-6);
            }
            _ => panic!("expected zero-point scheme"),
        }

        // Odd element count: final high nibble stays zero
        assert_eq!(q.data.len(), 2);
        assert_eq!(q.data[1] >> 4, 0);

        let d = q.dequantize();
        for (a, b) in m.data.iter().zip(d.data.iter()) {
            assert!((a - b).abs() <= 2.0 / 15.0 + 1e-6);
        }
    }

    #[test]
    fn test_quantize_constant_matrix() {
        let m = DenseMatrixF32::new(2, 2, vec![3.5; 4]).unwrap();
        let q = QuantizedMatrix4::quantize(&m).unwrap();

        // All nibbles zero, dequant yields z exactly
        for i in 0..4 {
            assert_eq!(q.nibble(i), 0);
        }
        let d = q.dequantize();
        for &x in &d.data {
            assert_eq!(x, 3.5);
        }
    }

    #[test]
    fn test_blocked_roundtrip_bound() {
        let data: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 10.0).collect();
        let m = DenseMatrixF32::new(8, 8, data).unwrap();
        let q = QuantizedMatrix4::quantize_blocked(&m, 16).unwrap();
        let d = q.dequantize();

        match &q.scheme {
            ScaleScheme::Blocked { scales, block_size } => {
                assert_eq!(*block_size, 16);
                assert_eq!(scales.len(), 4);
            }
            _ => panic!("expected blocked scheme"),
        }

        // Per-block bound: max |x| / 7 over the block
        for b in 0..4 {
            let block = &m.data[b * 16..(b + 1) * 16];
            let bound = block.iter().map(|x| x.abs()).fold(0.0f32, f32::max) / 7.0;
            for (a, r) in block.iter().zip(d.data[b * 16..(b + 1) * 16].iter()) {
                assert!((a - r).abs() <= bound + 1e-6);
            }
        }
    }

    #[test]
    fn test_blocked_zero_block() {
        let m = DenseMatrixF32::new(1, 8, vec![0.0; 8]).unwrap();
        let q = QuantizedMatrix4::quantize_blocked(&m, 8).unwrap();
        let d = q.dequantize();
        for &x in &d.data {
            assert_eq!(x, 0.0);
        }
    }

    #[test]
    fn test_row_values() {
        let m = DenseMatrixF32::new(3, 4, (0..12).map(|i| i as f32).collect()).unwrap();
        let q = QuantizedMatrix4::quantize(&m).unwrap();

        let mut row = vec![0.0f32; 4];
        q.row_values(1, &mut row).unwrap();
        let step = 11.0 / 15.0;
        for (c, &v) in row.iter().enumerate() {
            let expect = (4 + c) as f32;
            assert!((v - expect).abs() <= step + 1e-6);
        }

        assert!(q.row_values(3, &mut row).is_err());
        let mut short = vec![0.0f32; 3];
        assert!(q.row_values(0, &mut short).is_err());
    }

    #[test]
    fn test_q8_roundtrip_bound() {
        let m = DenseMatrixF32::new(2, 2, vec![-2.0, -0.5, 0.5, 2.0]).unwrap();
        let q = QuantizedMatrix8::quantize(&m).unwrap();
        let d = q.dequantize();

        let step = 4.0 / 254.0;
        for (a, b) in m.data.iter().zip(d.data.iter()) {
            assert!((a - b).abs() <= step + 1e-6);
        }
    }

    #[test]
    fn test_slice_rows() {
        let m = DenseMatrixF32::new(3, 3, (0..9).map(|i| i as f32).collect()).unwrap();
        let q = QuantizedMatrix4::quantize(&m).unwrap();

        // Slice starting at an odd flat index (row 1 of a 3-wide matrix)
        let s = q.slice_rows(1, 3).unwrap();
        assert_eq!(s.rows, 2);
        assert_eq!(s.cols, 3);
        for i in 0..6 {
            assert_eq!(s.nibble(i), q.nibble(3 + i));
        }

        assert!(q.slice_rows(2, 2).is_err());
        assert!(q.slice_rows(0, 4).is_err());
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        // With s = 1, z = 0 we can observe raw rounding behavior
        let m = DenseMatrixF32::new(1, 2, vec![0.0, 15.0]).unwrap();
        let q = QuantizedMatrix4::quantize(&m).unwrap();
        assert_eq!(q.nibble(0), 0);
        assert_eq!(q.nibble(1), 15);
    }
}
