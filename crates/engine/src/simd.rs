//! SIMD Kernel Bank with Runtime Dispatch
//!
//! # Overview
//!
//! Every compute-heavy primitive the engine needs lives here:
//! - Quantized matrix-vector and matrix-matrix multiplication (dequant on
//!   the fly, honoring the matrix's scale scheme)
//! - Vector add, bias add, position-wise activation
//! - Numerically stable row softmax
//! - Blocked 4-bit quantize/dequantize over flat buffers
//!
//! # Dispatch Tiers
//!
//! The instruction tier is probed **once** when a [`Kernels`] value is
//! constructed and stored in it; no global mutable flags.
//!
//! | Tier | x86_64 | aarch64 |
//! |------|--------|---------|
//! | `Scalar`    | always | always |
//! | `Vec128`    | SSE2   | NEON   |
//! | `Vec256`    | AVX    | n/a    |
//! | `Vec256Int` | AVX2 + FMA | n/a |
//!
//! # Contract
//!
//! Within one tier kernels are deterministic for a given input. Across
//! tiers results agree with the scalar reference within `1e-4` absolute for
//! normalized inputs (`1e-2` for softmax and GELU, which go through
//! transcendental approximations).
//!
//! # Example Usage
//!
//! ```no_run
//! use infercore::simd::Kernels;
//! # use infercore::quantize::{DenseMatrixF32, QuantizedMatrix4};
//! # let dense = DenseMatrixF32::new(2, 2, vec![1.0, 0.0, 0.0, 1.0])?;
//! # let weights = QuantizedMatrix4::quantize(&dense)?;
//! # let input = vec![1.0f32, 2.0];
//!
//! let kernels = Kernels::detect();
//! let mut out = vec![0.0f32; weights.rows];
//! kernels.matmul_q4_vec(&mut out, &weights, &input)?;
//! # Ok::<(), infercore::errors::EngineError>(())
//! ```

use crate::errors::{EngineError, EngineResult};
use crate::quantize::{packed_len, QuantizedMatrix4, ScaleScheme};
use crate::tables::{tables, Activation};

/// Elements decoded per inner-loop chunk of the quantized kernels
const DECODE_CHUNK: usize = 64;

/// Vector instruction tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelTier {
    /// Portable reference implementation
    Scalar,
    /// 128-bit lanes (SSE2 / NEON)
    Vec128,
    /// 256-bit float lanes (AVX)
    Vec256,
    /// 256-bit lanes with integer ops and FMA (AVX2 + FMA)
    Vec256Int,
}

impl KernelTier {
    /// Whether this tier can run on the current CPU
    pub fn available(self) -> bool {
        match self {
            KernelTier::Scalar => true,
            KernelTier::Vec128 => {
                #[cfg(target_arch = "x86_64")]
                {
                    std::arch::is_x86_feature_detected!("sse2")
                }
                #[cfg(target_arch = "aarch64")]
                {
                    std::arch::is_aarch64_feature_detected!("neon")
                }
                #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
                {
                    false
                }
            }
            KernelTier::Vec256 => {
                #[cfg(target_arch = "x86_64")]
                {
                    std::arch::is_x86_feature_detected!("avx")
                }
                #[cfg(not(target_arch = "x86_64"))]
                {
                    false
                }
            }
            KernelTier::Vec256Int => {
                #[cfg(target_arch = "x86_64")]
                {
                    std::arch::is_x86_feature_detected!("avx2")
                        && std::arch::is_x86_feature_detected!("fma")
                }
                #[cfg(not(target_arch = "x86_64"))]
                {
                    false
                }
            }
        }
    }

    /// Highest tier the current CPU supports
    pub fn detect_best() -> KernelTier {
        for tier in [
            KernelTier::Vec256Int,
            KernelTier::Vec256,
            KernelTier::Vec128,
        ] {
            if tier.available() {
                return tier;
            }
        }
        KernelTier::Scalar
    }

    /// Human-readable tier name
    pub fn name(self) -> &'static str {
        match self {
            KernelTier::Scalar => "scalar",
            KernelTier::Vec128 => "vec128",
            KernelTier::Vec256 => "vec256",
            KernelTier::Vec256Int => "vec256-int",
        }
    }
}

/// Kernel bank bound to one dispatch tier
///
/// Construct once at engine start and share by reference; `Kernels` is
/// `Copy` and carries no state beyond the chosen tier.
#[derive(Debug, Clone, Copy)]
pub struct Kernels {
    tier: KernelTier,
}

impl Kernels {
    /// Probe the CPU and bind the best available tier
    pub fn detect() -> Self {
        let tier = KernelTier::detect_best();
        tracing::debug!(tier = tier.name(), "kernel dispatch tier selected");
        Self { tier }
    }

    /// Bind a specific tier (for tests and tolerance checks)
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the tier is not available on this CPU.
    pub fn with_tier(tier: KernelTier) -> EngineResult<Self> {
        if !tier.available() {
            return Err(EngineError::InvalidArgument {
                what: format!("kernel tier {} not available", tier.name()),
            });
        }
        Ok(Self { tier })
    }

    /// The bound tier
    pub fn tier(&self) -> KernelTier {
        self.tier
    }

    /// Dot product of two equal-length f32 slices
    #[inline]
    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self.tier {
            KernelTier::Scalar => dot_scalar(a, b),
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec128 => unsafe { dot_sse2(a, b) },
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec256 => unsafe { dot_avx(a, b) },
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec256Int => unsafe { dot_avx2(a, b) },
            #[cfg(target_arch = "aarch64")]
            KernelTier::Vec128 => unsafe { dot_neon(a, b) },
            #[allow(unreachable_patterns)]
            _ => dot_scalar(a, b),
        }
    }

    /// Element-wise `out[i] = a[i] + b[i]`
    pub fn vec_add(&self, out: &mut [f32], a: &[f32], b: &[f32]) -> EngineResult<()> {
        if a.len() != b.len() || out.len() != a.len() {
            return Err(EngineError::InvalidShape {
                context: format!("vec_add lengths {}/{}/{}", out.len(), a.len(), b.len()),
            });
        }
        match self.tier {
            KernelTier::Scalar => {
                for i in 0..a.len() {
                    out[i] = a[i] + b[i];
                }
            }
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec256 | KernelTier::Vec256Int => unsafe { vec_add_avx(out, a, b) },
            #[cfg(target_arch = "aarch64")]
            KernelTier::Vec128 => unsafe { vec_add_neon(out, a, b) },
            _ => {
                for i in 0..a.len() {
                    out[i] = a[i] + b[i];
                }
            }
        }
        Ok(())
    }

    /// In-place `vec[i] += bias[i]`
    pub fn bias_add_inplace(&self, vec: &mut [f32], bias: &[f32]) -> EngineResult<()> {
        if vec.len() != bias.len() {
            return Err(EngineError::InvalidShape {
                context: format!("bias_add lengths {}/{}", vec.len(), bias.len()),
            });
        }
        match self.tier {
            KernelTier::Scalar => {
                for (v, b) in vec.iter_mut().zip(bias.iter()) {
                    *v += b;
                }
            }
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec256 | KernelTier::Vec256Int => unsafe { add_assign_avx(vec, bias) },
            #[cfg(target_arch = "aarch64")]
            KernelTier::Vec128 => unsafe { add_assign_neon(vec, bias) },
            _ => {
                for (v, b) in vec.iter_mut().zip(bias.iter()) {
                    *v += b;
                }
            }
        }
        Ok(())
    }

    /// In-place position-wise activation
    ///
    /// ReLU is vectorized per tier; sigmoid/tanh/GELU use the precomputed
    /// tables on vector tiers and the analytic forms on the scalar tier.
    pub fn activate_inplace(&self, vec: &mut [f32], kind: Activation) {
        match kind {
            Activation::None => {}
            Activation::Relu => {
                for v in vec.iter_mut() {
                    *v = v.max(0.0);
                }
            }
            _ if self.tier == KernelTier::Scalar => {
                for v in vec.iter_mut() {
                    *v = kind.apply(*v);
                }
            }
            Activation::Sigmoid => {
                let t = tables();
                for v in vec.iter_mut() {
                    *v = t.sigmoid(*v);
                }
            }
            Activation::Tanh => {
                let t = tables();
                for v in vec.iter_mut() {
                    *v = t.tanh(*v);
                }
            }
            Activation::Gelu => {
                let t = tables();
                for v in vec.iter_mut() {
                    *v = t.gelu(*v);
                }
            }
        }
    }

    /// Numerically stable softmax over one row, in place
    ///
    /// `-inf` entries (masked slots) come out as exactly zero. When every
    /// entry is masked the row is left all-zero rather than divided by zero.
    pub fn softmax_row(&self, row: &mut [f32]) {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        if max == f32::NEG_INFINITY {
            row.iter_mut().for_each(|v| *v = 0.0);
            return;
        }
        let mut sum = 0.0f32;
        for v in row.iter_mut() {
            let e = if *v == f32::NEG_INFINITY {
                0.0
            } else {
                (*v - max).exp()
            };
            *v = e;
            sum += e;
        }
        if sum > 0.0 {
            let inv = 1.0 / sum;
            for v in row.iter_mut() {
                *v *= inv;
            }
        }
    }

    /// Quantized matrix-vector multiply: `out = W * input`
    ///
    /// `W` is `(rows, cols)` quantized 4-bit; `input` has `cols` elements;
    /// `out` has `rows` elements. Weights are dequantized on the fly in
    /// chunks so no full-matrix f32 copy is materialized.
    pub fn matmul_q4_vec(
        &self,
        out: &mut [f32],
        weights: &QuantizedMatrix4,
        input: &[f32],
    ) -> EngineResult<()> {
        if input.len() != weights.cols || out.len() != weights.rows {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "matmul_q4_vec {}x{} with input {} out {}",
                    weights.rows,
                    weights.cols,
                    input.len(),
                    out.len()
                ),
            });
        }

        let cols = weights.cols;
        let mut chunk = [0.0f32; DECODE_CHUNK];
        for (r, slot) in out.iter_mut().enumerate() {
            let base = r * cols;
            let mut acc = 0.0f32;
            let mut c = 0;
            while c < cols {
                let take = (cols - c).min(DECODE_CHUNK);
                decode_q4(weights, base + c, take, &mut chunk);
                acc += self.dot(&chunk[..take], &input[c..c + take]);
                c += take;
            }
            *slot = acc;
        }
        Ok(())
    }

    /// Quantized matrix-matrix multiply: `out = A * B`
    ///
    /// `A` is `(rows_a, cols_a)` quantized; `B` is dense row-major
    /// `(cols_a, cols_b)`; `out` is dense row-major `(rows_a, cols_b)`.
    /// Implemented as scaled row accumulation so the inner loop runs over
    /// contiguous memory.
    pub fn matmul_q4_mat(
        &self,
        out: &mut [f32],
        a: &QuantizedMatrix4,
        b: &[f32],
        cols_b: usize,
    ) -> EngineResult<()> {
        if b.len() != a.cols * cols_b || out.len() != a.rows * cols_b {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "matmul_q4_mat {}x{} * {}x{} into {}",
                    a.rows,
                    a.cols,
                    a.cols,
                    cols_b,
                    out.len()
                ),
            });
        }

        out.iter_mut().for_each(|v| *v = 0.0);
        for i in 0..a.rows {
            let out_row = &mut out[i * cols_b..(i + 1) * cols_b];
            let base = i * a.cols;
            for k in 0..a.cols {
                let a_ik = a.value(base + k);
                if a_ik != 0.0 {
                    let b_row = &b[k * cols_b..(k + 1) * cols_b];
                    self.axpy(out_row, a_ik, b_row);
                }
            }
        }
        Ok(())
    }

    /// Blocked 4-bit quantization of a flat f32 buffer
    ///
    /// `out_bytes` must hold `ceil(n / 2)` bytes; one scale per block is
    /// appended to `scales_out`.
    pub fn quantize_4bit_blocked(
        &self,
        out_bytes: &mut [u8],
        input: &[f32],
        scales_out: &mut Vec<f32>,
        block_size: usize,
    ) -> EngineResult<()> {
        if block_size == 0 {
            return Err(EngineError::InvalidArgument {
                what: "block_size must be non-zero".into(),
            });
        }
        if out_bytes.len() != packed_len(input.len()) {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "quantize_4bit_blocked {} floats into {} bytes",
                    input.len(),
                    out_bytes.len()
                ),
            });
        }

        out_bytes.iter_mut().for_each(|b| *b = 0);
        for (b, block) in input.chunks(block_size).enumerate() {
            let max_abs = block.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
            let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 7.0 };
            scales_out.push(scale);

            let start = b * block_size;
            for (off, &x) in block.iter().enumerate() {
                let q = (((x / scale).round()).clamp(-8.0, 7.0) as i8 + 8) as u8;
                let i = start + off;
                let byte = &mut out_bytes[i / 2];
                if i % 2 == 0 {
                    *byte |= q;
                } else {
                    *byte |= q << 4;
                }
            }
        }
        Ok(())
    }

    /// Blocked 4-bit dequantization of a flat packed buffer
    pub fn dequantize_4bit_blocked(
        &self,
        out: &mut [f32],
        bytes: &[u8],
        scales: &[f32],
        block_size: usize,
    ) -> EngineResult<()> {
        if block_size == 0 {
            return Err(EngineError::InvalidArgument {
                what: "block_size must be non-zero".into(),
            });
        }
        if bytes.len() != packed_len(out.len())
            || scales.len() != (out.len() + block_size - 1) / block_size
        {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "dequantize_4bit_blocked {} floats from {} bytes, {} scales",
                    out.len(),
                    bytes.len(),
                    scales.len()
                ),
            });
        }

        for (i, slot) in out.iter_mut().enumerate() {
            let byte = bytes[i / 2];
            let q = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            *slot = (q as i32 - 8) as f32 * scales[i / block_size];
        }
        Ok(())
    }

    /// `out[i] += s * x[i]`
    #[inline]
    fn axpy(&self, out: &mut [f32], s: f32, x: &[f32]) {
        debug_assert_eq!(out.len(), x.len());
        match self.tier {
            KernelTier::Scalar => axpy_scalar(out, s, x),
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec256Int => unsafe { axpy_fma(out, s, x) },
            #[cfg(target_arch = "x86_64")]
            KernelTier::Vec256 => unsafe { axpy_avx(out, s, x) },
            #[cfg(target_arch = "aarch64")]
            KernelTier::Vec128 => unsafe { axpy_neon(out, s, x) },
            #[allow(unreachable_patterns)]
            _ => axpy_scalar(out, s, x),
        }
    }
}

/// Decode `count` quantized values starting at flat index `start`
#[inline]
fn decode_q4(m: &QuantizedMatrix4, start: usize, count: usize, out: &mut [f32; DECODE_CHUNK]) {
    match &m.scheme {
        ScaleScheme::ZeroPoint { scale, zero_point } => {
            for i in 0..count {
                out[i] = m.nibble(start + i) as f32 * scale + zero_point;
            }
        }
        ScaleScheme::Blocked { scales, block_size } => {
            for i in 0..count {
                let idx = start + i;
                out[i] = (m.nibble(idx) as i32 - 8) as f32 * scales[idx / block_size];
            }
        }
    }
}

//
// Scalar reference implementations
//

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn axpy_scalar(out: &mut [f32], s: f32, x: &[f32]) {
    for (o, &v) in out.iter_mut().zip(x.iter()) {
        *o += s * v;
    }
}

//
// x86_64 implementations
//

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    #[target_feature(enable = "sse2")]
    pub unsafe fn dot_sse2(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = _mm_setzero_ps();
        let mut i = 0;
        while i + 4 <= len {
            let va = _mm_loadu_ps(a.as_ptr().add(i));
            let vb = _mm_loadu_ps(b.as_ptr().add(i));
            sum = _mm_add_ps(sum, _mm_mul_ps(va, vb));
            i += 4;
        }
        let mut lanes = [0.0f32; 4];
        _mm_storeu_ps(lanes.as_mut_ptr(), sum);
        let mut total = lanes.iter().sum::<f32>();
        while i < len {
            total += a[i] * b[i];
            i += 1;
        }
        total
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn dot_avx(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = _mm256_setzero_ps();
        let mut i = 0;
        while i + 8 <= len {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            sum = _mm256_add_ps(sum, _mm256_mul_ps(va, vb));
            i += 8;
        }
        let mut total = hsum256(sum);
        while i < len {
            total += a[i] * b[i];
            i += 1;
        }
        total
    }

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = _mm256_setzero_ps();
        let mut i = 0;
        while i + 8 <= len {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            sum = _mm256_fmadd_ps(va, vb, sum);
            i += 8;
        }
        let mut total = hsum256(sum);
        while i < len {
            total += a[i] * b[i];
            i += 1;
        }
        total
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn vec_add_avx(out: &mut [f32], a: &[f32], b: &[f32]) {
        let len = a.len();
        let mut i = 0;
        while i + 8 <= len {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_add_ps(va, vb));
            i += 8;
        }
        while i < len {
            out[i] = a[i] + b[i];
            i += 1;
        }
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn add_assign_avx(vec: &mut [f32], bias: &[f32]) {
        let len = vec.len();
        let mut i = 0;
        while i + 8 <= len {
            let v = _mm256_loadu_ps(vec.as_ptr().add(i));
            let b = _mm256_loadu_ps(bias.as_ptr().add(i));
            _mm256_storeu_ps(vec.as_mut_ptr().add(i), _mm256_add_ps(v, b));
            i += 8;
        }
        while i < len {
            vec[i] += bias[i];
            i += 1;
        }
    }

    #[target_feature(enable = "avx")]
    pub unsafe fn axpy_avx(out: &mut [f32], s: f32, x: &[f32]) {
        let len = out.len();
        let vs = _mm256_set1_ps(s);
        let mut i = 0;
        while i + 8 <= len {
            let vo = _mm256_loadu_ps(out.as_ptr().add(i));
            let vx = _mm256_loadu_ps(x.as_ptr().add(i));
            _mm256_storeu_ps(
                out.as_mut_ptr().add(i),
                _mm256_add_ps(vo, _mm256_mul_ps(vs, vx)),
            );
            i += 8;
        }
        while i < len {
            out[i] += s * x[i];
            i += 1;
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn axpy_fma(out: &mut [f32], s: f32, x: &[f32]) {
        let len = out.len();
        let vs = _mm256_set1_ps(s);
        let mut i = 0;
        while i + 8 <= len {
            let vo = _mm256_loadu_ps(out.as_ptr().add(i));
            let vx = _mm256_loadu_ps(x.as_ptr().add(i));
            _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_fmadd_ps(vs, vx, vo));
            i += 8;
        }
        while i < len {
            out[i] += s * x[i];
            i += 1;
        }
    }

    #[inline]
    unsafe fn hsum256(v: __m256) -> f32 {
        let hi = _mm256_extractf128_ps(v, 1);
        let lo = _mm256_castps256_ps128(v);
        let sum4 = _mm_add_ps(hi, lo);
        let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
        let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 0x1));
        _mm_cvtss_f32(sum1)
    }
}

#[cfg(target_arch = "x86_64")]
use x86::{add_assign_avx, axpy_avx, axpy_fma, dot_avx, dot_avx2, dot_sse2, vec_add_avx};

//
// aarch64 implementations
//

#[cfg(target_arch = "aarch64")]
mod arm {
    use std::arch::aarch64::*;

    #[target_feature(enable = "neon")]
    pub unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = vdupq_n_f32(0.0);
        let mut i = 0;
        while i + 4 <= len {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            sum = vfmaq_f32(sum, va, vb);
            i += 4;
        }
        let mut total = vaddvq_f32(sum);
        while i < len {
            total += a[i] * b[i];
            i += 1;
        }
        total
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn vec_add_neon(out: &mut [f32], a: &[f32], b: &[f32]) {
        let len = a.len();
        let mut i = 0;
        while i + 4 <= len {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vaddq_f32(va, vb));
            i += 4;
        }
        while i < len {
            out[i] = a[i] + b[i];
            i += 1;
        }
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn add_assign_neon(vec: &mut [f32], bias: &[f32]) {
        let len = vec.len();
        let mut i = 0;
        while i + 4 <= len {
            let v = vld1q_f32(vec.as_ptr().add(i));
            let b = vld1q_f32(bias.as_ptr().add(i));
            vst1q_f32(vec.as_mut_ptr().add(i), vaddq_f32(v, b));
            i += 4;
        }
        while i < len {
            vec[i] += bias[i];
            i += 1;
        }
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn axpy_neon(out: &mut [f32], s: f32, x: &[f32]) {
        let len = out.len();
        let vs = vdupq_n_f32(s);
        let mut i = 0;
        while i + 4 <= len {
            let vo = vld1q_f32(out.as_ptr().add(i));
            let vx = vld1q_f32(x.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vfmaq_f32(vo, vx, vs));
            i += 4;
        }
        while i < len {
            out[i] += s * x[i];
            i += 1;
        }
    }
}

#[cfg(target_arch = "aarch64")]
use arm::{add_assign_neon, axpy_neon, dot_neon, vec_add_neon};
