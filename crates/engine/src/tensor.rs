//! Shape Utilities and Memory-Efficient Tensors
//!
//! # Overview
//!
//! Small tensor layer under the execution core:
//! - [`Shape`]: ordered dimension list with derived element count, canonical
//!   strides, and contiguity checks
//! - [`MemTensor`]: an f32-element tensor tagged with a dtype and an
//!   allocation strategy (static, pooled, streamed)
//! - [`TensorPool`]: a reuse pool that hands freed buffers back to
//!   subsequent allocations under a byte capacity
//!
//! A tensor is contiguous iff its strides are the canonical product of
//! trailing dimensions. In-place element-wise ops require identical shape
//! and dtype and only succeed when strides permit position-wise iteration.

use serde::Serialize;

use crate::errors::{EngineError, EngineResult};

/// Element type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dtype {
    F32,
    F16,
    I8,
    I16,
    I32,
}

impl Dtype {
    /// Bytes per element
    pub fn size_bytes(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F16 | Dtype::I16 => 2,
            Dtype::I8 => 1,
        }
    }
}

/// Allocation strategy for a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TensorStrategy {
    /// Owned buffer allocated up front
    Static,
    /// Buffer acquired from (and returned to) a [`TensorPool`]
    Pooled,
    /// Processed through fixed-size chunks to bound auxiliary memory
    Streamed,
}

/// Ordered dimension list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> EngineResult<Self> {
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(EngineError::InvalidShape {
                context: format!("shape {:?}", dims),
            });
        }
        Ok(Self { dims })
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total element count
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Canonical row-major strides (product of trailing dimensions)
    pub fn canonical_strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// A stride set is contiguous iff it equals the canonical strides
    pub fn is_contiguous(&self, strides: &[usize]) -> bool {
        strides == self.canonical_strides().as_slice()
    }
}

/// Memory-efficient tensor
///
/// Element storage is f32; the dtype tag records the logical element type
/// for memory accounting and interop. Element-wise arithmetic is only
/// implemented for `Dtype::F32`.
#[derive(Debug)]
pub struct MemTensor {
    data: Vec<f32>,
    dtype: Dtype,
    shape: Shape,
    strides: Vec<usize>,
    strategy: TensorStrategy,
}

impl MemTensor {
    /// Allocate a zero-filled static tensor
    pub fn zeros(shape: Shape, dtype: Dtype) -> Self {
        let n = shape.elem_count();
        let strides = shape.canonical_strides();
        Self {
            data: vec![0.0; n],
            dtype,
            shape,
            strides,
            strategy: TensorStrategy::Static,
        }
    }

    /// Wrap existing data
    pub fn from_data(shape: Shape, dtype: Dtype, data: Vec<f32>) -> EngineResult<Self> {
        if data.len() != shape.elem_count() {
            return Err(EngineError::InvalidShape {
                context: format!("{} elements for shape {:?}", data.len(), shape.dims()),
            });
        }
        let strides = shape.canonical_strides();
        Ok(Self {
            data,
            dtype,
            shape,
            strides,
            strategy: TensorStrategy::Static,
        })
    }

    /// Acquire backing storage from a pool
    pub fn pooled(shape: Shape, dtype: Dtype, pool: &mut TensorPool) -> EngineResult<Self> {
        let n = shape.elem_count();
        let data = pool.acquire(n, dtype)?;
        let strides = shape.canonical_strides();
        Ok(Self {
            data,
            dtype,
            shape,
            strides,
            strategy: TensorStrategy::Pooled,
        })
    }

    /// Mark the tensor as stream-processed
    pub fn streamed(mut self) -> Self {
        self.strategy = TensorStrategy::Streamed;
        self
    }

    /// Override strides (produces a non-contiguous view for testing and
    /// future slicing support)
    pub fn with_strides(mut self, strides: Vec<usize>) -> EngineResult<Self> {
        if strides.len() != self.shape.rank() {
            return Err(EngineError::InvalidShape {
                context: format!(
                    "{} strides for rank {}",
                    strides.len(),
                    self.shape.rank()
                ),
            });
        }
        self.strides = strides;
        Ok(self)
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    #[inline]
    pub fn strategy(&self) -> TensorStrategy {
        self.strategy
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Logical memory usage in bytes (dtype-sized)
    pub fn memory_usage(&self) -> usize {
        self.shape.elem_count() * self.dtype.size_bytes()
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.shape.is_contiguous(&self.strides)
    }

    /// In-place element-wise add: `self += other`
    ///
    /// # Errors
    ///
    /// `InvalidShape` on shape/dtype mismatch or when either side is not
    /// position-wise iterable; `NotImplemented` for non-f32 dtypes.
    pub fn add_inplace(&mut self, other: &MemTensor) -> EngineResult<()> {
        self.check_elementwise(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// In-place element-wise multiply: `self *= other`
    pub fn mul_inplace(&mut self, other: &MemTensor) -> EngineResult<()> {
        self.check_elementwise(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a *= b;
        }
        Ok(())
    }

    /// Apply `f` over the data in fixed-size chunks
    ///
    /// Chunk size bounds the peak auxiliary memory a position-wise
    /// transformation may use.
    pub fn stream_apply<F>(&mut self, chunk_size: usize, mut f: F) -> EngineResult<()>
    where
        F: FnMut(&mut [f32]),
    {
        if chunk_size == 0 {
            return Err(EngineError::InvalidArgument {
                what: "chunk_size must be non-zero".into(),
            });
        }
        for chunk in self.data.chunks_mut(chunk_size) {
            f(chunk);
        }
        Ok(())
    }

    /// Return pooled storage to its pool
    ///
    /// No-op for static/streamed tensors.
    pub fn release(self, pool: &mut TensorPool) {
        if self.strategy == TensorStrategy::Pooled {
            pool.release(self.data, self.dtype);
        }
    }

    fn check_elementwise(&self, other: &MemTensor) -> EngineResult<()> {
        if self.dtype != Dtype::F32 || other.dtype != Dtype::F32 {
            return Err(EngineError::NotImplemented {
                what: format!("element-wise ops on {:?}/{:?}", self.dtype, other.dtype),
            });
        }
        if self.shape != other.shape {
            return Err(EngineError::InvalidShape {
                context: format!("{:?} vs {:?}", self.shape.dims(), other.shape.dims()),
            });
        }
        if !self.is_contiguous() || !other.is_contiguous() {
            return Err(EngineError::InvalidShape {
                context: "strides do not permit position-wise iteration".into(),
            });
        }
        Ok(())
    }
}

/// Buffer reuse pool with a byte capacity
///
/// Freed buffers are kept on a free list and handed back to later
/// allocations of the same or smaller element count. Live allocations are
/// owned by their tensors; the pool only bounds the total bytes it will
/// hand out at once.
#[derive(Debug)]
pub struct TensorPool {
    capacity_bytes: usize,
    live_bytes: usize,
    free: Vec<Vec<f32>>,
    stats: PoolStats,
}

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub allocation_count: u64,
    pub free_count: u64,
    pub reuse_count: u64,
    pub peak_live_bytes: usize,
}

impl TensorPool {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            live_bytes: 0,
            free: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    /// Acquire a buffer of `elems` elements, reusing a freed one when
    /// possible
    pub fn acquire(&mut self, elems: usize, dtype: Dtype) -> EngineResult<Vec<f32>> {
        let bytes = elems * dtype.size_bytes();
        if self.live_bytes + bytes > self.capacity_bytes {
            return Err(EngineError::OutOfMemory { requested: bytes });
        }

        self.live_bytes += bytes;
        self.stats.allocation_count += 1;
        self.stats.peak_live_bytes = self.stats.peak_live_bytes.max(self.live_bytes);

        // Best-fit scan over the free list
        let mut best: Option<usize> = None;
        for (i, buf) in self.free.iter().enumerate() {
            if buf.capacity() >= elems {
                let better = match best {
                    Some(j) => buf.capacity() < self.free[j].capacity(),
                    None => true,
                };
                if better {
                    best = Some(i);
                }
            }
        }
        if let Some(i) = best {
            let mut buf = self.free.swap_remove(i);
            buf.clear();
            buf.resize(elems, 0.0);
            self.stats.reuse_count += 1;
            return Ok(buf);
        }

        Ok(vec![0.0; elems])
    }

    /// Return a buffer to the free list
    pub fn release(&mut self, buf: Vec<f32>, dtype: Dtype) {
        let bytes = buf.len() * dtype.size_bytes();
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
        self.stats.free_count += 1;
        self.free.push(buf);
    }

    /// Change the pool capacity
    ///
    /// Live allocations are preserved. Shrinking below the currently live
    /// byte count fails with `OutOfMemory` and leaves the pool unchanged.
    pub fn resize(&mut self, new_capacity_bytes: usize) -> EngineResult<()> {
        if new_capacity_bytes < self.live_bytes {
            return Err(EngineError::OutOfMemory {
                requested: new_capacity_bytes,
            });
        }
        self.capacity_bytes = new_capacity_bytes;
        // Drop cached free buffers that no longer fit the new capacity
        self.free.retain(|b| b.capacity() * 4 <= new_capacity_bytes);
        Ok(())
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_basics() {
        let s = Shape::new(vec![2, 3, 4]).unwrap();
        assert_eq!(s.elem_count(), 24);
        assert_eq!(s.canonical_strides(), vec![12, 4, 1]);
        assert!(s.is_contiguous(&[12, 4, 1]));
        assert!(!s.is_contiguous(&[1, 4, 12]));
    }

    #[test]
    fn test_shape_rejects_zero_dim() {
        assert!(Shape::new(vec![2, 0, 4]).is_err());
        assert!(Shape::new(vec![]).is_err());
    }

    #[test]
    fn test_add_inplace() {
        let shape = Shape::new(vec![2, 2]).unwrap();
        let mut a =
            MemTensor::from_data(shape.clone(), Dtype::F32, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = MemTensor::from_data(shape, Dtype::F32, vec![10.0, 20.0, 30.0, 40.0]).unwrap();

        a.add_inplace(&b).unwrap();
        assert_eq!(a.data(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_mul_inplace_shape_mismatch() {
        let mut a = MemTensor::zeros(Shape::new(vec![2, 2]).unwrap(), Dtype::F32);
        let b = MemTensor::zeros(Shape::new(vec![4]).unwrap(), Dtype::F32);
        assert!(a.mul_inplace(&b).is_err());
    }

    #[test]
    fn test_elementwise_rejects_non_f32() {
        let mut a = MemTensor::zeros(Shape::new(vec![4]).unwrap(), Dtype::I8);
        let b = MemTensor::zeros(Shape::new(vec![4]).unwrap(), Dtype::I8);
        match a.add_inplace(&b) {
            Err(EngineError::NotImplemented { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_elementwise_rejects_non_contiguous() {
        let shape = Shape::new(vec![2, 2]).unwrap();
        let mut a = MemTensor::zeros(shape.clone(), Dtype::F32)
            .with_strides(vec![1, 2])
            .unwrap();
        let b = MemTensor::zeros(shape, Dtype::F32);
        assert!(a.add_inplace(&b).is_err());
    }

    #[test]
    fn test_stream_apply_chunked() {
        let mut t = MemTensor::from_data(
            Shape::new(vec![7]).unwrap(),
            Dtype::F32,
            vec![1.0; 7],
        )
        .unwrap()
        .streamed();

        let mut chunk_sizes = Vec::new();
        t.stream_apply(3, |chunk| {
            chunk_sizes.push(chunk.len());
            for v in chunk.iter_mut() {
                *v *= 2.0;
            }
        })
        .unwrap();

        assert_eq!(chunk_sizes, vec![3, 3, 1]);
        assert!(t.data().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_pool_reuse() {
        let mut pool = TensorPool::new(1024);
        let shape = Shape::new(vec![16]).unwrap();

        let t = MemTensor::pooled(shape.clone(), Dtype::F32, &mut pool).unwrap();
        assert_eq!(pool.live_bytes(), 64);
        t.release(&mut pool);
        assert_eq!(pool.live_bytes(), 0);

        let _t2 = MemTensor::pooled(shape, Dtype::F32, &mut pool).unwrap();
        assert_eq!(pool.stats().reuse_count, 1);
    }

    #[test]
    fn test_pool_capacity_enforced() {
        let mut pool = TensorPool::new(32);
        let shape = Shape::new(vec![16]).unwrap(); // 64 bytes
        assert!(MemTensor::pooled(shape, Dtype::F32, &mut pool).is_err());
    }

    #[test]
    fn test_pool_resize_preserves_live() {
        let mut pool = TensorPool::new(1024);
        let t = MemTensor::pooled(Shape::new(vec![32]).unwrap(), Dtype::F32, &mut pool).unwrap();
        assert_eq!(pool.live_bytes(), 128);

        // Shrink below live fails without mutation
        assert!(pool.resize(64).is_err());
        assert_eq!(pool.capacity_bytes(), 1024);

        // Shrink above live succeeds
        pool.resize(256).unwrap();
        assert_eq!(pool.capacity_bytes(), 256);
        drop(t);
    }

    #[test]
    fn test_memory_usage_dtype_sized() {
        let t = MemTensor::zeros(Shape::new(vec![10]).unwrap(), Dtype::I16);
        assert_eq!(t.memory_usage(), 20);
    }
}
