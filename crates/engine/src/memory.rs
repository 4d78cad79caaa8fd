//! Memory Optimizer
//!
//! # Overview
//!
//! Converts a single memory/speed trade-off knob into concrete execution
//! policy and tracks every activation buffer the execution core allocates:
//!
//! | `memory_speed_tradeoff` | Policy |
//! |---|---|
//! | `t < 0.3` | speed-first: no checkpointing, aggressive workspace headroom |
//! | `0.3 ≤ t ≤ 0.7` | selective checkpointing |
//! | `t > 0.7` | memory-first: checkpoint all eligible, mandatory in-place ops, recomputation allowed |
//!
//! Freed activation buffers are kept for reuse, so steady-state generation
//! allocates close to nothing. The optimizer enforces `max_memory_budget`
//! over everything it hands out.

use serde::Serialize;

use crate::errors::{EngineError, EngineResult};
use crate::scheduler::CheckpointPolicy;
use crate::tensor::{Dtype, TensorPool};

/// Memory optimizer configuration
#[derive(Debug, Clone, Copy)]
pub struct MemoryOptimizerConfig {
    /// Upper bound on bytes the optimizer will hand out at once
    pub max_memory_budget: usize,

    /// Master switch for activation checkpointing
    pub enable_checkpointing: bool,

    /// Trade-off knob in `[0, 1]`: 0 = all speed, 1 = all memory
    pub memory_speed_tradeoff: f32,

    /// Allow recomputing activations instead of holding them
    pub recompute_activations: bool,

    /// Cap on bytes of live activations (0 = bounded by budget only)
    pub max_activation_memory: usize,
}

impl Default for MemoryOptimizerConfig {
    fn default() -> Self {
        Self {
            max_memory_budget: 64 * 1024 * 1024,
            enable_checkpointing: true,
            memory_speed_tradeoff: 0.5,
            recompute_activations: false,
            max_activation_memory: 0,
        }
    }
}

impl MemoryOptimizerConfig {
    /// Speed-first preset
    pub fn speed_first() -> Self {
        Self {
            memory_speed_tradeoff: 0.0,
            enable_checkpointing: false,
            ..Default::default()
        }
    }

    /// Memory-first preset
    pub fn memory_first() -> Self {
        Self {
            memory_speed_tradeoff: 1.0,
            recompute_activations: true,
            ..Default::default()
        }
    }

    /// Set the budget
    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.max_memory_budget = bytes;
        self
    }

    /// Set the trade-off knob (clamped to `[0, 1]`)
    pub fn with_tradeoff(mut self, t: f32) -> Self {
        self.memory_speed_tradeoff = t.clamp(0.0, 1.0);
        self
    }
}

/// Memory accounting counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryStats {
    pub total_allocated: usize,
    pub current_allocated: usize,
    pub peak_allocated: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    pub tensor_reuse_count: u64,
    pub memory_saved: usize,
}

/// Memory optimizer
///
/// Owns a reuse pool for activation buffers and exposes the policy derived
/// from the configured trade-off.
pub struct MemoryOptimizer {
    config: MemoryOptimizerConfig,
    pool: TensorPool,
    stats: MemoryStats,
}

impl MemoryOptimizer {
    pub fn new(config: MemoryOptimizerConfig) -> Self {
        let pool = TensorPool::new(config.max_memory_budget);
        Self {
            config,
            pool,
            stats: MemoryStats::default(),
        }
    }

    pub fn config(&self) -> &MemoryOptimizerConfig {
        &self.config
    }

    /// Checkpoint policy implied by the trade-off knob
    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        if !self.config.enable_checkpointing {
            return CheckpointPolicy::None;
        }
        let t = self.config.memory_speed_tradeoff;
        if t < 0.3 {
            CheckpointPolicy::None
        } else if t <= 0.7 {
            CheckpointPolicy::Selective
        } else {
            CheckpointPolicy::AllEligible
        }
    }

    /// Whether element-wise ops must run in place
    pub fn in_place_required(&self) -> bool {
        self.config.memory_speed_tradeoff > 0.7
    }

    /// Whether recomputation is allowed in place of retention
    pub fn recompute_allowed(&self) -> bool {
        self.config.recompute_activations || self.config.memory_speed_tradeoff > 0.7
    }

    /// Workspace sizing multiplier for the scheduler
    ///
    /// Speed-first expands the workspace so fewer layers hit the
    /// `WorkspaceTooSmall` retry path.
    pub fn workspace_headroom(&self) -> f32 {
        if self.config.memory_speed_tradeoff < 0.3 {
            2.0
        } else {
            1.0
        }
    }

    /// Derive a scheduler configuration from the current policy
    ///
    /// `workspace_elems` is the base per-half workspace size; speed-first
    /// configurations scale it up by the headroom factor.
    pub fn scheduler_config(&self, workspace_elems: usize) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            policy: self.checkpoint_policy(),
            memory_budget: Some(self.config.max_memory_budget),
            workspace_size: (workspace_elems as f32 * self.workspace_headroom()) as usize,
            memory_min: self.config.memory_speed_tradeoff > 0.7,
            allow_recompute: self.recompute_allowed(),
        }
    }

    /// Allocate an activation buffer of `elems` f32 elements
    ///
    /// Reuses a previously freed buffer when one fits.
    ///
    /// # Errors
    ///
    /// `BudgetExceeded` when the allocation would push live bytes past the
    /// budget (or past `max_activation_memory` when set).
    pub fn alloc_activation(&mut self, elems: usize) -> EngineResult<Vec<f32>> {
        let bytes = elems * std::mem::size_of::<f32>();
        let cap = if self.config.max_activation_memory > 0 {
            self.config.max_activation_memory.min(self.config.max_memory_budget)
        } else {
            self.config.max_memory_budget
        };
        if self.pool.live_bytes() + bytes > cap {
            return Err(EngineError::BudgetExceeded {
                required: self.pool.live_bytes() + bytes,
                budget: cap,
            });
        }

        let reuse_before = self.pool.stats().reuse_count;
        let buf = self.pool.acquire(elems, Dtype::F32)?;
        let reused = self.pool.stats().reuse_count > reuse_before;

        self.stats.allocation_count += 1;
        self.stats.total_allocated += bytes;
        self.stats.current_allocated += bytes;
        self.stats.peak_allocated = self.stats.peak_allocated.max(self.stats.current_allocated);
        if reused {
            self.stats.tensor_reuse_count += 1;
            self.stats.memory_saved += bytes;
        }
        Ok(buf)
    }

    /// Return an activation buffer for reuse
    pub fn free_activation(&mut self, buf: Vec<f32>) {
        let bytes = buf.len() * std::mem::size_of::<f32>();
        self.stats.free_count += 1;
        self.stats.current_allocated = self.stats.current_allocated.saturating_sub(bytes);
        self.pool.release(buf, Dtype::F32);
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    /// Clear accumulated statistics (buffers stay pooled)
    pub fn reset_stats(&mut self) {
        self.stats = MemoryStats::default();
    }
}
