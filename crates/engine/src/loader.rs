//! Progressive Weight Loader
//!
//! # Overview
//!
//! Streams per-layer weights from a weights file under a byte budget.
//! Layers are brought in on first access and evicted when a new load would
//! push the resident total past the budget. Only weight bytes are evicted;
//! per-layer metadata stays resident.
//!
//! Invariant: the sum of loaded-layer byte sizes never exceeds the budget.
//!
//! # Eviction Priority
//!
//! - `Sequential`: evict the lowest-numbered loaded layer first (forward
//!   passes touch layers in order, so low indices are the coldest)
//! - `AccessPattern`: evict the least recently accessed layer (LRU over an
//!   access tick)
//!
//! # Prefetch
//!
//! A run of consecutive-layer loads raises the estimated probability that
//! layer `i + 1` is next. Once that estimate reaches the configured
//! threshold, [`ProgressiveLoader::maybe_prefetch`] loads the next layer
//! eagerly, but only when it fits without evicting anything.

use serde::Serialize;

use crate::errors::{EngineError, EngineResult};
use crate::format::{LayerWeights, WeightsFile};

/// Eviction priority strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PriorityStrategy {
    Sequential,
    AccessPattern,
}

/// Loader configuration
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    /// Resident-weight byte budget
    pub budget_bytes: usize,

    /// Eviction priority strategy
    pub strategy: PriorityStrategy,

    /// Predicted next-access probability at which prefetch triggers
    pub prefetch_threshold: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 32 * 1024 * 1024,
            strategy: PriorityStrategy::AccessPattern,
            prefetch_threshold: 0.7,
        }
    }
}

/// Loader counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoaderStats {
    pub loads: u64,
    pub cache_hits: u64,
    pub evictions: u64,
    pub prefetches: u64,
}

struct Slot {
    weights: Option<LayerWeights>,
    bytes: usize,
    last_access_tick: u64,
}

/// Progressive per-layer weight loader
pub struct ProgressiveLoader {
    file: WeightsFile,
    config: LoaderConfig,
    slots: Vec<Slot>,
    tick: u64,
    loaded_bytes: usize,
    /// Length of the current run of consecutive-layer loads
    seq_run: u64,
    last_access: Option<usize>,
    stats: LoaderStats,
}

impl ProgressiveLoader {
    pub fn new(file: WeightsFile, config: LoaderConfig) -> Self {
        let slots = (0..file.layer_count())
            .map(|i| Slot {
                weights: None,
                bytes: file.layer_byte_size(i),
                last_access_tick: 0,
            })
            .collect();
        Self {
            file,
            config,
            slots,
            tick: 0,
            loaded_bytes: 0,
            seq_run: 0,
            last_access: None,
            stats: LoaderStats::default(),
        }
    }

    pub fn layer_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_loaded(&self, i: usize) -> bool {
        self.slots.get(i).map_or(false, |s| s.weights.is_some())
    }

    pub fn loaded_bytes(&self) -> usize {
        self.loaded_bytes
    }

    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Bring layer `i` in (evicting under budget pressure) and return it
    pub fn load_layer(&mut self, i: usize) -> EngineResult<&LayerWeights> {
        if i >= self.slots.len() {
            return Err(EngineError::InvalidArgument {
                what: format!("layer index {} of {}", i, self.slots.len()),
            });
        }

        self.tick += 1;
        self.slots[i].last_access_tick = self.tick;
        self.track_access(i);

        if self.slots[i].weights.is_some() {
            self.stats.cache_hits += 1;
            return Ok(self.slots[i].weights.as_ref().expect("just checked"));
        }

        let bytes = self.slots[i].bytes;
        if bytes > self.config.budget_bytes {
            return Err(EngineError::BudgetExceeded {
                required: bytes,
                budget: self.config.budget_bytes,
            });
        }
        while self.loaded_bytes + bytes > self.config.budget_bytes {
            self.evict_one(i)?;
        }

        let weights = self.file.read_layer(i)?;
        tracing::debug!(layer = i, bytes, "layer weights loaded");
        self.slots[i].weights = Some(weights);
        self.loaded_bytes += bytes;
        self.stats.loads += 1;
        Ok(self.slots[i].weights.as_ref().expect("just stored"))
    }

    /// Drop layer `i`'s weight bytes; metadata remains
    pub fn unload_layer(&mut self, i: usize) {
        if let Some(slot) = self.slots.get_mut(i) {
            if slot.weights.take().is_some() {
                self.loaded_bytes -= slot.bytes;
            }
        }
    }

    /// Prefetch the predicted next layer when the access run is long enough
    ///
    /// Never evicts; a prefetch that does not fit is skipped.
    pub fn maybe_prefetch(&mut self) -> EngineResult<()> {
        // Run of k consecutive-layer accesses: estimate (k + 1) / (k + 2)
        let prob = (self.seq_run + 1) as f32 / (self.seq_run + 2) as f32;
        if prob < self.config.prefetch_threshold {
            return Ok(());
        }
        let next = match self.last_access {
            Some(i) if i + 1 < self.slots.len() => i + 1,
            _ => return Ok(()),
        };
        if self.slots[next].weights.is_some()
            || self.loaded_bytes + self.slots[next].bytes > self.config.budget_bytes
        {
            return Ok(());
        }

        let weights = self.file.read_layer(next)?;
        tracing::debug!(layer = next, "layer weights prefetched");
        self.loaded_bytes += self.slots[next].bytes;
        self.slots[next].weights = Some(weights);
        self.slots[next].last_access_tick = self.tick;
        self.stats.loads += 1;
        self.stats.prefetches += 1;
        Ok(())
    }

    fn track_access(&mut self, i: usize) {
        match self.last_access {
            Some(prev) if i == prev + 1 => self.seq_run += 1,
            Some(prev) if i == prev => {}
            _ => self.seq_run = 0,
        }
        self.last_access = Some(i);
    }

    /// Evict the lowest-priority loaded layer other than `protect`
    fn evict_one(&mut self, protect: usize) -> EngineResult<()> {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(idx, s)| *idx != protect && s.weights.is_some())
            .min_by_key(|(idx, s)| match self.config.strategy {
                PriorityStrategy::Sequential => *idx as u64,
                PriorityStrategy::AccessPattern => s.last_access_tick,
            })
            .map(|(idx, _)| idx);

        match victim {
            Some(idx) => {
                tracing::debug!(layer = idx, "layer weights evicted");
                self.slots[idx].weights = None;
                self.loaded_bytes -= self.slots[idx].bytes;
                self.stats.evictions += 1;
                Ok(())
            }
            None => Err(EngineError::BudgetExceeded {
                required: self.loaded_bytes,
                budget: self.config.budget_bytes,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{write_arch_file, write_weights_file, LayerArch, ModelArch};
    use crate::model::{LayerKind, ModelKind};
    use crate::quantize::{DenseMatrixF32, QuantizedMatrix4};
    use crate::tables::Activation;
    use tempfile::TempDir;

    /// Four uniform dense layers with equal record sizes
    fn fixture(dir: &TempDir) -> (ModelArch, std::path::PathBuf) {
        let layers: Vec<LayerArch> = (0..4)
            .map(|_| LayerArch {
                kind: LayerKind::Dense,
                input_size: 4,
                output_size: 4,
                activation: Activation::Relu,
            })
            .collect();
        let arch = ModelArch {
            model_kind: ModelKind::Transformer,
            hidden_size: 4,
            context_size: 8,
            layers,
        };

        let weights: Vec<LayerWeights> = (0..4)
            .map(|l| {
                let dense = DenseMatrixF32::new(
                    4,
                    4,
                    (0..16).map(|i| (l * 16 + i) as f32 * 0.1).collect(),
                )
                .unwrap();
                LayerWeights {
                    matrix: QuantizedMatrix4::quantize(&dense).unwrap(),
                    bias: vec![l as f32; 4],
                }
            })
            .collect();

        let arch_path = dir.path().join("m.arch");
        let weights_path = dir.path().join("m.weights");
        write_arch_file(&arch_path, &arch).unwrap();
        write_weights_file(&weights_path, &arch, &weights).unwrap();
        (arch, weights_path)
    }

    fn loader(dir: &TempDir, config: LoaderConfig) -> ProgressiveLoader {
        let (arch, weights_path) = fixture(dir);
        let file = WeightsFile::open(&weights_path, &arch).unwrap();
        ProgressiveLoader::new(file, config)
    }

    fn record_bytes(l: &ProgressiveLoader) -> usize {
        l.slots[0].bytes
    }

    #[test]
    fn test_load_and_hit() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(&dir, LoaderConfig::default());

        let w = l.load_layer(2).unwrap();
        assert_eq!(w.bias, vec![2.0; 4]);
        assert!(l.is_loaded(2));

        l.load_layer(2).unwrap();
        let s = l.stats();
        assert_eq!(s.loads, 1);
        assert_eq!(s.cache_hits, 1);
    }

    #[test]
    fn test_budget_invariant_with_eviction() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(&dir, LoaderConfig::default());
        let rec = record_bytes(&l);

        // Budget for exactly two layers
        l.config.budget_bytes = 2 * rec;
        for i in 0..4 {
            l.load_layer(i).unwrap();
            assert!(l.loaded_bytes() <= l.config.budget_bytes);
        }
        assert_eq!(l.stats().evictions, 2);
        assert!(l.is_loaded(3));
    }

    #[test]
    fn test_lru_eviction_order() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(
            &dir,
            LoaderConfig {
                strategy: PriorityStrategy::AccessPattern,
                ..LoaderConfig::default()
            },
        );
        let rec = record_bytes(&l);
        l.config.budget_bytes = 2 * rec;

        l.load_layer(0).unwrap();
        l.load_layer(1).unwrap();
        l.load_layer(0).unwrap(); // refresh 0; 1 becomes LRU
        l.load_layer(2).unwrap();

        assert!(l.is_loaded(0));
        assert!(!l.is_loaded(1));
        assert!(l.is_loaded(2));
    }

    #[test]
    fn test_sequential_eviction_order() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(
            &dir,
            LoaderConfig {
                strategy: PriorityStrategy::Sequential,
                ..LoaderConfig::default()
            },
        );
        let rec = record_bytes(&l);
        l.config.budget_bytes = 2 * rec;

        l.load_layer(1).unwrap();
        l.load_layer(3).unwrap();
        l.load_layer(2).unwrap(); // evicts lowest index: 1

        assert!(!l.is_loaded(1));
        assert!(l.is_loaded(2));
        assert!(l.is_loaded(3));
    }

    #[test]
    fn test_single_layer_over_budget() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(&dir, LoaderConfig::default());
        l.config.budget_bytes = record_bytes(&l) - 1;
        match l.load_layer(0) {
            Err(EngineError::BudgetExceeded { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unload() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(&dir, LoaderConfig::default());
        l.load_layer(1).unwrap();
        let bytes = l.loaded_bytes();
        assert!(bytes > 0);

        l.unload_layer(1);
        assert!(!l.is_loaded(1));
        assert_eq!(l.loaded_bytes(), 0);

        // Unloading again is a no-op
        l.unload_layer(1);
        assert_eq!(l.loaded_bytes(), 0);
    }

    #[test]
    fn test_prefetch_after_sequential_run() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(&dir, LoaderConfig::default());

        // 0, 1, 2, 3 in order: after the third consecutive access the
        // estimated probability (3/4) crosses the 0.7 threshold
        l.load_layer(0).unwrap();
        l.maybe_prefetch().unwrap();
        assert_eq!(l.stats().prefetches, 0);

        l.load_layer(1).unwrap();
        l.load_layer(2).unwrap();
        l.maybe_prefetch().unwrap();
        assert_eq!(l.stats().prefetches, 1);
        assert!(l.is_loaded(3));
    }

    #[test]
    fn test_prefetch_never_evicts() {
        let dir = TempDir::new().unwrap();
        let mut l = loader(&dir, LoaderConfig::default());
        let rec = record_bytes(&l);
        l.config.budget_bytes = 3 * rec;

        l.load_layer(0).unwrap();
        l.load_layer(1).unwrap();
        l.load_layer(2).unwrap();
        // Budget is full; prefetch of 3 must be skipped, nothing evicted
        l.maybe_prefetch().unwrap();
        assert_eq!(l.stats().prefetches, 0);
        assert!(l.is_loaded(0) && l.is_loaded(1) && l.is_loaded(2));
    }
}
