//! Dependency-Graph Layer Scheduler
//!
//! # Overview
//!
//! Executes a DAG of layers under a memory budget:
//!
//! 1. **Topological sort** via DFS coloring (`CycleDetected` on back-edges)
//! 2. **Checkpoint placement** per policy, plus availability analysis: a
//!    layer whose output is consumed later than the immediately-following
//!    record must either be checkpointed or be cheap to recompute, because
//!    the workspace only holds the most recent output
//! 3. **Peak memory estimation** by simulating the execution order; when the
//!    estimate exceeds the budget the policy escalates to all-eligible once,
//!    then fails with `BudgetExceeded`
//! 4. **Execution** with a single workspace used as two alternating halves
//!    (so a layer can read its predecessor's output while writing its own)
//!
//! # Multi-Input Layers
//!
//! Every forward function receives a slice of dependency outputs in edge
//! insertion order; layers with no dependencies receive the caller input.
//! [`LayerDesc::aggregate_concat`] builds the standard aggregation layer
//! that concatenates its inputs for downstream consumers.
//!
//! # State Machines
//!
//! Topo sort: `Unvisited → Visiting → Visited`. Execution per record:
//! `Pending → Running → Completed`, with a `checkpointed` flag once the
//! output copy is retained. `reset` clears execution state, checkpoints,
//! and statistics.

use std::time::Instant;

use serde::Serialize;

use crate::errors::{EngineError, EngineResult};

/// Checkpoint placement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckpointPolicy {
    /// Never checkpoint
    None,
    /// Checkpoint every eligible layer
    AllEligible,
    /// Checkpoint eligible layers with multiple dependents or large outputs
    Selective,
}

/// Output size above which the selective policy checkpoints under
/// memory-min pressure (1 MiB)
const SELECTIVE_SIZE_THRESHOLD: usize = 1024 * 1024;

/// Checkpoint memory overhead factor used by the peak estimator
const CHECKPOINT_OVERHEAD: f32 = 1.1;

/// Layer forward function: dependency outputs in, one output slice out
pub type ForwardFn = Box<dyn FnMut(&[&[f32]], &mut [f32]) -> EngineResult<()>>;

/// Scheduler view of one layer
pub struct LayerDesc {
    pub name: String,
    pub kind: String,
    pub input_size: usize,
    pub output_size: usize,
    pub workspace_size: usize,
    pub checkpoint_eligible: bool,
    pub forward: ForwardFn,
}

impl LayerDesc {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        input_size: usize,
        output_size: usize,
        forward: ForwardFn,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            input_size,
            output_size,
            workspace_size: 0,
            checkpoint_eligible: true,
            forward,
        }
    }

    pub fn with_workspace(mut self, elems: usize) -> Self {
        self.workspace_size = elems;
        self
    }

    pub fn not_checkpointable(mut self) -> Self {
        self.checkpoint_eligible = false;
        self
    }

    /// Standard aggregation layer: concatenates dependency outputs
    ///
    /// `output_size` must equal the sum of the dependency output sizes.
    pub fn aggregate_concat(name: impl Into<String>, output_size: usize) -> Self {
        Self::new(
            name,
            "aggregate",
            output_size,
            output_size,
            Box::new(|inputs, out| {
                let total: usize = inputs.iter().map(|i| i.len()).sum();
                if total != out.len() {
                    return Err(EngineError::InvalidShape {
                        context: format!("aggregate {} elements into {}", total, out.len()),
                    });
                }
                let mut off = 0;
                for input in inputs {
                    out[off..off + input.len()].copy_from_slice(input);
                    off += input.len();
                }
                Ok(())
            }),
        )
    }
}

/// Retained copy of one layer's output
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub layer_id: usize,
    pub data: Vec<f32>,
    pub active: bool,
}

/// Ordered execution plan produced by `prepare`
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Layer ids in execution order
    pub order: Vec<usize>,
    /// Per-layer checkpoint flag (indexed by layer id)
    pub should_checkpoint: Vec<bool>,
    /// Per-layer recompute-instead-of-checkpoint flag (indexed by layer id)
    pub recompute_on_demand: Vec<bool>,
    /// Estimated peak bytes for the plan
    pub estimated_peak: usize,
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub policy: CheckpointPolicy,
    /// Peak-memory budget in bytes (`None` = unbounded)
    pub memory_budget: Option<usize>,
    /// Preferred workspace size in f32 elements per half
    pub workspace_size: usize,
    /// Apply the 1 MiB output-size rule under the selective policy
    pub memory_min: bool,
    /// Recompute dependency-free layers instead of checkpointing them
    pub allow_recompute: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: CheckpointPolicy::Selective,
            memory_budget: None,
            workspace_size: 64 * 1024,
            memory_min: false,
            allow_recompute: false,
        }
    }
}

/// Execution state of one layer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Pending,
    Running,
    Completed,
}

/// Accumulated scheduler statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub peak_bytes: usize,
    pub total_allocated: usize,
    pub checkpoint_count: u64,
    pub recompute_count: u64,
    pub layer_exec_counts: Vec<u64>,
    pub elapsed_ns: u64,
}

struct LayerRecord {
    desc: LayerDesc,
    state: ExecState,
}

/// Dependency-graph layer scheduler
pub struct LayerScheduler {
    records: Vec<LayerRecord>,
    /// Dependency sources per target, in edge insertion order
    deps_of: Vec<Vec<usize>>,
    /// Dependents per source
    dependents_of: Vec<Vec<usize>>,
    config: SchedulerConfig,
    plan: Option<ExecutionPlan>,
    checkpoints: Vec<Option<Checkpoint>>,
    workspace: Vec<f32>,
    /// Elements per workspace half
    workspace_half: usize,
    stats: SchedulerStats,
}

impl LayerScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            records: Vec::new(),
            deps_of: Vec::new(),
            dependents_of: Vec::new(),
            config,
            plan: None,
            checkpoints: Vec::new(),
            workspace: Vec::new(),
            workspace_half: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Register a layer; returns its id
    pub fn add_layer(&mut self, desc: LayerDesc) -> usize {
        let id = self.records.len();
        self.records.push(LayerRecord {
            desc,
            state: ExecState::Pending,
        });
        self.deps_of.push(Vec::new());
        self.dependents_of.push(Vec::new());
        self.checkpoints.push(None);
        id
    }

    /// Add a dependency edge: `src` produces input for `dst`
    pub fn add_dependency(&mut self, src: usize, dst: usize) -> EngineResult<()> {
        let n = self.records.len();
        if src >= n || dst >= n || src == dst {
            return Err(EngineError::InvalidArgument {
                what: format!("dependency edge {} -> {}", src, dst),
            });
        }
        self.deps_of[dst].push(src);
        self.dependents_of[src].push(dst);
        self.plan = None;
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.records.len()
    }

    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    /// Build the execution plan and allocate the workspace
    pub fn prepare(&mut self) -> EngineResult<()> {
        if self.records.is_empty() {
            return Err(EngineError::InvalidArgument {
                what: "scheduler has no layers".into(),
            });
        }

        let order = self.topo_sort()?;
        let mut policy = self.config.policy;
        let mut plan = self.place_and_estimate(&order, policy);

        if let Some(budget) = self.config.memory_budget {
            if plan.estimated_peak > budget && policy != CheckpointPolicy::AllEligible {
                // One escalation retry, then give up
                policy = CheckpointPolicy::AllEligible;
                plan = self.place_and_estimate(&order, policy);
            }
            if plan.estimated_peak > budget {
                return Err(EngineError::BudgetExceeded {
                    required: plan.estimated_peak,
                    budget,
                });
            }
        }

        // Two alternating halves in one allocation
        let half = self.config.workspace_size;
        let mut workspace = Vec::new();
        workspace
            .try_reserve_exact(half * 2)
            .map_err(|_| EngineError::OutOfMemory {
                requested: half * 2 * std::mem::size_of::<f32>(),
            })?;
        workspace.resize(half * 2, 0.0);

        self.stats.peak_bytes = self.stats.peak_bytes.max(plan.estimated_peak);
        self.stats.total_allocated += workspace.len() * std::mem::size_of::<f32>();
        self.stats
            .layer_exec_counts
            .resize(self.records.len(), 0);
        self.workspace = workspace;
        self.workspace_half = half;

        tracing::debug!(
            layers = self.records.len(),
            peak = plan.estimated_peak,
            policy = ?policy,
            "execution plan prepared"
        );
        self.plan = Some(plan);
        Ok(())
    }

    /// Topological sort via DFS coloring
    fn topo_sort(&self) -> EngineResult<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Unvisited,
            Visiting,
            Visited,
        }

        let n = self.records.len();
        let mut color = vec![Color::Unvisited; n];
        let mut postorder = Vec::with_capacity(n);
        // Iterative DFS; (node, next child index) frames
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if color[root] != Color::Unvisited {
                continue;
            }
            color[root] = Color::Visiting;
            stack.push((root, 0));

            while let Some(&mut (node, ref mut child_idx)) = stack.last_mut() {
                let children = &self.dependents_of[node];
                if *child_idx < children.len() {
                    let child = children[*child_idx];
                    *child_idx += 1;
                    match color[child] {
                        Color::Visiting => {
                            return Err(EngineError::CycleDetected { layer: child });
                        }
                        Color::Unvisited => {
                            color[child] = Color::Visiting;
                            stack.push((child, 0));
                        }
                        Color::Visited => {}
                    }
                } else {
                    color[node] = Color::Visited;
                    postorder.push(node);
                    stack.pop();
                }
            }
        }

        postorder.reverse();
        Ok(postorder)
    }

    /// Apply a checkpoint policy and estimate peak memory for `order`
    fn place_and_estimate(&self, order: &[usize], policy: CheckpointPolicy) -> ExecutionPlan {
        let n = self.records.len();
        let mut should_checkpoint = vec![false; n];
        let mut recompute = vec![false; n];

        for &id in order {
            let desc = &self.records[id].desc;
            if !desc.checkpoint_eligible {
                continue;
            }
            let out_bytes = desc.output_size * std::mem::size_of::<f32>();
            should_checkpoint[id] = match policy {
                CheckpointPolicy::None => false,
                CheckpointPolicy::AllEligible => true,
                CheckpointPolicy::Selective => {
                    self.dependents_of[id].len() > 1
                        || (self.config.memory_min && out_bytes > SELECTIVE_SIZE_THRESHOLD)
                }
            };
        }

        // Availability: an output consumed later than the next record is
        // gone from the workspace by then. Checkpoint it, or mark it for
        // on-demand recomputation when that is possible and allowed.
        let position: Vec<usize> = {
            let mut pos = vec![0; n];
            for (i, &id) in order.iter().enumerate() {
                pos[id] = i;
            }
            pos
        };
        for &id in order {
            if should_checkpoint[id] {
                continue;
            }
            let needed_late = self.dependents_of[id]
                .iter()
                .any(|&d| position[d] > position[id] + 1);
            if needed_late {
                if self.config.allow_recompute && self.deps_of[id].is_empty() {
                    recompute[id] = true;
                } else {
                    should_checkpoint[id] = true;
                }
            }
        }

        // Simulate the order: outputs stay alive until their last consumer
        // has run; checkpoints cost ~1.1x the output size until reset.
        let last_consumer: Vec<Option<usize>> = (0..n)
            .map(|id| {
                self.dependents_of[id]
                    .iter()
                    .map(|&d| position[d])
                    .max()
            })
            .collect();

        let mut alive: usize = 0;
        let mut checkpoint_bytes: usize = 0;
        let mut peak: usize = 0;
        for (step, &id) in order.iter().enumerate() {
            let desc = &self.records[id].desc;
            let out_bytes = desc.output_size * std::mem::size_of::<f32>();
            let ws_bytes = desc.workspace_size * std::mem::size_of::<f32>();

            alive += out_bytes;
            if should_checkpoint[id] {
                checkpoint_bytes += (out_bytes as f32 * CHECKPOINT_OVERHEAD) as usize;
            }
            peak = peak.max(alive + ws_bytes + checkpoint_bytes);

            // Release outputs whose last consumer has now run
            for &other in order.iter().take(step + 1) {
                if last_consumer[other] == Some(step) {
                    let released =
                        self.records[other].desc.output_size * std::mem::size_of::<f32>();
                    alive = alive.saturating_sub(released);
                }
            }
        }

        ExecutionPlan {
            order: order.to_vec(),
            should_checkpoint,
            recompute_on_demand: recompute,
            estimated_peak: peak,
        }
    }

    /// Execute the plan
    ///
    /// `input` feeds every layer without dependencies; `output` receives the
    /// final record's output.
    pub fn execute(&mut self, input: &[f32], output: &mut [f32]) -> EngineResult<()> {
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument {
                what: "execute before prepare".into(),
            })?;
        let started = Instant::now();

        let half = self.workspace_half;
        let records = &mut self.records;
        let checkpoints = &mut self.checkpoints;
        let deps_of = &self.deps_of;

        for (step, &id) in plan.order.iter().enumerate() {
            let is_final = step + 1 == plan.order.len();
            let prev_id = if step > 0 {
                Some(plan.order[step - 1])
            } else {
                None
            };
            let prev_len = prev_id.map(|p| records[p].desc.output_size).unwrap_or(0);

            let (lo, hi) = self.workspace.split_at_mut(half);
            let (cur_half, prev_half) = if step % 2 == 0 { (lo, hi) } else { (hi, lo) };

            // Recompute any dependency that was planned for on-demand
            // recomputation and has no live copy.
            let mut recomputed: Vec<(usize, Vec<f32>)> = Vec::new();
            for &src in &deps_of[id] {
                let live = checkpoints[src].as_ref().map_or(false, |c| c.active)
                    || prev_id == Some(src);
                if !live && plan.recompute_on_demand[src] {
                    let mut buf = vec![0.0f32; records[src].desc.output_size];
                    let caller: [&[f32]; 1] = [input];
                    (records[src].desc.forward)(&caller, &mut buf).map_err(|e| {
                        EngineError::LayerFailure {
                            layer: src,
                            name: records[src].desc.name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    self.stats.recompute_count += 1;
                    recomputed.push((src, buf));
                }
            }

            // Gather dependency outputs in edge order
            let mut inputs: Vec<&[f32]> = Vec::with_capacity(deps_of[id].len().max(1));
            if deps_of[id].is_empty() {
                inputs.push(input);
            } else {
                for &src in &deps_of[id] {
                    if let Some(cp) = checkpoints[src].as_ref().filter(|c| c.active) {
                        inputs.push(&cp.data);
                    } else if prev_id == Some(src) {
                        inputs.push(&prev_half[..prev_len]);
                    } else if let Some((_, buf)) =
                        recomputed.iter().find(|(s, _)| *s == src)
                    {
                        inputs.push(buf);
                    } else {
                        return Err(EngineError::LayerFailure {
                            layer: id,
                            name: records[id].desc.name.clone(),
                            reason: format!("output of layer {} unavailable", src),
                        });
                    }
                }
            }

            let out_len = records[id].desc.output_size;
            records[id].state = ExecState::Running;

            let status = if is_final {
                if output.len() != out_len {
                    return Err(EngineError::InvalidShape {
                        context: format!(
                            "final output buffer {} for layer producing {}",
                            output.len(),
                            out_len
                        ),
                    });
                }
                (records[id].desc.forward)(&inputs, output)
            } else {
                if out_len > half {
                    return Err(EngineError::WorkspaceTooSmall {
                        required: out_len * std::mem::size_of::<f32>(),
                        capacity: half * std::mem::size_of::<f32>(),
                    });
                }
                (records[id].desc.forward)(&inputs, &mut cur_half[..out_len])
            };
            status.map_err(|e| EngineError::LayerFailure {
                layer: id,
                name: records[id].desc.name.clone(),
                reason: e.to_string(),
            })?;

            records[id].state = ExecState::Completed;
            self.stats.layer_exec_counts[id] += 1;

            // Retain an owned copy before the workspace half is reused
            if plan.should_checkpoint[id] {
                let data = if is_final {
                    output.to_vec()
                } else {
                    cur_half[..out_len].to_vec()
                };
                self.stats.total_allocated += data.len() * std::mem::size_of::<f32>();
                self.stats.checkpoint_count += 1;
                checkpoints[id] = Some(Checkpoint {
                    layer_id: id,
                    data,
                    active: true,
                });
            }
        }

        self.stats.elapsed_ns += started.elapsed().as_nanos() as u64;
        Ok(())
    }

    /// Clear execution state, checkpoints, and statistics
    pub fn reset(&mut self) {
        for rec in &mut self.records {
            rec.state = ExecState::Pending;
        }
        for cp in &mut self.checkpoints {
            *cp = None;
        }
        let n = self.records.len();
        self.stats = SchedulerStats {
            layer_exec_counts: vec![0; n],
            ..SchedulerStats::default()
        };
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
