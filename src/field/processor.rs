//! # Signal Processor
//!
//! ## Responsibility
//! Advance the `{E, L, S}` fields of every component by one tick:
//! normalize, inject, diffuse across the topology, decay.
//!
//! ## Guarantees
//! - Single writer: the processor owns its fields; `tick` takes `&mut self`
//! - Non-negative: injection gains are non-negative, decay factors are in
//!   `(0, 1)`, and topologies are rejected when `D * max_degree > 1`
//! - Gap tolerant: components without a sample this tick inject nothing
//! - Duplicate tolerant: the latest reading per component wins
//!
//! ## NOT Responsible For
//! - Interpreting field magnitudes (see [`super::threshold`])

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{ComponentId, FieldState, Signal, SignalSample, SignalTriple, ThresholdConfig};

// ─── Normalization ───────────────────────────────────────────────────────────

/// Fixed scales that map raw telemetry onto `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Normalization {
    /// Error count that maps to `1.0`. Counts above it map above `1.0`.
    pub error_window_cap: f64,
    /// Latency (ms) that maps to `1.0`.
    pub latency_scale_ms: f64,
    /// Spare capacity that maps to `1.0`.
    pub capacity_scale: f64,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            error_window_cap: 50.0,
            latency_scale_ms: 1_000.0,
            capacity_scale: 1_000.0,
        }
    }
}

fn ratio(raw: f64, scale: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 || !scale.is_finite() || scale <= 0.0 {
        return 0.0;
    }
    raw / scale
}

impl Normalization {
    /// Normalize one sample. Latency and capacity clamp to `[0, 1]`; errors
    /// are only floored at zero so bursts can push `E` past 1.
    pub fn normalize(&self, sample: &SignalSample) -> SignalTriple {
        SignalTriple {
            error: ratio(sample.raw_error_count as f64, self.error_window_cap),
            latency: ratio(sample.raw_latency_ms, self.latency_scale_ms).min(1.0),
            spare: ratio(sample.raw_capacity_estimate, self.capacity_scale).min(1.0),
        }
    }
}

// ─── Topology ────────────────────────────────────────────────────────────────

/// Topology construction errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TopologyError {
    /// A topology needs at least one component.
    #[error("topology has no components")]
    Empty,

    /// The same component was listed twice.
    #[error("duplicate component '{0}'")]
    DuplicateComponent(ComponentId),

    /// An edge references a component that is not in the node list.
    #[error("edge references unknown component '{0}'")]
    UnknownComponent(ComponentId),

    /// Diffusion would be unstable: `D * max_degree` must be at most 1.
    #[error("diffusion coefficient {coefficient} with max degree {max_degree} is unstable")]
    UnstableDiffusion {
        /// The offending coefficient.
        coefficient: f64,
        /// The largest node degree in the graph.
        max_degree: usize,
    },
}

/// Components and their neighbor graph, plus per-channel diffusion rates.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<ComponentId>,
    index: HashMap<ComponentId, usize>,
    neighbors: Vec<Vec<usize>>,
    diffusion: SignalTriple,
}

impl Topology {
    /// A single isolated component. Diffusion is skipped.
    pub fn single(component: ComponentId) -> Self {
        let mut index = HashMap::new();
        index.insert(component.clone(), 0);
        Self {
            nodes: vec![component],
            index,
            neighbors: vec![Vec::new()],
            diffusion: SignalTriple::splat(0.0),
        }
    }

    /// Build an undirected graph from `nodes` and `edges`.
    ///
    /// # Errors
    /// See [`TopologyError`].
    pub fn new(
        nodes: Vec<ComponentId>,
        edges: &[(ComponentId, ComponentId)],
        diffusion: SignalTriple,
    ) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.clone(), i).is_some() {
                return Err(TopologyError::DuplicateComponent(node.clone()));
            }
        }
        let mut neighbors = vec![Vec::new(); nodes.len()];
        for (a, b) in edges {
            let ia = *index
                .get(a)
                .ok_or_else(|| TopologyError::UnknownComponent(a.clone()))?;
            let ib = *index
                .get(b)
                .ok_or_else(|| TopologyError::UnknownComponent(b.clone()))?;
            if ia == ib {
                continue;
            }
            if !neighbors[ia].contains(&ib) {
                neighbors[ia].push(ib);
                neighbors[ib].push(ia);
            }
        }
        let max_degree = neighbors.iter().map(Vec::len).max().unwrap_or(0);
        for signal in Signal::ALL {
            let d = diffusion.get(signal);
            if !d.is_finite() || d < 0.0 || d * max_degree as f64 > 1.0 {
                return Err(TopologyError::UnstableDiffusion {
                    coefficient: d,
                    max_degree,
                });
            }
        }
        Ok(Self {
            nodes,
            index,
            neighbors,
            diffusion,
        })
    }

    /// Components in insertion order.
    pub fn components(&self) -> &[ComponentId] {
        &self.nodes
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always `false`; construction rejects empty graphs.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn is_isolated(&self) -> bool {
        self.nodes.len() < 2 || self.neighbors.iter().all(Vec::is_empty)
    }
}

// ─── SignalProcessor ─────────────────────────────────────────────────────────

/// Owns the fields of one instance and advances them tick by tick.
#[derive(Debug, Clone)]
pub struct SignalProcessor {
    topology: Topology,
    normalization: Normalization,
    fields: Vec<FieldState>,
    dt: f64,
    ticks: u64,
    gaps_last_tick: usize,
}

impl SignalProcessor {
    /// Fresh processor with all fields at zero.
    pub fn new(topology: Topology, normalization: Normalization) -> Self {
        let n = topology.len();
        Self {
            topology,
            normalization,
            fields: vec![FieldState::default(); n],
            dt: 1.0,
            ticks: 0,
            gaps_last_tick: 0,
        }
    }

    /// Processor for one isolated component.
    pub fn single(component: ComponentId, normalization: Normalization) -> Self {
        Self::new(Topology::single(component), normalization)
    }

    /// Seed fields from a checkpoint. Components not present in `fields`
    /// start at zero; unknown ones are ignored.
    pub fn restore(&mut self, fields: &[(ComponentId, FieldState)], ticks: u64) {
        for (id, state) in fields {
            if let Some(&i) = self.topology.index.get(id) {
                self.fields[i] = *state;
            }
        }
        self.ticks = ticks;
    }

    /// Advance one tick and return the aggregate (component-wise max) field.
    ///
    /// # Panics
    /// This function never panics.
    pub fn tick(&mut self, raw_samples: &[SignalSample], config: &ThresholdConfig) -> FieldState {
        let n = self.fields.len();

        // Latest reading per component wins.
        let mut latest: Vec<Option<&SignalSample>> = vec![None; n];
        for sample in raw_samples {
            match self.topology.index.get(&sample.component_id) {
                Some(&i) => {
                    let newer = latest[i].map_or(true, |prev| sample.timestamp >= prev.timestamp);
                    if newer {
                        latest[i] = Some(sample);
                    }
                }
                None => debug!(
                    component = %sample.component_id,
                    "sample for unknown component ignored"
                ),
            }
        }
        self.gaps_last_tick = latest.iter().filter(|s| s.is_none()).count();

        // Inject.
        for (field, sample) in self.fields.iter_mut().zip(&latest) {
            if let Some(sample) = sample {
                let x = self.normalization.normalize(sample);
                for signal in Signal::ALL {
                    *field.get_mut(signal) += config.injection_gains.get(signal) * x.get(signal);
                }
            }
        }

        // Diffuse over the graph Laplacian, from a snapshot of post-injection values.
        if !self.topology.is_isolated() {
            let snapshot = self.fields.clone();
            for (i, field) in self.fields.iter_mut().enumerate() {
                for signal in Signal::ALL {
                    let own = snapshot[i].get(signal);
                    let laplacian: f64 = self.topology.neighbors[i]
                        .iter()
                        .map(|&j| snapshot[j].get(signal) - own)
                        .sum();
                    *field.get_mut(signal) += self.topology.diffusion.get(signal) * laplacian;
                }
            }
        }

        // Decay.
        for field in &mut self.fields {
            for signal in Signal::ALL {
                let v = field.get_mut(signal);
                *v *= (-config.decay_rates.get(signal) * self.dt).exp();
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
        }

        self.ticks += 1;
        self.field()
    }

    /// Aggregate field: component-wise maximum across components.
    pub fn field(&self) -> FieldState {
        self.fields
            .iter()
            .copied()
            .fold(FieldState::default(), FieldState::max)
    }

    /// Per-component fields in topology order.
    pub fn component_fields(&self) -> Vec<(ComponentId, FieldState)> {
        self.topology
            .nodes
            .iter()
            .cloned()
            .zip(self.fields.iter().copied())
            .collect()
    }

    /// Component with the largest value on `signal`. Ties go to the first
    /// component in topology order.
    pub fn hottest(&self, signal: Signal) -> &ComponentId {
        let mut best = 0;
        for (i, field) in self.fields.iter().enumerate() {
            if field.get(signal) > self.fields[best].get(signal) {
                best = i;
            }
        }
        &self.topology.nodes[best]
    }

    /// Ticks processed since creation (or since the restored checkpoint).
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Components that had no sample on the most recent tick.
    pub fn gaps_last_tick(&self) -> usize {
        self.gaps_last_tick
    }

    /// Normalization scales in use.
    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    /// The topology this processor runs over.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}
