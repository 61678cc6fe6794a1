//! # Controller Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that sets every tunable of the
//! controller: signal normalization and topology, the starting baseline
//! thresholds, agent tunables, experiment and analyst settings, the adoption
//! gate, and the cadence of the production and research loops.
//! ```text
//! field-controller --config controller.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `ControllerConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete defaults: an empty file is a valid configuration
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the engine or loops from config (that belongs to `main`)
//! - Changing thresholds at runtime (that belongs to the adoption gate)
//! - Metrics collection (that belongs to `metrics`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::agents::AgentConfig;
use crate::control::runtime::RuntimeConfig;
use crate::field::{ComponentId, Normalization, SignalTriple, ThresholdConfig, Topology, TopologyError};
use crate::self_tune::analyst::AnalystConfig;
use crate::self_tune::experiment::{ExperimentConfig, OrchestratorSettings};
use crate::self_tune::gate::GateConfig;
use crate::self_tune::wiring::ResearchConfig;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one controller process.
///
/// Deserialized from a TOML file and validated before use. Every section
/// is optional; missing sections take their defaults.
///
/// # Example
///
/// ```toml
/// [thresholds]
/// theta_l_hot = 0.55
///
/// [experiment]
/// replicas_per_arm = 5
/// duration_ticks = 3600
///
/// [runtime]
/// tick_interval_ms = 1000
/// checkpoint_path = "/var/lib/field-controller/checkpoint.json"
///
/// [observability]
/// log_format = "json"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ControllerConfig {
    /// Normalization scales and the component graph.
    pub signal: SignalConfig,
    /// Baseline version 1. Later versions come from adoptions.
    pub thresholds: ThresholdConfig,
    /// Agent tunables.
    pub agents: AgentConfig,
    /// Experiment runs, including the replayed workload.
    pub experiment: ExperimentConfig,
    /// Significance thresholds and composite weights.
    pub analyst: AnalystConfig,
    /// Adoption gate policy.
    pub gate: GateConfig,
    /// Production loop.
    pub runtime: RuntimeConfig,
    /// Research loop cadence.
    pub research: ResearchConfig,
    /// Logging and metrics exposition.
    pub observability: ObservabilityConfig,
}

impl ControllerConfig {
    /// Settings for an [`ExperimentOrchestrator`](crate::self_tune::ExperimentOrchestrator).
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            experiment: self.experiment.clone(),
            analyst: self.analyst.clone(),
            agents: self.agents.clone(),
            normalization: self.signal.normalization.clone(),
        }
    }
}

// ── Signal section ───────────────────────────────────────────────────────

/// An undirected neighbor relation between two components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EdgeConfig {
    /// One endpoint.
    pub from: String,
    /// The other endpoint.
    pub to: String,
}

/// How raw telemetry becomes a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SignalConfig {
    /// Scales mapping raw telemetry onto `[0, 1]`.
    pub normalization: Normalization,
    /// Per-channel diffusion coefficient. Zero disables diffusion.
    pub diffusion: SignalTriple,
    /// Neighbor graph. Components not named here are isolated.
    pub edges: Vec<EdgeConfig>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::default(),
            diffusion: SignalTriple::splat(0.0),
            edges: Vec::new(),
        }
    }
}

impl SignalConfig {
    /// Build the topology over `components` using the configured edges.
    ///
    /// # Errors
    /// See [`TopologyError`].
    pub fn topology(&self, components: &[ComponentId]) -> Result<Topology, TopologyError> {
        let edges: Vec<(ComponentId, ComponentId)> = self
            .edges
            .iter()
            .map(|e| (ComponentId::new(e.from.clone()), ComponentId::new(e.to.clone())))
            .collect();
        Topology::new(components.to_vec(), &edges, self.diffusion)
    }
}

// ── Observability section ────────────────────────────────────────────────

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging and metrics exposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// Log output format. `LOG_FORMAT` overrides it.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Print the Prometheus text exposition when the binary exits.
    #[serde(default = "default_true")]
    pub dump_metrics_on_exit: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            dump_metrics_on_exit: default_true(),
        }
    }
}

// ── Schema export ────────────────────────────────────────────────────────

/// Export the JSON Schema for [`ControllerConfig`].
///
/// # Errors
/// Returns `serde_json::Error` if serialization fails (should not happen).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(ControllerConfig);
    serde_json::to_string_pretty(&schema)
}
