//! Research layer: replayed workloads, isolated experiment instances,
//! significance testing, and the gate that promotes winners to the
//! production baseline.

pub mod analyst;
pub mod baseline;
pub mod experiment;
pub mod gate;
pub mod hypothesis;
pub mod instance;
pub mod score;
pub mod wiring;
pub mod workload;

pub use analyst::{analyze, Analysis, AnalystConfig, Recommendation};
pub use baseline::{BaselineDiff, BaselineError, BaselineSource, BaselineStore, BaselineVersion};
pub use experiment::{
    ExperimentConfig, ExperimentError, ExperimentLogEntry, ExperimentOrchestrator, ExperimentResult,
    ExperimentStatus, OrchestratorSettings,
};
pub use gate::{AdoptionDecision, AdoptionGate, AdoptionRecord, GateConfig, GateError, GateLedger, OperatorAlert};
pub use hypothesis::{propose, ExperimentCandidate};
pub use score::{CompositeWeights, MetricVector, ProductionMetrics};
pub use wiring::{run_research_cycle, start_research_loop, ResearchConfig, ResearchHandles};
pub use workload::{Phase, Workload, WorkloadConfig, WorkloadReplayer};
