//! # Operational Layer
//!
//! The production side of the controller: one [`engine::ControlEngine`]
//! driven on a fixed interval by [`runtime::ControlLoop`], fed through
//! [`telemetry::TelemetryFeed`], persisted by [`checkpoint`], and measured by
//! [`window`] so the research layer can learn from it.

pub mod checkpoint;
pub mod engine;
pub mod runtime;
pub mod telemetry;
pub mod window;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointWriter};
pub use engine::{ControlEngine, TickOutcome};
pub use runtime::{ControlLoop, ControlPorts, LiveView, RuntimeConfig};
pub use telemetry::{TelemetryFeed, TelemetrySender};
pub use window::{ProductionWindow, WindowAccumulator, WindowSettings};
