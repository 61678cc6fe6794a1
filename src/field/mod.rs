//! # Field Model
//!
//! ## Responsibility
//! Turn raw per-component telemetry into three bounded scalar fields
//! (error pressure `E`, latency pressure `L`, spare capacity `S`) and decide,
//! from those fields alone, whether the service is under enough stress to act.
//!
//! ```text
//! SignalSample* ──► SignalProcessor::tick ──► FieldState ──► threshold::evaluate ──► Evaluation
//!                   (normalize, inject,                       (crossings, quorum,
//!                    diffuse, decay)                           approved)
//! ```
//!
//! ## Guarantees
//! - Non-negative: fields never go below zero for non-negative gains and decay
//! - Gap tolerant: a tick with no samples for a component decays without injecting
//! - Pure evaluation: [`threshold::evaluate`] has no hidden state
//!
//! ## NOT Responsible For
//! - Collecting telemetry (see `control::telemetry`)
//! - Acting on crossings (see `agents`)

pub mod processor;
pub mod threshold;

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use processor::{Normalization, SignalProcessor, Topology, TopologyError};
pub use threshold::{evaluate, Crossings, Evaluation, Parameter, ParameterDelta, ThresholdConfig};

// ─── ComponentId ─────────────────────────────────────────────────────────────

/// Identifier of a managed service component (a node in the field topology).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub String);

impl ComponentId {
    /// Create a new [`ComponentId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the component ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── SignalSample ────────────────────────────────────────────────────────────

/// One raw telemetry reading for one component.
///
/// Produced by an external collector (or the workload replayer), consumed
/// once by a [`SignalProcessor`] tick, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    /// Component this reading belongs to.
    pub component_id: ComponentId,
    /// Timestamp of the reading in seconds (wall clock or simulated).
    pub timestamp: u64,
    /// Errors observed since the previous reading.
    pub raw_error_count: u64,
    /// Observed request latency in milliseconds.
    pub raw_latency_ms: f64,
    /// Estimated spare capacity, in the unit of `Normalization::capacity_scale`.
    pub raw_capacity_estimate: f64,
}

// ─── Signal ──────────────────────────────────────────────────────────────────

/// The three field channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Error pressure (`E`).
    Error,
    /// Latency pressure (`L`).
    Latency,
    /// Spare capacity (`S`).
    Spare,
}

impl Signal {
    /// All channels in `E, L, S` order.
    pub const ALL: [Signal; 3] = [Signal::Error, Signal::Latency, Signal::Spare];

    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Error => "error",
            Signal::Latency => "latency",
            Signal::Spare => "spare",
        }
    }
}

/// One `f64` per field channel. Used for gains, decay rates, quorum weights
/// and diffusion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SignalTriple {
    /// Value for the error channel.
    pub error: f64,
    /// Value for the latency channel.
    pub latency: f64,
    /// Value for the spare-capacity channel.
    pub spare: f64,
}

impl SignalTriple {
    /// Build a triple from explicit per-channel values.
    pub const fn new(error: f64, latency: f64, spare: f64) -> Self {
        Self {
            error,
            latency,
            spare,
        }
    }

    /// Same value on every channel.
    pub const fn splat(v: f64) -> Self {
        Self::new(v, v, v)
    }

    /// Read the value for `signal`.
    pub fn get(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Error => self.error,
            Signal::Latency => self.latency,
            Signal::Spare => self.spare,
        }
    }

    /// Mutable access to the value for `signal`.
    pub fn get_mut(&mut self, signal: Signal) -> &mut f64 {
        match signal {
            Signal::Error => &mut self.error,
            Signal::Latency => &mut self.latency,
            Signal::Spare => &mut self.spare,
        }
    }

    /// Sum of the three values.
    pub fn sum(&self) -> f64 {
        self.error + self.latency + self.spare
    }
}

// ─── FieldState ──────────────────────────────────────────────────────────────

/// The smoothed `{E, L, S}` fields of one instance.
///
/// Owned by exactly one [`SignalProcessor`]; values are conceptually in
/// `[0, 1]` but may exceed 1 transiently under bursty errors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldState {
    /// Error pressure.
    pub error: f64,
    /// Latency pressure.
    pub latency: f64,
    /// Spare capacity.
    pub spare: f64,
}

impl FieldState {
    /// Build a field state from explicit values.
    pub const fn new(error: f64, latency: f64, spare: f64) -> Self {
        Self {
            error,
            latency,
            spare,
        }
    }

    /// Read the field for `signal`.
    pub fn get(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Error => self.error,
            Signal::Latency => self.latency,
            Signal::Spare => self.spare,
        }
    }

    /// Mutable access to the field for `signal`.
    pub fn get_mut(&mut self, signal: Signal) -> &mut f64 {
        match signal {
            Signal::Error => &mut self.error,
            Signal::Latency => &mut self.latency,
            Signal::Spare => &mut self.spare,
        }
    }

    /// `true` when every channel is a finite number.
    pub fn is_finite(&self) -> bool {
        self.error.is_finite() && self.latency.is_finite() && self.spare.is_finite()
    }

    /// Component-wise maximum of two states.
    pub fn max(self, other: FieldState) -> FieldState {
        FieldState {
            error: self.error.max(other.error),
            latency: self.latency.max(other.latency),
            spare: self.spare.max(other.spare),
        }
    }
}
