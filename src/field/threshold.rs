//! # Threshold & Quorum Engine
//!
//! ## Responsibility
//! Compare a [`FieldState`] against a [`ThresholdConfig`] and combine the
//! resulting crossing flags into one weighted "act" decision.
//!
//! ## Guarantees
//! - Pure: [`evaluate`] is a function of its two arguments only, so the
//!   production loop and every experiment instance get identical answers
//! - Immutable config: a [`ThresholdConfig`] is never edited in place;
//!   [`ThresholdConfig::with_deltas`] returns a new, validated value
//!
//! ## NOT Responsible For
//! - Choosing which agent acts (see `agents`)
//! - Versioning configs (see `self_tune::baseline`)

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{FieldState, Signal, SignalTriple};

/// Tolerance for the quorum weights summing to one.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A threshold config or parameter change that falls outside its valid range.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParameterError {
    /// A tunable parameter left its hard-coded valid range.
    #[error("parameter '{parameter}' value {value} outside valid range [{min}, {max}]")]
    OutOfRange {
        /// The offending parameter.
        parameter: Parameter,
        /// The value it would take.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// The quorum weights do not sum to one, or one of them is negative.
    #[error("quorum weights must be non-negative and sum to 1.0, got sum {0}")]
    InvalidWeights(f64),

    /// A value is NaN or infinite.
    #[error("parameter '{0}' is not a finite number")]
    NonFinite(Parameter),
}

// ─── Parameter ───────────────────────────────────────────────────────────────

/// One tunable scalar inside a [`ThresholdConfig`].
///
/// Quorum weights are deliberately absent: they are constrained to sum to
/// one and are tuned by operators, not by the experimentation harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// `theta_E_hot`.
    ThetaErrorHot,
    /// `theta_L_hot`.
    ThetaLatencyHot,
    /// `theta_S_high`.
    ThetaSpareHigh,
    /// `k_inject_E`.
    InjectError,
    /// `k_inject_L`.
    InjectLatency,
    /// `k_inject_S`.
    InjectSpare,
    /// `lambda_E`.
    DecayError,
    /// `lambda_L`.
    DecayLatency,
    /// `lambda_S`.
    DecaySpare,
    /// `quorum_approval_threshold`.
    QuorumThreshold,
}

impl Parameter {
    /// Every tunable parameter in declaration order.
    pub fn all() -> &'static [Parameter] {
        &[
            Parameter::ThetaErrorHot,
            Parameter::ThetaLatencyHot,
            Parameter::ThetaSpareHigh,
            Parameter::InjectError,
            Parameter::InjectLatency,
            Parameter::InjectSpare,
            Parameter::DecayError,
            Parameter::DecayLatency,
            Parameter::DecaySpare,
            Parameter::QuorumThreshold,
        ]
    }

    /// Canonical snake_case name.
    pub fn name(self) -> &'static str {
        match self {
            Parameter::ThetaErrorHot => "theta_e_hot",
            Parameter::ThetaLatencyHot => "theta_l_hot",
            Parameter::ThetaSpareHigh => "theta_s_high",
            Parameter::InjectError => "k_inject_e",
            Parameter::InjectLatency => "k_inject_l",
            Parameter::InjectSpare => "k_inject_s",
            Parameter::DecayError => "lambda_e",
            Parameter::DecayLatency => "lambda_l",
            Parameter::DecaySpare => "lambda_s",
            Parameter::QuorumThreshold => "quorum_approval_threshold",
        }
    }

    /// Hard-coded inclusive valid range `(min, max)`.
    pub fn valid_range(self) -> (f64, f64) {
        match self {
            Parameter::ThetaErrorHot | Parameter::ThetaLatencyHot | Parameter::ThetaSpareHigh => {
                (0.01, 2.0)
            }
            Parameter::InjectError | Parameter::InjectLatency | Parameter::InjectSpare => {
                (0.01, 1.0)
            }
            Parameter::DecayError | Parameter::DecayLatency | Parameter::DecaySpare => (0.01, 2.0),
            Parameter::QuorumThreshold => (0.05, 1.0),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A relative change to one parameter: `new = old * (1 + relative)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterDelta {
    /// Which parameter moves.
    pub parameter: Parameter,
    /// Signed relative change, e.g. `0.1` for +10%.
    pub relative: f64,
}

impl ParameterDelta {
    /// Build a delta.
    pub fn new(parameter: Parameter, relative: f64) -> Self {
        Self {
            parameter,
            relative,
        }
    }

    /// `+1` for an increase, `-1` for a decrease, `0` for no change.
    pub fn direction(&self) -> i8 {
        if self.relative > 0.0 {
            1
        } else if self.relative < 0.0 {
            -1
        } else {
            0
        }
    }

    /// The delta that undoes this one exactly.
    pub fn inverse(&self) -> ParameterDelta {
        let denom = 1.0 + self.relative;
        let relative = if denom.abs() < f64::EPSILON {
            0.0
        } else {
            1.0 / denom - 1.0
        };
        ParameterDelta::new(self.parameter, relative)
    }
}

// ─── ThresholdConfig ─────────────────────────────────────────────────────────

/// Every tunable knob of the signal processor and quorum engine.
///
/// This is exactly the object the experimentation harness varies between
/// control and candidate arms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ThresholdConfig {
    /// `E` above this is "hot".
    pub theta_e_hot: f64,
    /// `L` above this is "hot".
    pub theta_l_hot: f64,
    /// `S` above this is "high".
    pub theta_s_high: f64,
    /// Per-channel injection gain `k_inject`.
    pub injection_gains: SignalTriple,
    /// Per-channel exponential decay rate `lambda` (per tick).
    pub decay_rates: SignalTriple,
    /// Per-channel quorum vote weight; sums to one.
    pub quorum_weights: SignalTriple,
    /// Quorum at or above which the engine approves action.
    pub quorum_approval_threshold: f64,
}

impl Default for ThresholdConfig {
    /// Gains satisfy `k = e^lambda - 1`, so a constant normalized input `x`
    /// settles the field at roughly `x`.
    fn default() -> Self {
        Self {
            theta_e_hot: 0.3,
            theta_l_hot: 0.6,
            theta_s_high: 0.6,
            injection_gains: SignalTriple::splat(0.22),
            decay_rates: SignalTriple::splat(0.2),
            quorum_weights: SignalTriple::new(0.4, 0.4, 0.2),
            quorum_approval_threshold: 0.4,
        }
    }
}

impl ThresholdConfig {
    /// Crossing threshold for `signal`.
    pub fn threshold(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Error => self.theta_e_hot,
            Signal::Latency => self.theta_l_hot,
            Signal::Spare => self.theta_s_high,
        }
    }

    /// Current value of a tunable parameter.
    pub fn get(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::ThetaErrorHot => self.theta_e_hot,
            Parameter::ThetaLatencyHot => self.theta_l_hot,
            Parameter::ThetaSpareHigh => self.theta_s_high,
            Parameter::InjectError => self.injection_gains.error,
            Parameter::InjectLatency => self.injection_gains.latency,
            Parameter::InjectSpare => self.injection_gains.spare,
            Parameter::DecayError => self.decay_rates.error,
            Parameter::DecayLatency => self.decay_rates.latency,
            Parameter::DecaySpare => self.decay_rates.spare,
            Parameter::QuorumThreshold => self.quorum_approval_threshold,
        }
    }

    fn slot(&mut self, parameter: Parameter) -> &mut f64 {
        match parameter {
            Parameter::ThetaErrorHot => &mut self.theta_e_hot,
            Parameter::ThetaLatencyHot => &mut self.theta_l_hot,
            Parameter::ThetaSpareHigh => &mut self.theta_s_high,
            Parameter::InjectError => &mut self.injection_gains.error,
            Parameter::InjectLatency => &mut self.injection_gains.latency,
            Parameter::InjectSpare => &mut self.injection_gains.spare,
            Parameter::DecayError => &mut self.decay_rates.error,
            Parameter::DecayLatency => &mut self.decay_rates.latency,
            Parameter::DecaySpare => &mut self.decay_rates.spare,
            Parameter::QuorumThreshold => &mut self.quorum_approval_threshold,
        }
    }

    /// Return a new config with `deltas` applied in order, validated.
    ///
    /// # Errors
    /// Returns the first [`ParameterError`] the resulting config violates.
    pub fn with_deltas(&self, deltas: &[ParameterDelta]) -> Result<ThresholdConfig, ParameterError> {
        let mut next = self.clone();
        for delta in deltas {
            let slot = next.slot(delta.parameter);
            *slot *= 1.0 + delta.relative;
        }
        next.validate()?;
        Ok(next)
    }

    /// Check every parameter against its valid range and the weights against
    /// the sum-to-one rule.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ParameterError> {
        for &parameter in Parameter::all() {
            let value = self.get(parameter);
            if !value.is_finite() {
                return Err(ParameterError::NonFinite(parameter));
            }
            let (min, max) = parameter.valid_range();
            if value < min || value > max {
                return Err(ParameterError::OutOfRange {
                    parameter,
                    value,
                    min,
                    max,
                });
            }
        }
        let w = self.quorum_weights;
        let sum = w.sum();
        if w.error < 0.0
            || w.latency < 0.0
            || w.spare < 0.0
            || !sum.is_finite()
            || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(ParameterError::InvalidWeights(sum));
        }
        Ok(())
    }

    /// Relative difference of every parameter that differs from `base`.
    pub fn diff_from(&self, base: &ThresholdConfig) -> Vec<ParameterDelta> {
        Parameter::all()
            .iter()
            .filter_map(|&p| {
                let old = base.get(p);
                let new = self.get(p);
                if (new - old).abs() <= f64::EPSILON || old == 0.0 {
                    None
                } else {
                    Some(ParameterDelta::new(p, new / old - 1.0))
                }
            })
            .collect()
    }
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Which fields are past their thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Crossings {
    /// `E > theta_E_hot`.
    pub error_hot: bool,
    /// `L > theta_L_hot`.
    pub latency_hot: bool,
    /// `S > theta_S_high`.
    pub spare_high: bool,
}

impl Crossings {
    fn flag(&self, signal: Signal) -> bool {
        match signal {
            Signal::Error => self.error_hot,
            Signal::Latency => self.latency_hot,
            Signal::Spare => self.spare_high,
        }
    }
}

/// Output of [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Evaluation {
    /// Per-field crossing flags.
    pub crossings: Crossings,
    /// Weighted vote in `[0, 1]`.
    pub quorum: f64,
    /// `quorum >= quorum_approval_threshold`.
    pub approved: bool,
}

/// Evaluate thresholds and quorum for one tick.
///
/// # Panics
/// This function never panics.
pub fn evaluate(field: &FieldState, config: &ThresholdConfig) -> Evaluation {
    let crossings = Crossings {
        error_hot: field.error > config.theta_e_hot,
        latency_hot: field.latency > config.theta_l_hot,
        spare_high: field.spare > config.theta_s_high,
    };
    let quorum: f64 = Signal::ALL
        .iter()
        .filter(|&&s| crossings.flag(s))
        .map(|&s| config.quorum_weights.get(s))
        .sum();
    Evaluation {
        crossings,
        quorum,
        approved: quorum >= config.quorum_approval_threshold,
    }
}
