//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`ControllerConfig`] that cannot
//! be expressed through the type system alone (range checks, weight sums,
//! cross-field invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::ControllerConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "gate.rollback_tolerance").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn positive(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !value.is_finite() || value <= 0.0 {
        errors.push(invalid(field, value, "must be a finite number > 0"));
    }
}

fn fraction(errors: &mut Vec<ConfigError>, field: &str, value: f64, open_upper: bool) {
    let upper_ok = if open_upper { value < 1.0 } else { value <= 1.0 };
    if !value.is_finite() || value < 0.0 || !upper_ok {
        let reason = if open_upper {
            "must be in [0, 1)"
        } else {
            "must be in [0, 1]"
        };
        errors.push(invalid(field, value, reason));
    }
}

fn nonzero(errors: &mut Vec<ConfigError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(invalid(field, value, "must be > 0"));
    }
}

/// Validate all semantic constraints on a [`ControllerConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &ControllerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Signal ───────────────────────────────────────────────────────
    let norm = &config.signal.normalization;
    positive(&mut errors, "signal.normalization.error_window_cap", norm.error_window_cap);
    positive(&mut errors, "signal.normalization.latency_scale_ms", norm.latency_scale_ms);
    positive(&mut errors, "signal.normalization.capacity_scale", norm.capacity_scale);
    for (name, d) in [
        ("signal.diffusion.error", config.signal.diffusion.error),
        ("signal.diffusion.latency", config.signal.diffusion.latency),
        ("signal.diffusion.spare", config.signal.diffusion.spare),
    ] {
        fraction(&mut errors, name, d, false);
    }

    // ── Thresholds ───────────────────────────────────────────────────
    if let Err(e) = config.thresholds.validate() {
        errors.push(invalid("thresholds", &e, "baseline thresholds out of range"));
    }

    // ── Agents ───────────────────────────────────────────────────────
    let agents = &config.agents;
    if agents.quality_floor == 0 {
        errors.push(invalid("agents.quality_floor", agents.quality_floor, "must be >= 1"));
    }
    if agents.quality_floor > agents.quality_ceiling {
        errors.push(invalid(
            "agents.quality_floor",
            agents.quality_floor,
            "must be <= agents.quality_ceiling",
        ));
    }
    nonzero(
        &mut errors,
        "agents.isolation_release_ticks",
        u64::from(agents.isolation_release_ticks),
    );

    // ── Experiment ───────────────────────────────────────────────────
    let exp = &config.experiment;
    nonzero(&mut errors, "experiment.replicas_per_arm", u64::from(exp.replicas_per_arm));
    nonzero(&mut errors, "experiment.duration_ticks", exp.duration_ticks);
    nonzero(&mut errors, "experiment.window_ticks", exp.window_ticks);
    nonzero(&mut errors, "experiment.thrash_window_ticks", exp.thrash_window_ticks);
    nonzero(
        &mut errors,
        "experiment.max_concurrent_experiments",
        exp.max_concurrent_experiments as u64,
    );
    fraction(&mut errors, "experiment.warmup_fraction", exp.warmup_fraction, true);
    positive(&mut errors, "experiment.response_target_ms", exp.response_target_ms);
    if exp.window_ticks > exp.duration_ticks {
        errors.push(invalid(
            "experiment.window_ticks",
            exp.window_ticks,
            "must be <= experiment.duration_ticks",
        ));
    }
    nonzero(&mut errors, "experiment.workload.components", exp.workload.components as u64);
    nonzero(&mut errors, "experiment.workload.steady_ticks", exp.workload.steady_ticks);
    fraction(&mut errors, "experiment.workload.noise", exp.workload.noise, true);

    // ── Analyst ──────────────────────────────────────────────────────
    let analyst = &config.analyst;
    if !(analyst.alpha > 0.0 && analyst.alpha < 1.0) {
        errors.push(invalid("analyst.alpha", analyst.alpha, "must be in (0, 1)"));
    }
    if !analyst.min_effect_size.is_finite() || analyst.min_effect_size < 0.0 {
        errors.push(invalid(
            "analyst.min_effect_size",
            analyst.min_effect_size,
            "must be a finite number >= 0",
        ));
    }
    fraction(&mut errors, "analyst.min_improvement", analyst.min_improvement, true);
    fraction(&mut errors, "analyst.critical_regression", analyst.critical_regression, true);
    if analyst.min_samples_per_arm < 2 {
        errors.push(invalid(
            "analyst.min_samples_per_arm",
            analyst.min_samples_per_arm,
            "must be >= 2 for a variance estimate",
        ));
    }
    if let Err(e) = analyst.weights.validate() {
        errors.push(invalid("analyst.weights", e.0, "must be non-negative and sum to 1.0"));
    }

    // ── Gate ─────────────────────────────────────────────────────────
    let gate = &config.gate;
    nonzero(&mut errors, "gate.anti_thrash_records", gate.anti_thrash_records as u64);
    fraction(&mut errors, "gate.max_auto_magnitude", gate.max_auto_magnitude, false);
    nonzero(&mut errors, "gate.rollback_windows", u64::from(gate.rollback_windows));
    fraction(&mut errors, "gate.rollback_tolerance", gate.rollback_tolerance, true);
    nonzero(&mut errors, "gate.probation_windows", u64::from(gate.probation_windows));

    // ── Runtime ──────────────────────────────────────────────────────
    let rt = &config.runtime;
    nonzero(&mut errors, "runtime.tick_interval_ms", rt.tick_interval_ms);
    nonzero(&mut errors, "runtime.telemetry_capacity", rt.telemetry_capacity as u64);
    nonzero(&mut errors, "runtime.action_capacity", rt.action_capacity as u64);
    nonzero(&mut errors, "runtime.window_capacity", rt.window_capacity as u64);
    nonzero(&mut errors, "runtime.window_ticks", rt.window_ticks);
    nonzero(&mut errors, "runtime.recent_windows", rt.recent_windows as u64);

    // ── Research ─────────────────────────────────────────────────────
    let research = &config.research;
    nonzero(&mut errors, "research.interval_ms", research.interval_ms);
    nonzero(&mut errors, "research.recent_windows", research.recent_windows as u64);
    if research.recent_windows != rt.recent_windows {
        errors.push(invalid(
            "research.recent_windows",
            research.recent_windows,
            "must equal runtime.recent_windows so research and the live view aggregate the same windows",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
