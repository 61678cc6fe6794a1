//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`ControllerConfig`], and run
//! validation before returning. This is the entry point for loading the
//! controller configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::ControllerConfig;

/// Load a [`ControllerConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(ControllerConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_field_controller::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("controller.toml"))?;
/// println!("tick interval: {}ms", config.runtime.tick_interval_ms);
/// ```
pub fn load_from_file(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`ControllerConfig`] from a TOML string.
///
/// `source_name` only appears in error messages.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<ControllerConfig, ConfigError> {
    let config: ControllerConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[signal.normalization]
latency_scale_ms = 800.0

[thresholds]
theta_e_hot = 0.35

[agents]
cooldown_ticks = 20

[experiment]
replicas_per_arm = 3
duration_ticks = 1800

[gate]
rollback_windows = 4

[runtime]
tick_interval_ms = 500

[observability]
log_format = "json"
"#;

    #[test]
    fn test_load_from_str_valid() {
        let cfg = load_from_str(VALID_TOML, "test.toml").unwrap();
        assert_eq!(cfg.signal.normalization.latency_scale_ms, 800.0);
        assert_eq!(cfg.thresholds.theta_e_hot, 0.35);
        assert_eq!(cfg.agents.cooldown_ticks, 20);
        assert_eq!(cfg.experiment.duration_ticks, 1_800);
        assert_eq!(cfg.gate.rollback_windows, 4);
        assert_eq!(cfg.runtime.tick_interval_ms, 500);
    }

    #[test]
    fn test_load_from_str_malformed_toml() {
        let err = load_from_str("[thresholds\ntheta_e_hot = ", "bad.toml").unwrap_err();
        match err {
            ConfigError::Parse { file, .. } => assert_eq!(file, "bad.toml"),
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_str_wrong_type() {
        let err = load_from_str("[runtime]\ntick_interval_ms = \"fast\"\n", "t.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_validation_failure_lists_every_field() {
        let err = load_from_str(
            "[experiment]\nreplicas_per_arm = 0\n[runtime]\ntick_interval_ms = 0\n",
            "t.toml",
        )
        .unwrap_err();
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("experiment.replicas_per_arm"));
                assert!(msg.contains("runtime.tick_interval_ms"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID_TOML.as_bytes()).unwrap();
        let cfg = load_from_file(file.path()).unwrap();
        assert_eq!(cfg.runtime.tick_interval_ms, 500);
    }

    #[test]
    fn test_load_from_file_missing() {
        let err = load_from_file(Path::new("/nonexistent/controller.toml")).unwrap_err();
        match err {
            ConfigError::Io { file, .. } => assert!(file.contains("controller.toml")),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_shipped_default_toml_loads() {
        let content = include_str!("default.toml");
        let cfg = load_from_str(content, "default.toml").unwrap();
        assert_eq!(cfg.thresholds, crate::field::ThresholdConfig::default());
    }
}
