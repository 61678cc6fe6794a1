//! # Baseline Store
//!
//! ## Responsibility
//! Versioned history of the active [`ThresholdConfig`]. Every adoption or
//! rollback appends a new version; nothing is ever edited in place.
//!
//! ## Guarantees
//! - Append-only: versions are strictly increasing and never removed
//! - Validated: only configs that pass [`ThresholdConfig::validate`] are stored
//! - Deterministic diffs: same two versions always give the same diff
//!
//! ## NOT Responsible For
//! - Deciding what to publish (see [`super::gate`])
//! - Writing itself to disk (the gate's ledger carries the version history)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::field::threshold::ParameterError;
use crate::field::{ParameterDelta, ThresholdConfig};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by the baseline store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BaselineError {
    /// The requested version does not exist.
    #[error("baseline version {0} not found")]
    VersionNotFound(u64),

    /// The config failed validation.
    #[error("invalid baseline config: {0}")]
    InvalidConfig(#[from] ParameterError),

    /// A restored history is empty or its versions do not strictly increase.
    #[error("invalid baseline history: {0}")]
    InvalidHistory(String),
}

// ---------------------------------------------------------------------------
// BaselineVersion
// ---------------------------------------------------------------------------

/// What produced a baseline version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BaselineSource {
    /// The config the controller started with.
    Initial,
    /// Taken over from a production checkpoint when no ledger was available.
    Resumed,
    /// Auto-adopted from an experiment.
    Adoption {
        /// The winning experiment.
        experiment_id: Uuid,
    },
    /// Adopted after an operator approved a deferred change.
    OperatorApproval {
        /// The approved experiment.
        experiment_id: Uuid,
        /// Who approved.
        approver: String,
    },
    /// Restored an earlier version after a regression.
    Rollback {
        /// The version that regressed.
        from_version: u64,
        /// The version whose config was restored.
        to_version: u64,
    },
}

/// An immutable, versioned threshold config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineVersion {
    /// Monotonically increasing version number, starting at 1.
    pub version: u64,
    /// The config.
    pub config: ThresholdConfig,
    /// What produced this version.
    pub source: BaselineSource,
    /// When it was stored.
    pub created_at: DateTime<Utc>,
    /// Human-readable note.
    pub description: String,
}

/// Parameter-level difference between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineDiff {
    /// Older side.
    pub from_version: u64,
    /// Newer side.
    pub to_version: u64,
    /// Relative change of each parameter that differs.
    pub changes: Vec<ParameterDelta>,
}

// ---------------------------------------------------------------------------
// BaselineStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoreInner {
    versions: Vec<BaselineVersion>,
}

/// Shared handle to the version history.
///
/// Cloning shares the same history. Only the adoption gate should call
/// [`BaselineStore::publish`].
#[derive(Debug, Clone)]
pub struct BaselineStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl BaselineStore {
    /// Create a store whose version 1 is `initial`.
    ///
    /// # Errors
    /// [`BaselineError::InvalidConfig`] if `initial` fails validation.
    pub fn new(initial: ThresholdConfig) -> Result<Self, BaselineError> {
        initial.validate()?;
        let first = BaselineVersion {
            version: 1,
            config: initial,
            source: BaselineSource::Initial,
            created_at: Utc::now(),
            description: "initial baseline".to_owned(),
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                versions: vec![first],
            })),
        })
    }

    /// Create a store whose first entry is `config` at `version`, continuing
    /// the numbering of a checkpointed controller.
    ///
    /// # Errors
    /// [`BaselineError::InvalidConfig`] if `config` fails validation,
    /// [`BaselineError::InvalidHistory`] if `version` is zero.
    pub fn resumed(version: u64, config: ThresholdConfig) -> Result<Self, BaselineError> {
        if version == 0 {
            return Err(BaselineError::InvalidHistory("version numbering starts at 1".to_owned()));
        }
        config.validate()?;
        Self::from_versions(vec![BaselineVersion {
            version,
            config,
            source: BaselineSource::Resumed,
            created_at: Utc::now(),
            description: format!("resumed from checkpoint at v{version}"),
        }])
    }

    /// Rebuild a store from a persisted history, oldest first.
    ///
    /// # Errors
    /// [`BaselineError::InvalidHistory`] if `versions` is empty or not
    /// strictly increasing, [`BaselineError::InvalidConfig`] if any entry
    /// fails validation.
    pub fn from_versions(versions: Vec<BaselineVersion>) -> Result<Self, BaselineError> {
        if versions.is_empty() {
            return Err(BaselineError::InvalidHistory("no versions".to_owned()));
        }
        if versions.windows(2).any(|w| w[1].version <= w[0].version) {
            return Err(BaselineError::InvalidHistory("versions must strictly increase".to_owned()));
        }
        for v in &versions {
            v.config.validate()?;
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner { versions })),
        })
    }

    /// The active (latest) version.
    pub fn current(&self) -> BaselineVersion {
        let inner = self.inner.lock();
        // The store is created with one version and never shrinks.
        inner.versions[inner.versions.len() - 1].clone()
    }

    /// Look up any historical version.
    ///
    /// # Errors
    /// [`BaselineError::VersionNotFound`] for unknown versions.
    pub fn get(&self, version: u64) -> Result<BaselineVersion, BaselineError> {
        self.inner
            .lock()
            .versions
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or(BaselineError::VersionNotFound(version))
    }

    /// Every version, oldest first.
    pub fn history(&self) -> Vec<BaselineVersion> {
        self.inner.lock().versions.clone()
    }

    /// Append a new version.
    ///
    /// # Errors
    /// [`BaselineError::InvalidConfig`] if `config` fails validation.
    pub fn publish(
        &self,
        config: ThresholdConfig,
        source: BaselineSource,
        description: impl Into<String>,
    ) -> Result<BaselineVersion, BaselineError> {
        config.validate()?;
        let mut inner = self.inner.lock();
        let version = inner.versions.last().map_or(1, |v| v.version + 1);
        let entry = BaselineVersion {
            version,
            config,
            source,
            created_at: Utc::now(),
            description: description.into(),
        };
        inner.versions.push(entry.clone());
        Ok(entry)
    }

    /// Compute the parameter diff between two versions.
    ///
    /// # Errors
    /// [`BaselineError::VersionNotFound`] if either version is unknown.
    pub fn diff(&self, from: u64, to: u64) -> Result<BaselineDiff, BaselineError> {
        let a = self.get(from)?;
        let b = self.get(to)?;
        Ok(BaselineDiff {
            from_version: from,
            to_version: to,
            changes: b.config.diff_from(&a.config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Parameter;

    #[test]
    fn test_new_store_starts_at_version_one() {
        let store = BaselineStore::new(ThresholdConfig::default()).unwrap();
        let current = store.current();
        assert_eq!(current.version, 1);
        assert_eq!(current.source, BaselineSource::Initial);
    }

    #[test]
    fn test_publish_increments_version_and_keeps_history() {
        let store = BaselineStore::new(ThresholdConfig::default()).unwrap();
        let next = ThresholdConfig::default()
            .with_deltas(&[ParameterDelta::new(Parameter::ThetaErrorHot, 0.1)])
            .unwrap();
        let v2 = store
            .publish(
                next,
                BaselineSource::Adoption {
                    experiment_id: Uuid::new_v4(),
                },
                "raise theta_e",
            )
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(store.history().len(), 2);
        assert_eq!(store.get(1).unwrap().config, ThresholdConfig::default());
    }

    #[test]
    fn test_publish_rejects_invalid_config() {
        let store = BaselineStore::new(ThresholdConfig::default()).unwrap();
        let bad = ThresholdConfig {
            theta_e_hot: -1.0,
            ..ThresholdConfig::default()
        };
        assert!(matches!(
            store.publish(bad, BaselineSource::Initial, "bad"),
            Err(BaselineError::InvalidConfig(_))
        ));
        assert_eq!(store.current().version, 1);
    }

    #[test]
    fn test_diff_between_versions() {
        let store = BaselineStore::new(ThresholdConfig::default()).unwrap();
        let next = ThresholdConfig::default()
            .with_deltas(&[ParameterDelta::new(Parameter::DecayError, -0.2)])
            .unwrap();
        store
            .publish(
                next,
                BaselineSource::Adoption {
                    experiment_id: Uuid::new_v4(),
                },
                "faster",
            )
            .unwrap();
        let diff = store.diff(1, 2).unwrap();
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].parameter, Parameter::DecayError);
        assert!(matches!(store.diff(1, 9), Err(BaselineError::VersionNotFound(9))));
    }

    #[test]
    fn test_resumed_store_continues_numbering() {
        let cfg = ThresholdConfig::default()
            .with_deltas(&[ParameterDelta::new(Parameter::ThetaErrorHot, 0.1)])
            .unwrap();
        let store = BaselineStore::resumed(4, cfg.clone()).unwrap();
        assert_eq!(store.current().version, 4);
        assert_eq!(store.current().source, BaselineSource::Resumed);
        let next = store
            .publish(cfg, BaselineSource::Initial, "after restart")
            .unwrap();
        assert_eq!(next.version, 5);
        assert!(matches!(
            BaselineStore::resumed(0, ThresholdConfig::default()),
            Err(BaselineError::InvalidHistory(_))
        ));
    }

    #[test]
    fn test_from_versions_rejects_bad_history() {
        let store = BaselineStore::new(ThresholdConfig::default()).unwrap();
        store
            .publish(ThresholdConfig::default(), BaselineSource::Initial, "again")
            .unwrap();
        let history = store.history();
        let restored = BaselineStore::from_versions(history.clone()).unwrap();
        assert_eq!(restored.current().version, 2);

        let mut reversed = history;
        reversed.reverse();
        assert!(matches!(
            BaselineStore::from_versions(reversed),
            Err(BaselineError::InvalidHistory(_))
        ));
        assert!(matches!(
            BaselineStore::from_versions(Vec::new()),
            Err(BaselineError::InvalidHistory(_))
        ));
    }

    #[test]
    fn test_clone_shares_history() {
        let a = BaselineStore::new(ThresholdConfig::default()).unwrap();
        let b = a.clone();
        a.publish(
            ThresholdConfig::default(),
            BaselineSource::Rollback {
                from_version: 1,
                to_version: 1,
            },
            "noop",
        )
        .unwrap();
        assert_eq!(b.current().version, 2);
    }
}
