//! Domain library for trial storage.
//!
//! Holds the study/trial domain types, the storage ports (traits) every
//! backend implements, and the error definitions. Keep adapters and IO
//! concerns out of this crate, except for the in-memory adapter used by
//! tests and demos.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use distribution::Distribution;

/// Free-form attribute map attached to studies and trials.
pub type Attrs = BTreeMap<String, serde_json::Value>;

/// Identifier of a study within one storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StudyId(pub i64);

/// Identifier of a trial, unique across all studies of one storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialId(pub i64);

impl Display for StudyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for TrialId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimization direction of one objective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudyDirection {
    Minimize,
    Maximize,
}

impl StudyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyDirection::Minimize => "MINIMIZE",
            StudyDirection::Maximize => "MAXIMIZE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MINIMIZE" => Some(StudyDirection::Minimize),
            "MAXIMIZE" => Some(StudyDirection::Maximize),
            _ => None,
        }
    }

    /// Whether `a` is strictly better than `b` under this direction.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        match self {
            StudyDirection::Minimize => a < b,
            StudyDirection::Maximize => a > b,
        }
    }
}

/// Lifecycle state of a trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialState {
    Running,
    Waiting,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::Running => "RUNNING",
            TrialState::Waiting => "WAITING",
            TrialState::Complete => "COMPLETE",
            TrialState::Pruned => "PRUNED",
            TrialState::Fail => "FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Some(TrialState::Running),
            "WAITING" => Some(TrialState::Waiting),
            "COMPLETE" => Some(TrialState::Complete),
            "PRUNED" => Some(TrialState::Pruned),
            "FAIL" => Some(TrialState::Fail),
            _ => None,
        }
    }

    /// Finished trials are immutable.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TrialState::Complete | TrialState::Pruned | TrialState::Fail
        )
    }
}

/// Snapshot of a trial as stored.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenTrial {
    pub trial_id: TrialId,
    /// Sequential per study, starting at 0.
    pub number: u64,
    pub state: TrialState,
    pub values: Option<Vec<f64>>,
    pub datetime_start: Option<DateTime<Utc>>,
    pub datetime_complete: Option<DateTime<Utc>>,
    /// Parameter values in their internal (float) representation.
    pub params: BTreeMap<String, f64>,
    pub distributions: BTreeMap<String, Distribution>,
    pub user_attrs: Attrs,
    pub system_attrs: Attrs,
    pub intermediate_values: BTreeMap<u64, f64>,
}

impl FrozenTrial {
    /// A fresh running trial with nothing recorded yet.
    pub fn new(trial_id: TrialId, number: u64, datetime_start: DateTime<Utc>) -> Self {
        Self {
            trial_id,
            number,
            state: TrialState::Running,
            values: None,
            datetime_start: Some(datetime_start),
            datetime_complete: None,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            user_attrs: Attrs::new(),
            system_attrs: Attrs::new(),
            intermediate_values: BTreeMap::new(),
        }
    }

    /// Copy everything recorded in `template` onto a new id and number.
    pub fn from_template(trial_id: TrialId, number: u64, template: &FrozenTrial) -> Self {
        Self {
            trial_id,
            number,
            ..template.clone()
        }
    }

    /// The single objective value, if the trial has exactly one.
    pub fn value(&self) -> Option<f64> {
        match self.values.as_deref() {
            Some([v]) => Some(*v),
            _ => None,
        }
    }

    /// Parameters converted to their user-facing representation.
    pub fn external_params(&self) -> BTreeMap<String, serde_json::Value> {
        self.params
            .iter()
            .filter_map(|(name, internal)| {
                self.distributions
                    .get(name)
                    .map(|d| (name.clone(), d.to_external(*internal)))
            })
            .collect()
    }
}

/// Snapshot of a study as stored.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenStudy {
    pub study_id: StudyId,
    pub study_name: String,
    pub directions: Vec<StudyDirection>,
    pub user_attrs: Attrs,
    pub system_attrs: Attrs,
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Storage port for persisting and loading studies and trials.
///
/// Every backend (in-memory, relational, journal) implements this trait with
/// identical observable semantics.
pub trait StudyStorage: Send + Sync {
    /// Create a study. A missing name is replaced by a generated unique one.
    fn create_new_study(
        &self,
        directions: &[StudyDirection],
        study_name: Option<&str>,
    ) -> Result<StudyId, CoreError>;
    /// Delete a study together with all of its trials.
    fn delete_study(&self, study_id: StudyId) -> Result<(), CoreError>;
    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError>;
    fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError>;
    fn get_study_id_from_name(&self, study_name: &str) -> Result<StudyId, CoreError>;
    fn get_study_name_from_id(&self, study_id: StudyId) -> Result<String, CoreError>;
    fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError>;
    fn get_study_user_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError>;
    fn get_study_system_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError>;
    fn get_all_studies(&self) -> Result<Vec<FrozenStudy>, CoreError>;

    /// Create a trial, optionally copying state and records from `template`.
    fn create_new_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId, CoreError>;
    /// Record a parameter in its internal representation.
    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal_value: f64,
        distribution: &Distribution,
    ) -> Result<(), CoreError>;
    fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: u64,
    ) -> Result<TrialId, CoreError>;
    /// Update state and values. Returns `false` without changing anything when
    /// `Running` is requested for a trial that is not `Waiting`.
    fn set_trial_state_values(
        &self,
        trial_id: TrialId,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool, CoreError>;
    fn set_trial_intermediate_value(
        &self,
        trial_id: TrialId,
        step: u64,
        value: f64,
    ) -> Result<(), CoreError>;
    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError>;
    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError>;
    fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial, CoreError>;
    /// Trials of a study ordered by number, optionally filtered by state.
    fn get_all_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError>;

    fn get_trial_number_from_id(&self, trial_id: TrialId) -> Result<u64, CoreError> {
        Ok(self.get_trial(trial_id)?.number)
    }

    fn get_trial_params(&self, trial_id: TrialId) -> Result<BTreeMap<String, f64>, CoreError> {
        Ok(self.get_trial(trial_id)?.params)
    }

    fn get_trial_param(&self, trial_id: TrialId, name: &str) -> Result<f64, CoreError> {
        self.get_trial(trial_id)?
            .params
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("param {name} of trial {trial_id}")))
    }

    fn get_n_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<usize, CoreError> {
        Ok(self.get_all_trials(study_id, states)?.len())
    }

    /// Best complete trial of a single-objective study.
    fn get_best_trial(&self, study_id: StudyId) -> Result<FrozenTrial, CoreError> {
        let directions = self.get_study_directions(study_id)?;
        let [direction] = directions.as_slice() else {
            return Err(CoreError::InvalidArgument(
                "best trial is only defined for single-objective studies".into(),
            ));
        };
        let mut best: Option<FrozenTrial> = None;
        for trial in self.get_all_trials(study_id, Some(&[TrialState::Complete]))? {
            let Some(value) = trial.value() else { continue };
            match best.as_ref().and_then(FrozenTrial::value) {
                Some(current) if !direction.is_better(value, current) => {}
                _ => best = Some(trial),
            }
        }
        best.ok_or_else(|| CoreError::NotFound(format!("no complete trial in study {study_id}")))
    }
}

/// Storages that can track liveness of running trials.
pub trait HeartbeatStorage: StudyStorage {
    fn record_heartbeat(&self, trial_id: TrialId) -> Result<(), CoreError>;
    /// Running trials whose latest heartbeat is older than the grace period.
    fn get_stale_trial_ids(&self, study_id: StudyId) -> Result<Vec<TrialId>, CoreError>;
    /// Heartbeat interval in seconds, `None` when disabled.
    fn heartbeat_interval(&self) -> Option<u64>;

    fn is_heartbeat_enabled(&self) -> bool {
        self.heartbeat_interval().is_some()
    }
}

/// Core domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("study already exists: {0}")]
    DuplicatedStudy(String),
    #[error("cannot update finished trial: {0}")]
    UpdateFinishedTrial(String),
    #[error("incompatible distribution: {0}")]
    IncompatibleDistribution(String),
    #[error("repository error: {0}")]
    Repository(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub mod adapters;
pub mod distribution;
pub mod heartbeat;
pub mod validate;

#[cfg(test)]
mod tests {
    use super::*;

    fn trial_with_value(number: u64, value: f64) -> FrozenTrial {
        let mut t = FrozenTrial::new(TrialId(number as i64), number, Utc::now());
        t.state = TrialState::Complete;
        t.values = Some(vec![value]);
        t
    }

    #[test]
    fn trial_state_finished() {
        assert!(!TrialState::Running.is_finished());
        assert!(!TrialState::Waiting.is_finished());
        assert!(TrialState::Complete.is_finished());
        assert!(TrialState::Pruned.is_finished());
        assert!(TrialState::Fail.is_finished());
    }

    #[test]
    fn trial_state_parse_is_case_insensitive() {
        assert_eq!(TrialState::parse("complete"), Some(TrialState::Complete));
        assert_eq!(TrialState::parse("FAIL"), Some(TrialState::Fail));
        assert_eq!(TrialState::parse("done"), None);
    }

    #[test]
    fn direction_comparison() {
        assert!(StudyDirection::Minimize.is_better(1.0, 2.0));
        assert!(StudyDirection::Maximize.is_better(2.0, 1.0));
        assert!(!StudyDirection::Maximize.is_better(1.0, 1.0));
    }

    #[test]
    fn value_requires_single_objective() {
        let mut t = trial_with_value(0, 1.5);
        assert_eq!(t.value(), Some(1.5));
        t.values = Some(vec![1.0, 2.0]);
        assert_eq!(t.value(), None);
    }

    #[test]
    fn template_keeps_records_but_not_identity() {
        let mut template = trial_with_value(3, 0.25);
        template.user_attrs.insert("k".into(), serde_json::json!("v"));
        let copy = FrozenTrial::from_template(TrialId(9), 0, &template);
        assert_eq!(copy.trial_id, TrialId(9));
        assert_eq!(copy.number, 0);
        assert_eq!(copy.values, Some(vec![0.25]));
        assert_eq!(copy.user_attrs["k"], serde_json::json!("v"));
    }

    #[test]
    fn external_params_use_distribution() {
        let mut t = FrozenTrial::new(TrialId(0), 0, Utc::now());
        t.params.insert("opt".into(), 1.0);
        t.distributions.insert(
            "opt".into(),
            Distribution::categorical(vec![serde_json::json!("sgd"), serde_json::json!("adam")]),
        );
        assert_eq!(t.external_params()["opt"], serde_json::json!("adam"));
    }
}
