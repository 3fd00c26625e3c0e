//! In-memory view rebuilt by replaying journal records in log order.

use std::collections::{BTreeMap, HashMap};

use domain::validate::{
    ensure_unfinished, recorded_distribution, validate_directions, validate_intermediate_value,
    validate_param, validate_study_name, validate_values,
};
use domain::{Attrs, CoreError, FrozenStudy, FrozenTrial, StudyId, TrialId, TrialState};

use crate::operation::{JournalOperation, JournalRecord, JsonFloat};

/// Why a record could not be applied.
#[derive(Debug)]
pub(crate) enum Rejection {
    /// `Running` requested for a trial that is not `Waiting`.
    NotWaiting,
    Invalid(CoreError),
}

impl Rejection {
    pub(crate) fn into_error(self) -> CoreError {
        match self {
            Rejection::NotWaiting => {
                CoreError::InvalidArgument("only waiting trials can be set running".into())
            }
            Rejection::Invalid(err) => err,
        }
    }
}

impl From<CoreError> for Rejection {
    fn from(err: CoreError) -> Self {
        Rejection::Invalid(err)
    }
}

pub(crate) struct StudyRecord {
    pub study: FrozenStudy,
    /// Indexed by trial number.
    pub trials: Vec<FrozenTrial>,
}

#[derive(Default)]
pub(crate) struct JournalState {
    /// Number of log entries consumed so far, applied or skipped.
    pub log_number_read: usize,
    studies: BTreeMap<StudyId, StudyRecord>,
    trial_study: HashMap<TrialId, StudyId>,
    next_study_id: i64,
    next_trial_id: i64,
    last_created_trial: HashMap<String, TrialId>,
}

impl JournalState {
    pub fn study(&self, study_id: StudyId) -> Result<&StudyRecord, CoreError> {
        self.studies
            .get(&study_id)
            .ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))
    }

    fn study_mut(&mut self, study_id: StudyId) -> Result<&mut StudyRecord, CoreError> {
        self.studies
            .get_mut(&study_id)
            .ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))
    }

    pub fn studies(&self) -> impl Iterator<Item = &FrozenStudy> {
        self.studies.values().map(|s| &s.study)
    }

    pub fn study_id_by_name(&self, name: &str) -> Option<StudyId> {
        self.studies()
            .find(|s| s.study_name == name)
            .map(|s| s.study_id)
    }

    fn trial_location(&self, trial_id: TrialId) -> Result<StudyId, CoreError> {
        self.trial_study
            .get(&trial_id)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("trial {trial_id}")))
    }

    pub fn trial(&self, trial_id: TrialId) -> Result<&FrozenTrial, CoreError> {
        let study_id = self.trial_location(trial_id)?;
        self.study(study_id)?
            .trials
            .iter()
            .find(|t| t.trial_id == trial_id)
            .ok_or_else(|| CoreError::NotFound(format!("trial {trial_id}")))
    }

    fn trial_mut(&mut self, trial_id: TrialId) -> Result<&mut FrozenTrial, CoreError> {
        let study_id = self.trial_location(trial_id)?;
        self.study_mut(study_id)?
            .trials
            .iter_mut()
            .find(|t| t.trial_id == trial_id)
            .ok_or_else(|| CoreError::NotFound(format!("trial {trial_id}")))
    }

    fn unfinished_trial(&self, trial_id: TrialId) -> Result<&FrozenTrial, CoreError> {
        let trial = self.trial(trial_id)?;
        ensure_unfinished(trial_id, trial.state)?;
        Ok(trial)
    }

    /// Id of the trial most recently created by `worker_id`.
    pub fn last_created_trial(&self, worker_id: &str) -> Option<TrialId> {
        self.last_created_trial.get(worker_id).copied()
    }

    /// Validate `op` against the current state without applying it.
    pub fn check(&self, op: &JournalOperation) -> Result<(), Rejection> {
        match op {
            JournalOperation::CreateStudy {
                study_name,
                directions,
            } => {
                validate_directions(directions)?;
                validate_study_name(study_name)?;
                if self.study_id_by_name(study_name).is_some() {
                    return Err(CoreError::DuplicatedStudy(study_name.clone()).into());
                }
            }
            JournalOperation::DeleteStudy { study_id }
            | JournalOperation::SetStudyUserAttr { study_id, .. }
            | JournalOperation::SetStudySystemAttr { study_id, .. }
            | JournalOperation::CreateTrial { study_id, .. } => {
                self.study(*study_id)?;
            }
            JournalOperation::SetTrialParam {
                trial_id,
                name,
                value,
                distribution,
            } => {
                self.unfinished_trial(*trial_id)?;
                let study_id = self.trial_location(*trial_id)?;
                let recorded = recorded_distribution(&self.study(study_id)?.trials, name);
                validate_param(name, value.0, distribution, recorded)?;
            }
            JournalOperation::SetTrialStateValues {
                trial_id,
                state,
                values,
                ..
            } => {
                let study_id = self.trial_location(*trial_id)?;
                if let Some(values) = values {
                    let n_directions = self.study(study_id)?.study.directions.len();
                    validate_values(&JsonFloat::unwrap_all(values), n_directions)?;
                }
                let trial = self.unfinished_trial(*trial_id)?;
                if *state == TrialState::Running && trial.state != TrialState::Waiting {
                    return Err(Rejection::NotWaiting);
                }
            }
            JournalOperation::SetTrialIntermediateValue {
                trial_id, value, ..
            } => {
                validate_intermediate_value(value.0)?;
                self.unfinished_trial(*trial_id)?;
            }
            JournalOperation::SetTrialUserAttr { trial_id, .. }
            | JournalOperation::SetTrialSystemAttr { trial_id, .. } => {
                self.unfinished_trial(*trial_id)?;
            }
        }
        Ok(())
    }

    /// Apply one record. A rejected record leaves the state untouched.
    pub fn apply(&mut self, record: JournalRecord) -> Result<(), Rejection> {
        self.check(&record.op)?;
        match record.op {
            JournalOperation::CreateStudy {
                study_name,
                directions,
            } => {
                let study_id = StudyId(self.next_study_id);
                self.next_study_id += 1;
                self.studies.insert(
                    study_id,
                    StudyRecord {
                        study: FrozenStudy {
                            study_id,
                            study_name,
                            directions,
                            user_attrs: Attrs::new(),
                            system_attrs: Attrs::new(),
                        },
                        trials: Vec::new(),
                    },
                );
            }
            JournalOperation::DeleteStudy { study_id } => {
                if let Some(removed) = self.studies.remove(&study_id) {
                    for trial in &removed.trials {
                        self.trial_study.remove(&trial.trial_id);
                    }
                }
            }
            JournalOperation::SetStudyUserAttr {
                study_id,
                key,
                value,
            } => {
                self.study_mut(study_id)?.study.user_attrs.insert(key, value);
            }
            JournalOperation::SetStudySystemAttr {
                study_id,
                key,
                value,
            } => {
                self.study_mut(study_id)?
                    .study
                    .system_attrs
                    .insert(key, value);
            }
            JournalOperation::CreateTrial {
                study_id,
                datetime_start,
                template,
            } => {
                let trial_id = TrialId(self.next_trial_id);
                let study = self.study_mut(study_id)?;
                let number = study.trials.len() as u64;
                let trial = match template {
                    Some(template) => template.into_trial(trial_id, number),
                    None => FrozenTrial::new(trial_id, number, datetime_start),
                };
                study.trials.push(trial);
                self.next_trial_id += 1;
                self.trial_study.insert(trial_id, study_id);
                self.last_created_trial.insert(record.worker_id, trial_id);
            }
            JournalOperation::SetTrialParam {
                trial_id,
                name,
                value,
                distribution,
            } => {
                let trial = self.trial_mut(trial_id)?;
                trial.params.insert(name.clone(), value.0);
                trial.distributions.insert(name, distribution);
            }
            JournalOperation::SetTrialStateValues {
                trial_id,
                state,
                values,
                datetime,
            } => {
                let trial = self.trial_mut(trial_id)?;
                trial.state = state;
                if let Some(values) = values {
                    trial.values = Some(JsonFloat::unwrap_all(&values));
                }
                if state == TrialState::Running {
                    trial.datetime_start = Some(datetime);
                }
                if state.is_finished() {
                    trial.datetime_complete = Some(datetime);
                }
            }
            JournalOperation::SetTrialIntermediateValue {
                trial_id,
                step,
                value,
            } => {
                self.trial_mut(trial_id)?
                    .intermediate_values
                    .insert(step, value.0);
            }
            JournalOperation::SetTrialUserAttr {
                trial_id,
                key,
                value,
            } => {
                self.trial_mut(trial_id)?.user_attrs.insert(key, value);
            }
            JournalOperation::SetTrialSystemAttr {
                trial_id,
                key,
                value,
            } => {
                self.trial_mut(trial_id)?.system_attrs.insert(key, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::StudyDirection;

    fn record(worker: &str, op: JournalOperation) -> JournalRecord {
        JournalRecord {
            worker_id: worker.into(),
            op,
        }
    }

    fn create_study(name: &str) -> JournalOperation {
        JournalOperation::CreateStudy {
            study_name: name.into(),
            directions: vec![StudyDirection::Minimize],
        }
    }

    #[test]
    fn rejected_record_leaves_state_untouched() {
        let mut state = JournalState::default();
        state.apply(record("a", create_study("s"))).unwrap();
        let dup = state.apply(record("b", create_study("s")));
        assert!(matches!(
            dup,
            Err(Rejection::Invalid(CoreError::DuplicatedStudy(_)))
        ));
        assert_eq!(state.studies().count(), 1);
        // The id counter only moves on success.
        state.apply(record("b", create_study("t"))).unwrap();
        assert_eq!(state.study_id_by_name("t"), Some(StudyId(1)));
    }

    #[test]
    fn last_created_trial_is_tracked_per_worker() {
        let mut state = JournalState::default();
        state.apply(record("a", create_study("s"))).unwrap();
        for worker in ["a", "b", "a"] {
            state
                .apply(record(
                    worker,
                    JournalOperation::CreateTrial {
                        study_id: StudyId(0),
                        datetime_start: Utc::now(),
                        template: None,
                    },
                ))
                .unwrap();
        }
        assert_eq!(state.last_created_trial("a"), Some(TrialId(2)));
        assert_eq!(state.last_created_trial("b"), Some(TrialId(1)));
        assert_eq!(state.study(StudyId(0)).unwrap().trials[2].number, 2);
    }

    #[test]
    fn running_requires_waiting() {
        let mut state = JournalState::default();
        state.apply(record("a", create_study("s"))).unwrap();
        state
            .apply(record(
                "a",
                JournalOperation::CreateTrial {
                    study_id: StudyId(0),
                    datetime_start: Utc::now(),
                    template: None,
                },
            ))
            .unwrap();
        let op = JournalOperation::SetTrialStateValues {
            trial_id: TrialId(0),
            state: TrialState::Running,
            values: None,
            datetime: Utc::now(),
        };
        assert!(matches!(state.check(&op), Err(Rejection::NotWaiting)));
    }
}
