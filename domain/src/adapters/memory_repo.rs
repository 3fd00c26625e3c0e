use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::validate::{
    ensure_unfinished, generate_study_name, recorded_distribution, validate_directions,
    validate_intermediate_value, validate_param, validate_study_name, validate_values,
};
use crate::{
    Attrs, CoreError, Distribution, FrozenStudy, FrozenTrial, StudyDirection, StudyId,
    StudyStorage, TrialId, TrialState,
};

/// Volatile storage for tests and demos. Nothing survives the process; all
/// state sits behind one mutex.
pub struct InMemoryStorage {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    studies: BTreeMap<StudyId, StudyRecord>,
    /// Owning study of every trial.
    trial_study: BTreeMap<TrialId, StudyId>,
    next_study_id: i64,
    next_trial_id: i64,
}

struct StudyRecord {
    study: FrozenStudy,
    /// Indexed by trial number.
    trials: Vec<FrozenTrial>,
}

impl State {
    fn study(&self, study_id: StudyId) -> Result<&StudyRecord, CoreError> {
        self.studies
            .get(&study_id)
            .ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))
    }

    fn study_mut(&mut self, study_id: StudyId) -> Result<&mut StudyRecord, CoreError> {
        self.studies
            .get_mut(&study_id)
            .ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))
    }

    fn trial_location(&self, trial_id: TrialId) -> Result<StudyId, CoreError> {
        self.trial_study
            .get(&trial_id)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("trial {trial_id}")))
    }

    fn trial(&self, trial_id: TrialId) -> Result<&FrozenTrial, CoreError> {
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

    /// Mutable access to a trial that must not be finished yet.
    fn unfinished_trial_mut(&mut self, trial_id: TrialId) -> Result<&mut FrozenTrial, CoreError> {
        let trial = self.trial_mut(trial_id)?;
        ensure_unfinished(trial_id, trial.state)?;
        Ok(trial)
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StudyStorage for InMemoryStorage {
    fn create_new_study(
        &self,
        directions: &[StudyDirection],
        study_name: Option<&str>,
    ) -> Result<StudyId, CoreError> {
        validate_directions(directions)?;
        let name = match study_name {
            Some(n) => {
                validate_study_name(n)?;
                n.to_string()
            }
            None => generate_study_name(),
        };
        let mut state = self.state()?;
        if state.studies.values().any(|s| s.study.study_name == name) {
            return Err(CoreError::DuplicatedStudy(name));
        }
        let study_id = StudyId(state.next_study_id);
        state.next_study_id += 1;
        state.studies.insert(
            study_id,
            StudyRecord {
                study: FrozenStudy {
                    study_id,
                    study_name: name,
                    directions: directions.to_vec(),
                    user_attrs: Attrs::new(),
                    system_attrs: Attrs::new(),
                },
                trials: Vec::new(),
            },
        );
        Ok(study_id)
    }

    fn delete_study(&self, study_id: StudyId) -> Result<(), CoreError> {
        let mut state = self.state()?;
        let record = state
            .studies
            .remove(&study_id)
            .ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))?;
        for trial in &record.trials {
            state.trial_study.remove(&trial.trial_id);
        }
        Ok(())
    }

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        state
            .study_mut(study_id)?
            .study
            .user_attrs
            .insert(key.to_string(), value);
        Ok(())
    }

    fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        state
            .study_mut(study_id)?
            .study
            .system_attrs
            .insert(key.to_string(), value);
        Ok(())
    }

    fn get_study_id_from_name(&self, study_name: &str) -> Result<StudyId, CoreError> {
        let state = self.state()?;
        state
            .studies
            .values()
            .find(|s| s.study.study_name == study_name)
            .map(|s| s.study.study_id)
            .ok_or_else(|| CoreError::NotFound(format!("study named {study_name}")))
    }

    fn get_study_name_from_id(&self, study_id: StudyId) -> Result<String, CoreError> {
        Ok(self.state()?.study(study_id)?.study.study_name.clone())
    }

    fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError> {
        Ok(self.state()?.study(study_id)?.study.directions.clone())
    }

    fn get_study_user_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        Ok(self.state()?.study(study_id)?.study.user_attrs.clone())
    }

    fn get_study_system_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        Ok(self.state()?.study(study_id)?.study.system_attrs.clone())
    }

    fn get_all_studies(&self) -> Result<Vec<FrozenStudy>, CoreError> {
        let state = self.state()?;
        Ok(state.studies.values().map(|s| s.study.clone()).collect())
    }

    fn create_new_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId, CoreError> {
        let mut state = self.state()?;
        let trial_id = TrialId(state.next_trial_id);
        let record = state.study_mut(study_id)?;
        let number = record.trials.len() as u64;
        let trial = match template {
            Some(t) => FrozenTrial::from_template(trial_id, number, t),
            None => FrozenTrial::new(trial_id, number, Utc::now()),
        };
        record.trials.push(trial);
        state.next_trial_id += 1;
        state.trial_study.insert(trial_id, study_id);
        Ok(trial_id)
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal_value: f64,
        distribution: &Distribution,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        let study_id = state.trial_location(trial_id)?;
        ensure_unfinished(trial_id, state.trial(trial_id)?.state)?;
        let recorded = recorded_distribution(&state.study(study_id)?.trials, name).cloned();
        validate_param(name, internal_value, distribution, recorded.as_ref())?;
        let trial = state.trial_mut(trial_id)?;
        trial.params.insert(name.to_string(), internal_value);
        trial
            .distributions
            .insert(name.to_string(), distribution.clone());
        Ok(())
    }

    fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: u64,
    ) -> Result<TrialId, CoreError> {
        let state = self.state()?;
        state
            .study(study_id)?
            .trials
            .get(number as usize)
            .map(|t| t.trial_id)
            .ok_or_else(|| {
                CoreError::NotFound(format!("trial number {number} in study {study_id}"))
            })
    }

    fn set_trial_state_values(
        &self,
        trial_id: TrialId,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool, CoreError> {
        let mut guard = self.state()?;
        let study_id = guard.trial_location(trial_id)?;
        let n_directions = guard.study(study_id)?.study.directions.len();
        if let Some(values) = values {
            validate_values(values, n_directions)?;
        }
        let trial = guard.unfinished_trial_mut(trial_id)?;
        if state == TrialState::Running && trial.state != TrialState::Waiting {
            return Ok(false);
        }
        trial.state = state;
        if let Some(values) = values {
            trial.values = Some(values.to_vec());
        }
        if state == TrialState::Running {
            trial.datetime_start = Some(Utc::now());
        }
        if state.is_finished() {
            trial.datetime_complete = Some(Utc::now());
        }
        Ok(true)
    }

    fn set_trial_intermediate_value(
        &self,
        trial_id: TrialId,
        step: u64,
        value: f64,
    ) -> Result<(), CoreError> {
        validate_intermediate_value(value)?;
        let mut state = self.state()?;
        state
            .unfinished_trial_mut(trial_id)?
            .intermediate_values
            .insert(step, value);
        Ok(())
    }

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        state
            .unfinished_trial_mut(trial_id)?
            .user_attrs
            .insert(key.to_string(), value);
        Ok(())
    }

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut state = self.state()?;
        state
            .unfinished_trial_mut(trial_id)?
            .system_attrs
            .insert(key.to_string(), value);
        Ok(())
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial, CoreError> {
        Ok(self.state()?.trial(trial_id)?.clone())
    }

    fn get_all_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError> {
        let state = self.state()?;
        Ok(state
            .study(study_id)?
            .trials
            .iter()
            .filter(|t| states.map_or(true, |s| s.contains(&t.state)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage_with_study() -> (InMemoryStorage, StudyId) {
        let storage = InMemoryStorage::new();
        let study_id = storage
            .create_new_study(&[StudyDirection::Minimize], Some("s"))
            .unwrap();
        (storage, study_id)
    }

    #[test]
    fn create_study_rejects_duplicate_name() {
        let (storage, _) = storage_with_study();
        let err = storage
            .create_new_study(&[StudyDirection::Maximize], Some("s"))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicatedStudy(_)));
    }

    #[test]
    fn unnamed_studies_get_distinct_names() {
        let storage = InMemoryStorage::new();
        let a = storage
            .create_new_study(&[StudyDirection::Minimize], None)
            .unwrap();
        let b = storage
            .create_new_study(&[StudyDirection::Minimize], None)
            .unwrap();
        assert_ne!(
            storage.get_study_name_from_id(a).unwrap(),
            storage.get_study_name_from_id(b).unwrap()
        );
    }

    #[test]
    fn trial_numbers_are_per_study() {
        let (storage, s1) = storage_with_study();
        let s2 = storage
            .create_new_study(&[StudyDirection::Minimize], Some("other"))
            .unwrap();
        let a = storage.create_new_trial(s1, None).unwrap();
        let b = storage.create_new_trial(s2, None).unwrap();
        let c = storage.create_new_trial(s1, None).unwrap();
        assert_eq!(storage.get_trial_number_from_id(a).unwrap(), 0);
        assert_eq!(storage.get_trial_number_from_id(b).unwrap(), 0);
        assert_eq!(storage.get_trial_number_from_id(c).unwrap(), 1);
        assert_eq!(
            storage.get_trial_id_from_study_id_trial_number(s1, 1).unwrap(),
            c
        );
    }

    #[test]
    fn finished_trial_is_immutable() {
        let (storage, study_id) = storage_with_study();
        let trial_id = storage.create_new_trial(study_id, None).unwrap();
        assert!(storage
            .set_trial_state_values(trial_id, TrialState::Complete, Some(&[1.0]))
            .unwrap());
        let err = storage
            .set_trial_user_attr(trial_id, "k", json!(1))
            .unwrap_err();
        assert!(matches!(err, CoreError::UpdateFinishedTrial(_)));
        let trial = storage.get_trial(trial_id).unwrap();
        assert!(trial.datetime_complete.is_some());
    }

    #[test]
    fn running_requires_waiting() {
        let (storage, study_id) = storage_with_study();
        let running = storage.create_new_trial(study_id, None).unwrap();
        assert!(!storage
            .set_trial_state_values(running, TrialState::Running, None)
            .unwrap());

        let mut template = storage.get_trial(running).unwrap();
        template.state = TrialState::Waiting;
        template.datetime_start = None;
        let waiting = storage.create_new_trial(study_id, Some(&template)).unwrap();
        assert!(storage
            .set_trial_state_values(waiting, TrialState::Running, None)
            .unwrap());
        assert!(storage.get_trial(waiting).unwrap().datetime_start.is_some());
    }

    #[test]
    fn delete_study_removes_trials() {
        let (storage, study_id) = storage_with_study();
        let trial_id = storage.create_new_trial(study_id, None).unwrap();
        storage.delete_study(study_id).unwrap();
        assert!(matches!(
            storage.get_trial(trial_id),
            Err(CoreError::NotFound(_))
        ));
        assert!(storage.get_all_studies().unwrap().is_empty());
    }

    #[test]
    fn param_distribution_must_stay_compatible() {
        let (storage, study_id) = storage_with_study();
        let t0 = storage.create_new_trial(study_id, None).unwrap();
        let t1 = storage.create_new_trial(study_id, None).unwrap();
        storage
            .set_trial_param(t0, "x", 0.5, &Distribution::float(0.0, 1.0))
            .unwrap();
        let err = storage
            .set_trial_param(t1, "x", 1.0, &Distribution::int(0, 3))
            .unwrap_err();
        assert!(matches!(err, CoreError::IncompatibleDistribution(_)));
        assert_eq!(storage.get_trial_param(t0, "x").unwrap(), 0.5);
    }
}
