//! Read cache in front of [`RdbStorage`].
//!
//! Finished trials never change, so once a bulk read has seen one it is kept
//! in process memory and later reads only ask the database for the rest.
//! Study names and directions are immutable too and are cached on first use.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use domain::{
    Attrs, CoreError, Distribution, FrozenStudy, FrozenTrial, HeartbeatStorage, StudyDirection,
    StudyId, StudyStorage, TrialId, TrialState,
};
use domain::validate::ensure_unfinished;

use crate::RdbStorage;

pub struct CachedStorage {
    backend: RdbStorage,
    cache: Mutex<Cache>,
}

#[derive(Default)]
struct Cache {
    studies: HashMap<StudyId, StudyCache>,
    /// Owning study of every cached finished trial.
    finished_owner: HashMap<TrialId, StudyId>,
}

#[derive(Default)]
struct StudyCache {
    name: Option<String>,
    directions: Option<Vec<StudyDirection>>,
    finished: BTreeMap<TrialId, FrozenTrial>,
}

impl Cache {
    fn finished_trial(&self, trial_id: TrialId) -> Option<&FrozenTrial> {
        let study_id = self.finished_owner.get(&trial_id)?;
        self.studies.get(study_id)?.finished.get(&trial_id)
    }

    fn evict(&mut self, study_id: StudyId) {
        if let Some(study) = self.studies.remove(&study_id) {
            for trial_id in study.finished.keys() {
                self.finished_owner.remove(trial_id);
            }
        }
    }
}

impl CachedStorage {
    pub fn new(backend: RdbStorage) -> Self {
        Self {
            backend,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// The wrapped relational storage.
    pub fn backend(&self) -> &RdbStorage {
        &self.backend
    }

    #[cfg(test)]
    fn cached_trial_count(&self, study_id: StudyId) -> Result<usize, CoreError> {
        Ok(self
            .cache()?
            .studies
            .get(&study_id)
            .map_or(0, |s| s.finished.len()))
    }

    fn cache(&self) -> Result<MutexGuard<'_, Cache>, CoreError> {
        self.cache
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }

    /// Fail fast on writes to trials already known to be finished.
    fn check_writable(&self, trial_id: TrialId) -> Result<(), CoreError> {
        if let Some(trial) = self.cache()?.finished_trial(trial_id) {
            ensure_unfinished(trial_id, trial.state)?;
        }
        Ok(())
    }
}

impl StudyStorage for CachedStorage {
    fn create_new_study(
        &self,
        directions: &[StudyDirection],
        study_name: Option<&str>,
    ) -> Result<StudyId, CoreError> {
        let study_id = self.backend.create_new_study(directions, study_name)?;
        let name = self.backend.get_study_name_from_id(study_id)?;
        let mut cache = self.cache()?;
        cache.studies.insert(
            study_id,
            StudyCache {
                name: Some(name),
                directions: Some(directions.to_vec()),
                finished: BTreeMap::new(),
            },
        );
        Ok(study_id)
    }

    fn delete_study(&self, study_id: StudyId) -> Result<(), CoreError> {
        self.cache()?.evict(study_id);
        self.backend.delete_study(study_id)
    }

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.backend.set_study_user_attr(study_id, key, value)
    }

    fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.backend.set_study_system_attr(study_id, key, value)
    }

    fn get_study_id_from_name(&self, study_name: &str) -> Result<StudyId, CoreError> {
        self.backend.get_study_id_from_name(study_name)
    }

    fn get_study_name_from_id(&self, study_id: StudyId) -> Result<String, CoreError> {
        let mut cache = self.cache()?;
        if let Some(name) = cache.studies.get(&study_id).and_then(|s| s.name.clone()) {
            return Ok(name);
        }
        let name = self.backend.get_study_name_from_id(study_id)?;
        cache.studies.entry(study_id).or_default().name = Some(name.clone());
        Ok(name)
    }

    fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError> {
        let mut cache = self.cache()?;
        if let Some(directions) = cache
            .studies
            .get(&study_id)
            .and_then(|s| s.directions.clone())
        {
            return Ok(directions);
        }
        let directions = self.backend.get_study_directions(study_id)?;
        cache.studies.entry(study_id).or_default().directions = Some(directions.clone());
        Ok(directions)
    }

    fn get_study_user_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        self.backend.get_study_user_attrs(study_id)
    }

    fn get_study_system_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        self.backend.get_study_system_attrs(study_id)
    }

    fn get_all_studies(&self) -> Result<Vec<FrozenStudy>, CoreError> {
        self.backend.get_all_studies()
    }

    fn create_new_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId, CoreError> {
        self.backend.create_new_trial(study_id, template)
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal_value: f64,
        distribution: &Distribution,
    ) -> Result<(), CoreError> {
        self.check_writable(trial_id)?;
        self.backend
            .set_trial_param(trial_id, name, internal_value, distribution)
    }

    fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: u64,
    ) -> Result<TrialId, CoreError> {
        self.backend
            .get_trial_id_from_study_id_trial_number(study_id, number)
    }

    fn set_trial_state_values(
        &self,
        trial_id: TrialId,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool, CoreError> {
        self.check_writable(trial_id)?;
        self.backend.set_trial_state_values(trial_id, state, values)
    }

    fn set_trial_intermediate_value(
        &self,
        trial_id: TrialId,
        step: u64,
        value: f64,
    ) -> Result<(), CoreError> {
        self.check_writable(trial_id)?;
        self.backend
            .set_trial_intermediate_value(trial_id, step, value)
    }

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.check_writable(trial_id)?;
        self.backend.set_trial_user_attr(trial_id, key, value)
    }

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.check_writable(trial_id)?;
        self.backend.set_trial_system_attr(trial_id, key, value)
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial, CoreError> {
        if let Some(trial) = self.cache()?.finished_trial(trial_id) {
            return Ok(trial.clone());
        }
        self.backend.get_trial(trial_id)
    }

    fn get_all_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError> {
        let mut cache = self.cache()?;
        let known: BTreeSet<TrialId> = cache
            .studies
            .get(&study_id)
            .map(|s| s.finished.keys().copied().collect())
            .unwrap_or_default();
        let fresh = self.backend.get_trials_excluding(study_id, &known, None)?;

        let cache = &mut *cache;
        let study = cache.studies.entry(study_id).or_default();
        for trial in &fresh {
            if trial.state.is_finished() {
                study.finished.insert(trial.trial_id, trial.clone());
                cache.finished_owner.insert(trial.trial_id, study_id);
            }
        }
        let mut trials: Vec<FrozenTrial> = study
            .finished
            .values()
            .filter(|t| known.contains(&t.trial_id))
            .cloned()
            .chain(fresh)
            .filter(|t| states.map_or(true, |s| s.contains(&t.state)))
            .collect();
        trials.sort_by_key(|t| t.number);
        Ok(trials)
    }
}

impl HeartbeatStorage for CachedStorage {
    fn record_heartbeat(&self, trial_id: TrialId) -> Result<(), CoreError> {
        self.backend.record_heartbeat(trial_id)
    }

    fn get_stale_trial_ids(&self, study_id: StudyId) -> Result<Vec<TrialId>, CoreError> {
        self.backend.get_stale_trial_ids(study_id)
    }

    fn heartbeat_interval(&self) -> Option<u64> {
        self.backend.heartbeat_interval()
    }
}
