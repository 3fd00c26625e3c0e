use std::collections::BTreeMap;

use domain::adapters::memory_repo::InMemoryStorage;
use domain::{
    Attrs, CoreError, Distribution, FrozenStudy, FrozenTrial, HeartbeatStorage, StudyDirection,
    StudyId, StudyStorage, TrialId, TrialState,
};
use journal_adapter::{JournalFileBackend, JournalRedisBackend, JournalStorage};
use sqlite_adapter::{CachedStorage, RdbStorage};

use crate::mode::StorageMode;

/// The storage a supplier hands out, one variant per backend.
pub enum StorageHandle {
    InMemory(InMemoryStorage),
    Rdb(RdbStorage),
    Cached(CachedStorage),
    Journal(JournalStorage<JournalFileBackend>),
    JournalRedis(JournalStorage<JournalRedisBackend>),
}

impl StorageHandle {
    pub fn mode(&self) -> StorageMode {
        match self {
            StorageHandle::InMemory(_) => StorageMode::InMemory,
            StorageHandle::Rdb(_) => StorageMode::Sqlite,
            StorageHandle::Cached(_) => StorageMode::CachedSqlite,
            StorageHandle::Journal(_) => StorageMode::Journal,
            StorageHandle::JournalRedis(_) => StorageMode::JournalRedis,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, StorageHandle::Cached(_))
    }

    /// Heartbeat view of the storage, for backends that track liveness.
    pub fn as_heartbeat(&self) -> Option<&dyn HeartbeatStorage> {
        match self {
            StorageHandle::Rdb(s) => Some(s),
            StorageHandle::Cached(s) => Some(s),
            StorageHandle::InMemory(_)
            | StorageHandle::Journal(_)
            | StorageHandle::JournalRedis(_) => None,
        }
    }

    fn inner(&self) -> &dyn StudyStorage {
        match self {
            StorageHandle::InMemory(s) => s,
            StorageHandle::Rdb(s) => s,
            StorageHandle::Cached(s) => s,
            StorageHandle::Journal(s) => s,
            StorageHandle::JournalRedis(s) => s,
        }
    }
}

impl StudyStorage for StorageHandle {
    fn create_new_study(
        &self,
        directions: &[StudyDirection],
        study_name: Option<&str>,
    ) -> Result<StudyId, CoreError> {
        self.inner().create_new_study(directions, study_name)
    }

    fn delete_study(&self, study_id: StudyId) -> Result<(), CoreError> {
        self.inner().delete_study(study_id)
    }

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.inner().set_study_user_attr(study_id, key, value)
    }

    fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.inner().set_study_system_attr(study_id, key, value)
    }

    fn get_study_id_from_name(&self, study_name: &str) -> Result<StudyId, CoreError> {
        self.inner().get_study_id_from_name(study_name)
    }

    fn get_study_name_from_id(&self, study_id: StudyId) -> Result<String, CoreError> {
        self.inner().get_study_name_from_id(study_id)
    }

    fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError> {
        self.inner().get_study_directions(study_id)
    }

    fn get_study_user_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        self.inner().get_study_user_attrs(study_id)
    }

    fn get_study_system_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        self.inner().get_study_system_attrs(study_id)
    }

    fn get_all_studies(&self) -> Result<Vec<FrozenStudy>, CoreError> {
        self.inner().get_all_studies()
    }

    fn create_new_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId, CoreError> {
        self.inner().create_new_trial(study_id, template)
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal_value: f64,
        distribution: &Distribution,
    ) -> Result<(), CoreError> {
        self.inner()
            .set_trial_param(trial_id, name, internal_value, distribution)
    }

    fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: u64,
    ) -> Result<TrialId, CoreError> {
        self.inner()
            .get_trial_id_from_study_id_trial_number(study_id, number)
    }

    fn set_trial_state_values(
        &self,
        trial_id: TrialId,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool, CoreError> {
        self.inner().set_trial_state_values(trial_id, state, values)
    }

    fn set_trial_intermediate_value(
        &self,
        trial_id: TrialId,
        step: u64,
        value: f64,
    ) -> Result<(), CoreError> {
        self.inner()
            .set_trial_intermediate_value(trial_id, step, value)
    }

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.inner().set_trial_user_attr(trial_id, key, value)
    }

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.inner().set_trial_system_attr(trial_id, key, value)
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial, CoreError> {
        self.inner().get_trial(trial_id)
    }

    fn get_all_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError> {
        self.inner().get_all_trials(study_id, states)
    }

    fn get_trial_params(&self, trial_id: TrialId) -> Result<BTreeMap<String, f64>, CoreError> {
        self.inner().get_trial_params(trial_id)
    }
}
