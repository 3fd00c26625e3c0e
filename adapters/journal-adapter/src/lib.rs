//! Journal storage: every mutation is appended to a shared, ordered log of
//! operations and every reader rebuilds its view by replaying that log.
//!
//! Several workers may append to the same journal. A write goes through
//! sync, validate, append, sync; records that turn out to be invalid on
//! replay are skipped by everyone, and the worker that wrote one gets the
//! validation error back.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use domain::validate::generate_study_name;
use domain::{
    Attrs, CoreError, Distribution, FrozenStudy, FrozenTrial, StudyDirection, StudyId,
    StudyStorage, TrialId, TrialState,
};
use tracing::{debug, warn};

mod file;
mod operation;
mod redis;
mod replay;

pub use crate::file::{JournalFileBackend, JournalFileOpenLock, OpenLockGuard, LOCK_GRACE_PERIOD};
pub use crate::operation::{JournalOperation, JournalRecord, JsonFloat, TrialTemplate};
#[cfg(feature = "redis")]
pub use crate::redis::RedisConnection;
pub use crate::redis::{FakeRedis, JournalRedisBackend, RedisClient, RESERVED_RECORD_WAIT};

use crate::replay::{JournalState, Rejection};

/// Durable, ordered log of JSON records.
pub trait JournalBackend: Send + Sync {
    fn append_logs(&self, logs: &[serde_json::Value]) -> Result<(), CoreError>;
    /// Records from `log_number_from` (0-based) up to the last complete one.
    fn read_logs(&self, log_number_from: usize) -> Result<Vec<serde_json::Value>, CoreError>;
}

pub struct JournalStorage<B: JournalBackend> {
    backend: B,
    worker_id: String,
    state: Mutex<JournalState>,
}

impl<B: JournalBackend> JournalStorage<B> {
    /// Wrap `backend` and replay whatever it already holds.
    pub fn new(backend: B) -> Result<Self, CoreError> {
        let storage = Self {
            backend,
            worker_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(JournalState::default()),
        };
        let n = storage.read()?.log_number_read;
        debug!(worker_id = %storage.worker_id, records = n, "journal storage ready");
        Ok(storage)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Identifies this storage's records in a shared journal.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn state(&self) -> Result<MutexGuard<'_, JournalState>, CoreError> {
        self.state
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }

    /// Apply every record appended since the last sync.
    fn sync(&self, state: &mut JournalState) -> Result<(), Rejection> {
        let logs = self.backend.read_logs(state.log_number_read)?;
        let mut own_rejection = None;
        for log in logs {
            state.log_number_read += 1;
            let record: JournalRecord = match serde_json::from_value(log) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable journal record");
                    continue;
                }
            };
            let own = record.worker_id == self.worker_id;
            if let Err(rejection) = state.apply(record) {
                if own && own_rejection.is_none() {
                    own_rejection = Some(rejection);
                } else {
                    debug!(?rejection, "journal record rejected on replay");
                }
            }
        }
        own_rejection.map_or(Ok(()), Err)
    }

    /// Up-to-date state for reading.
    fn read(&self) -> Result<MutexGuard<'_, JournalState>, CoreError> {
        let mut state = self.state()?;
        self.sync(&mut state).map_err(Rejection::into_error)?;
        Ok(state)
    }

    /// Append `op` and return the state with it applied.
    fn write(&self, op: JournalOperation) -> Result<MutexGuard<'_, JournalState>, Rejection> {
        let mut state = self.state()?;
        self.sync(&mut state)?;
        state.check(&op)?;
        let record = JournalRecord {
            worker_id: self.worker_id.clone(),
            op,
        };
        let log = serde_json::to_value(&record).map_err(CoreError::from)?;
        self.backend.append_logs(&[log])?;
        self.sync(&mut state)?;
        Ok(state)
    }

    fn write_op(&self, op: JournalOperation) -> Result<MutexGuard<'_, JournalState>, CoreError> {
        self.write(op).map_err(Rejection::into_error)
    }
}

impl<B: JournalBackend> StudyStorage for JournalStorage<B> {
    fn create_new_study(
        &self,
        directions: &[StudyDirection],
        study_name: Option<&str>,
    ) -> Result<StudyId, CoreError> {
        let study_name = study_name.map_or_else(generate_study_name, str::to_string);
        let state = self.write_op(JournalOperation::CreateStudy {
            study_name: study_name.clone(),
            directions: directions.to_vec(),
        })?;
        state
            .study_id_by_name(&study_name)
            .ok_or_else(|| CoreError::NotFound(format!("study named {study_name}")))
    }

    fn delete_study(&self, study_id: StudyId) -> Result<(), CoreError> {
        self.write_op(JournalOperation::DeleteStudy { study_id })?;
        Ok(())
    }

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.write_op(JournalOperation::SetStudyUserAttr {
            study_id,
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.write_op(JournalOperation::SetStudySystemAttr {
            study_id,
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    fn get_study_id_from_name(&self, study_name: &str) -> Result<StudyId, CoreError> {
        self.read()?
            .study_id_by_name(study_name)
            .ok_or_else(|| CoreError::NotFound(format!("study named {study_name}")))
    }

    fn get_study_name_from_id(&self, study_id: StudyId) -> Result<String, CoreError> {
        Ok(self.read()?.study(study_id)?.study.study_name.clone())
    }

    fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError> {
        Ok(self.read()?.study(study_id)?.study.directions.clone())
    }

    fn get_study_user_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        Ok(self.read()?.study(study_id)?.study.user_attrs.clone())
    }

    fn get_study_system_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        Ok(self.read()?.study(study_id)?.study.system_attrs.clone())
    }

    fn get_all_studies(&self) -> Result<Vec<FrozenStudy>, CoreError> {
        Ok(self.read()?.studies().cloned().collect())
    }

    fn create_new_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId, CoreError> {
        let state = self.write_op(JournalOperation::CreateTrial {
            study_id,
            datetime_start: Utc::now(),
            template: template.map(TrialTemplate::from),
        })?;
        state
            .last_created_trial(&self.worker_id)
            .ok_or_else(|| CoreError::Repository("created trial missing from journal".into()))
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal_value: f64,
        distribution: &Distribution,
    ) -> Result<(), CoreError> {
        self.write_op(JournalOperation::SetTrialParam {
            trial_id,
            name: name.to_string(),
            value: JsonFloat(internal_value),
            distribution: distribution.clone(),
        })?;
        Ok(())
    }

    fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: u64,
    ) -> Result<TrialId, CoreError> {
        let state = self.read()?;
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
        let op = JournalOperation::SetTrialStateValues {
            trial_id,
            state,
            values: values.map(JsonFloat::wrap_all),
            datetime: Utc::now(),
        };
        match self.write(op) {
            Ok(_) => Ok(true),
            Err(Rejection::NotWaiting) => Ok(false),
            Err(Rejection::Invalid(err)) => Err(err),
        }
    }

    fn set_trial_intermediate_value(
        &self,
        trial_id: TrialId,
        step: u64,
        value: f64,
    ) -> Result<(), CoreError> {
        self.write_op(JournalOperation::SetTrialIntermediateValue {
            trial_id,
            step,
            value: JsonFloat(value),
        })?;
        Ok(())
    }

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.write_op(JournalOperation::SetTrialUserAttr {
            trial_id,
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.write_op(JournalOperation::SetTrialSystemAttr {
            trial_id,
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial, CoreError> {
        Ok(self.read()?.trial(trial_id)?.clone())
    }

    fn get_all_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError> {
        let state = self.read()?;
        Ok(state
            .study(study_id)?
            .trials
            .iter()
            .filter(|t| states.map_or(true, |s| s.contains(&t.state)))
            .cloned()
            .collect())
    }
}
