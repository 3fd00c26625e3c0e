//! Helpers built on top of [`HeartbeatStorage`].

use crate::{CoreError, HeartbeatStorage, StudyId, TrialId, TrialState};

/// Mark every stale running trial of `study_id` as failed.
///
/// Returns the trials this call actually failed. A trial another worker
/// finished in the meantime is skipped.
pub fn fail_stale_trials(
    storage: &dyn HeartbeatStorage,
    study_id: StudyId,
) -> Result<Vec<TrialId>, CoreError> {
    if !storage.is_heartbeat_enabled() {
        return Ok(Vec::new());
    }
    let mut failed = Vec::new();
    for trial_id in storage.get_stale_trial_ids(study_id)? {
        match storage.set_trial_state_values(trial_id, TrialState::Fail, None) {
            Ok(true) => failed.push(trial_id),
            Ok(false) | Err(CoreError::UpdateFinishedTrial(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}
