//! Lightweight input validation helpers shared by every storage backend.
//! Keep logic minimal and deterministic.

use crate::{CoreError, Distribution, FrozenTrial, StudyDirection, TrialId, TrialState};

/// Name given to studies created without one.
pub fn generate_study_name() -> String {
    format!("no-name-{}", uuid::Uuid::new_v4())
}

pub fn validate_directions(directions: &[StudyDirection]) -> Result<(), CoreError> {
    if directions.is_empty() {
        return Err(CoreError::InvalidArgument(
            "a study needs at least one direction".into(),
        ));
    }
    Ok(())
}

pub fn validate_study_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidArgument("study name is empty".into()));
    }
    Ok(())
}

/// Finished trials are immutable.
pub fn ensure_unfinished(trial_id: TrialId, state: TrialState) -> Result<(), CoreError> {
    if state.is_finished() {
        return Err(CoreError::UpdateFinishedTrial(format!(
            "trial {trial_id} is already {}",
            state.as_str()
        )));
    }
    Ok(())
}

/// Check a parameter against its own distribution and, when the study has
/// already recorded `name`, against that earlier distribution.
pub fn validate_param(
    name: &str,
    internal_value: f64,
    distribution: &Distribution,
    recorded: Option<&Distribution>,
) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::InvalidArgument("param name is empty".into()));
    }
    distribution.validate()?;
    if !distribution.contains(internal_value) {
        return Err(CoreError::InvalidArgument(format!(
            "value {internal_value} of param {name} is outside its distribution"
        )));
    }
    if let Some(recorded) = recorded {
        recorded.check_compatibility(distribution)?;
    }
    Ok(())
}

/// Values must match the number of objectives and must not be NaN.
pub fn validate_values(values: &[f64], n_directions: usize) -> Result<(), CoreError> {
    if values.len() != n_directions {
        return Err(CoreError::InvalidArgument(format!(
            "expected {n_directions} values, got {}",
            values.len()
        )));
    }
    if values.iter().any(|v| v.is_nan()) {
        return Err(CoreError::InvalidArgument("trial values must not be NaN".into()));
    }
    Ok(())
}

pub fn validate_intermediate_value(value: f64) -> Result<(), CoreError> {
    if value.is_nan() {
        return Err(CoreError::InvalidArgument(
            "intermediate values must not be NaN".into(),
        ));
    }
    Ok(())
}

/// Upper bound for heartbeat interval and grace period: one year.
pub const MAX_HEARTBEAT_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Heartbeat interval and grace period, when given, must be positive and at
/// most [`MAX_HEARTBEAT_SECONDS`].
pub fn validate_heartbeat(
    heartbeat_interval: Option<u64>,
    grace_period: Option<u64>,
) -> Result<(), CoreError> {
    if heartbeat_interval == Some(0) {
        return Err(CoreError::InvalidArgument(
            "heartbeat_interval must be positive".into(),
        ));
    }
    if grace_period == Some(0) {
        return Err(CoreError::InvalidArgument("grace_period must be positive".into()));
    }
    for (name, value) in [("heartbeat_interval", heartbeat_interval), ("grace_period", grace_period)] {
        if value.is_some_and(|v| v > MAX_HEARTBEAT_SECONDS) {
            return Err(CoreError::InvalidArgument(format!(
                "{name} must be at most {MAX_HEARTBEAT_SECONDS} seconds"
            )));
        }
    }
    if heartbeat_interval.is_none() && grace_period.is_some() {
        return Err(CoreError::InvalidArgument(
            "grace_period requires heartbeat_interval".into(),
        ));
    }
    Ok(())
}

/// Find the distribution already recorded for `name` among `trials`.
pub fn recorded_distribution<'a>(
    trials: impl IntoIterator<Item = &'a FrozenTrial>,
    name: &str,
) -> Option<&'a Distribution> {
    trials
        .into_iter()
        .find_map(|t| t.distributions.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_unique() {
        let a = generate_study_name();
        let b = generate_study_name();
        assert!(a.starts_with("no-name-"));
        assert_ne!(a, b);
    }

    #[test]
    fn directions_must_not_be_empty() {
        assert!(validate_directions(&[]).is_err());
        assert!(validate_directions(&[StudyDirection::Minimize]).is_ok());
    }

    #[test]
    fn values_length_and_nan() {
        assert!(validate_values(&[1.0], 1).is_ok());
        assert!(validate_values(&[f64::INFINITY], 1).is_ok());
        assert!(validate_values(&[1.0, 2.0], 1).is_err());
        assert!(validate_values(&[f64::NAN], 1).is_err());
    }

    #[test]
    fn finished_trials_are_rejected() {
        assert!(ensure_unfinished(TrialId(1), TrialState::Running).is_ok());
        let err = ensure_unfinished(TrialId(1), TrialState::Complete).unwrap_err();
        assert!(matches!(err, CoreError::UpdateFinishedTrial(_)));
    }

    #[test]
    fn param_checks_range_and_compatibility() {
        let d = Distribution::float(0.0, 1.0);
        assert!(validate_param("x", 0.5, &d, None).is_ok());
        assert!(validate_param("x", 2.0, &d, None).is_err());
        let recorded = Distribution::int(0, 1);
        assert!(matches!(
            validate_param("x", 0.5, &d, Some(&recorded)),
            Err(CoreError::IncompatibleDistribution(_))
        ));
    }

    #[test]
    fn heartbeat_settings() {
        assert!(validate_heartbeat(None, None).is_ok());
        assert!(validate_heartbeat(Some(60), Some(120)).is_ok());
        assert!(validate_heartbeat(Some(0), None).is_err());
        assert!(validate_heartbeat(None, Some(10)).is_err());
    }

    #[test]
    fn heartbeat_settings_are_bounded() {
        let max = MAX_HEARTBEAT_SECONDS;
        assert!(validate_heartbeat(Some(max), Some(max)).is_ok());
        assert!(matches!(
            validate_heartbeat(Some(u64::MAX / 2 + 1), None),
            Err(CoreError::InvalidArgument(m)) if m.contains("heartbeat_interval")
        ));
        assert!(matches!(
            validate_heartbeat(Some(60), Some(10_000_000_000_000_000)),
            Err(CoreError::InvalidArgument(m)) if m.contains("grace_period")
        ));
    }
}
