//! The same study and trial scenarios, run against every storage mode.

use std::thread;
use std::time::Duration;

use domain::heartbeat::fail_stale_trials;
use domain::{
    CoreError, Distribution, FrozenTrial, StudyDirection, StudyStorage, TrialId, TrialState,
};
use serde_json::json;
use storage_testing::{
    StorageHandle, StorageSupplier, SupplierOptions, STORAGE_MODES, STORAGE_MODES_HEARTBEAT,
};

fn for_each_mode(test: impl Fn(&StorageHandle)) {
    for mode in STORAGE_MODES {
        StorageSupplier::new(mode, SupplierOptions::new())
            .scope(&test)
            .unwrap_or_else(|e| panic!("{mode}: {e}"));
    }
}

#[test]
fn study_lifecycle() {
    for_each_mode(|storage| {
        let mode = storage.mode();
        let study_id = storage
            .create_new_study(&[StudyDirection::Minimize, StudyDirection::Maximize], Some("a"))
            .unwrap();
        assert_eq!(storage.get_study_id_from_name("a").unwrap(), study_id);
        assert_eq!(
            storage.get_study_directions(study_id).unwrap(),
            vec![StudyDirection::Minimize, StudyDirection::Maximize]
        );
        assert!(
            matches!(
                storage.create_new_study(&[StudyDirection::Minimize], Some("a")),
                Err(CoreError::DuplicatedStudy(_))
            ),
            "{mode}"
        );

        storage.set_study_user_attr(study_id, "owner", json!("me")).unwrap();
        storage.set_study_system_attr(study_id, "v", json!(2)).unwrap();
        assert_eq!(storage.get_study_user_attrs(study_id).unwrap()["owner"], json!("me"));
        assert_eq!(storage.get_study_system_attrs(study_id).unwrap()["v"], json!(2));

        let unnamed = storage
            .create_new_study(&[StudyDirection::Minimize], None)
            .unwrap();
        assert!(storage
            .get_study_name_from_id(unnamed)
            .unwrap()
            .starts_with("no-name-"));
        assert_eq!(storage.get_all_studies().unwrap().len(), 2, "{mode}");

        storage.delete_study(study_id).unwrap();
        assert!(
            matches!(storage.get_study_name_from_id(study_id), Err(CoreError::NotFound(_))),
            "{mode}"
        );
        assert!(matches!(
            storage.delete_study(study_id),
            Err(CoreError::NotFound(_))
        ));
    });
}

#[test]
fn trial_lifecycle() {
    for_each_mode(|storage| {
        let mode = storage.mode();
        let study_id = storage
            .create_new_study(&[StudyDirection::Minimize], Some("t"))
            .unwrap();
        let ids: Vec<TrialId> = (0..3)
            .map(|_| storage.create_new_trial(study_id, None).unwrap())
            .collect();
        for (number, id) in ids.iter().enumerate() {
            assert_eq!(storage.get_trial_number_from_id(*id).unwrap(), number as u64);
            assert_eq!(
                storage
                    .get_trial_id_from_study_id_trial_number(study_id, number as u64)
                    .unwrap(),
                *id
            );
        }

        let x = Distribution::float(-1.0, 1.0);
        storage.set_trial_param(ids[0], "x", 0.5, &x).unwrap();
        assert_eq!(storage.get_trial_param(ids[0], "x").unwrap(), 0.5);
        assert!(
            matches!(
                storage.set_trial_param(ids[1], "x", 1.0, &Distribution::int(0, 3)),
                Err(CoreError::IncompatibleDistribution(_))
            ),
            "{mode}"
        );

        storage.set_trial_intermediate_value(ids[0], 1, 0.9).unwrap();
        storage.set_trial_user_attr(ids[0], "note", json!([1, 2])).unwrap();
        storage.set_trial_system_attr(ids[0], "seed", json!(7)).unwrap();

        assert!(storage
            .set_trial_state_values(ids[0], TrialState::Complete, Some(&[0.25]))
            .unwrap());
        assert!(storage
            .set_trial_state_values(ids[1], TrialState::Complete, Some(&[0.75]))
            .unwrap());
        assert!(storage
            .set_trial_state_values(ids[2], TrialState::Pruned, None)
            .unwrap());

        let trial = storage.get_trial(ids[0]).unwrap();
        assert_eq!(trial.values, Some(vec![0.25]));
        assert_eq!(trial.intermediate_values[&1], 0.9);
        assert_eq!(trial.user_attrs["note"], json!([1, 2]));
        assert_eq!(trial.system_attrs["seed"], json!(7));
        assert!(trial.datetime_complete.is_some());

        assert!(
            matches!(
                storage.set_trial_user_attr(ids[0], "late", json!(true)),
                Err(CoreError::UpdateFinishedTrial(_))
            ),
            "{mode}"
        );
        assert!(matches!(
            storage.set_trial_state_values(ids[0], TrialState::Fail, None),
            Err(CoreError::UpdateFinishedTrial(_))
        ));

        assert_eq!(
            storage
                .get_n_trials(study_id, Some(&[TrialState::Complete]))
                .unwrap(),
            2
        );
        let all = storage.get_all_trials(study_id, None).unwrap();
        assert_eq!(
            all.iter().map(|t| t.number).collect::<Vec<_>>(),
            vec![0, 1, 2],
            "{mode}"
        );
        assert_eq!(storage.get_best_trial(study_id).unwrap().trial_id, ids[0]);
    });
}

#[test]
fn only_waiting_trials_can_start_running() {
    for_each_mode(|storage| {
        let mode = storage.mode();
        let study_id = storage
            .create_new_study(&[StudyDirection::Maximize], Some("w"))
            .unwrap();
        let running = storage.create_new_trial(study_id, None).unwrap();
        assert!(
            !storage
                .set_trial_state_values(running, TrialState::Running, None)
                .unwrap(),
            "{mode}"
        );

        let mut template = FrozenTrial::new(TrialId(0), 0, chrono::Utc::now());
        template.state = TrialState::Waiting;
        template.datetime_start = None;
        template.params.insert("lr".into(), 0.01);
        template
            .distributions
            .insert("lr".into(), Distribution::float(0.0, 1.0));
        let queued = storage.create_new_trial(study_id, Some(&template)).unwrap();
        assert_eq!(storage.get_trial(queued).unwrap().state, TrialState::Waiting);
        assert!(storage
            .set_trial_state_values(queued, TrialState::Running, None)
            .unwrap());

        let started = storage.get_trial(queued).unwrap();
        assert_eq!(started.state, TrialState::Running);
        assert!(started.datetime_start.is_some(), "{mode}");
        assert_eq!(started.params["lr"], 0.01);
    });
}

#[test]
fn invalid_values_are_rejected() {
    for_each_mode(|storage| {
        let study_id = storage
            .create_new_study(&[StudyDirection::Minimize], Some("v"))
            .unwrap();
        let trial_id = storage.create_new_trial(study_id, None).unwrap();
        assert!(matches!(
            storage.set_trial_state_values(trial_id, TrialState::Complete, Some(&[1.0, 2.0])),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            storage.set_trial_intermediate_value(trial_id, 0, f64::NAN),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            storage.set_trial_param(trial_id, "x", 5.0, &Distribution::float(0.0, 1.0)),
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(storage.get_trial(trial_id).unwrap().state, TrialState::Running);
    });
}

#[test]
fn stale_trials_are_failed_in_heartbeat_modes() {
    for mode in STORAGE_MODES_HEARTBEAT {
        let options = SupplierOptions::new().heartbeat_interval(1).grace_period(1);
        StorageSupplier::new(mode, options)
            .scope(|storage| {
                let heartbeat = storage.as_heartbeat().unwrap();
                let study_id = storage
                    .create_new_study(&[StudyDirection::Minimize], Some("hb"))
                    .unwrap();
                let stale = storage.create_new_trial(study_id, None).unwrap();
                heartbeat.record_heartbeat(stale).unwrap();
                thread::sleep(Duration::from_millis(1500));

                let fresh = storage.create_new_trial(study_id, None).unwrap();
                heartbeat.record_heartbeat(fresh).unwrap();

                assert_eq!(fail_stale_trials(heartbeat, study_id).unwrap(), vec![stale]);
                assert_eq!(storage.get_trial(stale).unwrap().state, TrialState::Fail);
                assert_eq!(storage.get_trial(fresh).unwrap().state, TrialState::Running);
            })
            .unwrap();
    }
}
