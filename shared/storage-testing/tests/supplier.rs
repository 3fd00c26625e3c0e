use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use domain::{CoreError, StudyDirection, StudyStorage};
use journal_adapter::{FakeRedis, RedisClient};
use storage_testing::{
    StorageHandle, StorageMode, StorageSpec, StorageSupplier, SupplierOptions, STORAGE_MODES,
};

fn enter(mode: StorageMode) -> storage_testing::SuppliedStorage {
    StorageSupplier::new(mode, SupplierOptions::new())
        .enter()
        .unwrap()
}

#[test]
fn inmemory_without_options_is_usable() {
    let supplied = enter(StorageMode::InMemory);
    assert!(matches!(supplied.storage(), StorageHandle::InMemory(_)));
    assert!(supplied.temp_path().is_none());
    let study_id = supplied
        .storage()
        .create_new_study(&[StudyDirection::Minimize], Some("s"))
        .unwrap();
    assert_eq!(
        supplied.storage().get_study_name_from_id(study_id).unwrap(),
        "s"
    );
}

#[test]
fn inmemory_rejects_options() {
    for options in [
        SupplierOptions::new().heartbeat_interval(60),
        SupplierOptions::new().redis_prefix("p"),
        SupplierOptions::new().redis_client(Arc::new(FakeRedis::new())),
    ] {
        let err = StorageSupplier::new(StorageMode::InMemory, options)
            .enter()
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::InvalidArgument(_)), "{err}");
    }
}

#[test]
fn sqlite_family_removes_its_temp_file_on_exit() {
    for mode in [StorageMode::Sqlite, StorageMode::CachedSqlite] {
        let supplied = enter(mode);
        let path = supplied.temp_path().unwrap().to_path_buf();
        assert!(path.exists());
        supplied
            .storage()
            .create_new_study(&[StudyDirection::Maximize], None)
            .unwrap();
        drop(supplied);
        assert!(!path.exists(), "{mode}: {} left behind", path.display());
    }
}

#[test]
fn sqlite_storage_points_at_the_temp_file() {
    let supplied = enter(StorageMode::Sqlite);
    let path = supplied.temp_path().unwrap().display().to_string();
    let StorageHandle::Rdb(rdb) = supplied.storage() else {
        panic!("expected relational storage");
    };
    assert_eq!(rdb.url(), format!("sqlite:///{path}"));
    assert!(!supplied.storage().is_cached());
}

#[test]
fn cached_sqlite_wraps_relational_storage() {
    let supplied = enter(StorageMode::CachedSqlite);
    assert!(supplied.storage().is_cached());
    let StorageHandle::Cached(cached) = supplied.storage() else {
        panic!("expected cached storage");
    };
    let path = supplied.temp_path().unwrap().display().to_string();
    assert!(cached.backend().url().ends_with(&path));
}

#[test]
fn journal_writes_to_the_temp_file() {
    let supplied = enter(StorageMode::Journal);
    let path = supplied.temp_path().unwrap().to_path_buf();
    let StorageHandle::Journal(journal) = supplied.storage() else {
        panic!("expected file journal");
    };
    assert_eq!(journal.backend().path(), path.as_path());

    supplied
        .storage()
        .create_new_study(&[StudyDirection::Minimize], Some("j"))
        .unwrap();
    assert!(std::fs::metadata(&path).unwrap().len() > 0);
    supplied.close().unwrap();
    assert!(!path.exists());
}

#[test]
fn journal_redis_uses_a_fresh_fake_by_default() {
    let supplied = enter(StorageMode::JournalRedis);
    assert!(supplied.temp_path().is_none());
    assert!(matches!(supplied.storage(), StorageHandle::JournalRedis(_)));
    supplied
        .storage()
        .create_new_study(&[StudyDirection::Minimize], Some("r"))
        .unwrap();

    // A second supplier gets its own fake and does not see the study.
    let other = enter(StorageMode::JournalRedis);
    assert!(other.storage().get_all_studies().unwrap().is_empty());
}

#[test]
fn journal_redis_uses_the_given_client() {
    let redis = Arc::new(FakeRedis::new());
    let options = SupplierOptions::new()
        .redis_client(redis.clone())
        .redis_prefix("suite");
    let supplied = StorageSupplier::new(StorageMode::JournalRedis, options)
        .enter()
        .unwrap();
    supplied
        .storage()
        .create_new_study(&[StudyDirection::Minimize], Some("shared"))
        .unwrap();

    assert_eq!(redis.get("suite:log_number").unwrap().as_deref(), Some("1"));
}

#[test]
#[should_panic(expected = "unrecognized storage mode")]
fn unknown_mode_is_a_harness_defect() {
    let _ = StorageSupplier::named("postgres", SupplierOptions::new());
}

#[test]
fn named_accepts_every_mode() {
    for mode in STORAGE_MODES {
        let supplier = StorageSupplier::named(mode.as_str(), SupplierOptions::new());
        assert_eq!(supplier.mode(), mode);
    }
}

#[test]
fn release_is_idempotent() {
    for mode in STORAGE_MODES {
        let mut supplied = enter(mode);
        supplied.release().unwrap();
        assert!(supplied.temp_path().is_none());
        supplied.release().unwrap();
    }
}

#[test]
fn temp_file_is_removed_when_the_body_panics() {
    let mut seen: Option<PathBuf> = None;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let supplied = enter(StorageMode::CachedSqlite);
        seen = supplied.temp_path().map(|p| p.to_path_buf());
        panic!("test body failed");
    }));
    assert!(result.is_err());
    let path = seen.unwrap();
    assert!(!path.exists());
}

#[test]
fn scope_cleans_up_after_a_panicking_closure() {
    let mut seen: Option<PathBuf> = None;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        StorageSupplier::new(StorageMode::Journal, SupplierOptions::new()).scope(|storage| {
            if let StorageHandle::Journal(journal) = storage {
                seen = Some(journal.backend().path().to_path_buf());
            }
            panic!("test body failed");
        })
    }));
    assert!(result.is_err());
    assert!(!seen.unwrap().exists());
}

#[test]
fn scope_returns_the_closure_result() {
    let n = StorageSupplier::new(StorageMode::Sqlite, SupplierOptions::new())
        .scope(|storage| {
            storage
                .create_new_study(&[StudyDirection::Minimize], None)
                .unwrap();
            storage.get_all_studies().unwrap().len()
        })
        .unwrap();
    assert_eq!(n, 1);
}

#[test]
fn heartbeat_options_reach_the_relational_storage() {
    let supplied = StorageSupplier::new(
        StorageMode::Sqlite,
        SupplierOptions::new().heartbeat_interval(60).grace_period(120),
    )
    .enter()
    .unwrap();
    let heartbeat = supplied.storage().as_heartbeat().unwrap();
    assert_eq!(heartbeat.heartbeat_interval(), Some(60));
    assert!(enter(StorageMode::Journal).storage().as_heartbeat().is_none());
}

#[test]
fn backend_errors_pass_through_unchanged() {
    let err = StorageSupplier::new(StorageMode::Sqlite, SupplierOptions::new().grace_period(10))
        .enter()
        .err()
        .unwrap();
    assert!(matches!(err, CoreError::InvalidArgument(ref m) if m.contains("grace_period")));
}

#[test]
fn explicit_spec_skips_resolution() {
    let supplied = StorageSupplier::from_spec(StorageSpec::JournalRedis {
        client: None,
        prefix: "explicit".into(),
    })
    .enter()
    .unwrap();
    assert_eq!(supplied.mode(), StorageMode::JournalRedis);
}
