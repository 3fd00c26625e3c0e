//! Counts files in the temp directory, so it runs alone in its own binary.

use std::fs;
use std::path::Path;

use domain::{StudyDirection, StudyStorage};
use storage_testing::{StorageSupplier, SupplierOptions, STORAGE_MODES};

fn count_with_prefix(dir: &Path, prefix: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .count()
}

#[test]
fn each_mode_allocates_at_most_one_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("TMPDIR", dir.path());

    for mode in STORAGE_MODES {
        let prefix = format!("{mode}-");
        let expected = usize::from(mode.is_file_backed());
        assert_eq!(count_with_prefix(dir.path(), &prefix), 0, "{mode}");

        let supplied = StorageSupplier::new(mode, SupplierOptions::new())
            .enter()
            .unwrap();
        supplied
            .storage()
            .create_new_study(&[StudyDirection::Minimize], Some("count"))
            .unwrap();
        assert_eq!(count_with_prefix(dir.path(), &prefix), expected, "{mode}");
        if let Some(path) = supplied.temp_path() {
            assert_eq!(path.parent(), Some(dir.path()), "{mode}");
        }

        drop(supplied);
        assert_eq!(count_with_prefix(dir.path(), &prefix), 0, "{mode}");
    }
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}
