//! Storage supplier for tests that must run against every backend.
//!
//! ```no_run
//! use domain::{StudyDirection, StudyStorage};
//! use storage_testing::{StorageSupplier, SupplierOptions, STORAGE_MODES};
//!
//! for mode in STORAGE_MODES {
//!     StorageSupplier::new(mode, SupplierOptions::new())
//!         .scope(|storage| {
//!             let study_id = storage
//!                 .create_new_study(&[StudyDirection::Minimize], Some("demo"))
//!                 .unwrap();
//!             assert_eq!(storage.get_study_name_from_id(study_id).unwrap(), "demo");
//!         })
//!         .unwrap();
//! }
//! ```

mod handle;
mod mode;
mod options;
mod supplier;

pub use handle::StorageHandle;
pub use mode::{StorageMode, STORAGE_MODES, STORAGE_MODES_HEARTBEAT};
pub use options::{StorageSpec, SupplierOptions, DEFAULT_REDIS_PREFIX, SQLITE3_TIMEOUT};
pub use supplier::{StorageSupplier, SuppliedStorage};
