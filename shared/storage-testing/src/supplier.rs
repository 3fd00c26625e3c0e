use std::io;
use std::path::Path;
use std::sync::Arc;

use domain::adapters::memory_repo::InMemoryStorage;
use domain::CoreError;
use journal_adapter::{FakeRedis, JournalFileBackend, JournalRedisBackend, JournalStorage};
use sqlite_adapter::{CachedStorage, RdbStorage};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::handle::StorageHandle;
use crate::mode::StorageMode;
use crate::options::{StorageSpec, SupplierOptions};

/// Builds one storage for the duration of a test scope.
///
/// Construction only records what to build. [`enter`](Self::enter) builds
/// the backend, allocating a temporary file for file-backed modes, and the
/// returned [`SuppliedStorage`] deletes that file when it goes away.
#[derive(Debug)]
pub struct StorageSupplier {
    request: Request,
}

#[derive(Debug)]
enum Request {
    Options(StorageMode, SupplierOptions),
    Spec(StorageSpec),
}

impl StorageSupplier {
    pub fn new(mode: StorageMode, options: SupplierOptions) -> Self {
        Self {
            request: Request::Options(mode, options),
        }
    }

    pub fn from_spec(spec: StorageSpec) -> Self {
        Self {
            request: Request::Spec(spec),
        }
    }

    /// Supplier for a textual mode identifier such as `"cached_sqlite"`.
    ///
    /// # Panics
    /// Panics when `specifier` is not one of the known modes; tests are
    /// expected to name modes from [`crate::STORAGE_MODES`] only.
    pub fn named(specifier: &str, options: SupplierOptions) -> Self {
        let Ok(mode) = specifier.parse::<StorageMode>() else {
            panic!("unrecognized storage mode: {specifier:?}");
        };
        Self::new(mode, options)
    }

    pub fn mode(&self) -> StorageMode {
        match &self.request {
            Request::Options(mode, _) => *mode,
            Request::Spec(spec) => spec.mode(),
        }
    }

    /// Build the storage. Fails with `InvalidArgument` when the options do
    /// not fit the mode; backend construction errors are passed through.
    pub fn enter(self) -> Result<SuppliedStorage, CoreError> {
        let spec = match self.request {
            Request::Options(mode, options) => options.resolve(mode)?,
            Request::Spec(spec) => spec,
        };
        let mode = spec.mode();

        let tempfile = if mode.is_file_backed() {
            Some(temp_file(mode)?)
        } else {
            None
        };
        let path = tempfile.as_ref().map(NamedTempFile::path);

        let storage = match spec {
            StorageSpec::InMemory => StorageHandle::InMemory(InMemoryStorage::new()),
            StorageSpec::Sqlite(options) => {
                StorageHandle::Rdb(RdbStorage::new(&sqlite_url(backing(path)?), options)?)
            }
            StorageSpec::CachedSqlite(options) => {
                let rdb = RdbStorage::new(&sqlite_url(backing(path)?), options)?;
                StorageHandle::Cached(CachedStorage::new(rdb))
            }
            StorageSpec::JournalRedis { client, prefix } => {
                let client = client.unwrap_or_else(|| Arc::new(FakeRedis::new()));
                let backend = JournalRedisBackend::with_client(client, prefix);
                StorageHandle::JournalRedis(JournalStorage::new(backend)?)
            }
            StorageSpec::Journal => {
                let backend = JournalFileBackend::open(backing(path)?)?;
                StorageHandle::Journal(JournalStorage::new(backend)?)
            }
        };

        let supplied = SuppliedStorage { storage, tempfile };
        debug!(%mode, temp_path = ?supplied.temp_path(), "entered storage scope");
        Ok(supplied)
    }

    /// Run `f` against the supplied storage, releasing it afterwards. The
    /// temporary file is removed even when `f` panics.
    pub fn scope<T>(self, f: impl FnOnce(&StorageHandle) -> T) -> Result<T, CoreError> {
        let supplied = self.enter()?;
        let out = f(supplied.storage());
        supplied.close()?;
        Ok(out)
    }
}

/// A live storage plus the temporary file backing it, if any.
pub struct SuppliedStorage {
    storage: StorageHandle,
    tempfile: Option<NamedTempFile>,
}

impl SuppliedStorage {
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn mode(&self) -> StorageMode {
        self.storage.mode()
    }

    /// Path of the backing temporary file while it is still held.
    pub fn temp_path(&self) -> Option<&Path> {
        self.tempfile.as_ref().map(NamedTempFile::path)
    }

    /// Delete the temporary file. Safe to call repeatedly.
    pub fn release(&mut self) -> io::Result<()> {
        match self.tempfile.take() {
            Some(file) => {
                let path = file.path().to_path_buf();
                file.close()?;
                debug!(path = %path.display(), "removed temporary storage file");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Release the temporary file, reporting a failure, and drop the storage.
    pub fn close(mut self) -> io::Result<()> {
        self.release()
    }
}

impl Drop for SuppliedStorage {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(mode = %self.storage.mode(), error = %err, "failed to remove temporary storage file");
        }
    }
}

fn temp_file(mode: StorageMode) -> Result<NamedTempFile, CoreError> {
    let file = tempfile::Builder::new()
        .prefix(&format!("{}-", mode.as_str()))
        .tempfile()?;
    Ok(file)
}

fn backing(path: Option<&Path>) -> Result<&Path, CoreError> {
    path.ok_or_else(|| CoreError::Repository("file-backed storage without a temporary file".into()))
}

fn sqlite_url(path: &Path) -> String {
    format!("sqlite:///{}", path.display())
}
