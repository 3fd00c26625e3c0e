//! Append-only JSON-lines journal on the local filesystem.
//!
//! Appends are serialized across processes with an open-lock: a sibling
//! `{path}.lock` file created exclusively and removed on release. A lock
//! older than its grace period is treated as abandoned and broken.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use domain::CoreError;
use tracing::{debug, warn};

use crate::JournalBackend;

/// Locks older than this are considered abandoned.
pub const LOCK_GRACE_PERIOD: Duration = Duration::from_secs(30);

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(1);

pub struct JournalFileBackend {
    path: PathBuf,
    lock: JournalFileOpenLock,
    cursor: Mutex<ReadCursor>,
}

/// Position of the next unread line.
#[derive(Default)]
struct ReadCursor {
    log_number: usize,
    offset: u64,
}

impl JournalFileBackend {
    /// Open `path`, creating an empty journal when it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "opened journal file");
        Ok(Self {
            lock: JournalFileOpenLock::new(&path),
            path,
            cursor: Mutex::new(ReadCursor::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cursor(&self) -> Result<MutexGuard<'_, ReadCursor>, CoreError> {
        self.cursor
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl JournalBackend for JournalFileBackend {
    fn append_logs(&self, logs: &[serde_json::Value]) -> Result<(), CoreError> {
        let mut buf = String::new();
        for log in logs {
            buf.push_str(&serde_json::to_string(log)?);
            buf.push('\n');
        }
        let _guard = self.lock.acquire()?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn read_logs(&self, log_number_from: usize) -> Result<Vec<serde_json::Value>, CoreError> {
        let mut cursor = self.cursor()?;
        if log_number_from < cursor.log_number {
            *cursor = ReadCursor::default();
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(cursor.offset))?;
        let mut reader = BufReader::new(file);

        let mut logs = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            // A line without its newline is still being written.
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            let log_number = cursor.log_number;
            cursor.log_number += 1;
            cursor.offset += n as u64;
            if log_number >= log_number_from {
                logs.push(serde_json::from_str(line.trim_end())?);
            }
        }
        Ok(logs)
    }
}

/// Cross-process mutex built on exclusive file creation.
pub struct JournalFileOpenLock {
    lock_path: PathBuf,
    grace_period: Duration,
}

impl JournalFileOpenLock {
    pub fn new(journal_path: &Path) -> Self {
        let mut lock_path = journal_path.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            grace_period: LOCK_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Block until the lock file could be created.
    pub fn acquire(&self) -> Result<OpenLockGuard<'_>, CoreError> {
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(_) => {
                    return Ok(OpenLockGuard {
                        path: &self.lock_path,
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale() {
                        warn!(path = %self.lock_path.display(), "breaking stale journal lock");
                        if let Err(err) = fs::remove_file(&self.lock_path) {
                            if err.kind() != ErrorKind::NotFound {
                                return Err(err.into());
                            }
                        }
                        continue;
                    }
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn is_stale(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > self.grace_period)
    }
}

/// Removes the lock file when dropped.
pub struct OpenLockGuard<'a> {
    path: &'a Path,
}

impl Drop for OpenLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release journal lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_and_reads_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JournalFileBackend::open(dir.path().join("journal.log")).unwrap();
        backend.append_logs(&[json!({"a": 1}), json!({"a": 2})]).unwrap();
        backend.append_logs(&[json!({"a": 3})]).unwrap();

        assert_eq!(backend.read_logs(0).unwrap().len(), 3);
        assert_eq!(backend.read_logs(2).unwrap(), vec![json!({"a": 3})]);
        assert!(backend.read_logs(3).unwrap().is_empty());
        // Rewinding restarts from the top of the file.
        assert_eq!(backend.read_logs(1).unwrap()[0], json!({"a": 2}));
        assert!(!backend.lock.lock_path().exists());
    }

    #[test]
    fn partial_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let backend = JournalFileBackend::open(&path).unwrap();
        backend.append_logs(&[json!(1)]).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"half\":").unwrap();

        assert_eq!(backend.read_logs(0).unwrap(), vec![json!(1)]);
        file.write_all(b" true}\n").unwrap();
        assert_eq!(backend.read_logs(1).unwrap(), vec![json!({"half": true})]);
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let lock = JournalFileOpenLock::new(&path).with_grace_period(Duration::ZERO);
        fs::write(lock.lock_path(), b"").unwrap();
        thread::sleep(Duration::from_millis(20));

        let guard = lock.acquire().unwrap();
        assert!(lock.lock_path().exists());
        drop(guard);
        assert!(!lock.lock_path().exists());
    }

    #[test]
    fn lock_path_is_a_sibling() {
        let lock = JournalFileOpenLock::new(Path::new("/tmp/j.log"));
        assert_eq!(lock.lock_path(), Path::new("/tmp/j.log.lock"));
    }
}
