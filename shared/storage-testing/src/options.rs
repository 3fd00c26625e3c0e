//! Typed extra configuration and its resolution against a mode.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use domain::CoreError;
use journal_adapter::RedisClient;
use sqlite_adapter::{EngineOptions, RdbOptions};

use crate::mode::StorageMode;

/// Busy timeout given to every supplied SQLite connection.
pub const SQLITE3_TIMEOUT: Duration = Duration::from_secs(300);

/// Key prefix used by supplied key-value journals unless one is given.
pub const DEFAULT_REDIS_PREFIX: &str = "";

/// Optional settings forwarded to the backend constructor.
///
/// Each mode accepts only the fields that make sense for it; see
/// [`SupplierOptions::resolve`].
#[derive(Clone, Default)]
pub struct SupplierOptions {
    /// Seconds between trial heartbeats (sqlite family).
    pub heartbeat_interval: Option<u64>,
    /// Seconds before a silent running trial is stale (sqlite family).
    pub grace_period: Option<u64>,
    /// Pre-built client for `journal_redis`; a fresh fake otherwise.
    pub redis_client: Option<Arc<dyn RedisClient>>,
    /// Key prefix for `journal_redis`.
    pub redis_prefix: Option<String>,
}

impl fmt::Debug for SupplierOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupplierOptions")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("grace_period", &self.grace_period)
            .field("redis_client", &self.redis_client.as_ref().map(|_| ".."))
            .field("redis_prefix", &self.redis_prefix)
            .finish()
    }
}

impl SupplierOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat_interval(mut self, seconds: u64) -> Self {
        self.heartbeat_interval = Some(seconds);
        self
    }

    pub fn grace_period(mut self, seconds: u64) -> Self {
        self.grace_period = Some(seconds);
        self
    }

    pub fn redis_client(mut self, client: Arc<dyn RedisClient>) -> Self {
        self.redis_client = Some(client);
        self
    }

    pub fn redis_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.redis_prefix = Some(prefix.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.has_heartbeat() && !self.has_redis()
    }

    fn has_heartbeat(&self) -> bool {
        self.heartbeat_interval.is_some() || self.grace_period.is_some()
    }

    fn has_redis(&self) -> bool {
        self.redis_client.is_some() || self.redis_prefix.is_some()
    }

    /// Turn these options into a concrete backend description for `mode`,
    /// rejecting settings the backend does not take.
    pub fn resolve(self, mode: StorageMode) -> Result<StorageSpec, CoreError> {
        match mode {
            StorageMode::InMemory => {
                if !self.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "in-memory storage does not accept any options".into(),
                    ));
                }
                Ok(StorageSpec::InMemory)
            }
            StorageMode::Sqlite | StorageMode::CachedSqlite => {
                if self.has_redis() {
                    return Err(CoreError::InvalidArgument(format!(
                        "{mode} storage does not accept redis options"
                    )));
                }
                let options = RdbOptions {
                    engine: EngineOptions {
                        connect_timeout: SQLITE3_TIMEOUT,
                    },
                    heartbeat_interval: self.heartbeat_interval,
                    grace_period: self.grace_period,
                };
                Ok(if mode == StorageMode::Sqlite {
                    StorageSpec::Sqlite(options)
                } else {
                    StorageSpec::CachedSqlite(options)
                })
            }
            StorageMode::Journal => {
                if !self.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "journal file storage does not accept any options".into(),
                    ));
                }
                Ok(StorageSpec::Journal)
            }
            StorageMode::JournalRedis => {
                if self.has_heartbeat() {
                    return Err(CoreError::InvalidArgument(
                        "journal storage does not support heartbeats".into(),
                    ));
                }
                Ok(StorageSpec::JournalRedis {
                    client: self.redis_client,
                    prefix: self
                        .redis_prefix
                        .unwrap_or_else(|| DEFAULT_REDIS_PREFIX.to_string()),
                })
            }
        }
    }
}

/// Fully resolved backend description.
#[derive(Clone)]
pub enum StorageSpec {
    InMemory,
    Sqlite(RdbOptions),
    CachedSqlite(RdbOptions),
    Journal,
    JournalRedis {
        client: Option<Arc<dyn RedisClient>>,
        prefix: String,
    },
}

impl StorageSpec {
    pub fn mode(&self) -> StorageMode {
        match self {
            StorageSpec::InMemory => StorageMode::InMemory,
            StorageSpec::Sqlite(_) => StorageMode::Sqlite,
            StorageSpec::CachedSqlite(_) => StorageMode::CachedSqlite,
            StorageSpec::Journal => StorageMode::Journal,
            StorageSpec::JournalRedis { .. } => StorageMode::JournalRedis,
        }
    }
}

impl fmt::Debug for StorageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageSpec::Sqlite(o) | StorageSpec::CachedSqlite(o) => f
                .debug_tuple(self.mode().as_str())
                .field(o)
                .finish(),
            StorageSpec::JournalRedis { client, prefix } => f
                .debug_struct(self.mode().as_str())
                .field("client", &client.as_ref().map(|_| ".."))
                .field("prefix", prefix)
                .finish(),
            StorageSpec::InMemory | StorageSpec::Journal => f.write_str(self.mode().as_str()),
        }
    }
}
