//! Journal kept in a Redis-compatible key-value store.
//!
//! Layout under `prefix`:
//! - `{prefix}:log_number` holds the number of appended records (`INCR`).
//! - `{prefix}:{n}` holds record `n` as a JSON string.
//!
//! Readers take the counter as the end of the journal and read every record
//! below it. A number that is reserved but not yet written is polled until
//! its record shows up or `reserved_wait` runs out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use domain::CoreError;
use tracing::warn;

use crate::JournalBackend;

/// The three commands the journal needs.
pub trait RedisClient: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CoreError>;
    /// Increment the integer at `key` (missing counts as 0) and return it.
    fn incr(&self, key: &str) -> Result<i64, CoreError>;
}

/// Process-local stand-in for a Redis server.
#[derive(Default)]
pub struct FakeRedis {
    data: Mutex<HashMap<String, String>>,
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, CoreError> {
        self.data
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl RedisClient for FakeRedis {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self.data()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.data()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn incr(&self, key: &str) -> Result<i64, CoreError> {
        let mut data = self.data()?;
        let current = match data.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                CoreError::Repository(format!("value at {key} is not an integer"))
            })?,
            None => 0,
        };
        let next = current + 1;
        data.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

/// How long a reader waits for a reserved record before giving up.
pub const RESERVED_RECORD_WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct JournalRedisBackend {
    client: Arc<dyn RedisClient>,
    prefix: String,
    reserved_wait: Duration,
}

impl JournalRedisBackend {
    pub fn with_client(client: Arc<dyn RedisClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            reserved_wait: RESERVED_RECORD_WAIT,
        }
    }

    pub fn with_reserved_wait(mut self, reserved_wait: Duration) -> Self {
        self.reserved_wait = reserved_wait;
        self
    }

    /// Connect to a real server, e.g. `redis://127.0.0.1:6379`.
    #[cfg(feature = "redis")]
    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, CoreError> {
        let client = ::redis::Client::open(url).map_err(map_redis_err)?;
        let conn = client.get_connection().map_err(map_redis_err)?;
        tracing::debug!(url, "connected journal to redis");
        Ok(Self::with_client(
            Arc::new(RedisConnection(Mutex::new(conn))),
            prefix,
        ))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn log_key(&self, log_number: usize) -> String {
        format!("{}:{}", self.prefix, log_number)
    }

    fn counter_key(&self) -> String {
        format!("{}:log_number", self.prefix)
    }

    /// Number of log numbers handed out so far.
    fn reserved_count(&self) -> Result<usize, CoreError> {
        match self.client.get(&self.counter_key())? {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| CoreError::Repository(format!("bad log counter {raw}"))),
            None => Ok(0),
        }
    }

    /// Record `log_number`, polling while its writer has not stored it yet.
    fn wait_for_record(&self, log_number: usize) -> Result<String, CoreError> {
        let key = self.log_key(log_number);
        let deadline = Instant::now() + self.reserved_wait;
        loop {
            if let Some(raw) = self.client.get(&key)? {
                return Ok(raw);
            }
            if Instant::now() >= deadline {
                warn!(key, "reserved journal record was never written");
                return Err(CoreError::Repository(format!(
                    "journal record {key} reserved but not written"
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl JournalBackend for JournalRedisBackend {
    fn append_logs(&self, logs: &[serde_json::Value]) -> Result<(), CoreError> {
        let counter = self.counter_key();
        for log in logs {
            let reserved = self.client.incr(&counter)?;
            let log_number = usize::try_from(reserved - 1)
                .map_err(|_| CoreError::Repository(format!("bad log counter {reserved}")))?;
            self.client
                .set(&self.log_key(log_number), &serde_json::to_string(log)?)?;
        }
        Ok(())
    }

    fn read_logs(&self, log_number_from: usize) -> Result<Vec<serde_json::Value>, CoreError> {
        let end = self.reserved_count()?;
        let mut logs = Vec::new();
        for log_number in log_number_from..end {
            let raw = self.wait_for_record(log_number)?;
            logs.push(serde_json::from_str(&raw)?);
        }
        Ok(logs)
    }
}

#[cfg(feature = "redis")]
fn map_redis_err(err: ::redis::RedisError) -> CoreError {
    CoreError::Repository(err.to_string())
}

/// A single blocking connection shared behind a mutex.
#[cfg(feature = "redis")]
pub struct RedisConnection(pub Mutex<::redis::Connection>);

#[cfg(feature = "redis")]
impl RedisConnection {
    fn conn(&self) -> Result<MutexGuard<'_, ::redis::Connection>, CoreError> {
        self.0
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

#[cfg(feature = "redis")]
impl RedisClient for RedisConnection {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        use ::redis::Commands;
        self.conn()?.get(key).map_err(map_redis_err)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoreError> {
        use ::redis::Commands;
        self.conn()?.set(key, value).map_err(map_redis_err)
    }

    fn incr(&self, key: &str) -> Result<i64, CoreError> {
        use ::redis::Commands;
        self.conn()?.incr(key, 1).map_err(map_redis_err)
    }
}
