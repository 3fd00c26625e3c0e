use std::fmt::{Display, Formatter};
use std::str::FromStr;

use domain::CoreError;

/// Which storage backend a supplier builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageMode {
    InMemory,
    Sqlite,
    CachedSqlite,
    Journal,
    JournalRedis,
}

/// Every supported mode, in the order tests iterate them.
pub const STORAGE_MODES: [StorageMode; 5] = StorageMode::ALL;

/// Modes whose storage supports trial heartbeats.
pub const STORAGE_MODES_HEARTBEAT: [StorageMode; 2] = StorageMode::HEARTBEAT;

impl StorageMode {
    pub const ALL: [StorageMode; 5] = [
        StorageMode::InMemory,
        StorageMode::Sqlite,
        StorageMode::CachedSqlite,
        StorageMode::Journal,
        StorageMode::JournalRedis,
    ];

    pub const HEARTBEAT: [StorageMode; 2] = [StorageMode::Sqlite, StorageMode::CachedSqlite];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::InMemory => "inmemory",
            StorageMode::Sqlite => "sqlite",
            StorageMode::CachedSqlite => "cached_sqlite",
            StorageMode::Journal => "journal",
            StorageMode::JournalRedis => "journal_redis",
        }
    }

    /// Whether the backend lives in a temporary file.
    pub fn is_file_backed(&self) -> bool {
        matches!(
            self,
            StorageMode::Sqlite | StorageMode::CachedSqlite | StorageMode::Journal
        )
    }

    pub fn supports_heartbeat(&self) -> bool {
        Self::HEARTBEAT.contains(self)
    }
}

impl Display for StorageMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = CoreError;

    /// Exact, case-sensitive match on the mode identifiers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unrecognized storage mode: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_round_trip() {
        for mode in STORAGE_MODES {
            assert_eq!(mode.as_str().parse::<StorageMode>().unwrap(), mode);
        }
    }

    #[test]
    fn parsing_is_exact() {
        assert!("SQLITE".parse::<StorageMode>().is_err());
        assert!("sqlite_cached".parse::<StorageMode>().is_err());
        assert!("".parse::<StorageMode>().is_err());
    }

    #[test]
    fn heartbeat_modes_are_the_sqlite_family() {
        assert_eq!(
            STORAGE_MODES_HEARTBEAT,
            [StorageMode::Sqlite, StorageMode::CachedSqlite]
        );
        assert!(!StorageMode::Journal.supports_heartbeat());
        assert!(StorageMode::Journal.is_file_backed());
        assert!(!StorageMode::JournalRedis.is_file_backed());
    }
}
