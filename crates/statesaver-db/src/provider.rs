//! Storage providers: where a store's `SQLite` database lives.
//!
//! [`StorageProvider`] is the capability interface the store is written
//! against. A provider knows how to connect to its database, how to move a
//! corrupt database out of the way, and how to destroy it. The store,
//! migrator and swap protocol never branch on the concrete provider.
//!
//! | Provider | Backing | Use |
//! |----------|---------|-----|
//! | [`FileProvider`] | `SQLite` file in WAL mode | production |
//! | [`MemoryProvider`] | private in-memory database on one connection | tests, throwaway sessions |
//!
//! A [`MemoryProvider`] pool has exactly one connection, so every query on
//! it waits for the one before to release the connection. Long readers
//! should page with [`EventStore::replay_page`](crate::EventStore::replay_page)
//! rather than hold a stream open.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::DbError;

/// Default maximum number of pooled connections for file databases.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Default time a connection waits on a locked database.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Files `SQLite` keeps next to the main database file.
const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Size of the zero block used when scrubbing a database file.
const SCRUB_BLOCK: usize = 64 * 1024;

/// Which provider implementation to use, as named in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// [`FileProvider`].
    #[default]
    File,
    /// [`MemoryProvider`].
    Memory,
}

impl FromStr for ProviderKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(DbError::Config(format!("unknown storage provider `{other}`"))),
        }
    }
}

/// Capability interface over a backing database.
pub trait StorageProvider: Send + Sync + fmt::Debug {
    /// Human-readable location used in logs and reports.
    fn describe(&self) -> String;

    /// Connection options for the database.
    fn connect_options(&self) -> Result<SqliteConnectOptions, DbError>;

    /// Pool options for the database.
    fn pool_options(&self) -> SqlitePoolOptions;

    /// Move a database that failed to open out of the way.
    ///
    /// Returns where it went, or `None` if there was nothing to move.
    fn quarantine(&self) -> Result<Option<PathBuf>, DbError>;

    /// Irreversibly remove the database and its side files.
    fn destroy(&self) -> Result<(), DbError>;
}

/// A `SQLite` database file.
#[derive(Debug, Clone)]
pub struct FileProvider {
    path: PathBuf,
    max_connections: u32,
    busy_timeout: Duration,
}

impl FileProvider {
    /// Create a provider for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Set the maximum number of pooled connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set how long a connection waits on a locked database.
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn side_file(&self, suffix: &str) -> PathBuf {
        with_suffix(&self.path, suffix)
    }
}

impl StorageProvider for FileProvider {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions, DbError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(self.busy_timeout))
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        SqlitePoolOptions::new().max_connections(self.max_connections)
    }

    fn quarantine(&self) -> Result<Option<PathBuf>, DbError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stamp = format!(".corrupt.{}", chrono::Utc::now().timestamp_millis());
        let target = with_suffix(&self.path, &stamp);
        fs::rename(&self.path, &target)?;

        for suffix in SIDE_FILE_SUFFIXES {
            let side = self.side_file(suffix);
            if side.exists() {
                fs::rename(&side, with_suffix(&target, suffix))?;
            }
        }

        tracing::warn!(
            from = %self.path.display(),
            to = %target.display(),
            "Quarantined unreadable database"
        );
        Ok(Some(target))
    }

    fn destroy(&self) -> Result<(), DbError> {
        scrub_and_remove(&self.path)?;
        for suffix in SIDE_FILE_SUFFIXES {
            remove_if_exists(&self.side_file(suffix))?;
        }
        tracing::info!(path = %self.path.display(), "Destroyed database file");
        Ok(())
    }
}

/// A private in-memory database.
///
/// The pool pins a single connection that never idles out, so the
/// database lives exactly as long as the store that opened it.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    label: String,
}

impl MemoryProvider {
    /// Create an in-memory provider; `label` only appears in logs.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl StorageProvider for MemoryProvider {
    fn describe(&self) -> String {
        format!("memory:{}", self.label)
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions, DbError> {
        Ok(SqliteConnectOptions::from_str("sqlite::memory:")?)
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    }

    fn quarantine(&self) -> Result<Option<PathBuf>, DbError> {
        Ok(None)
    }

    fn destroy(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Append `suffix` to the final component of `path`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Overwrite the file with zeros, flush it, then unlink it.
fn scrub_and_remove(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut file = OpenOptions::new().write(true).open(path)?;
    let block = vec![0_u8; SCRUB_BLOCK];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = usize::try_from(remaining).map_or(SCRUB_BLOCK, |r| r.min(SCRUB_BLOCK));
        file.write_all(block.get(..chunk).unwrap_or(&block))?;
        remaining = remaining.saturating_sub(u64::try_from(chunk).unwrap_or(remaining));
    }
    file.sync_all()?;
    drop(file);

    fs::remove_file(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_moves_file_and_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sqlite");
        fs::write(&path, b"not a database").unwrap();
        fs::write(with_suffix(&path, "-wal"), b"stale wal").unwrap();

        let provider = FileProvider::new(&path);
        let target = provider.quarantine().unwrap().unwrap();

        assert!(!path.exists());
        assert!(target.exists());
        assert!(target.to_string_lossy().contains(".corrupt."));
        assert!(with_suffix(&target, "-wal").exists());
        assert!(!with_suffix(&path, "-wal").exists());
    }

    #[test]
    fn quarantine_without_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(dir.path().join("missing.sqlite"));
        assert!(provider.quarantine().unwrap().is_none());
    }

    #[test]
    fn destroy_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sqlite");
        fs::write(&path, vec![7_u8; SCRUB_BLOCK + 10]).unwrap();
        fs::write(with_suffix(&path, "-shm"), b"shm").unwrap();

        FileProvider::new(&path).destroy().unwrap();

        assert!(!path.exists());
        assert!(!with_suffix(&path, "-shm").exists());
    }

    #[test]
    fn destroy_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileProvider::new(dir.path().join("none.sqlite")).destroy().is_ok());
    }

    #[test]
    fn provider_kind_parses_lowercase() {
        let kind: ProviderKind = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(kind, ProviderKind::Memory);
        assert_eq!(ProviderKind::default(), ProviderKind::File);
        assert_eq!("File".parse::<ProviderKind>().unwrap(), ProviderKind::File);
        assert!(matches!(
            "postgres".parse::<ProviderKind>(),
            Err(DbError::Config(_))
        ));
    }
}
