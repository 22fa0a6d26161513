//! Engine configuration loaded from JSON.
//!
//! # Invariants
//! - Every field has a default; an empty object is a valid config.
//! - Relative database paths resolve against the config file's directory.

use crate::db::{open_db_with, DbError, DbOptions};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_FILE: &str = "tally.sqlite3";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// How long a writer waits for the SQLite lock.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_FILE),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rolling log files; logging stays off when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Configuration loading and database opening failures.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Invalid(String),
    Db(DbError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "io failure at `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "invalid config `{}`: {source}", path.display())
            }
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Db(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<DbError> for ConfigError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl EngineConfig {
    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.database.path = resolve(base, &config.database.path);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path cannot be empty".to_string()));
        }
        if self.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.busy_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            busy_timeout: Duration::from_millis(self.database.busy_timeout_ms),
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || base.as_os_str().is_empty() {
        return path.to_path_buf();
    }
    base.join(path)
}

/// Opens the configured database, applying migrations.
pub fn open_configured(config: &EngineConfig) -> Result<Connection, ConfigError> {
    config.validate()?;
    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(open_db_with(&config.database.path, &config.db_options())?)
}

#[cfg(test)]
mod tests {
    use super::{open_configured, ConfigError, EngineConfig};
    use std::path::PathBuf;

    #[test]
    fn empty_object_uses_defaults() {
        let config = EngineConfig::from_json("{}").expect("empty config parses");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(config.logging.dir.is_none());
    }

    #[test]
    fn relative_database_path_resolves_next_to_config() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("engine.json");
        std::fs::write(
            &config_path,
            r#"{"database": {"path": "data/tally.db", "busy_timeout_ms": 250}}"#,
        )
        .expect("write config");

        let config = EngineConfig::load(&config_path).expect("load config");
        assert_eq!(config.database.path, dir.path().join("data/tally.db"));
        assert_eq!(config.db_options().busy_timeout.as_millis(), 250);
    }

    #[test]
    fn zero_busy_timeout_is_rejected() {
        let mut config = EngineConfig::default();
        config.database.busy_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn open_configured_creates_migrated_database() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = EngineConfig::default();
        config.database.path = dir.path().join("nested").join("tally.sqlite3");
        let conn = open_configured(&config).expect("open configured");
        let version: u32 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .expect("user_version");
        assert_eq!(version, crate::db::migrations::latest_version());
        assert!(PathBuf::from(&config.database.path).exists());
    }

    #[test]
    fn missing_file_reports_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = EngineConfig::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
