use std::path::PathBuf;

use super::optional_env;
use crate::error::ConfigError;

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseBackend {
    /// libSQL embedded database file (default).
    #[default]
    LibSql,
    /// Process-local maps. Nothing survives a restart.
    Memory,
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LibSql => write!(f, "libsql"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "libsql" | "turso" | "sqlite" => Ok(Self::LibSql),
            "memory" | "mem" | "in-memory" => Ok(Self::Memory),
            _ => Err(format!(
                "invalid database backend '{}', expected 'libsql' or 'memory'",
                s
            )),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Path to the libSQL database file.
    pub libsql_path: PathBuf,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend: DatabaseBackend = if let Some(b) = optional_env("DATABASE_BACKEND")? {
            b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: e,
            })?
        } else {
            DatabaseBackend::default()
        };

        let libsql_path = optional_env("LIBSQL_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_libsql_path);

        Ok(Self {
            backend,
            libsql_path,
        })
    }
}

/// Default libSQL database path (`./interview.db`).
pub fn default_libsql_path() -> PathBuf {
    PathBuf::from("interview.db")
}
