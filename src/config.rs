use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult, ErrorKind};

pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_CHARSET: &str = "utf8";
pub const DEFAULT_COLLATION: &str = "utf8_bin";
pub const DEFAULT_MEMORY_LIMIT: &str = "128M";

/// Top-level folder holding user data (uploads, backups, caches).
pub const USER_DATA_DIR: &str = "MyFiles";
/// Top-level folder with code generated at runtime; never archived.
pub const GENERATED_DIR: &str = "Dinamic";

const ENV_PREFIX: &str = "SITEBACKUP_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Mysql,
    Postgresql,
}

impl EngineType {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::Mysql => "mysql",
            EngineType::Postgresql => "postgresql",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            EngineType::Mysql => DEFAULT_MYSQL_PORT,
            EngineType::Postgresql => 5432,
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(EngineType::Mysql),
            "postgresql" | "postgres" | "pgsql" => Ok(EngineType::Postgresql),
            other => Err(AppError::of(
                ErrorKind::UnsupportedEngine,
                format!("Unknown database engine: {other}"),
            )),
        }
    }
}

/// Connection coordinates for the database being backed up or restored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConnectionConfig {
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_engine")]
    pub engine: EngineType,
}

fn default_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

fn default_engine() -> EngineType {
    EngineType::Mysql
}

impl fmt::Debug for DatabaseConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnectionConfig")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("engine", &self.engine)
            .finish()
    }
}

impl DatabaseConnectionConfig {
    /// Fails unless the engine is the one the dump format targets.
    pub fn ensure_supported(&self) -> AppResult<()> {
        if self.engine != EngineType::Mysql {
            return Err(AppError::of(
                ErrorKind::UnsupportedEngine,
                "Only MySQL/MariaDB databases can be backed up",
            )
            .with_context("engine", self.engine.as_str()));
        }
        Ok(())
    }

    pub fn uses_default_port(&self) -> bool {
        self.port == self.engine.default_port()
    }
}

/// Everything the engine reads from the host application's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConnectionConfig,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default = "default_collation")]
    pub collation: String,
    /// Application root: the tree that is archived and restored into.
    pub base_dir: PathBuf,
    /// Memory ceiling in `php.ini` notation (`-1`, `512M`, `1G`, bytes).
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

fn default_collation() -> String {
    DEFAULT_COLLATION.to_string()
}

fn default_memory_limit() -> String {
    DEFAULT_MEMORY_LIMIT.to_string()
}

impl Settings {
    /// Load settings from `SITEBACKUP_*` environment variables.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Load settings from a JSON document on disk.
    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_settings")
                .with_context("path", path.display().to_string())
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "parse_settings")
                .with_context("path", path.display().to_string())
        })
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = lookup("DB_NAME").filter(|value| !value.trim().is_empty()).ok_or_else(|| {
            AppError::new("CONFIG/MISSING", "Database name is not configured")
                .with_context("variable", format!("{ENV_PREFIX}DB_NAME"))
        })?;
        let engine = match lookup("DB_TYPE") {
            Some(raw) => raw.parse::<EngineType>()?,
            None => EngineType::Mysql,
        };
        let port = match lookup("DB_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|err| {
                AppError::new("CONFIG/INVALID", format!("Invalid database port: {err}"))
                    .with_context("value", raw.clone())
            })?,
            None => engine.default_port(),
        };

        Ok(Settings {
            database: DatabaseConnectionConfig {
                name,
                user: lookup("DB_USER").unwrap_or_else(|| "root".to_string()),
                password: lookup("DB_PASS").unwrap_or_default(),
                host: lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                port,
                engine,
            },
            charset: lookup("DB_CHARSET").unwrap_or_else(default_charset),
            collation: lookup("DB_COLLATION").unwrap_or_else(default_collation),
            base_dir: lookup("BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            memory_limit: lookup("MEMORY_LIMIT").unwrap_or_else(default_memory_limit),
        })
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join(USER_DATA_DIR).join("Backups")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join(USER_DATA_DIR).join("Cache")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join(USER_DATA_DIR).join("Tmp")
    }
}
