//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage; persisted to a snapshot file across restarts.
    Memory,
    /// PostgreSQL storage.
    Postgres,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("postgres") {
            Self::Postgres
        } else {
            Self::Memory
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 8080)
    pub port: u16,
    /// Storage provider
    pub storage_provider: StorageProvider,
    /// PostgreSQL connection URL (required when using postgres storage)
    pub database_url: Option<String>,
    /// Snapshot file for the in-memory backend
    pub snapshot_path: PathBuf,
    /// Per-request deadline; unset means no deadline
    pub request_timeout: Option<Duration>,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let storage_provider = StorageProvider::from_str(
            &env::var("STORAGE_PROVIDER").unwrap_or_else(|_| "memory".into()),
        );

        let database_url = env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        if storage_provider == StorageProvider::Postgres && database_url.is_none() {
            return Err(ConfigError {
                field: "DATABASE_URL",
                message: "Required when STORAGE_PROVIDER=postgres".into(),
            });
        }

        let snapshot_path = env::var("SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/storage.json"));

        let request_timeout = match env::var("REQUEST_TIMEOUT_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| ConfigError {
                    field: "REQUEST_TIMEOUT_SECS",
                    message: format!("Invalid duration '{}': expected whole seconds", raw),
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            Err(_) => None,
        };

        let log_format =
            LogFormat::from_str(&env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".into()));

        Ok(Self {
            port,
            storage_provider,
            database_url,
            snapshot_path,
            request_timeout,
            log_format,
        })
    }

    /// Log warnings about configurations that lose data.
    pub fn warn_if_volatile(&self) {
        if self.storage_provider == StorageProvider::Memory {
            tracing::warn!(
                snapshot = %self.snapshot_path.display(),
                "STORAGE_PROVIDER=memory: state lives in process memory and is only \
                 persisted to the snapshot file on graceful shutdown"
            );
        }
    }
}
