//! Backend selection from configuration

use super::{
    Fields, MemoryStore, RedisStore, Session, SqliteStore, StateRecord, StateStore, StoreResult,
    Version,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Check if running in production environment
fn is_production() -> bool {
    std::env::var("RECALL_ENV")
        .map(|v| v.to_lowercase() == "production")
        .unwrap_or(false)
}

/// Check if production safety bypass is enabled
fn is_production_bypass_enabled() -> bool {
    std::env::var("RECALL_ALLOW_MEMORY_STORE_IN_PRODUCTION")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// State store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreBackendConfig {
    /// Backend type: "sqlite" (default), "redis", or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database path (relative paths resolve against the data directory)
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Redis URL (only used when backend = "redis")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Redis key prefix
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,

    /// How long SQLite waits for a connection or lock, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> String {
    "state.db".to_string()
}

fn default_redis_prefix() -> String {
    "recall:".to_string()
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Unified backend that wraps the concrete store implementations
pub enum StoreBackend {
    /// SQLite storage (default)
    Sqlite(SqliteStore),
    /// Redis storage (shared across hosts)
    Redis(RedisStore),
    /// In-memory storage (for testing only)
    Memory(MemoryStore),
}

impl StoreBackend {
    /// Create a backend from configuration
    ///
    /// `data_dir` anchors a relative `sqlite_path`.
    pub async fn from_config(config: &StoreBackendConfig, data_dir: &Path) -> Result<Self> {
        match config.backend.as_str() {
            "sqlite" => {
                let path = resolve_path(data_dir, &config.sqlite_path);
                let timeout = Duration::from_millis(config.acquire_timeout_ms);
                let store = SqliteStore::with_options(&path, timeout).await?;
                Ok(Self::Sqlite(store))
            }
            "redis" => {
                let url = config.redis_url.as_deref().unwrap_or("redis://localhost:6379");
                let store = RedisStore::with_prefix(url, &config.redis_prefix)?;
                info!(prefix = %config.redis_prefix, "Redis state store configured");
                Ok(Self::Redis(store))
            }
            "memory" => {
                if is_production() {
                    if !is_production_bypass_enabled() {
                        return Err(Error::Configuration(
                            "memory store is not allowed in production; use 'sqlite' or 'redis'"
                                .to_string(),
                        ));
                    }
                    warn!(
                        "SECURITY WARNING: memory store used in production with safety bypass; \
                         state will not survive a restart"
                    );
                }
                Ok(Self::Memory(MemoryStore::new()))
            }
            other => Err(Error::Configuration(format!(
                "Unknown store backend: '{}'. Use 'sqlite', 'redis', or 'memory'.",
                other
            ))),
        }
    }

    /// Backend name, for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Redis(_) => "redis",
            Self::Memory(_) => "memory",
        }
    }
}

fn resolve_path(data_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

#[async_trait]
impl StateStore for StoreBackend {
    async fn get(&self, session_id: &str) -> StoreResult<Option<StateRecord>> {
        match self {
            Self::Sqlite(store) => store.get(session_id).await,
            Self::Redis(store) => store.get(session_id).await,
            Self::Memory(store) => store.get(session_id).await,
        }
    }

    async fn put(
        &self,
        session_id: &str,
        fields: &Fields,
        expected_version: Version,
    ) -> StoreResult<Version> {
        match self {
            Self::Sqlite(store) => store.put(session_id, fields, expected_version).await,
            Self::Redis(store) => store.put(session_id, fields, expected_version).await,
            Self::Memory(store) => store.put(session_id, fields, expected_version).await,
        }
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        match self {
            Self::Sqlite(store) => store.delete(session_id).await,
            Self::Redis(store) => store.delete(session_id).await,
            Self::Memory(store) => store.delete(session_id).await,
        }
    }

    async fn touch(&self, session_id: &str) -> StoreResult<Session> {
        match self {
            Self::Sqlite(store) => store.touch(session_id).await,
            Self::Redis(store) => store.touch(session_id).await,
            Self::Memory(store) => store.touch(session_id).await,
        }
    }

    async fn session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        match self {
            Self::Sqlite(store) => store.session(session_id).await,
            Self::Redis(store) => store.session(session_id).await,
            Self::Memory(store) => store.session(session_id).await,
        }
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        match self {
            Self::Sqlite(store) => store.list_keys().await,
            Self::Redis(store) => store.list_keys().await,
            Self::Memory(store) => store.list_keys().await,
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        match self {
            Self::Sqlite(store) => store.health_check().await,
            Self::Redis(store) => store.health_check().await,
            Self::Memory(store) => store.health_check().await,
        }
    }
}
