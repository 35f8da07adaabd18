//! SQLite state storage backend
//!
//! The default backend: embedded, no external services, survives restarts.
//!
//! # Usage
//!
//! ```no_run
//! use recall_core::store::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Default location: ~/.recall/state.db
//! let store = SqliteStore::new_default().await?;
//!
//! // Or specify a custom path
//! let store = SqliteStore::new("/path/to/state.db").await?;
//! # Ok(())
//! # }
//! ```

use super::{Fields, Session, StateRecord, StateStore, StoreError, StoreResult, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time to wait for a pooled connection or a database lock
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(sqlx::FromRow)]
struct RecordRow {
    session_id: String,
    fields: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RecordRow> for StateRecord {
    type Error = StoreError;

    fn try_from(r: RecordRow) -> StoreResult<Self> {
        Ok(Self {
            fields: serde_json::from_str(&r.fields)?,
            version: r.version.max(0) as Version,
            created_at: parse_timestamp(&r.created_at)?,
            updated_at: parse_timestamp(&r.updated_at)?,
            session_id: r.session_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    created_at: String,
    last_seen_at: String,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(r: SessionRow) -> StoreResult<Self> {
        Ok(Self {
            created_at: parse_timestamp(&r.created_at)?,
            last_seen_at: parse_timestamp(&r.last_seen_at)?,
            session_id: r.session_id,
        })
    }
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Connection-level failures are retryable; a locked database is too.
fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            if msg.contains("locked") || msg.contains("busy") {
                StoreError::Unavailable(e.to_string())
            } else {
                StoreError::Backend(e.to_string())
            }
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

/// SQLite state store
///
/// One row per session in `state_records`; session bookkeeping lives in
/// `sessions` so touching a session never bumps the record version.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store at the specified path
    ///
    /// # Errors
    ///
    /// Returns error if database creation or schema setup fails.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_options(path, DEFAULT_ACQUIRE_TIMEOUT).await
    }

    /// Open a store with a custom connection/lock timeout
    pub async fn with_options(path: impl AsRef<Path>, acquire_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StoreError::Backend(format!("Invalid SQLite path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(acquire_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(path = %path.display(), "SQLite state store initialized");
        Ok(store)
    }

    /// Open a store at the default location (~/.recall/state.db)
    pub async fn new_default() -> StoreResult<Self> {
        let path = Self::default_path()?;
        Self::new(&path).await
    }

    /// Get the default database path
    pub fn default_path() -> StoreResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| StoreError::Backend("Could not determine home directory".to_string()))?;
        Ok(home.join(".recall").join("state.db"))
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_records (
                session_id TEXT PRIMARY KEY,
                fields     TEXT NOT NULL,
                version    INTEGER NOT NULL,
                deleted    INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id   TEXT PRIMARY KEY,
                created_at   TEXT NOT NULL,
                last_seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!("SQLite state schema initialized");
        Ok(())
    }

    async fn current_version(&self, session_id: &str) -> StoreResult<Version> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM state_records WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(row.map_or(0, |(v,)| v.max(0) as Version))
    }

    /// Close the pool, waiting for in-flight queries
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<StateRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT session_id, fields, version, created_at, updated_at \
             FROM state_records WHERE session_id = ? AND deleted = 0",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let record = StateRecord::try_from(row)?;
                debug!(session_id = %session_id, version = record.version, "State record loaded from SQLite");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        session_id: &str,
        fields: &Fields,
        expected_version: Version,
    ) -> StoreResult<Version> {
        let data = serde_json::to_string(fields)?;
        let now = Utc::now().to_rfc3339();

        // Each branch is a single statement, so the version check and the
        // write cannot interleave with another writer. A deleted row keeps
        // its version and a re-create continues from it.
        let written: Option<(i64,)> = if expected_version == 0 {
            sqlx::query_as(
                r#"
                INSERT INTO state_records (session_id, fields, version, deleted, created_at, updated_at)
                VALUES (?, ?, 1, 0, ?, ?)
                ON CONFLICT(session_id) DO UPDATE SET
                    fields = excluded.fields,
                    version = state_records.version + 1,
                    deleted = 0,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at
                WHERE state_records.deleted = 1
                RETURNING version
                "#,
            )
            .bind(session_id)
            .bind(&data)
            .bind(&now)
            .bind(&now)
            .fetch_optional(&self.pool)
            .await
        } else {
            sqlx::query_as(
                r#"
                UPDATE state_records
                SET fields = ?, version = version + 1, updated_at = ?
                WHERE session_id = ? AND version = ? AND deleted = 0
                RETURNING version
                "#,
            )
            .bind(&data)
            .bind(&now)
            .bind(session_id)
            .bind(expected_version as i64)
            .fetch_optional(&self.pool)
            .await
        }
        .map_err(map_sqlx_error)?;

        let Some((version,)) = written else {
            let actual = self.current_version(session_id).await?;
            warn!(
                session_id = %session_id,
                expected = expected_version,
                actual = actual,
                "Version conflict on SQLite put"
            );
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                actual,
            });
        };

        let version = version.max(0) as Version;
        debug!(session_id = %session_id, version = version, "State record saved to SQLite");
        Ok(version)
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        // Tombstone rather than DELETE so the version never goes backwards
        let result = sqlx::query(
            r#"
            UPDATE state_records
            SET fields = '{}', version = version + 1, deleted = 1, updated_at = ?
            WHERE session_id = ? AND deleted = 0
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        debug!(session_id = %session_id, "State record deleted from SQLite");
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> StoreResult<Session> {
        let now = Utc::now().to_rfc3339();
        let row: SessionRow = sqlx::query_as(
            r#"
            INSERT INTO sessions (session_id, created_at, last_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET last_seen_at = excluded.last_seen_at
            RETURNING session_id, created_at, last_seen_at
            "#,
        )
        .bind(session_id)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Session::try_from(row)
    }

    async fn session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT session_id, created_at, last_seen_at FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(Session::try_from).transpose()
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT session_id FROM state_records WHERE deleted = 0 ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
