//! State storage backends
//!
//! A [`StateStore`] owns the durable [`StateRecord`] for each session and the
//! [`Session`] bookkeeping row next to it. Writes go through a
//! compare-and-swap on `version`:
//!
//! - `expected_version == 0` creates the record (fails if one exists)
//! - any other value succeeds only if the stored version matches, then
//!   bumps the version by one and refreshes `updated_at`
//!
//! Deleting leaves a tombstone that reads as absent but keeps the version
//! counting: the delete itself takes the next version and a later create
//! continues above it. A writer holding a version from before the delete
//! therefore always conflicts.
//!
//! Backends:
//! - [`SqliteStore`] (default, embedded, persists across restarts)
//! - [`RedisStore`] (shared across processes and hosts)
//! - [`MemoryStore`] (tests and local development only)

mod backend;
mod memory_store;
mod redis_store;
mod sqlite_store;

pub use backend::{StoreBackend, StoreBackendConfig};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Monotonic record version. `0` means "no record yet".
pub type Version = u64;

/// Flat mapping from attribute name to value.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Durable payload associated with a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Owning session
    pub session_id: String,
    /// Agent-defined facts
    pub fields: Fields,
    /// Bumped by one on every successful write
    pub version: Version,
    /// When the record was first written
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// Placeholder for a session that has never been written.
    #[must_use]
    pub fn empty(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            fields: Fields::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Identity thread bookkeeping, kept apart from the versioned record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque stable identifier
    pub session_id: String,
    /// First contact
    pub created_at: DateTime<Utc>,
    /// Most recent turn
    pub last_seen_at: DateTime<Utc>,
}

/// Storage boundary errors
///
/// Each variant is a distinct signal the caller must be able to match on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record for this session
    #[error("no state record for session '{0}'")]
    NotFound(String),

    /// Stored version did not match the writer's expected version
    #[error("version conflict for session '{session_id}': expected {expected}, found {actual}")]
    VersionConflict {
        /// Session being written
        session_id: String,
        /// Version the writer read
        expected: Version,
        /// Version currently stored, including a tombstone's (0 if never written)
        actual: Version,
    },

    /// Backend unreachable or timed out; retryable by the caller
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is a version conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Whether the backend could not be reached
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Store result alias
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable CRUD over state records, keyed by session id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the record for a session, `None` if it was never written
    async fn get(&self, session_id: &str) -> StoreResult<Option<StateRecord>>;

    /// Compare-and-swap write; returns the new version
    async fn put(
        &self,
        session_id: &str,
        fields: &Fields,
        expected_version: Version,
    ) -> StoreResult<Version>;

    /// Forget the record, leaving a tombstone that keeps its version
    ///
    /// `NotFound` if there is no live record.
    async fn delete(&self, session_id: &str) -> StoreResult<()>;

    /// Record contact with a session, creating its bookkeeping row if needed
    async fn touch(&self, session_id: &str) -> StoreResult<Session>;

    /// Fetch session bookkeeping
    async fn session(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// List ids of sessions that have a record (use with caution in production)
    async fn list_keys(&self) -> StoreResult<Vec<String>>;

    /// Check backend health
    async fn health_check(&self) -> StoreResult<()>;
}
