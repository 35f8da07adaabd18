//! Session State Manager
//!
//! Turn-scoped mediation between the agent loop and the [`StateStore`]:
//! load-on-entry, merge-on-update, save-on-exit.
//!
//! ## Commit protocol
//!
//! 1. `load` captures the record's fields and the version they were read at.
//! 2. `update` folds a [`Patch`] into the working copy.
//! 3. `commit` writes `patch(base)` with `put(.., expected = version)`.
//!    On a version conflict it re-reads the record, re-applies the *same*
//!    patch to the fresh fields and tries again, up to
//!    `max_commit_attempts` puts, then gives up with [`Error::Retryable`].
//!
//! Two writers touching the same field resolve as last-committer-wins;
//! writers touching disjoint fields both survive. A patch that leaves the
//! fields exactly as stored is dropped without a write.

mod backoff;

pub use backoff::Backoff;

use crate::error::{Error, Result};
use crate::patch::Patch;
use crate::store::{Fields, Session, StateRecord, StateStore, StoreError, StoreResult, Version};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum `put` attempts per commit (conflict retries included)
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    /// Bound on every individual store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Backoff after the first conflict, in milliseconds
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Backoff cap, in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Randomize backoff delays
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: bool,
}

fn default_max_commit_attempts() -> u32 {
    3
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_retry_initial_delay_ms() -> u64 {
    10
}

fn default_retry_max_delay_ms() -> u64 {
    200
}

fn default_retry_jitter() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: default_max_commit_attempts(),
            store_timeout_ms: default_store_timeout_ms(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

impl ManagerConfig {
    /// Store call timeout
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    /// Backoff schedule for conflict retries
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::default()
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_jitter(self.retry_jitter)
    }
}

/// In-memory working copy of one session's state for the duration of a turn
#[derive(Debug, Clone)]
pub struct WorkingState {
    session_id: String,
    /// Fields as last read from (or written to) the store
    base: Fields,
    /// Version `base` was read at; 0 when no record exists
    version: Version,
    /// Changes not yet committed
    pending: Patch,
    /// `pending` applied to `base`
    view: Fields,
}

impl WorkingState {
    fn from_record(session_id: &str, record: Option<StateRecord>) -> Self {
        let (base, version) = match record {
            Some(r) => (r.fields, r.version),
            None => (Fields::new(), 0),
        };
        Self {
            session_id: session_id.to_string(),
            view: base.clone(),
            base,
            version,
            pending: Patch::new(),
        }
    }

    fn rebase(&mut self, record: Option<StateRecord>) {
        let (base, version) = match record {
            Some(r) => (r.fields, r.version),
            None => (Fields::new(), 0),
        };
        self.view = self.pending.applied(&base);
        self.base = base;
        self.version = version;
    }

    /// Session this state belongs to
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current view: stored fields plus pending changes
    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.view
    }

    /// Look up a field in the current view
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.view.get(field)
    }

    /// Look up a string field in the current view
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(serde_json::Value::as_str)
    }

    /// Version the stored fields were read at
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether no record existed when this state was read
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Uncommitted changes
    #[must_use]
    pub fn pending(&self) -> &Patch {
        &self.pending
    }

    /// Whether there are uncommitted changes
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Version now stored
    pub version: Version,
    /// `put` attempts made (0 when there was nothing to write)
    pub attempts: u32,
    /// Whether anything was written
    pub written: bool,
}

/// Session State Manager: the only writer path into the store
pub struct SessionStateManager {
    store: Arc<dyn StateStore>,
    config: ManagerConfig,
    backoff: Backoff,
}

impl SessionStateManager {
    /// Create a manager with default settings
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_config(store, ManagerConfig::default())
    }

    /// Create a manager with custom settings
    pub fn with_config(store: Arc<dyn StateStore>, config: ManagerConfig) -> Self {
        let backoff = config.backoff();
        Self {
            store,
            config,
            backoff,
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Run one store call under the configured timeout
    async fn call<T>(
        &self,
        op: &'static str,
        session_id: &str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    op = op,
                    timeout_ms = timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(StoreError::Unavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Load the current state, or an empty version-0 state for a new session
    pub async fn load(&self, session_id: &str) -> Result<WorkingState> {
        let record = self
            .call("get", session_id, self.store.get(session_id))
            .await?;
        let state = WorkingState::from_record(session_id, record);
        debug!(
            session_id = %session_id,
            version = state.version,
            fields = state.base.len(),
            "Session state loaded"
        );
        Ok(state)
    }

    /// Record contact with the session, then load its state
    pub async fn enter(&self, session_id: &str) -> Result<(Session, WorkingState)> {
        let session = self
            .call("touch", session_id, self.store.touch(session_id))
            .await?;
        let state = self.load(session_id).await?;
        Ok((session, state))
    }

    /// Merge a patch into the working copy (nothing is written yet)
    pub fn update(&self, state: &mut WorkingState, patch: Patch) {
        if patch.is_empty() {
            return;
        }
        patch.apply_to(&mut state.view);
        debug!(
            session_id = %state.session_id,
            fields = ?patch.fields().collect::<Vec<_>>(),
            "Patch staged"
        );
        state.pending.merge(patch);
    }

    /// Persist pending changes
    pub async fn commit(&self, state: &mut WorkingState) -> Result<CommitOutcome> {
        self.commit_with_cancel(state, &CancellationToken::new())
            .await
    }

    /// Persist pending changes, aborting if `cancel` fires
    ///
    /// Cancellation is checked before every `put` and during backoff, so a
    /// cancelled commit never issues another write. On any error the working
    /// state keeps its pending patch.
    pub async fn commit_with_cancel(
        &self,
        state: &mut WorkingState,
        cancel: &CancellationToken,
    ) -> Result<CommitOutcome> {
        if state.pending.is_empty() {
            return Ok(CommitOutcome {
                version: state.version,
                attempts: 0,
                written: false,
            });
        }

        let session_id = state.session_id.clone();
        let max_attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let merged = state.pending.applied(&state.base);
            if merged == state.base {
                debug!(
                    session_id = %session_id,
                    version = state.version,
                    "Pending patch changes nothing, skipping write"
                );
                state.view = merged;
                state.pending = Patch::new();
                return Ok(CommitOutcome {
                    version: state.version,
                    attempts: attempt - 1,
                    written: false,
                });
            }

            if cancel.is_cancelled() {
                info!(session_id = %session_id, attempt = attempt, "Commit cancelled");
                return Err(Error::Cancelled { session_id });
            }

            let put = self
                .call(
                    "put",
                    &session_id,
                    self.store.put(&session_id, &merged, state.version),
                )
                .await;

            match put {
                Ok(version) => {
                    info!(
                        session_id = %session_id,
                        version = version,
                        attempts = attempt,
                        "Session state committed"
                    );
                    state.base = merged.clone();
                    state.view = merged;
                    state.version = version;
                    state.pending = Patch::new();
                    return Ok(CommitOutcome {
                        version,
                        attempts: attempt,
                        written: true,
                    });
                }
                Err(StoreError::VersionConflict {
                    expected, actual, ..
                }) => {
                    warn!(
                        session_id = %session_id,
                        expected = expected,
                        actual = actual,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        "Version conflict on commit"
                    );
                    if attempt >= max_attempts {
                        return Err(Error::Retryable {
                            session_id,
                            attempts: attempt,
                            last_seen_version: actual,
                        });
                    }

                    let delay = self.backoff.delay_for(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(session_id = %session_id, attempt = attempt, "Commit cancelled during backoff");
                            return Err(Error::Cancelled { session_id });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    let fresh = self
                        .call("get", &session_id, self.store.get(&session_id))
                        .await?;
                    state.rebase(fresh);
                    debug!(
                        session_id = %session_id,
                        version = state.version,
                        "Rebased pending patch onto fresh snapshot"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete the session's state record
    pub async fn forget(&self, session_id: &str) -> Result<()> {
        self.call("delete", session_id, self.store.delete(session_id))
            .await?;
        info!(session_id = %session_id, "Session state forgotten");
        Ok(())
    }

    /// Fetch session bookkeeping
    pub async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self
            .call("session", session_id, self.store.session(session_id))
            .await?)
    }

    /// Fetch the raw stored record
    pub async fn record(&self, session_id: &str) -> Result<Option<StateRecord>> {
        Ok(self
            .call("get", session_id, self.store.get(session_id))
            .await?)
    }

    /// List sessions that have stored state
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.call("list", "*", self.store.list_keys()).await?)
    }

    /// Check that the store answers within the store timeout
    pub async fn health_check(&self) -> Result<()> {
        Ok(self
            .call("health_check", "*", self.store.health_check())
            .await?)
    }
}

#[cfg(test)]
mod tests;
