//! Agent turn loop
//!
//! One call to [`TurnLoop::handle_turn`] is one conversational turn:
//!
//! ```text
//! Received -> Loaded -> (Mutated)? -> Committed | Failed -> Responded
//! ```
//!
//! The loop never talks to the store directly. State is read through
//! [`SessionStateManager::enter`] and every tool round that staged changes is
//! committed before the responder sees the results. A failed commit ends the
//! turn with a "please try again" reply rather than a confirmation.

use crate::error::{format_error_for_chat, Error, Result};
use crate::manager::{SessionStateManager, WorkingState};
use crate::responder::{Reply, Responder, TurnContext};
use crate::store::Version;
use crate::tools::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turn loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum responder rounds that may request tools
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

fn default_max_tool_rounds() -> usize {
    4
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

/// Where a turn is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// Message accepted
    Received,
    /// State loaded
    Loaded,
    /// Changes staged in the working copy
    Mutated,
    /// Changes persisted
    Committed,
    /// Persisting failed; the user was told to retry
    Failed,
    /// Reply produced
    Responded,
}

impl TurnPhase {
    /// Whether the turn is over
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Responded | Self::Failed)
    }
}

/// Outcome of a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    /// Session the turn belonged to
    pub session_id: String,
    /// Reply for the user
    pub text: String,
    /// Terminal phase (`Responded` or `Failed`)
    pub phase: TurnPhase,
    /// State version after the turn
    pub version: Version,
    /// Whether this turn wrote state
    pub committed: bool,
    /// Tool calls executed
    pub tool_calls: usize,
}

impl TurnResponse {
    /// Whether the turn failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.phase == TurnPhase::Failed
    }
}

/// Drives conversational turns against a session manager
pub struct TurnLoop {
    manager: Arc<SessionStateManager>,
    responder: Arc<dyn Responder>,
    config: TurnConfig,
}

impl TurnLoop {
    /// Create a turn loop
    pub fn new(manager: Arc<SessionStateManager>, responder: Arc<dyn Responder>) -> Self {
        Self::with_config(manager, responder, TurnConfig::default())
    }

    /// Create a turn loop with custom settings
    pub fn with_config(
        manager: Arc<SessionStateManager>,
        responder: Arc<dyn Responder>,
        config: TurnConfig,
    ) -> Self {
        Self {
            manager,
            responder,
            config,
        }
    }

    /// The session manager behind this loop
    #[must_use]
    pub fn manager(&self) -> &Arc<SessionStateManager> {
        &self.manager
    }

    /// Handle one inbound message
    pub async fn handle_turn(&self, session_id: &str, message: &str) -> Result<TurnResponse> {
        self.handle_turn_with_cancel(session_id, message, &CancellationToken::new())
            .await
    }

    /// Handle one inbound message, aborting pending commits if `cancel` fires
    ///
    /// Transient store failures (unreachable store, exhausted conflict
    /// retries) come back as a `Failed` response. Anything else, including
    /// cancellation, is returned as an error.
    pub async fn handle_turn_with_cancel(
        &self,
        session_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResponse> {
        let mut phase = TurnPhase::Received;
        debug!(session_id = %session_id, phase = ?phase, "Turn received");

        let mut state = match self.manager.enter(session_id).await {
            Ok((_, state)) => state,
            Err(e) if e.is_transient() => return Ok(self.failed(session_id, 0, false, 0, &e)),
            Err(e) => return Err(e),
        };
        phase = TurnPhase::Loaded;
        debug!(
            session_id = %session_id,
            phase = ?phase,
            version = state.version(),
            "Turn state loaded"
        );

        let mut ctx = TurnContext::new(session_id, message, state.fields().clone());
        let mut committed = false;
        let mut tool_calls = 0;

        let text = loop {
            let reply = self.responder.respond(&ctx).await?;
            let calls = match reply {
                Reply::Text(text) => break text,
                Reply::ToolCalls(calls) => calls,
            };

            if ctx.round >= self.config.max_tool_rounds {
                warn!(
                    session_id = %session_id,
                    responder = self.responder.name(),
                    rounds = ctx.round,
                    "Tool round limit reached"
                );
                break "Sorry, I couldn't finish that request.".to_string();
            }

            tool_calls += calls.len();
            let results = self.run_tools(&mut state, &calls);
            if state.is_dirty() {
                phase = TurnPhase::Mutated;
                debug!(session_id = %session_id, phase = ?phase, "Turn state mutated");

                match self.manager.commit_with_cancel(&mut state, cancel).await {
                    Ok(outcome) => {
                        phase = TurnPhase::Committed;
                        committed |= outcome.written;
                        debug!(
                            session_id = %session_id,
                            phase = ?phase,
                            version = outcome.version,
                            attempts = outcome.attempts,
                            written = outcome.written,
                            "Turn state committed"
                        );
                    }
                    Err(e) if e.is_transient() => {
                        return Ok(self.failed(
                            session_id,
                            state.version(),
                            committed,
                            tool_calls,
                            &e,
                        ));
                    }
                    Err(e) => return Err(e),
                }
            }

            ctx.fields = state.fields().clone();
            ctx.tool_results.extend(results);
            ctx.round += 1;
        };

        info!(
            session_id = %session_id,
            last_phase = ?phase,
            version = state.version(),
            committed = committed,
            tool_calls = tool_calls,
            "Turn responded"
        );

        Ok(TurnResponse {
            session_id: session_id.to_string(),
            text,
            phase: TurnPhase::Responded,
            version: state.version(),
            committed,
            tool_calls,
        })
    }

    /// Execute tool calls against the working copy
    fn run_tools(&self, state: &mut WorkingState, calls: &[ToolCall]) -> Vec<ToolResult> {
        calls
            .iter()
            .map(|call| match call.to_invocation() {
                Ok(invocation) => {
                    if let Some(patch) = invocation.patch() {
                        self.manager.update(state, patch);
                    }
                    debug!(
                        session_id = %state.session_id(),
                        tool = %call.name,
                        "Tool executed"
                    );
                    ToolResult::success(call, invocation.describe(state.fields()))
                }
                Err(e) => {
                    warn!(
                        session_id = %state.session_id(),
                        tool = %call.name,
                        error = %e,
                        "Rejected tool call"
                    );
                    let reason = match e {
                        Error::Tool(msg) => msg,
                        other => other.to_string(),
                    };
                    ToolResult::error(call, reason)
                }
            })
            .collect()
    }

    fn failed(
        &self,
        session_id: &str,
        version: Version,
        committed: bool,
        tool_calls: usize,
        error: &Error,
    ) -> TurnResponse {
        warn!(
            session_id = %session_id,
            phase = ?TurnPhase::Failed,
            error = %error,
            "Turn failed"
        );
        TurnResponse {
            session_id: session_id.to_string(),
            text: format_error_for_chat(error),
            phase: TurnPhase::Failed,
            version,
            committed,
            tool_calls,
        }
    }
}
