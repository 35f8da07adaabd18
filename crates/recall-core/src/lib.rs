//! Recall Core - Durable session state for conversational agents
//!
//! This crate lets an agent remember facts about a user across independent
//! sessions, including:
//! - Store: versioned compare-and-swap persistence (SQLite, Redis, memory)
//! - Manager: load-on-entry, merge-on-update, save-on-exit with conflict retry
//! - Tools: memory tools a responder can call
//! - Turn: the per-message loop tying a responder to the manager

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod manager;
pub mod patch;
pub mod responder;
pub mod store;
pub mod tools;
pub mod turn;

pub use error::{format_error_for_chat, format_error_for_cli, Error, Result, UserFriendlyError};
pub use manager::{Backoff, CommitOutcome, ManagerConfig, SessionStateManager, WorkingState};
pub use patch::{FieldChange, Patch};
pub use responder::{Reply, Responder, RuleResponder, TurnContext};
pub use store::{
    Fields, MemoryStore, RedisStore, Session, SqliteStore, StateRecord, StateStore, StoreBackend,
    StoreBackendConfig, StoreError, StoreResult, Version,
};
pub use tools::{builtin_tools, ToolCall, ToolDefinition, ToolInvocation, ToolResult, USER_NAME_FIELD};
pub use turn::{TurnConfig, TurnLoop, TurnPhase, TurnResponse};
