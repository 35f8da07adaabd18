//! Responder boundary
//!
//! The turn loop does not care what produces replies. A [`Responder`] looks at
//! a [`TurnContext`] and either answers in text or asks for tool calls; the
//! loop executes those and asks again with the results attached.
//!
//! [`RuleResponder`] is a deterministic pattern-matching implementation that
//! lets the loop run without a language model.

use crate::error::{Error, Result};
use crate::store::Fields;
use crate::tools::{names, ToolCall, ToolResult, USER_NAME_FIELD};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

/// Everything a responder may look at
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// Session the turn belongs to
    pub session_id: String,
    /// Inbound user message
    pub message: String,
    /// Current view of the session's fields (pending changes included)
    pub fields: Fields,
    /// Results of tool calls made so far in this turn
    pub tool_results: Vec<ToolResult>,
    /// Tool round counter, starting at 0
    pub round: usize,
}

impl TurnContext {
    /// Context for a fresh turn
    #[must_use]
    pub fn new(session_id: impl Into<String>, message: impl Into<String>, fields: Fields) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            fields,
            tool_results: Vec::new(),
            round: 0,
        }
    }

    /// The user's name, if known
    #[must_use]
    pub fn user_name(&self) -> Option<&str> {
        self.fields.get(USER_NAME_FIELD).and_then(|v| v.as_str())
    }
}

/// Responder output
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Final text for the user
    Text(String),
    /// Tools to run before answering
    ToolCalls(Vec<ToolCall>),
}

/// Produces replies for a turn
#[async_trait]
pub trait Responder: Send + Sync {
    /// Decide what to do next
    async fn respond(&self, ctx: &TurnContext) -> Result<Reply>;

    /// Name for logs
    fn name(&self) -> &str {
        "responder"
    }
}

/// Deterministic responder driven by regular expressions
pub struct RuleResponder {
    name_pattern: Regex,
    city_pattern: Regex,
    forget_pattern: Regex,
    ask_name_pattern: Regex,
}

impl RuleResponder {
    /// Build the responder
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::Internal(format!("invalid pattern: {}", e)))
        };
        Ok(Self {
            name_pattern: compile(r"(?i)\b(?:my name is|call me)\s+([\p{L}][\p{L}'-]*)")?,
            city_pattern: compile(r"(?i)\bi live in\s+([\p{L}][\p{L} '-]*[\p{L}])")?,
            forget_pattern: compile(r"(?i)\bforget (?:my|the)\s+([\p{L}_]+)")?,
            ask_name_pattern: compile(
                r"(?i)\b(?:what(?: is|'s) my name|do you know my name|who am i)\b",
            )?,
        })
    }

    fn plan(&self, ctx: &TurnContext) -> Reply {
        let message = ctx.message.as_str();
        let mut calls = Vec::new();

        if let Some(caps) = self.forget_pattern.captures(message) {
            let key = match caps[1].to_lowercase().as_str() {
                "name" => USER_NAME_FIELD.to_string(),
                other => other.to_string(),
            };
            calls.push(ToolCall::new(
                call_id(ctx, calls.len()),
                names::FORGET_FACT,
                json!({ "key": key }),
            ));
        }

        if let Some(caps) = self.name_pattern.captures(message) {
            calls.push(ToolCall::new(
                call_id(ctx, calls.len()),
                names::REMEMBER_NAME,
                json!({ "name": &caps[1] }),
            ));
        }

        if let Some(caps) = self.city_pattern.captures(message) {
            calls.push(ToolCall::new(
                call_id(ctx, calls.len()),
                names::REMEMBER_FACT,
                json!({ "key": "city", "value": caps[1].trim() }),
            ));
        }

        if !calls.is_empty() {
            return Reply::ToolCalls(calls);
        }

        if self.ask_name_pattern.is_match(message) {
            return match ctx.user_name() {
                Some(name) => Reply::Text(format!("Your name is {}.", name)),
                None => Reply::ToolCalls(vec![ToolCall::new(
                    call_id(ctx, 0),
                    names::GET_NAME,
                    json!({}),
                )]),
            };
        }

        Reply::Text(match ctx.user_name() {
            Some(name) => format!("Hello again, {}! How can I help?", name),
            None => "Hello! I don't know your name yet. What should I call you?".to_string(),
        })
    }
}

fn call_id(ctx: &TurnContext, index: usize) -> String {
    format!("call_{}_{}", ctx.round, index)
}

/// Render the outcome of one tool call as a sentence
fn confirm(result: &ToolResult) -> String {
    if result.is_error {
        let reason = result.content["error"].as_str().unwrap_or("unknown error");
        return format!("Sorry, I couldn't do that ({}).", reason);
    }

    let content = &result.content;
    match result.name.as_str() {
        names::REMEMBER_NAME => match content["fields"][USER_NAME_FIELD].as_str() {
            Some(name) => format!("OK, I'll remember your name as {}.", name),
            None => "OK, I'll remember your name.".to_string(),
        },
        names::REMEMBER_FACT => match content["fields"].as_object().and_then(|m| m.iter().next()) {
            Some((key, value)) => format!(
                "Got it, I'll remember that your {} is {}.",
                key,
                value.as_str().map_or_else(|| value.to_string(), str::to_string)
            ),
            None => "Got it.".to_string(),
        },
        names::FORGET_FACT => {
            let field = content["field"].as_str().unwrap_or("that");
            let label = if field == USER_NAME_FIELD { "name" } else { field };
            format!("Done, I've forgotten your {}.", label)
        }
        names::GET_NAME => match content["value"].as_str() {
            Some(name) => format!("Your name is {}.", name),
            None => "I don't know your name.".to_string(),
        },
        other => format!("Finished {}.", other),
    }
}

#[async_trait]
impl Responder for RuleResponder {
    async fn respond(&self, ctx: &TurnContext) -> Result<Reply> {
        if ctx.tool_results.is_empty() {
            return Ok(self.plan(ctx));
        }

        let text = ctx
            .tool_results
            .iter()
            .map(confirm)
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Reply::Text(text))
    }

    fn name(&self) -> &str {
        "rules"
    }
}
