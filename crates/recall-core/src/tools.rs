//! Memory tools exposed to the responder
//!
//! A responder asks for state changes by emitting [`ToolCall`]s. Each call is
//! parsed into a [`ToolInvocation`] before the turn loop acts on it; raw
//! arguments never reach the store.

use crate::error::{Error, Result};
use crate::patch::Patch;
use crate::store::Fields;
use serde::{Deserialize, Serialize};

/// Field holding the user's name
pub const USER_NAME_FIELD: &str = "user_name";

/// Tool names
pub mod names {
    /// Store the user's name
    pub const REMEMBER_NAME: &str = "remember_name";
    /// Read the user's name
    pub const GET_NAME: &str = "get_name";
    /// Store an arbitrary fact
    pub const REMEMBER_FACT: &str = "remember_fact";
    /// Drop a fact
    pub const FORGET_FACT: &str = "forget_fact";
}

/// Model-facing tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON schema for parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition with no parameters
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    /// Set the parameters schema
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Definitions of every built-in memory tool
#[must_use]
pub fn builtin_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            names::REMEMBER_NAME,
            "Remember the user's name for future conversations",
        )
        .with_parameters(serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "The user's name"}
            },
            "required": ["name"]
        })),
        ToolDefinition::new(
            names::GET_NAME,
            "Look up the user's name if it was shared before",
        ),
        ToolDefinition::new(names::REMEMBER_FACT, "Remember a fact about the user")
            .with_parameters(serde_json::json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Fact name, e.g. 'city'"},
                    "value": {"description": "Fact value"}
                },
                "required": ["key", "value"]
            })),
        ToolDefinition::new(names::FORGET_FACT, "Forget a previously remembered fact")
            .with_parameters(serde_json::json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Fact name to forget"}
                },
                "required": ["key"]
            })),
    ]
}

/// Tool call requested by a responder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arguments as JSON string
    pub arguments: String,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct FactArgs {
    key: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct KeyArgs {
    key: String,
}

impl ToolCall {
    /// Create a tool call
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.to_string(),
        }
    }

    /// Parse arguments as a typed value
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let raw = if self.arguments.trim().is_empty() {
            "{}"
        } else {
            self.arguments.as_str()
        };
        serde_json::from_str(raw)
            .map_err(|e| Error::Tool(format!("invalid arguments for '{}': {}", self.name, e)))
    }

    /// Resolve into a typed invocation
    pub fn to_invocation(&self) -> Result<ToolInvocation> {
        match self.name.as_str() {
            names::REMEMBER_NAME => {
                let args: NameArgs = self.parse_arguments()?;
                let name = args.name.trim();
                if name.is_empty() {
                    return Err(Error::Tool("name must not be empty".to_string()));
                }
                Ok(ToolInvocation::Remember {
                    fields: Patch::new().with(USER_NAME_FIELD, name),
                })
            }
            names::GET_NAME => Ok(ToolInvocation::Recall {
                field: USER_NAME_FIELD.to_string(),
            }),
            names::REMEMBER_FACT => {
                let args: FactArgs = self.parse_arguments()?;
                let key = validate_key(&args.key)?;
                Ok(ToolInvocation::Remember {
                    fields: Patch::new().with(key, args.value),
                })
            }
            names::FORGET_FACT => {
                let args: KeyArgs = self.parse_arguments()?;
                Ok(ToolInvocation::Forget {
                    field: validate_key(&args.key)?.to_string(),
                })
            }
            other => Err(Error::Tool(format!("unknown tool: {}", other))),
        }
    }
}

fn validate_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Tool("fact key must not be empty".to_string()));
    }
    Ok(key)
}

/// Typed request to read or write session fields
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    /// Set one or more fields
    Remember {
        /// Changes to stage
        fields: Patch,
    },
    /// Remove a field
    Forget {
        /// Field to remove
        field: String,
    },
    /// Read a field from the working copy
    Recall {
        /// Field to read
        field: String,
    },
}

impl ToolInvocation {
    /// Patch this invocation stages, if it mutates state
    #[must_use]
    pub fn patch(&self) -> Option<Patch> {
        match self {
            Self::Remember { fields } => Some(fields.clone()),
            Self::Forget { field } => Some(Patch::new().without(field.clone())),
            Self::Recall { .. } => None,
        }
    }

    /// Render the outcome against the fields visible after staging
    #[must_use]
    pub fn describe(&self, fields: &Fields) -> serde_json::Value {
        match self {
            Self::Remember { fields: patch } => {
                let stored: Fields = patch
                    .fields()
                    .filter_map(|f| fields.get(f).map(|v| (f.to_string(), v.clone())))
                    .collect();
                serde_json::json!({ "status": "remembered", "fields": stored })
            }
            Self::Forget { field } => serde_json::json!({ "status": "forgotten", "field": field }),
            Self::Recall { field } => match fields.get(field) {
                Some(value) => serde_json::json!({ "status": "found", "field": field, "value": value }),
                None => serde_json::json!({ "status": "unknown", "field": field }),
            },
        }
    }
}

/// Result of executing one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// ID of the call this answers
    pub call_id: String,
    /// Tool name
    pub name: String,
    /// Result payload
    pub content: serde_json::Value,
    /// Whether the call failed
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Successful result
    #[must_use]
    pub fn success(call: &ToolCall, content: serde_json::Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error: false,
        }
    }

    /// Failed result
    #[must_use]
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }
}
