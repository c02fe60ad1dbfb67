//! Conversation message types.
//!
//! These are the messages a single agent run owns. Tool results always carry
//! the sanitized form of the raw tool output; the runtime enforces that before
//! anything is appended.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    System {
        text: String,
    },
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    ToolResult {
        tool_name: String,
        args_digest: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant { text: text.into() }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System { .. })
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Message::ToolResult { .. })
    }

    /// Flattened text used for token estimation and provider wire formats.
    pub fn text(&self) -> String {
        match self {
            Message::System { text } | Message::User { text } | Message::Assistant { text } => {
                text.clone()
            }
            Message::ToolResult {
                tool_name,
                args_digest,
                content,
                is_error,
            } => {
                let status = if *is_error { "error" } else { "ok" };
                format!("[tool result: {tool_name} {args_digest} ({status})]\n{content}")
            }
        }
    }
}

/// A parsed tool invocation request from the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

/// Token usage reported (or estimated) for one LLM round trip.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}
