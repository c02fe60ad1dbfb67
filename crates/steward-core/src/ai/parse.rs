//! Strict parsing of the assistant's tool-request protocol.
//!
//! The assistant requests a tool invocation by emitting one fenced block:
//!
//! ````text
//! ```tool
//! {"tool": "docker_ps", "args": {}}
//! ```
//! ````
//!
//! Parsing is strict: unknown fields are rejected and a malformed block
//! surfaces as a validation error the model can react to, never a crash.
//! A reply with no tool block is the agent's final answer. If several blocks
//! appear, only the first is honored; tool calls within one run are strictly
//! sequential.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::ToolCall;

const FENCE_OPEN: &str = "```tool";
const FENCE_CLOSE: &str = "```";

/// What the assistant's reply asks the runtime to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantAction {
    /// No tool block: the reply is the final answer.
    Final,
    /// A well-formed tool request.
    ToolCall(ToolCall),
    /// A tool block was present but malformed.
    Malformed(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolRequest {
    tool: String,
    #[serde(default)]
    args: Map<String, Value>,
}

pub fn parse_assistant_reply(text: &str) -> AssistantAction {
    let Some(start) = text.find(FENCE_OPEN) else {
        return AssistantAction::Final;
    };

    let body_start = start + FENCE_OPEN.len();
    let Some(end) = text[body_start..].find(FENCE_CLOSE) else {
        return AssistantAction::Malformed("unterminated tool block".to_string());
    };

    let body = text[body_start..body_start + end].trim();
    match serde_json::from_str::<RawToolRequest>(body) {
        Ok(raw) => {
            if raw.tool.trim().is_empty() {
                return AssistantAction::Malformed("tool name is empty".to_string());
            }
            AssistantAction::ToolCall(ToolCall {
                name: raw.tool,
                args: Value::Object(raw.args),
            })
        }
        Err(e) => AssistantAction::Malformed(format!("invalid tool request: {e}")),
    }
}

/// The protocol description injected into every agent system prompt.
pub fn protocol_instructions() -> &'static str {
    "To invoke a tool, reply with exactly one fenced block:\n\
     ```tool\n\
     {\"tool\": \"<name>\", \"args\": {<parameters>}}\n\
     ```\n\
     The block must contain only the JSON object, with no extra fields.\n\
     The tool result will be returned to you in the next message.\n\
     When the task is complete, reply with your final answer and no tool block."
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_without_block_is_final() {
        assert_eq!(
            parse_assistant_reply("All containers are healthy."),
            AssistantAction::Final
        );
    }

    #[test]
    fn well_formed_block_parses() {
        let reply = "Let me check.\n```tool\n{\"tool\": \"docker_ps\", \"args\": {}}\n```\n";
        match parse_assistant_reply(reply) {
            AssistantAction::ToolCall(call) => {
                assert_eq!(call.name, "docker_ps");
                assert_eq!(call.args, json!({}));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn args_default_to_empty_object() {
        let reply = "```tool\n{\"tool\": \"docker_ps\"}\n```";
        match parse_assistant_reply(reply) {
            AssistantAction::ToolCall(call) => assert_eq!(call.args, json!({})),
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let reply = "```tool\n{\"tool\": \"shell\", \"args\": {}, \"note\": \"hi\"}\n```";
        assert!(matches!(
            parse_assistant_reply(reply),
            AssistantAction::Malformed(_)
        ));
    }

    #[test]
    fn unterminated_block_is_malformed() {
        let reply = "```tool\n{\"tool\": \"shell\"}";
        assert!(matches!(
            parse_assistant_reply(reply),
            AssistantAction::Malformed(_)
        ));
    }

    #[test]
    fn invalid_json_is_malformed_not_a_crash() {
        let reply = "```tool\nnot json at all\n```";
        assert!(matches!(
            parse_assistant_reply(reply),
            AssistantAction::Malformed(_)
        ));
    }

    #[test]
    fn only_first_block_is_honored() {
        let reply = "```tool\n{\"tool\": \"first\", \"args\": {}}\n```\n\
                     ```tool\n{\"tool\": \"second\", \"args\": {}}\n```";
        match parse_assistant_reply(reply) {
            AssistantAction::ToolCall(call) => assert_eq!(call.name, "first"),
            other => panic!("expected tool call, got {other:?}"),
        }
    }
}
