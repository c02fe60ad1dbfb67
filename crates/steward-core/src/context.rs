//! Conversation pruning.
//!
//! Keeps the model context under a token budget with a deterministic policy:
//! the system message and the initial task are pinned, the last K user and
//! last K assistant messages are pinned, the oldest contiguous non-pinned
//! block is collapsed into a one-message summary, and remaining overflow is
//! paid for by replacing tool results (oldest first) with one-line markers.
//! Token counts are estimated at ~4 chars per token; the policy converges in
//! a single pass over the messages.

use std::collections::HashSet;

use serde_json::Value;

use crate::ai::types::Message;

/// Fixed per-message overhead added to the character estimate.
const MESSAGE_OVERHEAD_TOKENS: usize = 8;

/// Tool output longer than this gets structural compression before the
/// generic truncation cap.
const TOOL_OUTPUT_COMPRESS_AT: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ContextPolicy {
    pub max_tokens: usize,
    pub keep_last_user: usize,
    pub keep_last_assistant: usize,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            max_tokens: 8_000,
            keep_last_user: 3,
            keep_last_assistant: 3,
        }
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

fn message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.text()) + MESSAGE_OVERHEAD_TOKENS
}

fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}

#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    policy: ContextPolicy,
}

impl ContextManager {
    pub fn new(policy: ContextPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ContextPolicy {
        self.policy
    }

    /// Prune a conversation to the token budget. The input order is never
    /// changed; messages are only summarized or replaced in place.
    pub fn prune(&self, messages: &[Message]) -> Vec<Message> {
        let mut msgs: Vec<Message> = messages.to_vec();
        if total_tokens(&msgs) <= self.policy.max_tokens {
            return msgs;
        }

        // Collapse the oldest contiguous non-pinned block into a summary.
        let pinned = self.pinned_indices(&msgs);
        if let Some((start, end)) = oldest_unpinned_block(&msgs, &pinned) {
            let summary = summarize(&msgs[start..end]);
            msgs.splice(
                start..end,
                [Message::system(format!("Earlier context: {summary}"))],
            );
        }

        // Still over: drop whole tool results, oldest to newest.
        while total_tokens(&msgs) > self.policy.max_tokens {
            let Some(idx) = msgs.iter().position(|m| m.is_tool_result()) else {
                break;
            };
            let Message::ToolResult {
                tool_name,
                args_digest,
                ..
            } = &msgs[idx]
            else {
                unreachable!();
            };
            let marker = format!("[omitted tool result: {tool_name} {args_digest}]");
            msgs[idx] = Message::system(marker);
        }

        msgs
    }

    /// Indices that must survive pruning: the leading system message, the
    /// initial task, and the last K user / K assistant messages.
    fn pinned_indices(&self, messages: &[Message]) -> HashSet<usize> {
        let mut pinned = HashSet::new();

        if let Some(idx) = messages.iter().position(Message::is_system) {
            pinned.insert(idx);
        }
        if let Some(idx) = messages.iter().position(Message::is_user) {
            pinned.insert(idx);
        }

        let user_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_user())
            .map(|(i, _)| i)
            .collect();
        for idx in user_indices.iter().rev().take(self.policy.keep_last_user) {
            pinned.insert(*idx);
        }

        let assistant_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_assistant())
            .map(|(i, _)| i)
            .collect();
        for idx in assistant_indices
            .iter()
            .rev()
            .take(self.policy.keep_last_assistant)
        {
            pinned.insert(*idx);
        }

        pinned
    }
}

fn oldest_unpinned_block(
    messages: &[Message],
    pinned: &HashSet<usize>,
) -> Option<(usize, usize)> {
    let start = (0..messages.len()).find(|i| !pinned.contains(i))?;
    let mut end = start;
    while end < messages.len() && !pinned.contains(&end) {
        end += 1;
    }
    // A single-message block is not worth summarizing unless it is large.
    if end - start == 1 && message_tokens(&messages[start]) < 200 {
        return None;
    }
    Some((start, end))
}

/// Cheap extractive summary of a message block.
fn summarize(messages: &[Message]) -> String {
    let mut parts = Vec::with_capacity(messages.len());
    for message in messages {
        let part = match message {
            Message::User { text } => format!("User: {}", head(text, 100)),
            Message::Assistant { text } => format!("Assistant: {}", head(text, 100)),
            Message::System { text } => head(text, 100),
            Message::ToolResult {
                tool_name,
                is_error,
                ..
            } => format!(
                "Tool {tool_name}: {}",
                if *is_error { "error" } else { "ok" }
            ),
        };
        parts.push(part);
    }
    parts.join(" | ")
}

fn head(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.trim().to_string();
    }
    let mut boundary = max;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}…", text[..boundary].trim())
}

/// Compress an oversized tool output before it enters the conversation.
/// JSON envelopes are reduced to their status and key fields; anything else
/// is truncated with a visible marker.
pub fn compress_tool_output(output: &str) -> String {
    if output.len() <= TOOL_OUTPUT_COMPRESS_AT {
        return output.to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(output) {
        if let Value::Object(map) = &value {
            let mut compact = serde_json::Map::new();
            for key in ["status", "error_kind", "error_message", "exit_code", "path"] {
                if let Some(v) = map.get(key) {
                    compact.insert(key.to_string(), compact_value(v));
                }
            }
            if let Some(data) = map.get("data") {
                compact.insert("data".to_string(), compact_value(data));
            }
            if !compact.is_empty() {
                let compressed = Value::Object(compact).to_string();
                if compressed.len() < output.len() {
                    return format!(
                        "{compressed}\n[compressed from {} chars]",
                        output.len()
                    );
                }
            }
        }
    }

    format!(
        "{}\n… [truncated: {} chars total]",
        head(output, TOOL_OUTPUT_COMPRESS_AT),
        output.len()
    )
}

fn compact_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > 400 => Value::String(head(s, 400)),
        Value::Object(_) | Value::Array(_) => {
            let rendered = value.to_string();
            if rendered.len() > 400 {
                Value::String(head(&rendered, 400))
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(text: &str, repeat: usize) -> String {
        text.repeat(repeat)
    }

    fn conversation(tool_results: usize) -> Vec<Message> {
        let mut msgs = vec![
            Message::system("You are a container management agent."),
            Message::user("restart the redis container"),
        ];
        for i in 0..tool_results {
            msgs.push(Message::assistant(long("thinking about the situation ", 20)));
            msgs.push(Message::ToolResult {
                tool_name: format!("tool_{i}"),
                args_digest: "abc123".to_string(),
                content: long("tool output line ", 100),
                is_error: false,
            });
        }
        msgs.push(Message::user("and check the logs"));
        msgs
    }

    #[test]
    fn under_budget_is_untouched() {
        let manager = ContextManager::default();
        let msgs = conversation(1);
        let pruned = manager.prune(&msgs);
        assert_eq!(pruned.len(), msgs.len());
    }

    #[test]
    fn pins_survive_aggressive_pruning() {
        let manager = ContextManager::new(ContextPolicy {
            max_tokens: 400,
            keep_last_user: 3,
            keep_last_assistant: 3,
        });
        let msgs = conversation(8);
        let pruned = manager.prune(&msgs);

        // The system message is first and intact.
        assert!(pruned[0].is_system());
        assert!(pruned[0].text().contains("container management agent"));

        // The last user message survived.
        assert!(pruned
            .iter()
            .any(|m| m.is_user() && m.text().contains("check the logs")));

        // The initial task survived (possibly as the pinned first user message).
        assert!(pruned
            .iter()
            .any(|m| m.is_user() && m.text().contains("restart the redis container")));
    }

    #[test]
    fn overflow_replaces_tool_results_with_markers() {
        let manager = ContextManager::new(ContextPolicy {
            max_tokens: 300,
            keep_last_user: 1,
            keep_last_assistant: 1,
        });
        let msgs = conversation(6);
        let pruned = manager.prune(&msgs);

        assert!(pruned
            .iter()
            .any(|m| m.text().contains("[omitted tool result:")));
        assert!(total_tokens(&pruned) < total_tokens(&msgs));
    }

    #[test]
    fn ordering_is_preserved() {
        let manager = ContextManager::new(ContextPolicy {
            max_tokens: 500,
            keep_last_user: 2,
            keep_last_assistant: 2,
        });
        let msgs = conversation(5);
        let pruned = manager.prune(&msgs);

        let first_user = pruned.iter().position(|m| m.is_user()).unwrap();
        let system = pruned.iter().position(|m| m.is_system()).unwrap();
        assert!(system < first_user || system == 0);
    }

    #[test]
    fn compress_extracts_json_envelope() {
        let big_data = "x".repeat(2000);
        let output = format!(r#"{{"status": "success", "data": "{big_data}"}}"#);
        let compressed = compress_tool_output(&output);
        assert!(compressed.len() < output.len());
        assert!(compressed.contains("\"status\":\"success\""));
    }

    #[test]
    fn compress_truncates_non_json() {
        let output = "line of plain log output\n".repeat(100);
        let compressed = compress_tool_output(&output);
        assert!(compressed.len() < output.len());
        assert!(compressed.contains("[truncated:"));
    }

    #[test]
    fn small_output_passes_through() {
        assert_eq!(compress_tool_output("small"), "small");
    }
}
