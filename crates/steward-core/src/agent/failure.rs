//! Error signatures and repeated-failure tracking.
//!
//! Each failed tool result is reduced to a stable signature of (tool, error
//! class, normalized message prefix). The third identical failure within one
//! run aborts it, and a (tool, args) digest that already failed is never
//! retried in the same run.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// A signature seen this many times within one run aborts it.
pub const LOOP_THRESHOLD: usize = 3;

/// How much of the normalized error message feeds the signature.
const FINGERPRINT_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSignature {
    pub tool: String,
    pub error_class: String,
    pub fingerprint: String,
}

impl ErrorSignature {
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.tool, self.error_class, self.fingerprint)
    }
}

/// Build a signature from a tool's (sanitized) output envelope.
pub fn signature_for(tool: &str, output: &str) -> ErrorSignature {
    let (error_class, message) = extract_error(output);
    ErrorSignature {
        tool: tool.to_string(),
        error_class,
        fingerprint: normalize_fingerprint(&message),
    }
}

/// Stable digest of a (tool, args) pair, used to ban retries of attempted
/// fixes within a run.
pub fn args_digest(tool: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(args.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn extract_error(output: &str) -> (String, String) {
    // Tool results carry a typed kind in their envelope; use it directly.
    if let Ok(value) = serde_json::from_str::<Value>(output) {
        let kind = value.get("error_kind").and_then(Value::as_str);
        let message = value.get("error_message").and_then(Value::as_str);
        if kind.is_some() || message.is_some() {
            let message = message.unwrap_or_default().to_string();
            let kind = kind
                .map(str::to_string)
                .unwrap_or_else(|| classify_error(&message).to_string());
            return (kind, message);
        }
    }
    (classify_error(output).to_string(), output.to_string())
}

fn classify_error(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid parameters")
        || lower.contains("missing field")
        || lower.contains("unknown field")
    {
        "invalid_parameters"
    } else if lower.contains("unknown tool") {
        "unknown_tool"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("rejected") || lower.contains("denied") {
        "rejected"
    } else if lower.contains("not found") {
        "not_found"
    } else {
        "tool_error"
    }
}

fn normalize_fingerprint(message: &str) -> String {
    let mut compact = String::new();
    for part in message.split_whitespace() {
        if !compact.is_empty() {
            compact.push(' ');
        }
        compact.push_str(part);
    }
    if compact.is_empty() {
        return "unknown".to_string();
    }
    compact.make_ascii_lowercase();
    compact.chars().take(FINGERPRINT_CHARS).collect()
}

/// Per-run failure bookkeeping. Counts are cumulative for the whole run so
/// the third occurrence of a signature always terminates, regardless of
/// successes in between.
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: HashMap<String, usize>,
    attempted: HashMap<String, String>,
}

impl FailureTracker {
    /// Record a failure; returns how many times this signature has now been
    /// seen in this run.
    pub fn record_failure(&mut self, signature: &ErrorSignature, digest: &str) -> usize {
        self.attempted
            .insert(digest.to_string(), signature.key());
        let count = self.counts.entry(signature.key()).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether this exact (tool, args) digest already failed in this run.
    pub fn already_failed(&self, digest: &str) -> Option<&str> {
        self.attempted.get(digest).map(String::as_str)
    }

    pub fn count(&self, signature: &ErrorSignature) -> usize {
        self.counts.get(&signature.key()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_extracts_kind_and_message_from_envelope() {
        let output = r#"{"status": "error", "error_kind": "command_failed", "error_message": "command exited with code 1"}"#;
        let sig = signature_for("shell", output);
        assert_eq!(sig.tool, "shell");
        assert_eq!(sig.error_class, "command_failed");
        assert!(sig.fingerprint.contains("exited with code 1"));
    }

    #[test]
    fn identical_failures_share_a_signature() {
        let output = r#"{"status": "error", "error_kind": "timeout", "error_message": "tool 'shell' timed out after 300 seconds"}"#;
        let a = signature_for("shell", output);
        let b = signature_for("shell", output);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn plain_text_errors_are_classified() {
        let sig = signature_for("shell", "operation timed out after 30s");
        assert_eq!(sig.error_class, "timeout");

        let sig = signature_for("shell", "Invalid parameters: missing field `command`");
        assert_eq!(sig.error_class, "invalid_parameters");
    }

    #[test]
    fn fingerprint_normalizes_whitespace_and_truncates() {
        let long = format!("error:   {}", "x".repeat(500));
        let sig = signature_for("shell", &long);
        assert!(sig.fingerprint.len() <= FINGERPRINT_CHARS);
        assert!(!sig.fingerprint.contains("  "));
    }

    #[test]
    fn tracker_counts_to_threshold() {
        let mut tracker = FailureTracker::default();
        let sig = signature_for("shell", "boom");

        assert_eq!(tracker.record_failure(&sig, "digest-1"), 1);
        assert_eq!(tracker.record_failure(&sig, "digest-2"), 2);
        assert_eq!(tracker.record_failure(&sig, "digest-3"), 3);
        assert!(tracker.count(&sig) >= LOOP_THRESHOLD);
    }

    #[test]
    fn attempted_digests_are_remembered() {
        let mut tracker = FailureTracker::default();
        let sig = signature_for("shell", "boom");
        tracker.record_failure(&sig, "abc123");

        assert!(tracker.already_failed("abc123").is_some());
        assert!(tracker.already_failed("other").is_none());
    }

    #[test]
    fn args_digest_is_stable_and_distinguishes_args() {
        let a1 = args_digest("shell", &json!({"command": "ls"}));
        let a2 = args_digest("shell", &json!({"command": "ls"}));
        let b = args_digest("shell", &json!({"command": "pwd"}));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }
}
