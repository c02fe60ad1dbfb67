//! Fact ledger: the system's memory of what worked and what did not.
//!
//! An append-only JSON ledger of successes, failures, solved tasks, and
//! routing outcomes. The agent loop consults it to avoid repeating attempted
//! fixes, the orchestrator uses it for solution recall and pre-execution
//! abort, and the router uses per-agent success rates as a tie-break.
//! Everything is sanitized before it is written. Each list rotates at a cap,
//! oldest records dropped first.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::sanitize;
use crate::storage;

const DEFAULT_CAP: usize = 200;

/// Minimum bag-of-tokens overlap for `find_similar`.
const SIMILARITY_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub action_type: String,
    pub pattern: String,
    pub details: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub action_type: String,
    pub error_signature: String,
    pub error_hash: String,
    pub details: Value,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub task_fingerprint: String,
    pub task: String,
    pub summary: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub task_fingerprint: String,
    pub agent: String,
    pub success: bool,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerData {
    successes: Vec<SuccessRecord>,
    failures: Vec<FailureRecord>,
    solutions: Vec<SolutionRecord>,
    routing_history: Vec<RoutingRecord>,
}

pub struct FactLedger {
    path: PathBuf,
    cap: usize,
    inner: Mutex<LedgerData>,
}

impl FactLedger {
    pub fn new(path: PathBuf) -> Self {
        let data = storage::load_json::<LedgerData>(&path)
            .unwrap_or_else(|e| {
                tracing::warn!("could not load fact ledger, starting fresh: {e}");
                None
            })
            .unwrap_or_default();

        Self {
            path,
            cap: DEFAULT_CAP,
            inner: Mutex::new(data),
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn record_success(&self, action_type: &str, pattern: &str, details: Value) {
        let record = SuccessRecord {
            action_type: action_type.to_string(),
            pattern: sanitize::sanitize(pattern).text,
            details: sanitize::sanitize_value(&details),
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut inner = self.inner.lock().expect("fact ledger lock");
        inner.successes.push(record);
        rotate(&mut inner.successes, self.cap);
        self.persist(&inner);
    }

    pub fn record_failure(
        &self,
        action_type: &str,
        error_signature: &str,
        details: Value,
        suggested_fixes: Vec<String>,
    ) {
        let sanitized_signature = sanitize::sanitize(error_signature).text;
        let record = FailureRecord {
            action_type: action_type.to_string(),
            error_hash: error_hash(&sanitized_signature),
            error_signature: sanitized_signature,
            details: sanitize::sanitize_value(&details),
            suggested_fixes,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut inner = self.inner.lock().expect("fact ledger lock");
        inner.failures.push(record);
        rotate(&mut inner.failures, self.cap);
        self.persist(&inner);
    }

    pub fn record_solution(&self, task_fingerprint: &str, task: &str, summary: &str) {
        let record = SolutionRecord {
            task_fingerprint: task_fingerprint.to_string(),
            task: sanitize::sanitize(task).text,
            summary: sanitize::sanitize(summary).text,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut inner = self.inner.lock().expect("fact ledger lock");
        inner.solutions.push(record);
        rotate(&mut inner.solutions, self.cap);
        self.persist(&inner);
    }

    pub fn record_routing(&self, task_fingerprint: &str, agent: &str, success: bool) {
        let record = RoutingRecord {
            task_fingerprint: task_fingerprint.to_string(),
            agent: agent.to_string(),
            success,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut inner = self.inner.lock().expect("fact ledger lock");
        inner.routing_history.push(record);
        rotate(&mut inner.routing_history, self.cap);
        self.persist(&inner);
    }

    /// Find a past solution for a similar task by bag-of-tokens overlap.
    pub fn find_similar(&self, task: &str) -> Option<SolutionRecord> {
        let task_tokens = tokens(task);
        if task_tokens.is_empty() {
            return None;
        }
        let inner = self.inner.lock().expect("fact ledger lock");
        inner
            .solutions
            .iter()
            .rev()
            .find(|solution| {
                let solution_tokens = tokens(&solution.task);
                let overlap = task_tokens
                    .iter()
                    .filter(|t| solution_tokens.contains(*t))
                    .count();
                overlap as f64 / task_tokens.len() as f64 > SIMILARITY_THRESHOLD
            })
            .cloned()
    }

    /// How many times this exact failure has been seen for an action type.
    pub fn failure_count(&self, action_type: &str, error_signature: &str) -> usize {
        let hash = error_hash(&sanitize::sanitize(error_signature).text);
        let inner = self.inner.lock().expect("fact ledger lock");
        inner
            .failures
            .iter()
            .filter(|f| f.action_type == action_type && f.error_hash == hash)
            .count()
    }

    /// How many terminal runs of this task fingerprint have failed.
    pub fn task_failure_count(&self, task_fingerprint: &str) -> usize {
        let inner = self.inner.lock().expect("fact ledger lock");
        inner
            .routing_history
            .iter()
            .filter(|r| r.task_fingerprint == task_fingerprint && !r.success)
            .count()
    }

    /// Historical success rate for an agent, if it has any history.
    pub fn agent_success_rate(&self, agent: &str) -> Option<f64> {
        let inner = self.inner.lock().expect("fact ledger lock");
        let records: Vec<&RoutingRecord> = inner
            .routing_history
            .iter()
            .filter(|r| r.agent == agent)
            .collect();
        if records.is_empty() {
            return None;
        }
        let wins = records.iter().filter(|r| r.success).count();
        Some(wins as f64 / records.len() as f64)
    }

    fn persist(&self, data: &LedgerData) {
        if let Err(e) = storage::save_json_atomic(&self.path, data) {
            tracing::warn!("could not persist fact ledger: {e}");
        }
    }
}

/// Suggested next steps for a repeatedly failing action type.
pub fn suggest_fixes(action_type: &str, failure_count: usize) -> Vec<String> {
    if failure_count < 3 {
        return vec![format!(
            "This action has failed {failure_count} time(s) before. Consider a different approach."
        )];
    }
    match action_type {
        "write_file" => vec![
            "Verify the target directory exists".to_string(),
            "Check filesystem permissions".to_string(),
            "Try a simpler file layout".to_string(),
        ],
        "shell" => vec![
            "Verify the command syntax".to_string(),
            "Check that prerequisites are installed".to_string(),
            "Try an alternative command".to_string(),
        ],
        name if name.starts_with("docker") => vec![
            "Verify the container name with docker_ps".to_string(),
            "Check that the Docker daemon is running".to_string(),
        ],
        _ => vec![format!(
            "This action has failed {failure_count} times. A different strategy is required."
        )],
    }
}

fn error_hash(signature: &str) -> String {
    let digest = Sha256::digest(signature.as_bytes());
    let mut out = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn tokens(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| t.len() > 2)
        .collect()
}

fn rotate<T>(records: &mut Vec<T>, cap: usize) {
    let overflow = records.len().saturating_sub(cap);
    if overflow > 0 {
        records.drain(..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> (FactLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FactLedger::new(dir.path().join("fact_ledger.json"));
        (ledger, dir)
    }

    #[test]
    fn failures_are_counted_by_signature() {
        let (ledger, _dir) = ledger();
        for _ in 0..3 {
            ledger.record_failure("shell", "shell|timeout|command timed out", json!({}), vec![]);
        }
        ledger.record_failure("shell", "shell|tool_error|other failure", json!({}), vec![]);

        assert_eq!(
            ledger.failure_count("shell", "shell|timeout|command timed out"),
            3
        );
        assert_eq!(
            ledger.failure_count("shell", "shell|tool_error|other failure"),
            1
        );
        assert_eq!(ledger.failure_count("write_file", "anything"), 0);
    }

    #[test]
    fn find_similar_matches_overlapping_tasks() {
        let (ledger, _dir) = ledger();
        ledger.record_solution(
            "fp1",
            "create a docker-compose file with a redis service",
            "wrote docker-compose.yml with redis on 6379",
        );

        let hit = ledger.find_similar("create a docker-compose file with a postgres service");
        assert!(hit.is_some());

        let miss = ledger.find_similar("summarize the quarterly sales report");
        assert!(miss.is_none());
    }

    #[test]
    fn agent_success_rate_reflects_history() {
        let (ledger, _dir) = ledger();
        ledger.record_routing("fp1", "container", true);
        ledger.record_routing("fp2", "container", true);
        ledger.record_routing("fp3", "container", false);

        let rate = ledger.agent_success_rate("container").unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(ledger.agent_success_rate("unknown").is_none());
    }

    #[test]
    fn records_are_sanitized_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fact_ledger.json");
        let ledger = FactLedger::new(path.clone());
        ledger.record_failure(
            "shell",
            "failed with API_KEY=sk-ABCDEFGHIJKLMNOPQRSTUVWX",
            json!({"password": "hunter2"}),
            vec![],
        );
        drop(ledger);

        let raw = std::fs::read_to_string(path).unwrap();
        assert!(!raw.contains("ABCDEFGHIJKLMNOPQRSTUVWX"));
        assert!(!raw.contains("hunter2"));
    }

    #[test]
    fn rotation_drops_oldest_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FactLedger::new(dir.path().join("ledger.json")).with_cap(5);
        for i in 0..10 {
            ledger.record_success("shell", &format!("pattern-{i}"), json!({}));
        }
        let inner = ledger.inner.lock().unwrap();
        assert_eq!(inner.successes.len(), 5);
        assert_eq!(inner.successes[0].pattern, "pattern-5");
    }

    #[test]
    fn ledger_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let ledger = FactLedger::new(path.clone());
            ledger.record_routing("fp1", "config", true);
        }
        let reloaded = FactLedger::new(path);
        assert_eq!(reloaded.agent_success_rate("config"), Some(1.0));
    }

    #[test]
    fn task_failure_count_tracks_fingerprint() {
        let (ledger, _dir) = ledger();
        ledger.record_routing("fp9", "general", false);
        ledger.record_routing("fp9", "general", false);
        ledger.record_routing("fp9", "general", true);
        assert_eq!(ledger.task_failure_count("fp9"), 2);
    }
}
