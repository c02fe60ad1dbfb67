//! Task identity, environment tags, and terminal status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Execution environment a task runs against. Drives the governance gate:
/// yellow operations auto-approve everywhere except production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    #[default]
    Production,
    Local,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    /// Non-production environments auto-approve yellow operations.
    pub fn auto_approves_yellow(&self) -> bool {
        !self.is_production()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Local => "local",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            "local" => Ok(Environment::Local),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// A submitted unit of work. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Stable fingerprint of the normalized task text. Used to match
    /// parked approvals and ledger records across re-invocations.
    pub fingerprint: String,
}

impl Task {
    pub fn new(text: impl Into<String>, environment: Environment, id: Option<String>) -> Self {
        let text = text.into();
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            fingerprint: fingerprint(&text),
            text,
            submitted_at: Utc::now(),
            environment,
            parent_id: None,
        }
    }
}

/// Stable fingerprint of a task: sha256 over lowercased whitespace-normalized
/// tokens, truncated to 16 hex chars. Re-invocations with the same text (the
/// resumption mechanism) fingerprint identically.
pub fn fingerprint(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Terminal status of a task as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    BudgetExhausted,
    Stopped,
    AwaitingApproval,
    NeedsInput,
}

impl TaskStatus {
    /// CLI exit code mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskStatus::Succeeded => 0,
            TaskStatus::Failed => 2,
            TaskStatus::BudgetExhausted => 3,
            TaskStatus::Stopped => 4,
            TaskStatus::AwaitingApproval => 5,
            TaskStatus::NeedsInput => 6,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::BudgetExhausted => "budget_exhausted",
            TaskStatus::Stopped => "stopped",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::NeedsInput => "needs_input",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_aliases() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!(
            "development".parse::<Environment>().unwrap(),
            Environment::Dev
        );
        assert_eq!(
            "prod".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("moon".parse::<Environment>().is_err());
    }

    #[test]
    fn fingerprint_normalizes_whitespace_and_case() {
        assert_eq!(
            fingerprint("Restart the  redis\tcontainer"),
            fingerprint("restart the redis container")
        );
        assert_ne!(fingerprint("restart redis"), fingerprint("restart postgres"));
    }

    #[test]
    fn task_gets_id_and_fingerprint() {
        let task = Task::new("list containers", Environment::Dev, None);
        assert!(!task.id.is_empty());
        assert_eq!(task.fingerprint, fingerprint("list containers"));
    }
}
