//! The approval ledger.
//!
//! A durable map of approval id → record, persisted as pretty JSON in the
//! working directory with atomic temp-then-rename writes. The approval CLI
//! and the orchestrator communicate solely through this file: governance
//! parks a task by creating a pending record, an operator decides it out of
//! band, and a re-invocation of the same task consumes the verdict.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::sanitize;
use crate::task::Environment;
use crate::tools::registry::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("unknown approval status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub tool_name: String,
    /// Sanitized invocation arguments; replayed on resumption.
    pub args: Value,
    pub summary: String,
    pub risk: RiskLevel,
    pub requester_agent: String,
    pub task_id: String,
    pub task_fingerprint: String,
    pub environment: Environment,
    pub status: ApprovalStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Set when a resumed run has acted on the verdict.
    #[serde(default)]
    pub consumed: bool,
}

impl Approval {
    pub fn new(
        tool_name: &str,
        args: &Value,
        summary: &str,
        risk: RiskLevel,
        requester_agent: &str,
        task_id: &str,
        task_fingerprint: &str,
        environment: Environment,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            tool_name: tool_name.to_string(),
            args: sanitize::sanitize_value(args),
            summary: sanitize::sanitize(summary).text,
            risk,
            requester_agent: requester_agent.to_string(),
            task_id: task_id.to_string(),
            task_fingerprint: task_fingerprint.to_string(),
            environment,
            status: ApprovalStatus::Pending,
            created_at: Utc::now().to_rfc3339(),
            decided_at: None,
            operator_note: None,
            rejection_reason: None,
            consumed: false,
        }
    }
}

pub struct ApprovalStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, Approval>>,
}

impl ApprovalStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let records = crate::storage::load_json::<HashMap<String, Approval>>(&path)?
            .unwrap_or_default();
        Ok(Self {
            path,
            inner: Mutex::new(records),
        })
    }

    pub fn create(&self, approval: Approval) -> Result<String> {
        let id = approval.id.clone();
        let mut inner = self.inner.lock().expect("approval store lock");
        inner.insert(id.clone(), approval);
        self.persist(&inner)?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Approval> {
        self.inner
            .lock()
            .expect("approval store lock")
            .get(id)
            .cloned()
    }

    pub fn list(&self, status: Option<ApprovalStatus>) -> Vec<Approval> {
        let inner = self.inner.lock().expect("approval store lock");
        let mut out: Vec<Approval> = inner
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Approve a pending record. Idempotent: approving an already-approved
    /// record is a no-op; a rejected record never transitions again.
    pub fn approve(&self, id: &str, note: Option<&str>) -> Result<Approval> {
        self.decide(id, ApprovalStatus::Approved, note, None)
    }

    /// Reject a pending record. Idempotent on repeated rejection; an
    /// approved record never transitions again.
    pub fn reject(&self, id: &str, reason: &str) -> Result<Approval> {
        self.decide(id, ApprovalStatus::Rejected, None, Some(reason))
    }

    fn decide(
        &self,
        id: &str,
        verdict: ApprovalStatus,
        note: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Approval> {
        let mut inner = self.inner.lock().expect("approval store lock");
        let Some(approval) = inner.get_mut(id) else {
            bail!("approval '{id}' not found");
        };

        match approval.status {
            ApprovalStatus::Pending => {
                approval.status = verdict;
                approval.decided_at = Some(Utc::now().to_rfc3339());
                approval.operator_note = note.map(str::to_string);
                approval.rejection_reason = reason.map(str::to_string);
                let decided = approval.clone();
                self.persist(&inner)?;
                Ok(decided)
            }
            current if current == verdict => Ok(approval.clone()),
            current => bail!("approval '{id}' is already {current}"),
        }
    }

    /// Take the most recent decided-but-unconsumed approval for a task
    /// fingerprint, marking it consumed. This is the resumption rendezvous.
    pub fn take_decided_for_task(&self, task_fingerprint: &str) -> Result<Option<Approval>> {
        let mut inner = self.inner.lock().expect("approval store lock");
        let candidate = inner
            .values()
            .filter(|a| {
                a.task_fingerprint == task_fingerprint
                    && !a.consumed
                    && a.status != ApprovalStatus::Pending
            })
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|a| a.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let approval = inner.get_mut(&id).expect("candidate id present");
        approval.consumed = true;
        let taken = approval.clone();
        self.persist(&inner)?;
        Ok(Some(taken))
    }

    /// Whether a task still has an undecided approval pending.
    pub fn has_pending_for_task(&self, task_fingerprint: &str) -> bool {
        self.inner
            .lock()
            .expect("approval store lock")
            .values()
            .any(|a| a.task_fingerprint == task_fingerprint && a.status == ApprovalStatus::Pending)
    }

    fn persist(&self, records: &HashMap<String, Approval>) -> Result<()> {
        crate::storage::save_json_atomic(&self.path, records)
    }
}
