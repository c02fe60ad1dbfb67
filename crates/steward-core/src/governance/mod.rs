//! Governance: the traffic-light protocol for tool invocations.
//!
//! Every side-effecting operation passes through `decide` before it runs.
//! The decision is a pure function of the invocation, the task environment,
//! and the tool's risk grade after per-invocation overrides:
//!
//! - green ⇒ execute now
//! - yellow outside production ⇒ auto-approve (recorded, not persisted)
//! - yellow in production, and red anywhere ⇒ park behind a pending approval
//! - outside the tool's `allowed_contexts` ⇒ deny outright
//!
//! Governance never raises: if the approval ledger is unreachable the
//! decision degrades to requiring an approval ("governance unavailable"),
//! so the system fails closed.

pub mod approvals;
pub mod shell;

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::task::Environment;
use crate::tools::registry::{RegisteredTool, RiskLevel};

use self::approvals::{Approval, ApprovalStore};
use self::shell::{grade_command, ShellGrade};

pub use self::approvals::ApprovalStatus;

/// A validated tool invocation presented for a decision.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub tool_name: String,
    pub args: Value,
    pub agent: String,
    pub task_id: String,
    pub task_fingerprint: String,
    pub environment: Environment,
}

/// Outcome of a governance decision.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Proceed now.
    Execute,
    /// Proceed now; the reason is recorded in the run log.
    AutoApprove { reason: String },
    /// Park the task until an operator decides.
    RequireApproval { approval_id: String, reason: String },
    /// This invocation may not run in this context at all.
    Deny { reason: String },
}

pub struct Governance {
    store: Arc<ApprovalStore>,
}

impl Governance {
    pub fn new(store: Arc<ApprovalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ApprovalStore> {
        &self.store
    }

    /// Decide an invocation. In dry-run mode anything that would park the
    /// task is rejected instead, and no approval record is persisted.
    pub fn decide(
        &self,
        request: &InvocationRequest,
        registered: &RegisteredTool,
        dry_run: bool,
    ) -> Decision {
        // Context restriction narrows where the tool may run at all.
        if let Some(allowed) = &registered.allowed_contexts {
            if !allowed.contains(&request.environment) {
                return Decision::Deny {
                    reason: format!(
                        "tool '{}' is not permitted in the {} environment",
                        request.tool_name, request.environment
                    ),
                };
            }
        }

        let risk = self.effective_risk(request, registered);

        match risk {
            RiskLevel::Green => Decision::Execute,
            RiskLevel::Yellow if request.environment.auto_approves_yellow() => {
                Decision::AutoApprove {
                    reason: "non-prod yellow".to_string(),
                }
            }
            RiskLevel::Yellow | RiskLevel::Red => {
                if dry_run {
                    return Decision::Deny {
                        reason: "rejected by dry-run policy".to_string(),
                    };
                }
                self.require_approval(request, risk)
            }
        }
    }

    /// Per-invocation risk overrides. A `shell` call is regraded from its
    /// command string: read-only goes green, destructive is red and stays
    /// red, anything else keeps the registered grade.
    fn effective_risk(&self, request: &InvocationRequest, registered: &RegisteredTool) -> RiskLevel {
        if request.tool_name != "shell" {
            return registered.risk;
        }

        let command = request
            .args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("");
        match grade_command(command) {
            ShellGrade::ReadOnly => RiskLevel::Green,
            ShellGrade::Destructive(reason) => {
                tracing::info!(command, reason, "shell command graded destructive");
                RiskLevel::Red
            }
            ShellGrade::Unknown => registered.risk,
        }
    }

    fn require_approval(&self, request: &InvocationRequest, risk: RiskLevel) -> Decision {
        let summary = format!(
            "{} wants to run {} ({} risk) in {}",
            request.agent, request.tool_name, risk, request.environment
        );
        let approval = Approval::new(
            &request.tool_name,
            &request.args,
            &summary,
            risk,
            &request.agent,
            &request.task_id,
            &request.task_fingerprint,
            request.environment,
        );

        match self.store.create(approval) {
            Ok(approval_id) => Decision::RequireApproval {
                approval_id,
                reason: format!("{risk} risk requires operator approval"),
            },
            // Fail closed: an unreachable ledger still parks the task.
            Err(e) => {
                tracing::error!("approval store unavailable: {e}");
                Decision::RequireApproval {
                    approval_id: Uuid::new_v4().to_string()[..8].to_string(),
                    reason: "governance unavailable".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{Tool, ToolContext, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubTool {
        name: &'static str,
        risk: RiskLevel,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "stub"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn risk(&self) -> RiskLevel {
            self.risk
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(json!({}))
        }
    }

    fn registered(name: &'static str, risk: RiskLevel) -> RegisteredTool {
        RegisteredTool {
            tool: Arc::new(StubTool { name, risk }),
            risk,
            allowed_contexts: None,
            dynamic: false,
        }
    }

    fn governance() -> (Governance, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ApprovalStore::new(dir.path().join("approvals.json")).unwrap());
        (Governance::new(store), dir)
    }

    fn request(tool: &str, args: Value, environment: Environment) -> InvocationRequest {
        InvocationRequest {
            tool_name: tool.to_string(),
            args,
            agent: "container".to_string(),
            task_id: "task-1".to_string(),
            task_fingerprint: "fp1".to_string(),
            environment,
        }
    }

    #[test]
    fn green_executes_everywhere() {
        let (gov, _dir) = governance();
        let tool = registered("docker_ps", RiskLevel::Green);
        for env in [Environment::Dev, Environment::Production] {
            let decision = gov.decide(&request("docker_ps", json!({}), env), &tool, false);
            assert!(matches!(decision, Decision::Execute));
        }
        assert!(gov.store().list(None).is_empty());
    }

    #[test]
    fn yellow_auto_approves_outside_production() {
        let (gov, _dir) = governance();
        let tool = registered("write_file", RiskLevel::Yellow);

        let decision = gov.decide(
            &request("write_file", json!({}), Environment::Dev),
            &tool,
            false,
        );
        assert!(matches!(
            decision,
            Decision::AutoApprove { ref reason } if reason == "non-prod yellow"
        ));
        // Auto-approvals are not persisted.
        assert!(gov.store().list(None).is_empty());
    }

    #[test]
    fn yellow_in_production_requires_approval() {
        let (gov, _dir) = governance();
        let tool = registered("write_file", RiskLevel::Yellow);

        let decision = gov.decide(
            &request("write_file", json!({}), Environment::Production),
            &tool,
            false,
        );
        let Decision::RequireApproval { approval_id, .. } = decision else {
            panic!("expected RequireApproval");
        };
        let pending = gov.store().get(&approval_id).unwrap();
        assert_eq!(pending.status, ApprovalStatus::Pending);
    }

    #[test]
    fn red_requires_approval_in_every_environment() {
        let (gov, _dir) = governance();
        let tool = registered("docker_restart", RiskLevel::Red);

        for env in [Environment::Dev, Environment::Staging, Environment::Production] {
            let decision = gov.decide(
                &request("docker_restart", json!({"container": "web"}), env),
                &tool,
                false,
            );
            assert!(matches!(decision, Decision::RequireApproval { .. }));
        }
    }

    #[test]
    fn allowed_contexts_narrow_where_a_tool_runs() {
        let (gov, _dir) = governance();
        let mut tool = registered("deploy", RiskLevel::Yellow);
        tool.allowed_contexts = Some(vec![Environment::Dev, Environment::Staging]);

        let decision = gov.decide(
            &request("deploy", json!({}), Environment::Production),
            &tool,
            false,
        );
        assert!(matches!(decision, Decision::Deny { .. }));
    }

    #[test]
    fn read_only_shell_is_regraded_green() {
        let (gov, _dir) = governance();
        let tool = registered("shell", RiskLevel::Red);

        let decision = gov.decide(
            &request(
                "shell",
                json!({"command": "docker ps"}),
                Environment::Production,
            ),
            &tool,
            false,
        );
        assert!(matches!(decision, Decision::Execute));
    }

    #[test]
    fn destructive_shell_stays_red() {
        let (gov, _dir) = governance();
        let tool = registered("shell", RiskLevel::Red);

        let decision = gov.decide(
            &request(
                "shell",
                json!({"command": "rm -rf /var/lib/app"}),
                Environment::Dev,
            ),
            &tool,
            false,
        );
        assert!(matches!(decision, Decision::RequireApproval { .. }));
    }

    #[test]
    fn dry_run_denies_instead_of_parking_and_persists_nothing() {
        let (gov, _dir) = governance();
        let tool = registered("docker_restart", RiskLevel::Red);

        let decision = gov.decide(
            &request("docker_restart", json!({}), Environment::Dev),
            &tool,
            true,
        );
        assert!(matches!(decision, Decision::Deny { .. }));
        assert!(gov.store().list(None).is_empty());
    }
}
