//! The orchestrator: one entry point from task text to terminal report.
//!
//! `execute` checks the emergency stop, consults the fact ledger for past
//! solutions and known-failing tasks, asks the router for a decision, drives
//! the selected agent (resuming a parked approval when one has been decided),
//! runs secondary agents sequentially, and records the outcome for routing
//! feedback. The two sentinel errors (cost limit and emergency stop) are
//! caught here, at exactly one place.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info};

use crate::agent::profiles::{self, builtin_profiles, AgentProfile, GENERAL_AGENT};
use crate::agent::runtime::{AgentOutcome, AgentRuntime, ResumeVerdict, RunBudgets, RunStatus};
use crate::ai::provider::LlmProvider;
use crate::auth::AuthBroker;
use crate::config::Config;
use crate::context::{ContextManager, ContextPolicy};
use crate::cost::{CostLimitExceeded, CostLimits, CostTracker};
use crate::facts::FactLedger;
use crate::governance::approvals::{ApprovalStatus, ApprovalStore};
use crate::governance::Governance;
use crate::paths::StatePaths;
use crate::router::{RouteDecision, Router};
use crate::sanitize;
use crate::stop::{EmergencyStop, StopRequested};
use crate::task::{Environment, Task, TaskStatus};
use crate::tools::implementations::register_builtin_tools;
use crate::tools::registry::ToolRegistry;

/// A terminal run of this task fingerprint this many times without success
/// aborts before execution.
const KNOWN_FAILING_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub task_text: String,
    pub environment: Option<Environment>,
    /// Re-invocations may carry the original task id; resumption itself is
    /// matched by task fingerprint.
    pub task_id: Option<String>,
    pub dry_run: bool,
}

impl ExecuteRequest {
    pub fn new(task_text: impl Into<String>) -> Self {
        Self {
            task_text: task_text.into(),
            environment: None,
            task_id: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl TaskReport {
    fn new(task_id: &str, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            summary: None,
            reason: None,
            approval_id: None,
            clarification: None,
            agent: None,
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(sanitize::sanitize(&reason.into()).text);
        self
    }

    fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(sanitize::sanitize(&summary.into()).text);
        self
    }

    fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }
}

pub struct Orchestrator {
    config: Config,
    profiles: Vec<AgentProfile>,
    router: Router,
    runtime: AgentRuntime,
    registry: Arc<ToolRegistry>,
    approvals: Arc<ApprovalStore>,
    stop: Arc<EmergencyStop>,
    cost: Arc<CostTracker>,
    facts: Arc<FactLedger>,
}

impl Orchestrator {
    /// Wire up the full service graph against a state directory.
    pub async fn bootstrap(
        config: Config,
        paths: StatePaths,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(&registry).await?;

        let approvals = Arc::new(ApprovalStore::new(paths.approvals())?);
        let governance = Arc::new(Governance::new(approvals.clone()));
        let stop = Arc::new(EmergencyStop::new(paths.emergency_stop()));
        let cost = Arc::new(CostTracker::new(
            CostLimits {
                max_cost_per_task: config.max_cost_per_task,
                max_cost_per_hour: config.max_cost_per_hour,
                max_tokens_per_task: config.max_tokens_per_task,
                warn_at: 0.8,
            },
            paths.cost_history(),
        ));
        let facts = Arc::new(FactLedger::new(paths.fact_ledger()));
        let auth = Arc::new(AuthBroker::new(paths.clone()));
        let context = ContextManager::new(ContextPolicy {
            max_tokens: config.max_context_tokens,
            keep_last_user: config.keep_last_user_messages,
            keep_last_assistant: config.keep_last_assistant_messages,
        });

        let runtime = AgentRuntime::new(
            provider.clone(),
            registry.clone(),
            governance,
            stop.clone(),
            cost.clone(),
            facts.clone(),
            auth,
            context,
            RunBudgets::from_config(&config),
            paths.root().to_path_buf(),
        );
        let router = Router::new(provider, facts.clone(), config.use_semantic_routing);

        Ok(Self {
            config,
            profiles: builtin_profiles(),
            router,
            runtime,
            registry,
            approvals,
            stop,
            cost,
            facts,
        })
    }

    pub fn stop_handle(&self) -> Arc<EmergencyStop> {
        self.stop.clone()
    }

    pub fn approvals(&self) -> Arc<ApprovalStore> {
        self.approvals.clone()
    }

    /// Registration seam for tools added after startup (always red).
    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// Run a task to a terminal report. Never returns an error; internal
    /// failures become `failed(internal)` with sanitized details.
    pub async fn execute(&self, request: ExecuteRequest) -> TaskReport {
        if self.stop.is_set() {
            let reason = self
                .stop
                .reason()
                .unwrap_or_else(|| "emergency stop active".to_string());
            return TaskReport::new("-", TaskStatus::Stopped).with_reason(reason);
        }

        // Zero-length task: refused before the router is ever consulted.
        if request.task_text.trim().is_empty() {
            return TaskReport::new("-", TaskStatus::Failed).with_reason("empty_task");
        }

        let environment = request.environment.unwrap_or(self.config.environment);
        let task = Task::new(request.task_text.clone(), environment, request.task_id.clone());
        info!(task_id = %task.id, environment = %environment, "executing task");

        let report = self.execute_inner(&task, request.dry_run).await;
        self.cost.end_task(&task.id);
        report
    }

    async fn execute_inner(&self, task: &Task, dry_run: bool) -> TaskReport {
        // Resumption: a decided approval for this task is consumed here; an
        // undecided one keeps the task parked.
        let resume = match self.approvals.take_decided_for_task(&task.fingerprint) {
            Ok(approval) => approval.and_then(ResumeVerdict::from_approval),
            Err(e) => {
                error!("approval store read failed: {e:#}");
                None
            }
        };
        if resume.is_none() {
            if let Some(pending) = self
                .approvals
                .list(Some(ApprovalStatus::Pending))
                .into_iter()
                .find(|a| a.task_fingerprint == task.fingerprint)
            {
                let mut report = TaskReport::new(&task.id, TaskStatus::AwaitingApproval)
                    .with_reason("approval still pending");
                report.approval_id = Some(pending.id);
                return report;
            }
        }

        // A task that keeps failing is refused before another attempt.
        if resume.is_none() && self.facts.task_failure_count(&task.fingerprint) >= KNOWN_FAILING_THRESHOLD
        {
            return TaskReport::new(&task.id, TaskStatus::Failed).with_reason(format!(
                "this task has failed {KNOWN_FAILING_THRESHOLD}+ times before; try a different approach or break it into smaller steps"
            ));
        }

        // Solution recall: a similar solved task rides along as context.
        let recalled = self.facts.find_similar(&task.text).map(|s| s.summary);

        let route = self.router.analyze(&task.text, &self.profiles).await;
        info!(
            task_id = %task.id,
            primary = %route.primary,
            confidence = route.confidence,
            "route decided"
        );

        if let Some(prompt) = &route.clarification {
            let mut report = TaskReport::new(&task.id, TaskStatus::NeedsInput)
                .with_agent(&route.primary);
            report.clarification = Some(prompt.clone());
            return report;
        }

        let Some(profile) = profiles::find(&self.profiles, &route.primary)
            .or_else(|| profiles::find(&self.profiles, GENERAL_AGENT))
        else {
            return TaskReport::new(&task.id, TaskStatus::Failed).with_reason("no_agent");
        };

        let outcome = self
            .runtime
            .run(profile, task, recalled.as_deref(), resume, dry_run)
            .await;

        match outcome {
            Ok(outcome) => {
                self.finish(task, profile, &route, outcome, dry_run).await
            }
            Err(e) => self.classify_sentinel(task, profile, e),
        }
    }

    /// Map a successful run to a report, driving secondary agents and the
    /// routing-feedback loop.
    async fn finish(
        &self,
        task: &Task,
        profile: &AgentProfile,
        route: &RouteDecision,
        outcome: AgentOutcome,
        dry_run: bool,
    ) -> TaskReport {
        match outcome.status {
            RunStatus::Succeeded => {
                let mut summary = outcome.summary.clone();

                // Secondary agents run sequentially with the primary's
                // result as added context; their failures annotate the
                // summary instead of failing the task.
                for name in &route.secondary {
                    let Some(secondary) = profiles::find(&self.profiles, name) else {
                        continue;
                    };
                    info!(task_id = %task.id, agent = %name, "running secondary agent");
                    let primary_summary = summary.clone();
                    match self
                        .runtime
                        .run(secondary, task, Some(primary_summary.as_str()), None, dry_run)
                        .await
                    {
                        Ok(sec) if sec.status == RunStatus::Succeeded => {
                            summary.push_str("\n\n[");
                            summary.push_str(name);
                            summary.push_str("] ");
                            summary.push_str(&sec.summary);
                        }
                        Ok(sec) => {
                            summary.push_str(&format!(
                                "\n\n[{name}] did not complete ({:?})",
                                sec.status
                            ));
                        }
                        Err(e) => {
                            summary.push_str(&format!("\n\n[{name}] error: {e:#}"));
                        }
                    }
                }

                self.facts
                    .record_solution(&task.fingerprint, &task.text, &summary);
                self.facts.record_success(
                    "task",
                    &route.primary,
                    serde_json::json!({"agent": profile.name, "task_id": task.id}),
                );
                self.facts
                    .record_routing(&task.fingerprint, &profile.name, true);

                TaskReport::new(&task.id, TaskStatus::Succeeded)
                    .with_summary(summary)
                    .with_agent(&profile.name)
            }
            RunStatus::Failed => {
                self.facts
                    .record_routing(&task.fingerprint, &profile.name, false);
                TaskReport::new(&task.id, TaskStatus::Failed)
                    .with_reason(outcome.reason.unwrap_or_else(|| "unknown".to_string()))
                    .with_summary(outcome.summary)
                    .with_agent(&profile.name)
            }
            RunStatus::BudgetExhausted => {
                self.facts
                    .record_routing(&task.fingerprint, &profile.name, false);
                TaskReport::new(&task.id, TaskStatus::BudgetExhausted)
                    .with_reason(outcome.reason.unwrap_or_else(|| "budget".to_string()))
                    .with_agent(&profile.name)
            }
            RunStatus::AwaitingApproval => {
                let mut report = TaskReport::new(&task.id, TaskStatus::AwaitingApproval)
                    .with_reason(outcome.reason.unwrap_or_else(|| "approval required".to_string()))
                    .with_agent(&profile.name);
                report.approval_id = outcome.approval_id;
                report
            }
            RunStatus::NeedsInput => {
                let mut report = TaskReport::new(&task.id, TaskStatus::NeedsInput)
                    .with_agent(&profile.name);
                report.clarification = outcome.needs_input;
                report
            }
        }
    }

    /// The single catch point for sentinel errors.
    fn classify_sentinel(
        &self,
        task: &Task,
        profile: &AgentProfile,
        error: anyhow::Error,
    ) -> TaskReport {
        if let Some(cost) = error.downcast_ref::<CostLimitExceeded>() {
            self.facts
                .record_routing(&task.fingerprint, &profile.name, false);
            return TaskReport::new(&task.id, TaskStatus::BudgetExhausted)
                .with_reason(cost.to_string())
                .with_agent(&profile.name);
        }
        if let Some(stop) = error.downcast_ref::<StopRequested>() {
            return TaskReport::new(&task.id, TaskStatus::Stopped)
                .with_reason(stop.reason.clone())
                .with_agent(&profile.name);
        }

        error!(task_id = %task.id, "internal error: {error:#}");
        self.facts
            .record_routing(&task.fingerprint, &profile.name, false);
        self.facts.record_failure(
            "internal",
            &format!("internal|{error:#}"),
            serde_json::json!({"task_id": task.id}),
            vec![],
        );
        TaskReport::new(&task.id, TaskStatus::Failed)
            .with_reason(format!("internal: {error:#}"))
            .with_agent(&profile.name)
    }
}
