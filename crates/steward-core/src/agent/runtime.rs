//! The shared agent run loop.
//!
//! One loop serves every agent kind; profiles only change the system prompt
//! and the visible tool subset. The loop alternates reasoning with tool
//! dispatch under budgets and cancellation:
//!
//! ```text
//! loop:
//!     emergency-stop check, cost check, wall-clock check
//!     prune conversation → LLM (deadline) → parse reply
//!     final answer            → succeeded
//!     malformed tool request  → validation error result, continue
//!     tool request:
//!         unknown tool / bad args / already-attempted fix → error result
//!         governance: Execute|AutoApprove → sanitized dispatch (deadline)
//!                     RequireApproval     → park (awaiting_approval)
//!                     Deny                → rejection result, continue
//! ```
//!
//! Sanitization always runs before a tool result enters the conversation,
//! and the context manager prunes before every LLM call. The third identical
//! failure signature aborts the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::ai::parse::{parse_assistant_reply, protocol_instructions, AssistantAction};
use crate::ai::provider::LlmProvider;
use crate::ai::types::{Message, ToolCall};
use crate::auth::{AuthBroker, AuthCheck};
use crate::config::Config;
use crate::context::{self, ContextManager};
use crate::cost::CostTracker;
use crate::facts::{self, FactLedger};
use crate::governance::approvals::{Approval, ApprovalStatus};
use crate::governance::{Decision, Governance, InvocationRequest};
use crate::sanitize;
use crate::stop::EmergencyStop;
use crate::task::Task;
use crate::tools::registry::{ErrorKind, ToolContext, ToolRegistry, ToolResult};

use super::failure::{args_digest, signature_for, FailureTracker, LOOP_THRESHOLD};
use super::profiles::AgentProfile;

/// Budgets for a single run.
#[derive(Debug, Clone, Copy)]
pub struct RunBudgets {
    /// Tool-invoking turns allowed per run.
    pub max_iterations: usize,
    pub task_timeout: Duration,
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,
}

impl RunBudgets {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations,
            task_timeout: config.task_timeout,
            llm_timeout: config.llm_timeout,
            tool_timeout: config.tool_timeout,
        }
    }
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    AwaitingApproval,
    NeedsInput,
    BudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub status: RunStatus,
    pub summary: String,
    pub reason: Option<String>,
    pub approval_id: Option<String>,
    pub needs_input: Option<String>,
}

impl AgentOutcome {
    fn succeeded(summary: String) -> Self {
        Self {
            status: RunStatus::Succeeded,
            summary,
            reason: None,
            approval_id: None,
            needs_input: None,
        }
    }

    fn failed(reason: &str, summary: String) -> Self {
        Self {
            status: RunStatus::Failed,
            summary,
            reason: Some(reason.to_string()),
            approval_id: None,
            needs_input: None,
        }
    }

    fn budget_exhausted(reason: &str) -> Self {
        Self {
            status: RunStatus::BudgetExhausted,
            summary: String::new(),
            reason: Some(reason.to_string()),
            approval_id: None,
            needs_input: None,
        }
    }

    fn awaiting_approval(approval_id: String, reason: String) -> Self {
        Self {
            status: RunStatus::AwaitingApproval,
            summary: String::new(),
            reason: Some(reason),
            approval_id: Some(approval_id),
            needs_input: None,
        }
    }

    fn needs_input(prompt: String) -> Self {
        Self {
            status: RunStatus::NeedsInput,
            summary: String::new(),
            reason: None,
            approval_id: None,
            needs_input: Some(prompt),
        }
    }
}

/// A decided approval carried into a resumed run.
#[derive(Debug, Clone)]
pub enum ResumeVerdict {
    Approved(Approval),
    Rejected(Approval),
}

impl ResumeVerdict {
    pub fn from_approval(approval: Approval) -> Option<Self> {
        match approval.status {
            ApprovalStatus::Approved => Some(ResumeVerdict::Approved(approval)),
            ApprovalStatus::Rejected => Some(ResumeVerdict::Rejected(approval)),
            ApprovalStatus::Pending => None,
        }
    }
}

enum Dispatch {
    Continue(Message),
    Terminal(AgentOutcome),
}

pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    governance: Arc<Governance>,
    stop: Arc<EmergencyStop>,
    cost: Arc<CostTracker>,
    facts: Arc<FactLedger>,
    auth: Arc<AuthBroker>,
    context: ContextManager,
    budgets: RunBudgets,
    working_dir: std::path::PathBuf,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        governance: Arc<Governance>,
        stop: Arc<EmergencyStop>,
        cost: Arc<CostTracker>,
        facts: Arc<FactLedger>,
        auth: Arc<AuthBroker>,
        context: ContextManager,
        budgets: RunBudgets,
        working_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            provider,
            registry,
            governance,
            stop,
            cost,
            facts,
            auth,
            context,
            budgets,
            working_dir,
        }
    }

    /// Drive one agent run to a terminal outcome. Emergency stop and cost
    /// ceilings surface as sentinel errors for the orchestrator to catch;
    /// every other condition is a normal outcome.
    pub async fn run(
        &self,
        profile: &AgentProfile,
        task: &Task,
        extra_context: Option<&str>,
        resume: Option<ResumeVerdict>,
        dry_run: bool,
    ) -> Result<AgentOutcome> {
        let started = Instant::now();
        let mut conversation = self.initial_conversation(profile, task, extra_context).await;
        let mut tracker = FailureTracker::default();
        let mut tool_turns = 0usize;

        // Resumption: act on the operator's verdict before reasoning again.
        if let Some(verdict) = resume {
            match verdict {
                ResumeVerdict::Approved(approval) => {
                    info!(
                        approval_id = %approval.id,
                        tool = %approval.tool_name,
                        "resuming with approved invocation"
                    );
                    tool_turns += 1;
                    let call = ToolCall {
                        name: approval.tool_name.clone(),
                        args: approval.args.clone(),
                    };
                    match self
                        .invoke_tool(&call, task, started, &mut tracker, profile)
                        .await
                    {
                        Dispatch::Continue(message) => conversation.push(message),
                        Dispatch::Terminal(outcome) => return Ok(outcome),
                    }
                }
                ResumeVerdict::Rejected(approval) => {
                    info!(approval_id = %approval.id, "resuming with rejected invocation");
                    let reason = approval
                        .rejection_reason
                        .clone()
                        .unwrap_or_else(|| "rejected by operator".to_string());
                    let digest = args_digest(&approval.tool_name, &approval.args);
                    let result = ToolResult::failure(ErrorKind::Rejected, &reason);
                    conversation.push(Message::ToolResult {
                        tool_name: approval.tool_name.clone(),
                        args_digest: digest,
                        content: result.render(),
                        is_error: true,
                    });
                }
            }
        }

        loop {
            // Yield-point checks. Stop and cost are sentinels; wall clock is
            // a budget outcome.
            self.stop.check().map_err(anyhow::Error::new)?;
            self.cost
                .ensure_within_limits(&task.id)
                .map_err(anyhow::Error::new)?;
            if started.elapsed() >= self.budgets.task_timeout {
                return Ok(AgentOutcome::budget_exhausted("wall_clock"));
            }

            // Reasoning.
            let pruned = self.context.prune(&conversation);
            let remaining = self.budgets.task_timeout.saturating_sub(started.elapsed());
            let llm_deadline = self.budgets.llm_timeout.min(remaining);

            let response =
                match tokio::time::timeout(llm_deadline, self.provider.invoke(&pruned)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        let detail = sanitize::sanitize(&format!("{e:#}")).text;
                        warn!(error = %detail, "LLM invocation failed");
                        return Ok(AgentOutcome::failed("llm_error", detail));
                    }
                    Err(_) => {
                        // Synthetic timeout result so the model can react on
                        // the next turn; repeated timeouts trip the loop
                        // detector.
                        let rendered = ToolResult::failure(
                            ErrorKind::Timeout,
                            format!("LLM call timed out after {}s", llm_deadline.as_secs()),
                        )
                        .render();
                        let signature = signature_for("llm", &rendered);
                        let count = tracker.record_failure(&signature, "llm");
                        conversation.push(Message::ToolResult {
                            tool_name: "llm".to_string(),
                            args_digest: "-".to_string(),
                            content: rendered,
                            is_error: true,
                        });
                        if count >= LOOP_THRESHOLD {
                            return Ok(AgentOutcome::failed(
                                "repeated_error",
                                format!("LLM timed out {count} times"),
                            ));
                        }
                        continue;
                    }
                };

            let mut usage = response.usage;
            if usage.input_tokens == 0 && usage.output_tokens == 0 {
                usage.input_tokens = pruned
                    .iter()
                    .map(|m| self.provider.estimate_tokens(&m.text()))
                    .sum();
                usage.output_tokens = self.provider.estimate_tokens(&response.text);
            }
            self.cost.record(
                &task.id,
                usage.input_tokens,
                usage.output_tokens,
                self.provider.rates(),
            );

            conversation.push(Message::assistant(response.text.clone()));

            match parse_assistant_reply(&response.text) {
                AssistantAction::Final => {
                    let summary = strip_tool_fences(&response.text).trim().to_string();
                    return Ok(AgentOutcome::succeeded(summary));
                }
                AssistantAction::Malformed(error) => {
                    debug!(error = %error, "malformed tool request");
                    let rendered =
                        ToolResult::failure(ErrorKind::InvalidParameters, &error).render();
                    let signature = signature_for("tool_request", &rendered);
                    let count = tracker.record_failure(&signature, "tool_request");
                    conversation.push(Message::ToolResult {
                        tool_name: "tool_request".to_string(),
                        args_digest: "-".to_string(),
                        content: rendered,
                        is_error: true,
                    });
                    if count >= LOOP_THRESHOLD {
                        return Ok(AgentOutcome::failed(
                            "repeated_error",
                            format!("tool request malformed {count} times"),
                        ));
                    }
                }
                AssistantAction::ToolCall(call) => {
                    if tool_turns >= self.budgets.max_iterations {
                        return Ok(AgentOutcome::budget_exhausted("iteration_cap"));
                    }
                    tool_turns += 1;

                    match self
                        .dispatch(&call, task, started, &mut tracker, dry_run, profile)
                        .await
                    {
                        Dispatch::Continue(message) => conversation.push(message),
                        Dispatch::Terminal(outcome) => return Ok(outcome),
                    }
                }
            }
        }
    }

    async fn initial_conversation(
        &self,
        profile: &AgentProfile,
        task: &Task,
        extra_context: Option<&str>,
    ) -> Vec<Message> {
        let descriptors = self.registry.list(None).await;
        let visible: Vec<_> = descriptors
            .iter()
            .filter(|d| {
                profile.preferred_tools.is_empty()
                    || profile.preferred_tools.iter().any(|p| p == &d.name)
            })
            .collect();

        let mut tool_lines = String::new();
        for descriptor in &visible {
            tool_lines.push_str(&format!(
                "- {} [{}]: {}\n  parameters: {}\n",
                descriptor.name,
                descriptor.risk,
                descriptor.description,
                descriptor.parameters_schema
            ));
        }

        let system = format!(
            "{}\n\nEnvironment: {}\n\nAVAILABLE TOOLS:\n{}\n{}",
            profile.system_prompt,
            task.environment,
            tool_lines,
            protocol_instructions()
        );

        let mut user = task.text.clone();
        if let Some(extra) = extra_context {
            user.push_str("\n\nContext from similar past work:\n");
            user.push_str(extra);
        }

        vec![Message::system(system), Message::user(user)]
    }

    /// Full dispatch path for a model-requested call: validation, attempted-
    /// fix ban, auth, governance, then execution.
    async fn dispatch(
        &self,
        call: &ToolCall,
        task: &Task,
        started: Instant,
        tracker: &mut FailureTracker,
        dry_run: bool,
        profile: &AgentProfile,
    ) -> Dispatch {
        let digest = args_digest(&call.name, &call.args);

        // Unknown tool: immediate failure, no governance call.
        let Some(registered) = self.registry.lookup(&call.name).await else {
            let result = ToolResult::failure(
                ErrorKind::UnknownTool,
                format!("unknown tool: {}", call.name),
            );
            return self.error_result(call, &digest, result, tracker);
        };

        // Arguments are validated before governance ever sees the request.
        if let Err(error) =
            ToolRegistry::validate_args(&registered.tool.parameters_schema(), &call.args)
        {
            let result = ToolResult::failure(
                ErrorKind::InvalidParameters,
                format!("invalid parameters: {error}"),
            );
            return self.error_result(call, &digest, result, tracker);
        }

        // An attempted fix that already failed is never retried in one run.
        if let Some(previous) = tracker.already_failed(&digest) {
            let result = ToolResult::failure(
                ErrorKind::PreviouslyAttempted,
                format!(
                    "this exact call already failed in this run ({previous}); try a different approach"
                ),
            );
            return self.error_result(call, &digest, result, tracker);
        }

        // Identity requirements resolve outside the conversation.
        if let Some(identity) = registered.tool.required_identity() {
            if let AuthCheck::NeedAction { prompt, .. } = self.auth.require(identity).await {
                return Dispatch::Terminal(AgentOutcome::needs_input(prompt));
            }
        }

        let request = InvocationRequest {
            tool_name: call.name.clone(),
            args: call.args.clone(),
            agent: profile.name.clone(),
            task_id: task.id.clone(),
            task_fingerprint: task.fingerprint.clone(),
            environment: task.environment,
        };

        match self.governance.decide(&request, &registered, dry_run) {
            Decision::Execute => {}
            Decision::AutoApprove { reason } => {
                info!(tool = %call.name, reason = %reason, "auto-approved");
            }
            Decision::RequireApproval {
                approval_id,
                reason,
            } => {
                info!(tool = %call.name, approval_id = %approval_id, "parked for approval");
                return Dispatch::Terminal(AgentOutcome::awaiting_approval(approval_id, reason));
            }
            Decision::Deny { reason } => {
                let result = ToolResult::failure(ErrorKind::Rejected, &reason);
                return self.error_result(call, &digest, result, tracker);
            }
        }

        self.invoke_tool(call, task, started, tracker, profile).await
    }

    /// Execute an already-authorized call and fold the sanitized result into
    /// the conversation.
    async fn invoke_tool(
        &self,
        call: &ToolCall,
        task: &Task,
        started: Instant,
        tracker: &mut FailureTracker,
        _profile: &AgentProfile,
    ) -> Dispatch {
        let digest = args_digest(&call.name, &call.args);

        // The effective deadline is the smaller of the tool cap and what is
        // left of the task's wall clock.
        let remaining = self.budgets.task_timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Dispatch::Terminal(AgentOutcome::budget_exhausted("wall_clock"));
        }
        let ctx = ToolContext {
            working_dir: self.working_dir.clone(),
            environment: task.environment,
            timeout: Some(self.budgets.tool_timeout.min(remaining)),
        };

        let result = self
            .registry
            .execute(&call.name, call.args.clone(), &ctx)
            .await
            .unwrap_or_else(|| {
                ToolResult::failure(
                    ErrorKind::UnknownTool,
                    format!("unknown tool: {}", call.name),
                )
            });

        if result.is_error() {
            return self.error_result(call, &digest, result, tracker);
        }

        Dispatch::Continue(self.tool_message(call, &digest, result))
    }

    /// Record a failed result against the loop detector and fold it into the
    /// conversation, terminating the run on the third identical signature.
    fn error_result(
        &self,
        call: &ToolCall,
        digest: &str,
        result: ToolResult,
        tracker: &mut FailureTracker,
    ) -> Dispatch {
        let sanitized = sanitize::sanitize(&result.render()).text;
        let signature = signature_for(&call.name, &sanitized);
        let count = tracker.record_failure(&signature, digest);

        let fixes = facts::suggest_fixes(&call.name, count);
        self.facts.record_failure(
            &call.name,
            &signature.key(),
            json!({"args_digest": digest}),
            fixes.clone(),
        );

        if count >= LOOP_THRESHOLD {
            warn!(
                tool = %call.name,
                signature = %signature.key(),
                count,
                "repeated failure loop detected"
            );
            return Dispatch::Terminal(AgentOutcome::failed(
                "repeated_error",
                format!(
                    "'{}' failed {count} times with the same '{}' error",
                    call.name, signature.error_class
                ),
            ));
        }

        // From the second occurrence, replay a hint alongside the error.
        let mut content = sanitize::clamp_for_context(&context::compress_tool_output(&sanitized));
        if count >= 2 {
            if let Some(hint) = fixes.first() {
                content.push_str("\nHint: ");
                content.push_str(hint);
            }
        }

        Dispatch::Continue(Message::ToolResult {
            tool_name: call.name.clone(),
            args_digest: digest.to_string(),
            content,
            is_error: true,
        })
    }

    /// Sanitize, compress, and clamp a successful result before it enters
    /// the conversation.
    fn tool_message(&self, call: &ToolCall, digest: &str, result: ToolResult) -> Message {
        let sanitized = sanitize::sanitize(&result.render()).text;
        let content = sanitize::clamp_for_context(&context::compress_tool_output(&sanitized));
        if sanitize::has_secrets(&content) {
            warn!(tool = %call.name, "residual secret markers after sanitization");
        }
        Message::ToolResult {
            tool_name: call.name.clone(),
            args_digest: digest.to_string(),
            content,
            is_error: result.is_error(),
        }
    }
}

/// Remove tool fences from a final reply so the summary reads clean.
fn strip_tool_fences(text: &str) -> String {
    match text.find("```tool") {
        Some(idx) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::backends::ScriptedProvider;
    use crate::config::Config;
    use crate::context::ContextPolicy;
    use crate::cost::{CostLimits, CostTracker};
    use crate::governance::approvals::ApprovalStore;
    use crate::paths::StatePaths;
    use crate::task::Environment;
    use crate::tools::registry::{RiskLevel, Tool};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Harness {
        runtime: AgentRuntime,
        store: Arc<ApprovalStore>,
        _dir: tempfile::TempDir,
    }

    struct CountTool;

    #[async_trait]
    impl Tool for CountTool {
        fn name(&self) -> &str {
            "count"
        }
        fn description(&self) -> &str {
            "Returns a count"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Green
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(json!({"count": 3}))
        }
    }

    struct AlwaysFailTool;

    #[async_trait]
    impl Tool for AlwaysFailTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails the same way"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"attempt": {"type": "integer"}}
            })
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Green
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::failure(ErrorKind::ToolError, "the widget is jammed")
        }
    }

    struct RestartTool;

    #[async_trait]
    impl Tool for RestartTool {
        fn name(&self) -> &str {
            "restart_service"
        }
        fn description(&self) -> &str {
            "Restarts a service"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"service": {"type": "string"}},
                "required": ["service"]
            })
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Red
        }
        async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(json!({"restarted": params["service"]}))
        }
    }

    struct SecretTool;

    #[async_trait]
    impl Tool for SecretTool {
        fn name(&self) -> &str {
            "leaky"
        }
        fn description(&self) -> &str {
            "Returns output containing a credential"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Green
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(json!({"output": "API_KEY=sk-ABCDEFGHIJKLMNOPQRSTUVWX"}))
        }
    }

    async fn harness(replies: Vec<&str>, budgets: RunBudgets) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CountTool)).await.unwrap();
        registry.register(Arc::new(AlwaysFailTool)).await.unwrap();
        registry.register(Arc::new(RestartTool)).await.unwrap();
        registry.register(Arc::new(SecretTool)).await.unwrap();

        let store = Arc::new(ApprovalStore::new(paths.approvals()).unwrap());
        let runtime = AgentRuntime::new(
            Arc::new(ScriptedProvider::new(replies)),
            registry,
            Arc::new(Governance::new(store.clone())),
            Arc::new(EmergencyStop::new(paths.emergency_stop())),
            Arc::new(CostTracker::new(CostLimits::default(), paths.cost_history())),
            Arc::new(FactLedger::new(paths.fact_ledger())),
            Arc::new(AuthBroker::new(paths.clone())),
            ContextManager::new(ContextPolicy::default()),
            budgets,
            dir.path().to_path_buf(),
        );

        Harness {
            runtime,
            store,
            _dir: dir,
        }
    }

    fn profile() -> AgentProfile {
        crate::agent::profiles::builtin_profiles()
            .into_iter()
            .find(|p| p.name == "general")
            .unwrap()
    }

    fn task(text: &str, env: Environment) -> Task {
        Task::new(text, env, None)
    }

    const CALL_COUNT: &str = "```tool\n{\"tool\": \"count\", \"args\": {}}\n```";
    const CALL_BROKEN: &str = "```tool\n{\"tool\": \"broken\", \"args\": {}}\n```";

    #[tokio::test]
    async fn plain_reply_succeeds_without_tools() {
        let h = harness(vec!["All done: nothing to do."], RunBudgets::default()).await;
        let outcome = h
            .runtime
            .run(&profile(), &task("say hi", Environment::Dev), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(outcome.summary.contains("nothing to do"));
    }

    #[tokio::test]
    async fn tool_call_then_final_answer() {
        let h = harness(
            vec![CALL_COUNT, "There are 3 items."],
            RunBudgets::default(),
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("count items", Environment::Dev), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.summary, "There are 3 items.");
    }

    #[tokio::test]
    async fn red_tool_parks_with_pending_approval() {
        let h = harness(
            vec!["```tool\n{\"tool\": \"restart_service\", \"args\": {\"service\": \"web\"}}\n```"],
            RunBudgets::default(),
        )
        .await;
        let outcome = h
            .runtime
            .run(
                &profile(),
                &task("restart web", Environment::Dev),
                None,
                None,
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::AwaitingApproval);
        let approval_id = outcome.approval_id.unwrap();
        let pending = h.store.get(&approval_id).unwrap();
        assert_eq!(pending.status, ApprovalStatus::Pending);
        assert_eq!(pending.tool_name, "restart_service");
    }

    #[tokio::test]
    async fn approved_resume_executes_the_parked_call() {
        let h = harness(
            vec!["Service restarted successfully."],
            RunBudgets::default(),
        )
        .await;
        let t = task("restart web", Environment::Dev);

        let approval = Approval::new(
            "restart_service",
            &json!({"service": "web"}),
            "restart web",
            RiskLevel::Red,
            "general",
            &t.id,
            &t.fingerprint,
            Environment::Dev,
        );
        let id = h.store.create(approval).unwrap();
        h.store.approve(&id, None).unwrap();
        let decided = h.store.take_decided_for_task(&t.fingerprint).unwrap().unwrap();

        let outcome = h
            .runtime
            .run(
                &profile(),
                &t,
                None,
                ResumeVerdict::from_approval(decided),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn rejected_resume_surfaces_rejection_to_the_model() {
        let h = harness(
            vec!["Understood, I will not restart the service."],
            RunBudgets::default(),
        )
        .await;
        let t = task("restart web", Environment::Dev);

        let approval = Approval::new(
            "restart_service",
            &json!({"service": "web"}),
            "restart web",
            RiskLevel::Red,
            "general",
            &t.id,
            &t.fingerprint,
            Environment::Dev,
        );
        let id = h.store.create(approval).unwrap();
        h.store.reject(&id, "not now").unwrap();
        let decided = h.store.take_decided_for_task(&t.fingerprint).unwrap().unwrap();

        let outcome = h
            .runtime
            .run(
                &profile(),
                &t,
                None,
                ResumeVerdict::from_approval(decided),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(outcome.summary.contains("will not restart"));
    }

    #[tokio::test]
    async fn repeated_identical_failures_trip_loop_detection() {
        // Three attempts with different args but the same error signature;
        // the third terminates the run.
        let h = harness(
            vec![
                "```tool\n{\"tool\": \"broken\", \"args\": {\"attempt\": 1}}\n```",
                "```tool\n{\"tool\": \"broken\", \"args\": {\"attempt\": 2}}\n```",
                "```tool\n{\"tool\": \"broken\", \"args\": {\"attempt\": 3}}\n```",
                "never reached",
            ],
            RunBudgets {
                max_iterations: 10,
                ..Default::default()
            },
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("fix widget", Environment::Dev), None, None, false)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("repeated_error"));
    }

    #[tokio::test]
    async fn attempted_fix_is_never_retried_in_the_same_run() {
        // The second identical call is refused without invoking the tool.
        let h = harness(
            vec![
                CALL_BROKEN,
                CALL_BROKEN,
                "Giving up on the broken widget.",
            ],
            RunBudgets {
                max_iterations: 10,
                ..Default::default()
            },
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("fix widget", Environment::Dev), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn iteration_cap_exhausts_budget() {
        let replies: Vec<&str> = std::iter::repeat(CALL_COUNT).take(4).collect();
        let h = harness(
            replies,
            RunBudgets {
                max_iterations: 2,
                ..Default::default()
            },
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("count forever", Environment::Dev), None, None, false)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::BudgetExhausted);
        assert_eq!(outcome.reason.as_deref(), Some("iteration_cap"));
    }

    #[tokio::test]
    async fn emergency_stop_preempts_at_yield_point() {
        let h = harness(vec![CALL_COUNT, "done"], RunBudgets::default()).await;
        h.runtime.stop.trigger("ops drill");

        let err = h
            .runtime
            .run(&profile(), &task("anything", Environment::Dev), None, None, false)
            .await
            .unwrap_err();
        let stop = err.downcast_ref::<crate::stop::StopRequested>().unwrap();
        assert_eq!(stop.reason, "ops drill");
    }

    #[tokio::test]
    async fn unknown_tool_is_surfaced_without_invocation() {
        let h = harness(
            vec![
                "```tool\n{\"tool\": \"no_such_tool\", \"args\": {}}\n```",
                "Could not find that tool.",
            ],
            RunBudgets::default(),
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("use a ghost tool", Environment::Dev), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        // No approval was created for the unknown tool.
        assert!(h.store.list(None).is_empty());
    }

    #[tokio::test]
    async fn malformed_request_becomes_validation_error() {
        let h = harness(
            vec![
                "```tool\nnot json\n```",
                "Sorry, let me answer directly: done.",
            ],
            RunBudgets::default(),
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("do a thing", Environment::Dev), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn dry_run_rejects_approval_requiring_calls_without_records() {
        let h = harness(
            vec![
                "```tool\n{\"tool\": \"restart_service\", \"args\": {\"service\": \"web\"}}\n```",
                "Rejected by policy, stopping here.",
            ],
            RunBudgets::default(),
        )
        .await;
        let outcome = h
            .runtime
            .run(&profile(), &task("restart web", Environment::Dev), None, None, true)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(h.store.list(None).is_empty());
    }

    #[tokio::test]
    async fn secrets_never_reach_the_conversation() {
        let h = harness(
            vec![
                "```tool\n{\"tool\": \"leaky\", \"args\": {}}\n```",
                "The key is stored safely.",
            ],
            RunBudgets::default(),
        )
        .await;
        // The scripted provider sees the full conversation; if the secret
        // leaked it would be in the pruned messages. We verify indirectly:
        // the fact ledger and approval store must not contain the raw key.
        let outcome = h
            .runtime
            .run(&profile(), &task("leak a key", Environment::Dev), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let ledger_path = h._dir.path().join("fact_ledger.json");
        if ledger_path.exists() {
            let raw = std::fs::read_to_string(ledger_path).unwrap();
            assert!(!raw.contains("ABCDEFGHIJKLMNOPQRSTUVWX"));
        }
    }
}
