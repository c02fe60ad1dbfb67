//! Tool registry: registration with risk metadata, schema validation, and
//! timeout-wrapped dispatch.
//!
//! Tools are uniform `{name, schema, risk, handle}` records dispatched by
//! name. Every invocation is normalized into a [`ToolResult`] envelope
//! (`status`, `data` on success, a typed `error_kind` plus message on
//! failure) before it goes anywhere near the conversation; the loop detector
//! keys its signatures on the kind, and the dispatch layer retries
//! `TransientIo` failures exactly once. Registration validates uniqueness
//! and, for dynamically added tools, rejects command templates with
//! destructive patterns unless the registry is explicitly configured to
//! permit them; dynamic tools always start red.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::governance::shell::{grade_command, ShellGrade};
use crate::task::Environment;

/// Default tool execution timeout (5 minutes).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Traffic-light risk grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only, safe, idempotent.
    Green,
    /// Reversible mutations: drafts, file writes, container exec.
    Yellow,
    /// Destructive or production-affecting. Always needs an approval.
    Red,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Green => "green",
            RiskLevel::Yellow => "yellow",
            RiskLevel::Red => "red",
        };
        f.write_str(s)
    }
}

/// What went wrong with an invocation. Failure signatures are keyed on this,
/// so two failures of the same kind with the same message fingerprint count
/// as the same loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameters,
    UnknownTool,
    Timeout,
    /// Refused by governance or an operator verdict.
    Rejected,
    /// The identical call already failed in this run.
    PreviouslyAttempted,
    NotFound,
    CommandFailed,
    /// Network or subprocess hiccup worth exactly one retry.
    TransientIo,
    ToolError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::PreviouslyAttempted => "previously_attempted",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::ToolError => "tool_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Normalized result of one tool invocation.
///
/// Serialized as-is for the conversation: `{"status": "success", "data": …}`
/// or `{"status": "error", "error_kind": …, "error_message": …}`, with
/// optional `metadata` either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            data: Some(data),
            error_kind: None,
            error_message: None,
            metadata: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self {
            status: ToolStatus::Error,
            data: None,
            error_kind: Some(kind),
            error_message: Some(message.to_string()),
            metadata: None,
        }
    }

    /// Attach payload details (partial output of a failed command, say).
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Serialize for the conversation. The sanitizer runs on this string
    /// before it is appended anywhere.
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"error","error_kind":"tool_error","error_message":"unrenderable tool result"}"#
                .to_string()
        })
    }
}

/// Decode tool arguments into a typed struct; a mismatch becomes an
/// invalid-parameters failure the tool returns as-is.
pub fn decode_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolResult> {
    serde_json::from_value(args).map_err(|e| {
        ToolResult::failure(
            ErrorKind::InvalidParameters,
            format!("invalid parameters: {e}"),
        )
    })
}

/// Context handed to every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub environment: Environment,
    /// Per-call timeout override (shrunk to the remaining task budget).
    pub timeout: Option<Duration>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            environment: Environment::default(),
            timeout: None,
        }
    }
}

impl ToolContext {
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.working_dir.join(p)
        }
    }
}

/// Trait for tool implementations.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for parameters: `{"type": "object", "properties": …,
    /// "required": […]}`.
    fn parameters_schema(&self) -> Value;

    /// Registered risk grade. Governance may override per invocation.
    fn risk(&self) -> RiskLevel;

    /// Environments where this tool may run at all. `None` means anywhere.
    fn allowed_contexts(&self) -> Option<Vec<Environment>> {
        None
    }

    /// Identity this tool needs resolved by the auth broker, if any.
    fn required_identity(&self) -> Option<&str> {
        None
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// A tool plus its registration metadata.
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub risk: RiskLevel,
    pub allowed_contexts: Option<Vec<Environment>>,
    pub dynamic: bool,
}

/// Metadata exposed to agents and the router.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub risk: RiskLevel,
    pub parameters_schema: Value,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    default_timeout: Duration,
    /// Allow dynamic registration of tools whose templates look destructive.
    permit_dangerous_dynamic: bool,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
            permit_dangerous_dynamic: false,
        }
    }

    pub fn permitting_dangerous_dynamic(mut self) -> Self {
        self.permit_dangerous_dynamic = true;
        self
    }

    /// Register a tool at startup. Names are unique process-wide.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            bail!("tool '{name}' is already registered");
        }
        let registered = RegisteredTool {
            risk: tool.risk(),
            allowed_contexts: tool.allowed_contexts(),
            dynamic: false,
            tool,
        };
        tools.insert(name, registered);
        Ok(())
    }

    /// Register a tool added after startup. Dynamic tools always start red,
    /// and a destructive command template is rejected outright unless the
    /// registry permits such tools.
    pub async fn register_dynamic(
        &self,
        tool: Arc<dyn Tool>,
        command_template: Option<&str>,
    ) -> Result<()> {
        if let Some(template) = command_template {
            if let ShellGrade::Destructive(reason) = grade_command(template) {
                if !self.permit_dangerous_dynamic {
                    bail!("dynamic tool '{}' rejected: {reason}", tool.name());
                }
                tracing::warn!(
                    tool = tool.name(),
                    reason,
                    "registering dynamic tool with destructive template"
                );
            }
        }

        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            bail!("tool '{name}' is already registered");
        }
        let registered = RegisteredTool {
            risk: RiskLevel::Red,
            allowed_contexts: tool.allowed_contexts(),
            dynamic: true,
            tool,
        };
        tools.insert(name, registered);
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self, risk: Option<RiskLevel>) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolDescriptor> = tools
            .values()
            .filter(|t| risk.map_or(true, |r| t.risk == r))
            .map(|t| ToolDescriptor {
                name: t.tool.name().to_string(),
                description: t.tool.description().to_string(),
                risk: t.risk,
                parameters_schema: t.tool.parameters_schema(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Validate arguments against a tool's declared schema.
    pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
        let Some(args_map) = args.as_object() else {
            return Err("arguments must be an object".to_string());
        };
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !args_map.contains_key(field) {
                    return Err(format!("missing field `{field}`"));
                }
            }
        }

        for (key, value) in args_map {
            let Some(spec) = properties.get(key) else {
                return Err(format!("unknown field `{key}`"));
            };
            if let Some(expected) = spec.get("type").and_then(Value::as_str) {
                let ok = match expected {
                    "string" => value.is_string(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "object" => value.is_object(),
                    "array" => value.is_array(),
                    _ => true,
                };
                if !ok {
                    return Err(format!("field `{key}` must be of type {expected}"));
                }
            }
        }

        Ok(())
    }

    /// Execute a tool with a deadline. A `TransientIo` failure gets exactly
    /// one retry after a short backoff; a second failure surfaces as a
    /// normal tool error. Returns `None` for an unknown tool.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> Option<ToolResult> {
        let registered = self.lookup(name).await?;
        let timeout = ctx.timeout.unwrap_or(self.default_timeout);

        let mut result = self
            .execute_once(&registered, name, params.clone(), ctx, timeout)
            .await;

        if result.error_kind == Some(ErrorKind::TransientIo) {
            tracing::info!(tool = name, "transient tool failure, retrying once");
            tokio::time::sleep(Duration::from_millis(500)).await;
            result = self.execute_once(&registered, name, params, ctx, timeout).await;
        }

        Some(result)
    }

    async fn execute_once(
        &self,
        registered: &RegisteredTool,
        name: &str,
        params: Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> ToolResult {
        match tokio::time::timeout(timeout, registered.tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_secs = timeout.as_secs(),
                    "tool execution timed out"
                );
                ToolResult::failure(
                    ErrorKind::Timeout,
                    format!("tool '{name}' timed out after {} seconds", timeout.as_secs()),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the message back"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            })
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Green
        }
        async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(json!({"echo": params["message"]}))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Takes too long"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Green
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ToolResult::success(json!({}))
        }
    }

    struct FlakyTool {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Fails once with a transient error, then succeeds"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Green
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                ToolResult::failure(ErrorKind::TransientIo, "connection reset by peer")
            } else {
                ToolResult::success(json!({"recovered": true}))
            }
        }
    }

    #[tokio::test]
    async fn unknown_tool_returns_none() {
        let registry = ToolRegistry::new();
        let result = registry
            .execute("missing", json!({}), &ToolContext::default())
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        assert!(registry.register(Arc::new(EchoTool)).await.is_err());
    }

    #[tokio::test]
    async fn execute_returns_normalized_envelope() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();

        let result = registry
            .execute("echo", json!({"message": "hi"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(!result.is_error());

        let parsed: Value = serde_json::from_str(&result.render()).unwrap();
        assert_eq!(parsed["status"], "success");
        assert_eq!(parsed["data"]["echo"], "hi");
        assert!(parsed.get("error_kind").is_none());
    }

    #[tokio::test]
    async fn timeout_produces_timeout_error() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await.unwrap();

        let ctx = ToolContext {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let result = registry.execute("slow", json!({}), &ctx).await.unwrap();
        assert!(result.is_error());
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn transient_failures_get_one_retry() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(FlakyTool {
                attempts: AtomicUsize::new(0),
            }))
            .await
            .unwrap();

        let result = registry
            .execute("flaky", json!({}), &ToolContext::default())
            .await
            .unwrap();
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn dynamic_tools_start_red_and_destructive_templates_are_rejected() {
        let registry = ToolRegistry::new();
        registry
            .register_dynamic(Arc::new(EchoTool), Some("docker ps"))
            .await
            .unwrap();
        let registered = registry.lookup("echo").await.unwrap();
        assert_eq!(registered.risk, RiskLevel::Red);
        assert!(registered.dynamic);

        struct Dangerous;
        #[async_trait]
        impl Tool for Dangerous {
            fn name(&self) -> &str {
                "dangerous"
            }
            fn description(&self) -> &str {
                "wipes things"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object", "properties": {}})
            }
            fn risk(&self) -> RiskLevel {
                RiskLevel::Red
            }
            async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
                ToolResult::success(json!({}))
            }
        }

        let err = registry
            .register_dynamic(Arc::new(Dangerous), Some("rm -rf /"))
            .await;
        assert!(err.is_err());
    }

    #[test]
    fn decode_args_maps_mismatches_to_invalid_parameters() {
        #[derive(serde::Deserialize, Debug)]
        struct Params {
            #[allow(dead_code)]
            name: String,
        }

        let ok: Result<Params, ToolResult> = decode_args(json!({"name": "x"}));
        assert!(ok.is_ok());

        let err: Result<Params, ToolResult> = decode_args(json!({"name": 7}));
        let result = err.unwrap_err();
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidParameters));
        assert!(result.error_message.unwrap().contains("invalid parameters"));
    }

    #[test]
    fn render_round_trips_through_serde() {
        let result = ToolResult::failure(ErrorKind::CommandFailed, "exit 1")
            .with_data(json!({"stderr": "boom"}))
            .with_metadata(json!({"exit_code": 1}));

        let parsed: ToolResult = serde_json::from_str(&result.render()).unwrap();
        assert_eq!(parsed.status, ToolStatus::Error);
        assert_eq!(parsed.error_kind, Some(ErrorKind::CommandFailed));
        assert_eq!(parsed.data.unwrap()["stderr"], "boom");
    }

    #[test]
    fn validate_args_checks_required_types_and_unknowns() {
        let schema = json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["command"]
        });

        assert!(ToolRegistry::validate_args(&schema, &json!({"command": "ls"})).is_ok());
        assert!(ToolRegistry::validate_args(
            &schema,
            &json!({"command": "ls", "timeout_secs": 5})
        )
        .is_ok());

        let missing = ToolRegistry::validate_args(&schema, &json!({})).unwrap_err();
        assert!(missing.contains("missing field"));

        let wrong_type =
            ToolRegistry::validate_args(&schema, &json!({"command": 42})).unwrap_err();
        assert!(wrong_type.contains("must be of type string"));

        let unknown =
            ToolRegistry::validate_args(&schema, &json!({"command": "ls", "extra": 1}))
                .unwrap_err();
        assert!(unknown.contains("unknown field"));
    }
}
