//! Container management tools, shelling out to the local `docker` CLI.
//!
//! The read-only tools (`docker_ps`, `docker_logs`, `docker_inspect`) are
//! green; `docker_restart` can cause downtime and is red.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{decode_args, ErrorKind, RiskLevel, Tool, ToolContext, ToolResult};

async fn run_docker(args: &[&str]) -> ToolResult {
    let output = match tokio::process::Command::new("docker").args(args).output().await {
        Ok(o) => o,
        Err(e) => {
            return ToolResult::failure(ErrorKind::ToolError, format!("docker CLI unavailable: {e}"))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        ToolResult::success(json!({"output": stdout}))
    } else {
        ToolResult::failure(
            ErrorKind::CommandFailed,
            format!("docker {} failed", args.first().unwrap_or(&"")),
        )
        .with_data(json!({"stderr": stderr, "exit_code": output.status.code().unwrap_or(-1)}))
    }
}

pub struct DockerPsTool;

#[async_trait]
impl Tool for DockerPsTool {
    fn name(&self) -> &str {
        "docker_ps"
    }

    fn description(&self) -> &str {
        "List containers (name, image, status, ports)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "all": {"type": "boolean", "description": "Include stopped containers"}
            }
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Green
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let all = params.get("all").and_then(Value::as_bool).unwrap_or(false);
        let format = "table {{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Ports}}";
        if all {
            run_docker(&["ps", "-a", "--format", format]).await
        } else {
            run_docker(&["ps", "--format", format]).await
        }
    }
}

#[derive(Deserialize)]
struct ContainerParams {
    container: String,
    #[serde(default)]
    tail: Option<u32>,
}

pub struct DockerLogsTool;

#[async_trait]
impl Tool for DockerLogsTool {
    fn name(&self) -> &str {
        "docker_logs"
    }

    fn description(&self) -> &str {
        "Read recent logs from a container"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "container": {"type": "string", "description": "Container name or id"},
                "tail": {"type": "integer", "description": "Number of trailing lines (default 50)"}
            },
            "required": ["container"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Green
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let params: ContainerParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let tail = params.tail.unwrap_or(50).to_string();
        run_docker(&["logs", "--tail", &tail, &params.container]).await
    }
}

pub struct DockerInspectTool;

#[async_trait]
impl Tool for DockerInspectTool {
    fn name(&self) -> &str {
        "docker_inspect"
    }

    fn description(&self) -> &str {
        "Inspect a container's configuration and state"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "container": {"type": "string", "description": "Container name or id"}
            },
            "required": ["container"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Green
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let params: ContainerParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        run_docker(&["inspect", &params.container]).await
    }
}

pub struct DockerRestartTool;

#[async_trait]
impl Tool for DockerRestartTool {
    fn name(&self) -> &str {
        "docker_restart"
    }

    fn description(&self) -> &str {
        "Restart a container. May cause downtime"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "container": {"type": "string", "description": "Container name or id"}
            },
            "required": ["container"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Red
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let params: ContainerParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        run_docker(&["restart", &params.container]).await
    }
}
