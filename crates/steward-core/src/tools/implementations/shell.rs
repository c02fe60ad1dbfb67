//! Shell command execution.
//!
//! Registered red: governance regrades individual invocations (read-only
//! commands become green, destructive ones stay red and are not downgradable).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{decode_args, ErrorKind, RiskLevel, Tool, ToolContext, ToolResult};

const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

#[derive(Deserialize)]
struct ShellParams {
    command: String,
}

pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command on the host and return stdout, stderr, and the exit code"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command to run via sh -c"}
            },
            "required": ["command"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Red
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: ShellParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.working_dir)
            .output()
            .await;

        let output = match output {
            Ok(o) => o,
            Err(e) => return ToolResult::failure(ErrorKind::ToolError, e),
        };

        let stdout = clip(&String::from_utf8_lossy(&output.stdout));
        let stderr = clip(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            ToolResult::success(json!({"stdout": stdout, "stderr": stderr}))
                .with_metadata(json!({"exit_code": exit_code}))
        } else {
            ToolResult::failure(
                ErrorKind::CommandFailed,
                format!("command exited with code {exit_code}"),
            )
            .with_data(json!({"stdout": stdout, "stderr": stderr, "exit_code": exit_code}))
        }
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_CAPTURED_OUTPUT {
        return text.to_string();
    }
    let mut boundary = MAX_CAPTURED_OUTPUT;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}\n… [output clipped]", &text[..boundary])
}
