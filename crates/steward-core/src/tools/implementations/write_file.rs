//! Write or overwrite a file. Yellow: reversible, but a mutation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{decode_args, ErrorKind, RiskLevel, Tool, ToolContext, ToolResult};

#[derive(Deserialize)]
struct WriteFileParams {
    path: String,
    content: String,
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the working directory"},
                "content": {"type": "string", "description": "Full file content"}
            },
            "required": ["path", "content"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Yellow
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: WriteFileParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let path = ctx.resolve_path(&params.path);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::failure(ErrorKind::ToolError, e);
            }
        }

        let existed = path.exists();
        match tokio::fs::write(&path, params.content.as_bytes()).await {
            Ok(()) => ToolResult::success(json!({
                "path": path.display().to_string(),
                "bytes_written": params.content.len(),
                "overwrote": existed,
            })),
            Err(e) => ToolResult::failure(ErrorKind::ToolError, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_reports_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let first = WriteFileTool
            .execute(json!({"path": "conf/app.yml", "content": "a: 1\n"}), &ctx)
            .await;
        assert!(!first.is_error());
        assert_eq!(first.data.unwrap()["overwrote"], false);

        let second = WriteFileTool
            .execute(json!({"path": "conf/app.yml", "content": "a: 2\n"}), &ctx)
            .await;
        assert_eq!(second.data.unwrap()["overwrote"], true);

        let contents = std::fs::read_to_string(dir.path().join("conf/app.yml")).unwrap();
        assert_eq!(contents, "a: 2\n");
    }
}
