//! Read a file from the working directory.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{decode_args, ErrorKind, RiskLevel, Tool, ToolContext, ToolResult};

const MAX_READ_BYTES: u64 = 256 * 1024;

#[derive(Deserialize)]
struct ReadFileParams {
    path: String,
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file and return its contents"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the working directory"}
            },
            "required": ["path"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Green
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: ReadFileParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let path = ctx.resolve_path(&params.path);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > MAX_READ_BYTES => {
                return ToolResult::failure(
                    ErrorKind::ToolError,
                    format!("{} is {} bytes (limit {MAX_READ_BYTES})", path.display(), meta.len()),
                );
            }
            Err(e) => return ToolResult::failure(ErrorKind::NotFound, e),
            _ => {}
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => ToolResult::success(json!({
                "path": path.display().to_string(),
                "contents": contents,
            })),
            Err(e) => ToolResult::failure(ErrorKind::ToolError, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "hello").unwrap();
        let ctx = ToolContext {
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let result = ReadFileTool.execute(json!({"path": "note.txt"}), &ctx).await;
        assert!(!result.is_error());
        assert_eq!(result.data.unwrap()["contents"], "hello");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let result = ReadFileTool.execute(json!({"path": "nope.txt"}), &ctx).await;
        assert!(result.is_error());
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
    }
}
