//! HTTP GET tool for research tasks. Read-only, green.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{decode_args, ErrorKind, RiskLevel, Tool, ToolContext, ToolResult};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_CHARS: usize = 20_000;

#[derive(Deserialize)]
struct HttpFetchParams {
    url: String,
}

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with an HTTP GET and return the response body"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "http(s) URL to fetch"}
            },
            "required": ["url"]
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Green
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let params: HttpFetchParams = match decode_args(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if !params.url.starts_with("http://") && !params.url.starts_with("https://") {
            return ToolResult::failure(
                ErrorKind::InvalidParameters,
                "url must be http or https",
            );
        }

        let response = match self.client.get(&params.url).send().await {
            Ok(r) => r,
            // Connection-level hiccups are worth the dispatch layer's retry.
            Err(e) if e.is_connect() || e.is_timeout() => {
                return ToolResult::failure(ErrorKind::TransientIo, e)
            }
            Err(e) => return ToolResult::failure(ErrorKind::ToolError, e),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::failure(ErrorKind::ToolError, e),
        };

        let truncated = body.len() > MAX_BODY_CHARS;
        let body = if truncated {
            let mut boundary = MAX_BODY_CHARS;
            while boundary > 0 && !body.is_char_boundary(boundary) {
                boundary -= 1;
            }
            body[..boundary].to_string()
        } else {
            body
        };

        ToolResult::success(json!({"status": status, "body": body}))
            .with_metadata(json!({"truncated": truncated}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let result = HttpFetchTool::new()
            .execute(json!({"url": "file:///etc/passwd"}), &ToolContext::default())
            .await;
        assert!(result.is_error());
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidParameters));
    }
}
