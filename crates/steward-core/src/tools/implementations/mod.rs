//! Built-in tools.

mod docker;
mod http_fetch;
mod read_file;
mod shell;
mod write_file;

use std::sync::Arc;

use anyhow::Result;

pub use self::docker::{DockerInspectTool, DockerLogsTool, DockerPsTool, DockerRestartTool};
pub use self::http_fetch::HttpFetchTool;
pub use self::read_file::ReadFileTool;
pub use self::shell::ShellTool;
pub use self::write_file::WriteFileTool;

use super::registry::ToolRegistry;

/// Register the default tool set.
pub async fn register_builtin_tools(registry: &ToolRegistry) -> Result<()> {
    registry.register(Arc::new(ShellTool)).await?;
    registry.register(Arc::new(ReadFileTool)).await?;
    registry.register(Arc::new(WriteFileTool)).await?;
    registry.register(Arc::new(DockerPsTool)).await?;
    registry.register(Arc::new(DockerLogsTool)).await?;
    registry.register(Arc::new(DockerInspectTool)).await?;
    registry.register(Arc::new(DockerRestartTool)).await?;
    registry.register(Arc::new(HttpFetchTool::new())).await?;
    Ok(())
}
