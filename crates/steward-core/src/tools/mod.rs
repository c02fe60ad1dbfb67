//! Tool system: the registry, the `Tool` trait, and built-in implementations.

pub mod implementations;
pub mod registry;

pub use self::registry::{
    decode_args, ErrorKind, RegisteredTool, RiskLevel, Tool, ToolContext, ToolDescriptor,
    ToolRegistry, ToolResult, ToolStatus,
};
