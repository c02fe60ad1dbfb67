//! LLM provider layer: message types, the provider contract, concrete
//! backends, and strict parsing of the assistant's tool-request protocol.

pub mod backends;
pub mod parse;
pub mod provider;
pub mod types;

pub use self::provider::{LlmProvider, LlmResponse, Rates};
pub use self::types::{Message, ToolCall, Usage};
