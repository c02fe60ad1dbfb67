//! The provider contract.
//!
//! The runtime depends on nothing beyond this trait: reason over messages,
//! return text, report (or let us estimate) token usage, and expose pricing
//! hints for the cost tracker.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{Message, Usage};

/// Cost per 1k tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Usage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse>;

    /// Rough token estimate (~4 chars per token). Backends with real
    /// tokenizers may override.
    fn estimate_tokens(&self, text: &str) -> u64 {
        (text.len() / 4) as u64
    }

    fn rates(&self) -> Rates;
}
