//! Concrete LLM backends.
//!
//! `OllamaProvider` talks to a local Ollama server (free, private);
//! `AnthropicProvider` talks to the Anthropic Messages API. Both satisfy the
//! same contract, so the runtime never knows which one it is driving.
//! `ScriptedProvider` returns canned replies for tests and offline smoke runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{Config, ProviderSelection};

use super::provider::{LlmProvider, LlmResponse, Rates};
use super::types::{Message, Usage};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_OLLAMA_MODEL: &str = "gemma3:4b";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build the configured provider.
pub fn provider_from_config(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    match config.provider {
        ProviderSelection::Ollama => Ok(Arc::new(OllamaProvider::new(
            config.ollama_base_url.clone(),
            config
                .llm_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
        ))),
        ProviderSelection::Anthropic => {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .context("LLM_PROVIDER=anthropic requires ANTHROPIC_API_KEY")?;
            Ok(Arc::new(AnthropicProvider::new(
                api_key,
                config
                    .llm_model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            )))
        }
    }
}

fn wire_role(message: &Message) -> (&'static str, String) {
    match message {
        Message::System { text } => ("system", text.clone()),
        Message::User { text } => ("user", text.clone()),
        Message::Assistant { text } => ("assistant", text.clone()),
        // Tool results go back to the model as user turns carrying the
        // sanitized output, tagged so the model can correlate them.
        Message::ToolResult { .. } => ("user", message.text()),
    }
}

// ── Ollama ─────────────────────────────────────────────────────────────

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse> {
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| {
                let (role, content) = wire_role(m);
                json!({"role": role, "content": content})
            })
            .collect();

        let body = json!({
            "model": self.model,
            "messages": wire,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?;

        let status = response.status();
        let payload: Value = response.json().await.context("ollama response body")?;
        if !status.is_success() {
            return Err(anyhow!("ollama returned {status}: {payload}"));
        }

        let text = payload
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let usage = Usage {
            input_tokens: payload
                .get("prompt_eval_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: payload.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
        };

        Ok(LlmResponse { text, usage })
    }

    fn rates(&self) -> Rates {
        // Local inference is free.
        Rates::default()
    }
}

// ── Anthropic ──────────────────────────────────────────────────────────

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse> {
        // Anthropic takes system prompts out of band.
        let mut system = String::new();
        let mut wire: Vec<Value> = Vec::new();
        for message in messages {
            let (role, content) = wire_role(message);
            if role == "system" {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&content);
            } else {
                wire.push(json!({"role": role, "content": content}));
            }
        }

        let body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": system,
            "messages": wire,
        });

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = response.status();
        let payload: Value = response.json().await.context("anthropic response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "anthropic returned {status}: {}",
                payload
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            ));
        }

        let mut text = String::new();
        if let Some(blocks) = payload.get("content").and_then(Value::as_array) {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(chunk) = block.get("text").and_then(Value::as_str) {
                        text.push_str(chunk);
                    }
                }
            }
        }

        let usage = Usage {
            input_tokens: payload
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: payload
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };

        Ok(LlmResponse { text, usage })
    }

    fn rates(&self) -> Rates {
        Rates {
            input_per_1k: 0.003,
            output_per_1k: 0.015,
        }
    }
}

// ── Scripted (deterministic) ───────────────────────────────────────────

/// Deterministic provider that replays a fixed script of replies.
/// Used by tests and offline smoke runs; exhausting the script is an error.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    rates: Rates,
}

impl ScriptedProvider {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            rates: Rates::default(),
        }
    }

    pub fn with_rates(mut self, rates: Rates) -> Self {
        self.rates = rates;
        self
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("script lock").len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse> {
        let text = self
            .replies
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted provider exhausted"))?;

        let input_tokens = messages
            .iter()
            .map(|m| self.estimate_tokens(&m.text()))
            .sum();
        let output_tokens = self.estimate_tokens(&text);

        Ok(LlmResponse {
            text,
            usage: Usage {
                input_tokens,
                output_tokens,
            },
        })
    }

    fn rates(&self) -> Rates {
        self.rates
    }
}
