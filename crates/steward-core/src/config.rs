//! Runtime configuration loaded from environment variables.

use std::time::Duration;

use crate::task::Environment;

/// LLM backend selection. Opaque to the rest of the core; consumed by
/// `ai::backends::provider_from_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSelection {
    Ollama,
    Anthropic,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Default environment tag for submitted tasks (`ENVIRONMENT`).
    pub environment: Environment,

    // Cost ceilings.
    pub max_cost_per_task: f64,
    pub max_cost_per_hour: f64,
    pub max_tokens_per_task: u64,

    // Context policy.
    pub max_context_tokens: usize,
    pub keep_last_user_messages: usize,
    pub keep_last_assistant_messages: usize,

    // Agent budgets.
    pub max_iterations: usize,
    pub task_timeout: Duration,
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,

    // Routing.
    pub use_semantic_routing: bool,

    // Provider selection.
    pub provider: ProviderSelection,
    pub llm_model: Option<String>,
    pub ollama_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Production is the safe default: yellow operations require review.
            environment: Environment::Production,
            max_cost_per_task: 0.50,
            max_cost_per_hour: 10.0,
            max_tokens_per_task: 100_000,
            max_context_tokens: 8_000,
            keep_last_user_messages: 3,
            keep_last_assistant_messages: 3,
            max_iterations: 5,
            task_timeout: Duration::from_secs(600),
            llm_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(300),
            use_semantic_routing: false,
            provider: ProviderSelection::Ollama,
            llm_model: None,
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(env) = env_parse::<Environment>("ENVIRONMENT") {
            cfg.environment = env;
        }
        if let Some(v) = env_parse::<f64>("MAX_COST_PER_TASK") {
            cfg.max_cost_per_task = v;
        }
        if let Some(v) = env_parse::<f64>("MAX_COST_PER_HOUR") {
            cfg.max_cost_per_hour = v;
        }
        if let Some(v) = env_parse::<u64>("MAX_TOKENS_PER_TASK") {
            cfg.max_tokens_per_task = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_CONTEXT_TOKENS") {
            cfg.max_context_tokens = v;
        }
        if let Some(v) = env_parse::<usize>("KEEP_LAST_N_USER_MESSAGES") {
            cfg.keep_last_user_messages = v;
        }
        if let Some(v) = env_parse::<usize>("KEEP_LAST_N_ASSISTANT_MESSAGES") {
            cfg.keep_last_assistant_messages = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_ITERATIONS") {
            cfg.max_iterations = v;
        }
        if let Some(v) = env_parse::<u64>("TASK_TIMEOUT_SECS") {
            cfg.task_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("USE_SEMANTIC_ROUTING") {
            cfg.use_semantic_routing = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            match provider.trim().to_ascii_lowercase().as_str() {
                "anthropic" => cfg.provider = ProviderSelection::Anthropic,
                "ollama" | "" => cfg.provider = ProviderSelection::Ollama,
                other => {
                    tracing::warn!(provider = other, "unknown LLM_PROVIDER, using ollama");
                    cfg.provider = ProviderSelection::Ollama;
                }
            }
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            if !model.trim().is_empty() {
                cfg.llm_model = Some(model.trim().to_string());
            }
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            if !url.trim().is_empty() {
                cfg.ollama_base_url = url.trim().trim_end_matches('/').to_string();
            }
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}
