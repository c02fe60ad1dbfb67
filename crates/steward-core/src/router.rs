//! Task routing.
//!
//! The router classifies a task into a primary agent, optional secondary
//! agents, a complexity tier, and a clarification flag. The LLM is the
//! primary strategy; a bag-of-tokens similarity match over agent descriptors
//! serves as the optional second strategy, and a constant fallback to the
//! general agent backs both. The router never propagates an error to the
//! orchestrator.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agent::profiles::{self, AgentProfile, DESIGN_AGENT, GENERAL_AGENT};
use crate::ai::provider::LlmProvider;
use crate::ai::types::Message;
use crate::facts::FactLedger;

/// Two similarity scores within this distance are a tie, broken by the
/// agents' historical success rates.
const TIE_EPSILON: f64 = 0.05;

static BUILD_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(build|create|design|set up|stand up)\b").unwrap());
static BUILD_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(system|cluster|platform|application|app|infrastructure|assistant|service|pipeline)\b")
        .unwrap()
});
static ESSENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(scale|users|requests|availability|uptime|budget|cpu|memory|resources|credentials|auth)\b")
        .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
    pub complexity: Complexity,
    /// When set, the orchestrator returns `needs_input` with this prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

/// Tolerant shape of the LLM's structured reply.
#[derive(Debug, Deserialize)]
struct RawRouteReply {
    primary_agent: String,
    #[serde(default)]
    secondary_agents: Vec<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    needs_clarification: bool,
    #[serde(default)]
    clarification_question: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct Router {
    provider: Arc<dyn LlmProvider>,
    facts: Arc<FactLedger>,
    use_similarity: bool,
}

impl Router {
    pub fn new(provider: Arc<dyn LlmProvider>, facts: Arc<FactLedger>, use_similarity: bool) -> Self {
        Self {
            provider,
            facts,
            use_similarity,
        }
    }

    /// Classify a task. Degrades through similarity to the constant fallback
    /// on any failure; never errors.
    pub async fn analyze(&self, task_text: &str, profiles: &[AgentProfile]) -> RouteDecision {
        let decision = match self.llm_route(task_text, profiles).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("LLM routing failed, degrading: {e:#}");
                if self.use_similarity {
                    self.similarity_route(task_text, profiles)
                } else {
                    fallback_route("LLM routing unavailable")
                }
            }
        };
        self.normalize(decision, task_text, profiles)
    }

    async fn llm_route(
        &self,
        task_text: &str,
        profiles: &[AgentProfile],
    ) -> anyhow::Result<RouteDecision> {
        let mut agent_list = String::new();
        for profile in profiles {
            agent_list.push_str(&format!("- {}: {}\n", profile.name, profile.description));
        }

        let system = format!(
            "You are a task router. Classify the task and select the agent that should \
             handle it.\n\nAVAILABLE AGENTS:\n{agent_list}\n\
             Rules:\n\
             - Questions and analysis go to consulting.\n\
             - Building a system from scratch goes to design; design tasks need \
             clarification unless the task already states scale, availability, \
             resources, and available credentials.\n\
             - Execution tasks go to the most specific agent.\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"primary_agent\": \"<name>\", \"secondary_agents\": [], \
             \"complexity\": \"simple|medium|complex\", \"needs_clarification\": false, \
             \"clarification_question\": null, \"confidence\": 0.9, \
             \"reasoning\": \"<one line>\"}}"
        );

        let messages = vec![Message::system(system), Message::user(task_text.to_string())];
        let response = self.provider.invoke(&messages).await?;

        let raw = extract_json_object(&response.text)
            .ok_or_else(|| anyhow::anyhow!("no JSON object in router reply"))?;
        let reply: RawRouteReply = serde_json::from_str(raw)?;

        Ok(RouteDecision {
            primary: reply.primary_agent,
            secondary: reply.secondary_agents,
            complexity: parse_complexity(reply.complexity.as_deref()),
            clarification: if reply.needs_clarification {
                Some(reply.clarification_question.unwrap_or_else(|| {
                    "This task needs clarification before it can be routed.".to_string()
                }))
            } else {
                None
            },
            confidence: reply.confidence.unwrap_or(0.5),
            reasoning: reply.reasoning.unwrap_or_default(),
        })
    }

    /// Bag-of-tokens cosine similarity between the task and each agent's
    /// descriptor, with a success-rate tie-break.
    fn similarity_route(&self, task_text: &str, profiles: &[AgentProfile]) -> RouteDecision {
        let task_tokens = token_set(task_text);
        if task_tokens.is_empty() || profiles.is_empty() {
            return fallback_route("empty task or agent list");
        }

        let mut scored: Vec<(f64, &AgentProfile)> = profiles
            .iter()
            .map(|profile| {
                let descriptor = format!("{} {}", profile.name, profile.description);
                let descriptor_tokens = token_set(&descriptor);
                let overlap = task_tokens
                    .iter()
                    .filter(|t| descriptor_tokens.contains(*t))
                    .count() as f64;
                let denom = (task_tokens.len() as f64).sqrt()
                    * (descriptor_tokens.len().max(1) as f64).sqrt();
                (overlap / denom, profile)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let (best_score, mut best) = (scored[0].0, scored[0].1);
        if let Some((runner_score, runner)) = scored.get(1).map(|(s, p)| (*s, *p)) {
            if (best_score - runner_score).abs() < TIE_EPSILON {
                let best_rate = self.facts.agent_success_rate(&best.name).unwrap_or(0.5);
                let runner_rate = self.facts.agent_success_rate(&runner.name).unwrap_or(0.5);
                if runner_rate > best_rate {
                    best = runner;
                }
            }
        }

        RouteDecision {
            primary: best.name.clone(),
            secondary: Vec::new(),
            complexity: Complexity::Simple,
            clarification: None,
            confidence: best_score.min(1.0),
            reasoning: "similarity match over agent descriptors".to_string(),
        }
    }

    /// Enforce the decision invariants regardless of which strategy produced
    /// the decision.
    fn normalize(
        &self,
        mut decision: RouteDecision,
        task_text: &str,
        profiles: &[AgentProfile],
    ) -> RouteDecision {
        // Primary must name a registered agent.
        if profiles::find(profiles, &decision.primary).is_none() {
            tracing::info!(
                primary = %decision.primary,
                "router chose an unknown agent, falling back to general"
            );
            decision.primary = GENERAL_AGENT.to_string();
            decision.confidence = decision.confidence.min(0.3);
        }

        // Secondaries exclude the primary and unknown names.
        let primary = decision.primary.clone();
        decision
            .secondary
            .retain(|name| name != &primary && profiles::find(profiles, name).is_some());

        // Blank-slate build requests route to design and ask for the missing
        // essentials unless the task text already answers them.
        if is_build_request(task_text)
            && !ESSENTIALS.is_match(task_text)
            && profiles::find(profiles, DESIGN_AGENT).is_some()
        {
            decision.primary = DESIGN_AGENT.to_string();
            if decision.clarification.is_none() {
                decision.clarification = Some(
                    "Before designing this system I need: the expected scale (users or \
                     requests per second), the availability target, the resource \
                     envelope (CPU, memory, budget), and which credentials are \
                     available."
                        .to_string(),
                );
            }
        }

        // Clarification and secondary agents are mutually exclusive.
        if decision.clarification.is_some() {
            decision.secondary.clear();
        }

        decision.confidence = decision.confidence.clamp(0.0, 1.0);
        decision
    }
}

fn is_build_request(task_text: &str) -> bool {
    BUILD_VERB.is_match(task_text) && BUILD_OBJECT.is_match(task_text)
}

fn fallback_route(reasoning: &str) -> RouteDecision {
    RouteDecision {
        primary: GENERAL_AGENT.to_string(),
        secondary: Vec::new(),
        complexity: Complexity::Simple,
        clarification: None,
        confidence: 0.0,
        reasoning: reasoning.to_string(),
    }
}

fn parse_complexity(raw: Option<&str>) -> Complexity {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("medium") => Complexity::Medium,
        Some("complex") => Complexity::Complex,
        _ => Complexity::Simple,
    }
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn token_set(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| t.len() > 2)
        .collect()
}
