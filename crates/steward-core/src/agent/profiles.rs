//! Agent kinds as data.
//!
//! Profiles differ only in their system prompt and preferred tool subset;
//! the run loop is shared. The router picks among these by name.

pub const GENERAL_AGENT: &str = "general";
pub const DESIGN_AGENT: &str = "design";

#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    /// One-line description shown to the router.
    pub description: String,
    pub system_prompt: String,
    /// Tool names this agent sees. Empty means every registered tool.
    pub preferred_tools: Vec<String>,
}

impl AgentProfile {
    fn new(
        name: &str,
        description: &str,
        system_prompt: &str,
        preferred_tools: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: system_prompt.to_string(),
            preferred_tools: preferred_tools.iter().map(|t| t.to_string()).collect(),
        }
    }
}

pub fn find<'a>(profiles: &'a [AgentProfile], name: &str) -> Option<&'a AgentProfile> {
    profiles.iter().find(|p| p.name == name)
}

pub fn builtin_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile::new(
            "consulting",
            "Answers questions, analyzes systems, and makes recommendations without mutating anything",
            "You are a consulting agent. You answer questions, compare options, and \
             analyze the local system. Prefer read-only tools; gather evidence before \
             concluding. You never modify state: if the task would require a mutation, \
             say what you would change and why instead of changing it.",
            &[
                "read_file",
                "shell",
                "http_fetch",
                "docker_ps",
                "docker_logs",
                "docker_inspect",
            ],
        ),
        AgentProfile::new(
            "container",
            "Manages containers: listing, logs, inspection, restarts, compose services",
            "You are a container management agent. You operate on the local Docker \
             daemon: list containers, read logs, inspect state, and restart services \
             when asked. Verify a container exists (docker_ps) before operating on it. \
             Report what you observed, not what you assume.",
            &[
                "docker_ps",
                "docker_logs",
                "docker_inspect",
                "docker_restart",
                "shell",
            ],
        ),
        AgentProfile::new(
            "config",
            "Creates and edits configuration files: YAML, JSON, env files, compose files",
            "You are a configuration agent. You create and modify configuration files \
             (YAML, JSON, TOML, env files, docker-compose files). Read the current file \
             before changing it, keep the existing style, and write the complete new \
             content. After writing, read the file back to confirm the change landed.",
            &["read_file", "write_file", "shell"],
        ),
        AgentProfile::new(
            DESIGN_AGENT,
            "Designs systems from a blank slate; asks clarifying questions, then plans and builds",
            "You are a system design agent. You take underspecified build requests and \
             turn them into concrete plans and artifacts. Before designing, make sure \
             you know the expected scale, the availability target, the resource \
             envelope, and which credentials are available; the task text should answer \
             these. Produce the design as files, starting with the smallest thing that \
             works.",
            &["read_file", "write_file", "shell", "http_fetch"],
        ),
        AgentProfile::new(
            GENERAL_AGENT,
            "Fallback agent for tasks that fit no specialist",
            "You are a general-purpose operations agent. Break the task into steps, use \
             the available tools to carry them out, and verify each result before \
             moving on. If a tool fails, try one alternative approach; if that fails \
             too, report what happened instead of guessing.",
            &[],
        ),
    ]
}
