//! Auth broker: detect-and-instruct credential resolution.
//!
//! Context is public, environment is private: credentials never travel
//! through the conversation. When an agent needs an identity, the broker
//! probes the host for it and either reports `Ready` or returns the exact
//! action the human must take. Three patterns:
//!
//! - host inheritance (aws, kubernetes, …): credential file plus a
//!   non-mutating CLI identity probe
//! - env vault: a named, non-empty environment variable (also read from the
//!   working directory's `.env` file)
//! - OAuth: a stored token file under `.secrets/`

use std::time::Duration;

use crate::paths::StatePaths;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of an identity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCheck {
    Ready,
    /// Authentication is missing. `prompt` is what to tell the human,
    /// `hint` the command or URL that unblocks them.
    NeedAction { prompt: String, hint: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPattern {
    Host,
    EnvVault,
    OAuth,
}

pub struct AuthBroker {
    paths: StatePaths,
}

impl AuthBroker {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    /// Resolve an identity requirement. Never receives or returns secret
    /// values; only presence is checked.
    pub async fn require(&self, identity: &str) -> AuthCheck {
        match detect_pattern(identity) {
            AuthPattern::Host => self.check_host(identity).await,
            AuthPattern::EnvVault => self.check_env_vault(identity),
            AuthPattern::OAuth => self.check_oauth(identity),
        }
    }

    async fn check_host(&self, identity: &str) -> AuthCheck {
        let lower = identity.to_ascii_lowercase();
        let home = std::env::var("HOME").unwrap_or_default();

        let (cred_file, probe, hint): (String, &[&str], &str) = if lower.contains("aws") {
            (
                format!("{home}/.aws/credentials"),
                &["aws", "sts", "get-caller-identity"],
                "aws configure",
            )
        } else if lower.contains("kube") || lower.contains("k8s") {
            (
                format!("{home}/.kube/config"),
                &["kubectl", "cluster-info"],
                "kubectl config (e.g. aws eks update-kubeconfig --name <cluster>)",
            )
        } else {
            (String::new(), &[], "configure your CLI credentials")
        };

        let file_present = !cred_file.is_empty() && std::path::Path::new(&cred_file).exists();
        if file_present && !probe.is_empty() && run_probe(probe).await {
            return AuthCheck::Ready;
        }

        AuthCheck::NeedAction {
            prompt: format!(
                "I need {identity} access. Please run '{hint}' in your terminal, then re-run the task."
            ),
            hint: hint.to_string(),
        }
    }

    fn check_env_vault(&self, identity: &str) -> AuthCheck {
        let service = identity.to_ascii_uppercase().replace('-', "_");
        let candidates = [
            format!("{service}_API_KEY"),
            format!("{service}_TOKEN"),
            format!("{service}_PASSWORD"),
        ];

        let env_file_vars = read_env_file_keys(&self.paths);
        for var in &candidates {
            let set_in_process = std::env::var(var).map(|v| !v.trim().is_empty()).unwrap_or(false);
            if set_in_process || env_file_vars.iter().any(|k| k == var) {
                return AuthCheck::Ready;
            }
        }

        let first = &candidates[0];
        AuthCheck::NeedAction {
            prompt: format!(
                "I need {identity} credentials. Add them to the environment or the .env file as {first}."
            ),
            hint: format!("{first}=<value> in .env"),
        }
    }

    fn check_oauth(&self, identity: &str) -> AuthCheck {
        let token_file = self
            .paths
            .secrets_dir()
            .join(format!("{}_token.json", identity.to_ascii_lowercase()));
        if token_file.exists() {
            return AuthCheck::Ready;
        }

        let url = format!("https://oauth.{}.example/authorize", identity.to_ascii_lowercase());
        AuthCheck::NeedAction {
            prompt: format!(
                "I need {identity} access. Authorize read access at {url}, then re-run the task."
            ),
            hint: url,
        }
    }
}

fn detect_pattern(identity: &str) -> AuthPattern {
    let lower = identity.to_ascii_lowercase();
    const HOST_SERVICES: &[&str] = &["aws", "eks", "kubernetes", "k8s", "kubectl", "terraform", "gcloud", "azure"];
    const OAUTH_SERVICES: &[&str] = &["gmail", "google", "calendar", "spotify", "github", "oauth"];

    if HOST_SERVICES.iter().any(|s| lower.contains(s)) {
        AuthPattern::Host
    } else if OAUTH_SERVICES.iter().any(|s| lower.contains(s)) {
        AuthPattern::OAuth
    } else {
        AuthPattern::EnvVault
    }
}

/// Run a non-mutating identity probe; false on any failure or timeout.
async fn run_probe(argv: &[&str]) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(program).args(args).output(),
    )
    .await;
    matches!(result, Ok(Ok(output)) if output.status.success())
}

/// Variable names (never values) that the .env file defines non-empty.
fn read_env_file_keys(paths: &StatePaths) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(paths.env_file()) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            if value.trim().is_empty() {
                return None;
            }
            Some(key.trim().to_string())
        })
        .collect()
}
