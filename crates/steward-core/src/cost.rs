//! Token and cost accounting with hard circuit breakers.
//!
//! Per-task counters are memory-only; rolling hourly aggregates and the last
//! thousand per-task records persist to `cost_history.json` so an hourly
//! ceiling survives a crash. A warning fires at 80% of any ceiling; crossing
//! 100% raises `CostLimitExceeded` at the next agent yield point.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ai::provider::Rates;
use crate::storage;

const MAX_PERSISTED_RECORDS: usize = 1000;

/// Sentinel raised when a ceiling is crossed. Caught once, at the
/// orchestrator, and reported as `budget_exhausted`.
#[derive(Debug, Clone)]
pub struct CostLimitExceeded {
    pub limit: &'static str,
    pub detail: String,
}

impl fmt::Display for CostLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cost limit exceeded ({}): {}", self.limit, self.detail)
    }
}

impl std::error::Error for CostLimitExceeded {}

#[derive(Debug, Clone, Copy)]
pub struct CostLimits {
    pub max_cost_per_task: f64,
    pub max_cost_per_hour: f64,
    pub max_tokens_per_task: u64,
    pub warn_at: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            max_cost_per_task: 0.50,
            max_cost_per_hour: 10.0,
            max_tokens_per_task: 100_000,
            warn_at: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    #[serde(skip)]
    warned: bool,
}

impl TaskUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub task_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CostHistory {
    hourly_cost: BTreeMap<String, f64>,
    hourly_tokens: BTreeMap<String, u64>,
    records: Vec<UsageRecord>,
}

struct Inner {
    tasks: HashMap<String, TaskUsage>,
    history: CostHistory,
}

pub struct CostTracker {
    limits: CostLimits,
    history_path: PathBuf,
    inner: Mutex<Inner>,
}

impl CostTracker {
    pub fn new(limits: CostLimits, history_path: PathBuf) -> Self {
        let history = storage::load_json::<CostHistory>(&history_path)
            .unwrap_or_else(|e| {
                tracing::warn!("could not load cost history, starting fresh: {e}");
                None
            })
            .unwrap_or_default();

        Self {
            limits,
            history_path,
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                history,
            }),
        }
    }

    /// Record one LLM round trip. Returns the cost of this operation.
    pub fn record(&self, task_id: &str, input_tokens: u64, output_tokens: u64, rates: Rates) -> f64 {
        let cost = (input_tokens as f64 / 1000.0) * rates.input_per_1k
            + (output_tokens as f64 / 1000.0) * rates.output_per_1k;

        let mut inner = self.inner.lock().expect("cost tracker lock");
        let usage = inner.tasks.entry(task_id.to_string()).or_default();
        usage.input_tokens += input_tokens;
        usage.output_tokens += output_tokens;
        usage.cost += cost;

        let hour = hour_key();
        *inner.history.hourly_cost.entry(hour.clone()).or_insert(0.0) += cost;
        *inner.history.hourly_tokens.entry(hour).or_insert(0) += input_tokens + output_tokens;

        self.persist_locked(&inner.history);
        cost
    }

    /// Check every ceiling for a task. Warnings at 80%, hard stop at 100%.
    pub fn ensure_within_limits(&self, task_id: &str) -> Result<(), CostLimitExceeded> {
        let mut inner = self.inner.lock().expect("cost tracker lock");
        let hour_cost = inner
            .history
            .hourly_cost
            .get(&hour_key())
            .copied()
            .unwrap_or(0.0);
        let usage = inner.tasks.entry(task_id.to_string()).or_default();

        if usage.cost >= self.limits.max_cost_per_task {
            return Err(CostLimitExceeded {
                limit: "cost_per_task",
                detail: format!(
                    "${:.4} >= ${:.2}",
                    usage.cost, self.limits.max_cost_per_task
                ),
            });
        }
        if usage.total_tokens() >= self.limits.max_tokens_per_task {
            return Err(CostLimitExceeded {
                limit: "tokens_per_task",
                detail: format!(
                    "{} >= {}",
                    usage.total_tokens(),
                    self.limits.max_tokens_per_task
                ),
            });
        }
        if hour_cost >= self.limits.max_cost_per_hour {
            return Err(CostLimitExceeded {
                limit: "cost_per_hour",
                detail: format!("${hour_cost:.4} >= ${:.2}", self.limits.max_cost_per_hour),
            });
        }

        if !usage.warned {
            let near_cost = usage.cost >= self.limits.max_cost_per_task * self.limits.warn_at;
            let near_tokens = usage.total_tokens() as f64
                >= self.limits.max_tokens_per_task as f64 * self.limits.warn_at;
            if near_cost || near_tokens {
                usage.warned = true;
                tracing::warn!(
                    task_id,
                    cost = usage.cost,
                    tokens = usage.total_tokens(),
                    "task approaching budget ceiling"
                );
            }
        }

        Ok(())
    }

    pub fn task_usage(&self, task_id: &str) -> TaskUsage {
        self.inner
            .lock()
            .expect("cost tracker lock")
            .tasks
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Close out a task: move its counters into the persisted record list.
    pub fn end_task(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("cost tracker lock");
        let Some(usage) = inner.tasks.remove(task_id) else {
            return;
        };
        inner.history.records.push(UsageRecord {
            task_id: task_id.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: usage.cost,
            timestamp: Utc::now().to_rfc3339(),
        });
        let overflow = inner.history.records.len().saturating_sub(MAX_PERSISTED_RECORDS);
        if overflow > 0 {
            inner.history.records.drain(..overflow);
        }
        self.persist_locked(&inner.history);
    }

    fn persist_locked(&self, history: &CostHistory) {
        if let Err(e) = storage::save_json_atomic(&self.history_path, history) {
            tracing::warn!("could not persist cost history: {e}");
        }
    }
}

fn hour_key() -> String {
    Utc::now().format("%Y-%m-%d-%H").to_string()
}
