//! Steward core: autonomous task orchestration under traffic-light
//! governance.
//!
//! A task flows Orchestrator → Router → Agent runtime; the runtime
//! alternates LLM reasoning with tool invocation, and every side-effecting
//! call passes through Governance: green executes, yellow auto-approves
//! outside production, red parks the task behind a persisted approval that
//! an operator decides out of band. Around the loop sit the safety
//! services: output sanitization, emergency stop, cost circuit breakers,
//! context pruning, and the fact ledger that learns from repeated
//! success and failure.
//!
//! All shared state is explicit: the orchestrator owns the service graph
//! and everything persisted is human-readable JSON in the working
//! directory (`approvals.json`, `cost_history.json`, `fact_ledger.json`,
//! and the `.emergency_stop` sentinel).

pub mod agent;
pub mod ai;
pub mod auth;
pub mod config;
pub mod context;
pub mod cost;
pub mod facts;
pub mod governance;
pub mod orchestrator;
pub mod paths;
pub mod router;
pub mod sanitize;
pub mod stop;
pub mod storage;
pub mod task;
pub mod tools;

pub use crate::config::Config;
pub use crate::orchestrator::{ExecuteRequest, Orchestrator, TaskReport};
pub use crate::paths::StatePaths;
pub use crate::task::{Environment, TaskStatus};
