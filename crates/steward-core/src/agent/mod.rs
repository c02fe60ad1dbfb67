//! The agent system: profiles (agent kinds as data), failure tracking, and
//! the shared cooperative run loop.

pub mod failure;
pub mod profiles;
pub mod runtime;

pub use self::profiles::AgentProfile;
pub use self::runtime::{AgentOutcome, AgentRuntime, ResumeVerdict, RunBudgets, RunStatus};
