//! Locations of persisted state in the working directory.
//!
//! Everything Steward persists is human-readable JSON next to where it runs,
//! so the approval CLI and the orchestrator rendezvous through the filesystem.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// State files live in the current working directory by default.
    pub fn in_working_dir() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn approvals(&self) -> PathBuf {
        self.root.join("approvals.json")
    }

    pub fn cost_history(&self) -> PathBuf {
        self.root.join("cost_history.json")
    }

    pub fn fact_ledger(&self) -> PathBuf {
        self.root.join("fact_ledger.json")
    }

    pub fn emergency_stop(&self) -> PathBuf {
        self.root.join(".emergency_stop")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join(".secrets")
    }
}
