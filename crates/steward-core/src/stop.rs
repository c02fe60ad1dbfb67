//! Emergency stop.
//!
//! A process-wide flag paired with a sentinel file in the working directory.
//! Writing the file from another process (`steward stop activate`) halts every
//! cooperating process sharing that directory: each agent yield point calls
//! `check()`, which polls the file when the in-memory flag is clear.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Sentinel raised across yield points when the stop is active. Caught once,
/// at the orchestrator.
#[derive(Debug, Clone)]
pub struct StopRequested {
    pub reason: String,
}

impl fmt::Display for StopRequested {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emergency stop: {}", self.reason)
    }
}

impl std::error::Error for StopRequested {}

#[derive(Serialize, Deserialize)]
struct SentinelBody {
    stopped: bool,
    reason: String,
    timestamp: String,
}

pub struct EmergencyStop {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    sentinel: PathBuf,
}

impl EmergencyStop {
    /// Create a stop handle bound to a sentinel path, syncing from an
    /// existing sentinel left by a previous run or another process.
    pub fn new(sentinel: PathBuf) -> Self {
        let stop = Self {
            flag: AtomicBool::new(false),
            reason: Mutex::new(None),
            sentinel,
        };
        stop.sync_from_sentinel();
        stop
    }

    /// Activate the stop and persist the sentinel for other processes.
    pub fn trigger(&self, reason: &str) {
        let reason = if reason.trim().is_empty() {
            "emergency stop activated".to_string()
        } else {
            reason.trim().to_string()
        };

        self.flag.store(true, Ordering::SeqCst);
        *self.reason.lock().expect("stop reason lock") = Some(reason.clone());

        let body = SentinelBody {
            stopped: true,
            reason,
            timestamp: Utc::now().to_rfc3339(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&body) {
            if let Err(e) = std::fs::write(&self.sentinel, json) {
                tracing::warn!(path = %self.sentinel.display(), "could not write stop sentinel: {e}");
            }
        }
    }

    /// Clear the flag and remove the sentinel.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        *self.reason.lock().expect("stop reason lock") = None;
        if self.sentinel.exists() {
            if let Err(e) = std::fs::remove_file(&self.sentinel) {
                tracing::warn!(path = %self.sentinel.display(), "could not remove stop sentinel: {e}");
            }
        }
    }

    pub fn is_set(&self) -> bool {
        if !self.flag.load(Ordering::SeqCst) {
            self.sync_from_sentinel();
        }
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("stop reason lock").clone()
    }

    /// Non-blocking check invoked at every agent yield point.
    pub fn check(&self) -> Result<(), StopRequested> {
        if self.is_set() {
            return Err(StopRequested {
                reason: self
                    .reason()
                    .unwrap_or_else(|| "emergency stop activated".to_string()),
            });
        }
        Ok(())
    }

    fn sync_from_sentinel(&self) {
        if !self.sentinel.exists() {
            return;
        }
        let reason = match std::fs::read_to_string(&self.sentinel) {
            Ok(contents) => match serde_json::from_str::<SentinelBody>(&contents) {
                Ok(body) => body.reason,
                // A bare text file is accepted: its contents are the reason.
                Err(_) => {
                    let trimmed = contents.trim();
                    if trimmed.is_empty() {
                        "stop sentinel present".to_string()
                    } else {
                        trimmed.to_string()
                    }
                }
            },
            Err(e) => {
                tracing::warn!(path = %self.sentinel.display(), "could not read stop sentinel: {e}");
                "stop sentinel present".to_string()
            }
        };
        self.flag.store(true, Ordering::SeqCst);
        *self.reason.lock().expect("stop reason lock") = Some(reason);
    }
}
