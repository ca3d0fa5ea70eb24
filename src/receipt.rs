//! Attempt receipts.
//!
//! Every attempt leaves one JSON document under `<state_dir>/receipts/`,
//! named after its attempt id, whatever the outcome. A receipt is the
//! evidence behind the one-line summary in the loop state: what the agent
//! printed (tail plus a hash of the full output), what it cited, what changed
//! in its workspace, and how each gate and the review went.
//!
//! Receipts are written once through an atomic rename and never rewritten.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::atomic::write_atomic;
use crate::error::{LoopError, Result};
use crate::gates::GateResult;
use crate::review::ReviewOutcome;

/// Schema tag carried by every receipt.
pub const RECEIPT_SCHEMA: &str = "taskloop.receipt/v1";

/// Receipts directory name under the state directory.
pub const RECEIPTS_DIR: &str = "receipts";

/// Immutable evidence for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub schema: String,
    pub attempt_id: String,
    pub task_id: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,
    pub workspace: PathBuf,
    pub return_code: Option<i32>,
    pub timed_out: bool,
    pub exit_signal: bool,
    /// SHA-256 of the raw combined agent output, hex encoded.
    pub output_sha256: String,
    pub output_bytes: usize,
    pub output_tail: String,
    pub citations: Vec<String>,
    pub changed_files: Vec<String>,
    pub gates: Vec<GateResult>,
    pub gates_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewOutcome>,
    /// The agent updated the task's completion marker.
    pub completion_marked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Hex SHA-256 of `output`.
#[must_use]
pub fn output_hash(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    hex::encode(hasher.finalize())
}

/// Writes receipts into one directory.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    dir: PathBuf,
}

impl ReceiptStore {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join(RECEIPTS_DIR),
        }
    }

    #[must_use]
    pub fn path_for(&self, attempt_id: &str) -> PathBuf {
        self.dir.join(format!("{attempt_id}.json"))
    }

    /// Write `receipt` once. An existing receipt for the same attempt is left
    /// untouched.
    pub fn write(&self, receipt: &Receipt) -> Result<PathBuf> {
        let path = self.path_for(&receipt.attempt_id);
        if path.exists() {
            debug!(attempt_id = %receipt.attempt_id, "receipt already written");
            return Ok(path);
        }
        let json = serde_json::to_string_pretty(receipt)?;
        write_atomic(&path, json.as_bytes()).map_err(|e| LoopError::StateWrite {
            path: path.clone(),
            message: e.to_string(),
        })?;
        debug!(attempt_id = %receipt.attempt_id, path = %path.display(), "receipt written");
        Ok(path)
    }

    pub fn read(&self, attempt_id: &str) -> Result<Receipt> {
        let content = std::fs::read_to_string(self.path_for(attempt_id))?;
        Ok(serde_json::from_str(&content)?)
    }
}
