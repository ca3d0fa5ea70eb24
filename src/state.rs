//! Durable loop state.
//!
//! One JSON document under the state directory records every attempt ever
//! made against the project together with the counters the drivers use for
//! their exit decisions:
//!
//! ```text
//! .taskloop/
//! ├── state.json        LoopState (this module)
//! ├── receipts/         one immutable document per attempt
//! └── workspaces/       parallel worker checkouts
//! ```
//!
//! Loading is fail-open: a missing or unreadable document yields a fresh
//! state, and an unparsable one is moved aside so the evidence survives.
//! Saving goes through [`write_atomic_locked`], so no reader ever sees a torn
//! document. `history` only grows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic_locked;
use crate::error::{LoopError, Result};
use crate::review::ReviewVerdict;

/// State document file name.
pub const STATE_FILE: &str = "state.json";

/// Persisted summary of one attempt. Written once, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt_id: String,
    pub task_id: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_signal: bool,
    pub return_code: Option<i32>,
    pub gates_ok: bool,
    #[serde(default)]
    pub review_verdict: ReviewVerdict,
    pub progress_made: bool,
    /// The task transitioned to done as a result of this attempt.
    #[serde(default)]
    pub completed: bool,
    /// Why the attempt did not complete its task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,
}

impl AttemptSummary {
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Counters and history shared by both drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub invocation_count: u64,
    #[serde(default)]
    pub no_progress_streak: u32,
    #[serde(default)]
    pub history: Vec<AttemptSummary>,
    #[serde(default)]
    pub task_attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub blocked_tasks: BTreeMap<String, String>,
    /// Consecutive failed attempts per task; cleared on success.
    #[serde(default)]
    pub task_failures: BTreeMap<String, u32>,
    /// Last worker id handed out, so workspace names never repeat across runs.
    #[serde(default)]
    pub worker_seq: u64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            invocation_count: 0,
            no_progress_streak: 0,
            history: Vec::new(),
            task_attempts: BTreeMap::new(),
            blocked_tasks: BTreeMap::new(),
            task_failures: BTreeMap::new(),
            worker_seq: 0,
        }
    }
}

impl LoopState {
    /// Fold one finished attempt into the counters and append it to history.
    ///
    /// Returns the block reason when this attempt exhausts the task's budget
    /// of `max_attempts` consecutive failures. The caller applies the block
    /// to the tracker.
    pub fn record(&mut self, summary: AttemptSummary, max_attempts: u32) -> Option<String> {
        self.invocation_count += 1;
        if summary.progress_made {
            self.no_progress_streak = 0;
        } else {
            self.no_progress_streak += 1;
        }
        *self.task_attempts.entry(summary.task_id.clone()).or_insert(0) += 1;

        let mut block = None;
        match &summary.failure {
            None => {
                self.task_failures.remove(&summary.task_id);
            }
            Some(failure) => {
                let failures = self.task_failures.entry(summary.task_id.clone()).or_insert(0);
                *failures += 1;
                if *failures >= max_attempts && !self.blocked_tasks.contains_key(&summary.task_id) {
                    let reason = format!("{failures} consecutive failed attempts; last: {failure}");
                    self.blocked_tasks.insert(summary.task_id.clone(), reason.clone());
                    block = Some(reason);
                }
            }
        }

        self.history.push(summary);
        block
    }

    /// Last recorded attempt, where a crashed run stopped.
    #[must_use]
    pub fn resume_point(&self) -> Option<&AttemptSummary> {
        self.history.last()
    }

    /// Forget a block and the failures that led to it.
    pub fn clear_block(&mut self, task_id: &str) -> bool {
        self.task_failures.remove(task_id);
        self.blocked_tasks.remove(task_id).is_some()
    }

    /// Hand out the next worker id.
    pub fn allocate_worker_id(&mut self) -> u64 {
        self.worker_seq += 1;
        self.worker_seq
    }

    #[must_use]
    pub fn attempts_for(&self, task_id: &str) -> u32 {
        self.task_attempts.get(task_id).copied().unwrap_or(0)
    }
}

/// Loads and saves [`LoopState`] under a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the state, falling back to a fresh one.
    #[must_use]
    pub fn load(&self) -> LoopState {
        match self.try_load() {
            Ok(Some(state)) => {
                debug!(
                    invocations = state.invocation_count,
                    history = state.history.len(),
                    "loop state loaded"
                );
                state
            }
            Ok(None) => LoopState::default(),
            Err(e) => {
                warn!("{e}; starting from a fresh state");
                LoopState::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<LoopState>> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LoopError::StateLoad {
                    message: format!("cannot read {}: {e}", path.display()),
                })
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            let aside = path.with_extension(format!("json.corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
            let moved = std::fs::rename(&path, &aside).is_ok();
            LoopError::StateLoad {
                message: if moved {
                    format!("unparsable state document moved to {}: {e}", aside.display())
                } else {
                    format!("unparsable state document {}: {e}", path.display())
                },
            }
        })
    }

    /// Persist the state atomically.
    pub fn save(&self, state: &LoopState) -> Result<()> {
        let path = self.path();
        let json = serde_json::to_string_pretty(state)?;
        write_atomic_locked(&path, json.as_bytes()).map_err(|e| LoopError::StateWrite {
            path: path.clone(),
            message: e.to_string(),
        })
    }
}

/// The single serialization point for state updates.
///
/// Drivers and workers record attempts here; every record is persisted
/// before the lock is released, so history order is completion order.
#[derive(Debug)]
pub struct StateRecorder {
    inner: Mutex<(LoopState, StateStore)>,
}

impl StateRecorder {
    /// Load the state behind `store` and wrap it.
    #[must_use]
    pub fn open(store: StateStore) -> Self {
        let state = store.load();
        if let Some(last) = state.resume_point() {
            info!(
                attempt_id = %last.attempt_id,
                task_id = %last.task_id,
                finished_at = %last.finished_at,
                "resuming after previous attempt"
            );
        }
        Self {
            inner: Mutex::new((state, store)),
        }
    }

    /// Record an attempt and persist. See [`LoopState::record`].
    pub async fn record(&self, summary: AttemptSummary, max_attempts: u32) -> Result<Option<String>> {
        let mut guard = self.inner.lock().await;
        let (state, store) = &mut *guard;
        let block = state.record(summary, max_attempts);
        store.save(state)?;
        Ok(block)
    }

    /// Apply an arbitrary change and persist it.
    pub async fn update<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> Result<R> {
        let mut guard = self.inner.lock().await;
        let (state, store) = &mut *guard;
        let result = f(state);
        store.save(state)?;
        Ok(result)
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> LoopState {
        self.inner.lock().await.0.clone()
    }
}
