//! Sequential loop driver.
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!       SELECTING ── task ──> RUNNING ──> EVALUATING ── continue
//!            │                                │
//!      no task selectable              max iterations,
//!            │                         no progress, stop
//!   all done ──> exit 0                       │
//!   all blocked ──> exit 1                    ▼
//!   otherwise ──> exit 2                   exit 1
//! ```
//!
//! "No task selectable" is always terminal. The agent's exit signal is
//! recorded but never decides whether the loop continues.

mod control;

pub use control::{LoopHandle, RateLimiter, RunControl};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::LoopLimits;
use crate::error::{Result, EXIT_COMPLETE, EXIT_ERROR, EXIT_INCOMPLETE};
use crate::iteration::{IterationEngine, IterationRequest};
use crate::state::{AttemptSummary, StateRecorder};
use crate::tracker::{SharedTracker, Task};

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Every task is done.
    Complete,
    /// Every remaining task is blocked.
    AllBlocked,
    MaxIterations,
    NoProgress,
    /// An operator asked the run to stop.
    Stopped,
    /// Open tasks exist but none can be selected.
    SelectionAnomaly(String),
}

impl LoopExit {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            LoopExit::Complete => EXIT_COMPLETE,
            LoopExit::SelectionAnomaly(_) => EXIT_ERROR,
            LoopExit::AllBlocked | LoopExit::MaxIterations | LoopExit::NoProgress | LoopExit::Stopped => {
                EXIT_INCOMPLETE
            }
        }
    }
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopExit::Complete => write!(f, "all tasks done"),
            LoopExit::AllBlocked => write!(f, "all remaining tasks are blocked"),
            LoopExit::MaxIterations => write!(f, "iteration limit reached"),
            LoopExit::NoProgress => write!(f, "no progress limit reached"),
            LoopExit::Stopped => write!(f, "stopped"),
            LoopExit::SelectionAnomaly(detail) => write!(f, "selection anomaly: {detail}"),
        }
    }
}

/// Result of one pass through the state machine.
#[derive(Debug, Clone)]
pub enum Step {
    /// An attempt ran; carries the block reason when it exhausted the task.
    Ran {
        summary: AttemptSummary,
        blocked: Option<String>,
    },
    /// Nothing to run.
    Exit(LoopExit),
}

/// Outcome of a sequential run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub exit: LoopExit,
    /// Attempts made by this run.
    pub attempts: u32,
    pub completed: Vec<String>,
    pub blocked: Vec<String>,
}

impl RunSummary {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }
}

/// Drives attempts one at a time in the primary working tree.
pub struct LoopController {
    engine: Arc<IterationEngine>,
    tracker: SharedTracker,
    recorder: Arc<StateRecorder>,
    limits: LoopLimits,
    workspace: PathBuf,
    handle: LoopHandle,
    limiter: RateLimiter,
}

impl LoopController {
    #[must_use]
    pub fn new(
        engine: Arc<IterationEngine>,
        tracker: SharedTracker,
        recorder: Arc<StateRecorder>,
        limits: LoopLimits,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            tracker,
            recorder,
            limiter: RateLimiter::per_hour(limits.max_calls_per_hour),
            limits,
            workspace: workspace.into(),
            handle: LoopHandle::new(),
        }
    }

    #[must_use]
    pub fn with_handle(mut self, handle: LoopHandle) -> Self {
        self.handle = handle;
        self
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run until a terminal condition. `max_iterations` overrides the
    /// configured limit for this run.
    pub async fn run(&mut self, max_iterations: Option<u32>) -> Result<RunSummary> {
        let max_iterations = max_iterations.unwrap_or(self.limits.max_iterations);
        let mut attempts = 0u32;
        let mut completed = Vec::new();
        let mut blocked = Vec::new();
        info!(max_iterations, workspace = %self.workspace.display(), "loop started");

        let exit = loop {
            if !self.handle.proceed().await {
                break LoopExit::Stopped;
            }
            if attempts >= max_iterations {
                break LoopExit::MaxIterations;
            }

            match self.step().await? {
                Step::Exit(exit) => break exit,
                Step::Ran { summary, blocked: block } => {
                    attempts += 1;
                    if summary.completed {
                        completed.push(summary.task_id.clone());
                    }
                    if block.is_some() {
                        blocked.push(summary.task_id.clone());
                    }
                }
            }

            // EVALUATING
            let state = self.recorder.snapshot().await;
            if self.limits.no_progress_limit > 0 && state.no_progress_streak >= self.limits.no_progress_limit {
                warn!(streak = state.no_progress_streak, "no progress, stopping");
                break LoopExit::NoProgress;
            }
            if attempts >= max_iterations {
                break LoopExit::MaxIterations;
            }
            self.limiter.wait(&self.handle).await;
        };

        info!(%exit, attempts, completed = completed.len(), "loop finished");
        Ok(RunSummary {
            exit,
            attempts,
            completed,
            blocked,
        })
    }

    /// One SELECTING → RUNNING → EVALUATING pass, ignoring iteration limits.
    pub async fn step(&mut self) -> Result<Step> {
        let task = match self.select().await? {
            Ok(task) => task,
            Err(exit) => return Ok(Step::Exit(exit)),
        };

        self.limiter.record(Instant::now());
        let attempt = self
            .engine
            .run_iteration(
                &self.tracker,
                IterationRequest {
                    task,
                    workspace: self.workspace.clone(),
                    worker_id: None,
                    apply_completion: true,
                },
            )
            .await;

        let summary = attempt.summary();
        let blocked = self.recorder.record(summary.clone(), self.limits.max_attempts).await?;
        if let Some(reason) = &blocked {
            apply_block(&self.tracker, &summary.task_id, reason).await;
        }
        Ok(Step::Ran { summary, blocked })
    }

    /// The selectable task, or the terminal exit when there is none.
    async fn select(&self) -> Result<std::result::Result<Task, LoopExit>> {
        let mut tracker = self.tracker.lock().await;
        tracker.reload()?;
        if let Some(task) = tracker.claim_next_task() {
            info!(task_id = %task.id, title = %task.title, priority = task.priority, "task selected");
            return Ok(Ok(task));
        }
        if tracker.all_done() {
            return Ok(Err(LoopExit::Complete));
        }
        if tracker.all_blocked() {
            return Ok(Err(LoopExit::AllBlocked));
        }
        let detail = tracker.selection_diagnostic();
        warn!(%detail, "open tasks but none selectable");
        Ok(Err(LoopExit::SelectionAnomaly(detail)))
    }
}

/// Apply an auto-block to the tracker. Failure is logged; the block stays in
/// the loop state either way.
pub(crate) async fn apply_block(tracker: &SharedTracker, task_id: &str, reason: &str) {
    let mut tracker = tracker.lock().await;
    match tracker.block_task(task_id, reason) {
        Ok(()) => warn!(%task_id, %reason, "task blocked"),
        Err(e) => warn!(%task_id, error = %e, "could not block task in tracker"),
    }
}
