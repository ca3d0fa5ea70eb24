//! The iteration engine: one attempt at one task.
//!
//! ```text
//! context ──> agent ──> exit signal
//!                │
//!        clean exit? ──no──────────────────────────┐
//!                │ yes                             │
//!              gates ──fail──────────────────────> │
//!                │ pass                            │
//!           review? ──block─────────────────────>  │
//!                │ ship / none                     │
//!     completion marker updated? ──no──────────>   │
//!                │ yes                             ▼
//!          mark_done (sequential)              failed attempt
//!                │                                 │
//!                │                   marker put back as it was
//!                └──────> receipt (always) ──> Attempt
//! ```
//!
//! The task's completion marker is snapshotted before the agent runs. If the
//! attempt does not end in completion, any marker edit the agent made is
//! undone, so only a successful attempt can leave the task done.
//!
//! Nothing in here returns an error to the driver. Agent crashes, timeouts,
//! gate failures, git hiccups and tracker errors are folded into the
//! [`Attempt`] as data. Whether the attempt exhausts the task's failure budget
//! is decided by the driver when it records the attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::agent::{parse_citations, parse_exit_signal, AgentRequest, AgentResponse, AgentRunner};
use crate::config::LoopConfig;
use crate::context::ContextBuilder;
use crate::error::{LoopError, Result};
use crate::gates::{GateReport, GateRunner};
use crate::git::Git;
use crate::process::tail_lines;
use crate::receipt::{output_hash, Receipt, ReceiptStore, RECEIPT_SCHEMA};
use crate::review::{ReviewGate, ReviewOutcome, ReviewVerdict};
use crate::state::AttemptSummary;
use crate::tracker::{CompletionEvidence, SharedTracker, Task};

/// Lines of agent output kept in the receipt.
const RECEIPT_TAIL_LINES: usize = 200;

/// Full record of one attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub attempt_id: String,
    pub task_id: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub worker_id: Option<u64>,
    pub workspace: PathBuf,
    pub exit_signal: bool,
    pub return_code: Option<i32>,
    pub timed_out: bool,
    pub gates_ok: bool,
    pub gates: GateReport,
    pub review: Option<ReviewOutcome>,
    pub review_verdict: ReviewVerdict,
    /// Gates passed, review did not block, and the agent updated the task's
    /// completion marker.
    pub eligible: bool,
    /// The task transitioned to done because of this attempt.
    pub completed: bool,
    pub progress_made: bool,
    pub failure: Option<String>,
    pub citations: Vec<String>,
    pub changed_files: Vec<String>,
    pub receipt: Option<PathBuf>,
}

impl Attempt {
    /// Persisted form for the loop state history.
    #[must_use]
    pub fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            attempt_id: self.attempt_id.clone(),
            task_id: self.task_id.clone(),
            agent: self.agent.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_signal: self.exit_signal,
            return_code: self.return_code,
            gates_ok: self.gates_ok,
            review_verdict: self.review_verdict,
            progress_made: self.progress_made,
            completed: self.completed,
            failure: self.failure.clone(),
            receipt: self.receipt.clone(),
            worker_id: self.worker_id,
        }
    }

    /// Mark a deferred completion (parallel merge) as applied.
    pub fn set_completed(&mut self) {
        self.completed = true;
        self.progress_made = true;
    }

    /// Turn an eligible attempt into a failed one after the fact.
    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.completed = false;
        self.failure = Some(reason.into());
    }
}

/// Where and how one attempt runs.
#[derive(Debug, Clone)]
pub struct IterationRequest {
    pub task: Task,
    /// Working copy the agent runs in.
    pub workspace: PathBuf,
    pub worker_id: Option<u64>,
    /// Apply `mark_done` on the shared tracker when eligible. Parallel workers
    /// defer this until after their merge.
    pub apply_completion: bool,
}

/// Runs single attempts. Cheap to share between workers.
pub struct IterationEngine {
    agent: Arc<dyn AgentRunner>,
    git: Arc<dyn Git>,
    gates: GateRunner,
    review: Option<ReviewGate>,
    context: ContextBuilder,
    receipts: ReceiptStore,
    state_dir: PathBuf,
    agent_timeout: Duration,
}

impl std::fmt::Debug for IterationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationEngine")
            .field("agent", &self.agent.name())
            .field("gates", &self.gates)
            .field("review", &self.review.is_some())
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

impl IterationEngine {
    /// Engine with no gates, no review and default context settings.
    #[must_use]
    pub fn new(agent: Arc<dyn AgentRunner>, git: Arc<dyn Git>, state_dir: impl Into<PathBuf>, tracker_name: &'static str) -> Self {
        let state_dir = state_dir.into();
        Self {
            agent,
            git,
            gates: GateRunner::new(Vec::new()),
            review: None,
            context: ContextBuilder::new(&Default::default(), tracker_name),
            receipts: ReceiptStore::new(&state_dir),
            state_dir,
            agent_timeout: Duration::from_secs(900),
        }
    }

    /// Engine wired from configuration.
    ///
    /// `reviewer` is used when the configuration enables review.
    #[must_use]
    pub fn from_config(
        config: &LoopConfig,
        project_dir: &Path,
        agent: Arc<dyn AgentRunner>,
        reviewer: Option<Arc<dyn AgentRunner>>,
        git: Arc<dyn Git>,
        tracker_name: &'static str,
    ) -> Self {
        let review = reviewer.filter(|_| config.review.is_enabled()).map(|r| {
            ReviewGate::new(r, config.review.ship_token.clone())
                .with_timeout(Duration::from_secs(config.review.timeout_secs))
                .with_max_diff_bytes(config.review.max_diff_bytes)
        });
        Self::new(agent, git, config.state_path(project_dir), tracker_name)
            .with_gates(GateRunner::from_config(&config.gates))
            .with_review(review)
            .with_context(ContextBuilder::new(&config.context, tracker_name))
            .with_agent_timeout(Duration::from_secs(config.agent.timeout_secs))
    }

    #[must_use]
    pub fn with_gates(mut self, gates: GateRunner) -> Self {
        self.gates = gates;
        self
    }

    #[must_use]
    pub fn with_review(mut self, review: Option<ReviewGate>) -> Self {
        self.review = review;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    #[must_use]
    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    #[must_use]
    pub fn git(&self) -> Arc<dyn Git> {
        Arc::clone(&self.git)
    }

    /// Execute one attempt. Always returns a well-formed [`Attempt`].
    pub async fn run_iteration(&self, tracker: &SharedTracker, request: IterationRequest) -> Attempt {
        let IterationRequest {
            task,
            workspace,
            worker_id,
            apply_completion,
        } = request;
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(%attempt_id, task_id = %task.id, worker_id = ?worker_id, "attempt started");

        let start_head = self.git_blocking(&workspace, |git, dir| git.head(dir)).await.ok().flatten();
        let before = self.fingerprint(&workspace).await;
        let marker = {
            let tracker = tracker.lock().await;
            tracker.marker_snapshot(&task, &workspace).unwrap_or_else(|e| {
                warn!(%attempt_id, task_id = %task.id, error = %e, "cannot snapshot completion marker");
                None
            })
        };

        let prompt = self.context.build(&workspace, &task).await;
        let response = self
            .agent
            .invoke(AgentRequest {
                prompt,
                workspace: workspace.clone(),
                task_id: task.id.clone(),
                timeout: self.agent_timeout,
            })
            .await;
        let exit_signal = parse_exit_signal(&response.output);
        let citations = parse_citations(&response.output);
        debug!(%attempt_id, code = ?response.code, exit_signal, "agent finished");

        let mut failure = agent_failure(&response, self.agent_timeout).map(|e| e.to_string());

        // A failed agent run skips gates entirely.
        let gates = if failure.is_none() {
            self.gates.run(&workspace).await
        } else {
            GateReport::default()
        };
        let gates_ok = failure.is_none() && gates.ok();
        if failure.is_none() {
            if let Some(gate) = gates.first_failure() {
                failure = Some(
                    LoopError::GateFailure {
                        gate: gate.command.clone(),
                        code: gate.code,
                    }
                    .to_string(),
                );
            }
        }

        let review = match (&self.review, gates_ok) {
            (Some(gate), true) => {
                let since = start_head.clone();
                let diff = self
                    .git_blocking(&workspace, move |git, dir| git.diff(dir, since.as_deref()))
                    .await
                    .unwrap_or_else(|e| {
                        warn!(%attempt_id, error = %e, "cannot compute diff for review");
                        String::new()
                    });
                Some(gate.review(&workspace, &task, &diff).await)
            }
            _ => None,
        };
        let review_verdict = review.as_ref().map_or(ReviewVerdict::None, |r| r.verdict);
        if review_verdict == ReviewVerdict::Block {
            let reason = review
                .as_ref()
                .and_then(|r| r.reason.clone())
                .unwrap_or_else(|| "review blocked".to_string());
            failure = Some(LoopError::ReviewBlocked { reason }.to_string());
        }

        let mut completion_marked = false;
        let mut completed = false;
        if gates_ok && review_verdict != ReviewVerdict::Block {
            let mut tracker = tracker.lock().await;
            let evidence = CompletionEvidence {
                workspace: &workspace,
                agent_output: &response.output,
            };
            completion_marked = tracker.completion_marked(&task, &evidence).unwrap_or_else(|e| {
                warn!(%attempt_id, task_id = %task.id, error = %e, "cannot check completion marker");
                false
            });

            if !completion_marked {
                failure = Some(format!("completion marker for task {} was not updated", task.id));
            } else if apply_completion {
                match tracker.mark_done(&task.id) {
                    Ok(()) => completed = true,
                    Err(e) => failure = Some(format!("could not mark task {} done: {e}", task.id)),
                }
            }
        }
        let eligible = gates_ok && review_verdict != ReviewVerdict::Block && completion_marked;

        if !eligible || (apply_completion && !completed) {
            if let Some(snapshot) = &marker {
                let mut tracker = tracker.lock().await;
                match tracker.restore_marker(&task, &workspace, snapshot) {
                    Ok(true) => info!(%attempt_id, task_id = %task.id, "agent's completion marker undone"),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(%attempt_id, task_id = %task.id, error = %e, "cannot restore completion marker");
                    }
                }
            }
        }

        let after = self.fingerprint(&workspace).await;
        let repo_changed = matches!((&before, &after), (Some(b), Some(a)) if a != b);
        let progress_made = completed || repo_changed;

        let since = start_head.clone();
        let changed_files = self
            .git_blocking(&workspace, move |git, dir| git.changed_files(dir, since.as_deref()))
            .await
            .unwrap_or_default();

        let mut attempt = Attempt {
            attempt_id,
            task_id: task.id.clone(),
            agent: self.agent.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            worker_id,
            workspace,
            exit_signal,
            return_code: response.code,
            timed_out: response.timed_out,
            gates_ok,
            gates,
            review,
            review_verdict,
            eligible,
            completed,
            progress_made,
            failure,
            citations,
            changed_files,
            receipt: None,
        };
        match self.write_receipt(&attempt, &response.output, completion_marked) {
            Ok(path) => attempt.receipt = Some(path),
            Err(e) => {
                let missing = format!("receipt could not be written: {e}");
                attempt.failure = Some(match attempt.failure.take() {
                    Some(failure) => format!("{failure}; {missing}"),
                    None => missing,
                });
            }
        }

        if let Some(failure) = &attempt.failure {
            warn!(attempt_id = %attempt.attempt_id, task_id = %attempt.task_id, %failure, "attempt failed");
        } else {
            info!(
                attempt_id = %attempt.attempt_id,
                task_id = %attempt.task_id,
                completed = attempt.completed,
                progress = attempt.progress_made,
                "attempt succeeded"
            );
        }
        attempt
    }

    fn write_receipt(&self, attempt: &Attempt, output: &str, completion_marked: bool) -> Result<PathBuf> {
        let receipt = Receipt {
            schema: RECEIPT_SCHEMA.to_string(),
            attempt_id: attempt.attempt_id.clone(),
            task_id: attempt.task_id.clone(),
            agent: attempt.agent.clone(),
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
            worker_id: attempt.worker_id,
            workspace: attempt.workspace.clone(),
            return_code: attempt.return_code,
            timed_out: attempt.timed_out,
            exit_signal: attempt.exit_signal,
            output_sha256: output_hash(output),
            output_bytes: output.len(),
            output_tail: tail_lines(output, RECEIPT_TAIL_LINES),
            citations: attempt.citations.clone(),
            changed_files: attempt.changed_files.clone(),
            gates: attempt.gates.results.clone(),
            gates_ok: attempt.gates_ok,
            review: attempt.review.clone(),
            completion_marked,
            failure: attempt.failure.clone(),
        };
        self.receipts.write(&receipt)
    }

    /// Fingerprint of `workspace`, `None` when git cannot produce one.
    async fn fingerprint(&self, workspace: &Path) -> Option<String> {
        let state_dir = self.state_dir.clone();
        self.git_blocking(workspace, move |git, dir| git.fingerprint(dir, &[state_dir.as_path()]))
            .await
            .map_err(|e| debug!(error = %e, "fingerprint unavailable"))
            .ok()
    }

    async fn git_blocking<T, F>(&self, dir: &Path, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Git, &Path) -> Result<T> + Send + 'static,
    {
        let git = Arc::clone(&self.git);
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || f(git.as_ref(), &dir))
            .await
            .map_err(|e| LoopError::git("spawn_blocking", e.to_string()))?
    }
}

/// Classify an unsuccessful agent run.
fn agent_failure(response: &AgentResponse, timeout: Duration) -> Option<LoopError> {
    if let Some(message) = &response.spawn_error {
        return Some(LoopError::AgentNonZeroExit {
            code: None,
            message: format!("failed to start: {message}"),
        });
    }
    if response.timed_out {
        return Some(LoopError::AgentTimeout {
            secs: timeout.as_secs(),
        });
    }
    if response.code != Some(0) {
        let last = response.output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        return Some(LoopError::AgentNonZeroExit {
            code: response.code,
            message: last.trim().to_string(),
        });
    }
    None
}
