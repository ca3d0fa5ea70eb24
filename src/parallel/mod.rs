//! Parallel executor.
//!
//! Runs attempts concurrently, one per isolated workspace, bounded by a
//! worker pool.
//!
//! ```text
//!  tracker groups (read once)
//!        │
//!        ▼
//!  batches: queue ─> [all tasks]          group ─> [A] | [B] | [C]
//!        │                                          barrier between
//!        ▼
//!  Semaphore(max_workers) ──> JoinSet<worker>
//!        │
//!        ▼  per worker
//!  create workspace ─> attempt (no tracker mutation) ─> merge policy
//!        │                                    manual: keep branch
//!        │                                    auto_merge: merge, mark_done
//!        ▼
//!  record attempt (serialized) ─> after drain: apply auto-blocks
//! ```
//!
//! A worker never fails the run. Panics, git failures and merge conflicts end
//! up as a [`Worker`] with status [`WorkerStatus::Failed`] and an error
//! string. Only a state write failure or a workspace path that cannot be
//! allocated stops dispatch; in-flight workers are still drained first.

mod workspace;

pub use workspace::{Workspace, WorkspaceError, WorkspaceManager};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{LoopLimits, MergePolicy, ParallelConfig, Strategy};
use crate::controller::{apply_block, LoopHandle};
use crate::error::{LoopError, Result, EXIT_COMPLETE, EXIT_ERROR, EXIT_INCOMPLETE};
use crate::git::MergeOutcome;
use crate::iteration::{Attempt, IterationEngine, IterationRequest};
use crate::review::ReviewVerdict;
use crate::state::{AttemptSummary, StateRecorder};
use crate::tracker::{SharedTracker, Task, TaskGroup};

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// One execution slot running one attempt in one workspace.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub worker_id: u64,
    pub task: Task,
    pub workspace_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub status: WorkerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempt_id: Option<String>,
    /// The task reached done through this worker's merge.
    pub completed: bool,
}

impl Worker {
    fn queued(worker_id: u64, task: Task) -> Self {
        Self {
            worker_id,
            task,
            workspace_path: None,
            branch_name: None,
            status: WorkerStatus::Queued,
            started_at: None,
            completed_at: None,
            error: None,
            attempt_id: None,
            completed: false,
        }
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = WorkerStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

/// Outcome of a parallel run.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelSummary {
    pub exit_code: i32,
    /// Workers in completion order.
    pub workers: Vec<Worker>,
    /// Tasks not dispatched, with the reason.
    pub skipped: Vec<(String, String)>,
    /// Tasks auto-blocked after the pool drained.
    pub blocked: Vec<String>,
    pub stopped: bool,
}

impl ParallelSummary {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.workers.iter().filter(|w| w.status == WorkerStatus::Success).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.workers.iter().filter(|w| w.status == WorkerStatus::Failed).count()
    }
}

/// What a finished worker hands back to the driver.
struct WorkerReport {
    worker: Worker,
    block: Option<String>,
    /// The attempt could not be recorded.
    fatal: Option<LoopError>,
}

/// Shared by every spawned worker.
struct WorkerContext {
    engine: Arc<IterationEngine>,
    tracker: SharedTracker,
    recorder: Arc<StateRecorder>,
    workspaces: Arc<WorkspaceManager>,
    merge_policy: MergePolicy,
    max_attempts: u32,
}

/// Concurrent driver.
pub struct ParallelExecutor {
    ctx: Arc<WorkerContext>,
    max_workers: usize,
    strategy: Strategy,
    handle: LoopHandle,
}

impl ParallelExecutor {
    #[must_use]
    pub fn new(
        engine: Arc<IterationEngine>,
        tracker: SharedTracker,
        recorder: Arc<StateRecorder>,
        workspaces: Arc<WorkspaceManager>,
        config: &ParallelConfig,
        limits: &LoopLimits,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                engine,
                tracker,
                recorder,
                workspaces,
                merge_policy: config.merge_policy,
                max_attempts: limits.max_attempts,
            }),
            max_workers: config.max_workers.max(1),
            strategy: config.strategy,
            handle: LoopHandle::new(),
        }
    }

    #[must_use]
    pub fn with_handle(mut self, handle: LoopHandle) -> Self {
        self.handle = handle;
        self
    }

    /// Dispatch every open task once and wait for all workers.
    pub async fn run(&self) -> Result<ParallelSummary> {
        let (groups, mut done, cyclic, enforce) = {
            let mut tracker = self.ctx.tracker.lock().await;
            tracker.reload()?;
            let done: HashSet<String> = tracker
                .tasks()
                .iter()
                .filter(|t| t.is_done())
                .map(|t| t.id.clone())
                .collect();
            let cyclic: HashSet<String> = tracker.cycles().into_iter().flatten().collect();
            (tracker.get_parallel_groups(), done, cyclic, tracker.enforce_dependencies())
        };
        let batches = batches(groups, self.strategy);
        info!(
            batches = batches.len(),
            tasks = batches.iter().map(Vec::len).sum::<usize>(),
            max_workers = self.max_workers,
            strategy = ?self.strategy,
            merge_policy = ?self.ctx.merge_policy,
            "parallel run started"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut summary = ParallelSummary {
            exit_code: EXIT_INCOMPLETE,
            workers: Vec::new(),
            skipped: Vec::new(),
            blocked: Vec::new(),
            stopped: false,
        };
        let mut blocks: Vec<(String, String)> = Vec::new();
        let mut dispatched = 0usize;
        let mut fatal: Option<LoopError> = None;

        'batches: for batch in batches {
            let mut join_set: JoinSet<WorkerReport> = JoinSet::new();
            let mut running: HashMap<tokio::task::Id, Worker> = HashMap::new();

            for task in batch {
                if !self.handle.proceed().await {
                    info!("stop requested, no further dispatch");
                    summary.stopped = true;
                    break;
                }
                while let Some(joined) = join_set.try_join_next_with_id() {
                    reap(&self.ctx, joined, &mut running, &mut summary, &mut blocks, &mut done, &mut fatal).await;
                }
                if fatal.is_some() {
                    break;
                }

                if cyclic.contains(&task.id) {
                    summary.skipped.push((task.id.clone(), "in a dependency cycle".to_string()));
                    continue;
                }
                if enforce {
                    let unmet: Vec<&str> = task
                        .dependencies
                        .iter()
                        .filter(|d| !done.contains(*d))
                        .map(String::as_str)
                        .collect();
                    if !unmet.is_empty() {
                        debug!(task_id = %task.id, unmet = ?unmet, "dependencies unmet, skipping");
                        summary
                            .skipped
                            .push((task.id.clone(), format!("waits on {}", unmet.join(", "))));
                        continue;
                    }
                }

                let permit = loop {
                    if let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() {
                        break permit;
                    }
                    match join_set.join_next_with_id().await {
                        Some(joined) => {
                            reap(&self.ctx, joined, &mut running, &mut summary, &mut blocks, &mut done, &mut fatal)
                                .await;
                        }
                        None => {
                            break Arc::clone(&semaphore)
                                .acquire_owned()
                                .await
                                .map_err(|e| LoopError::WorkspaceCreation { message: e.to_string() })?
                        }
                    }
                };
                // A worker that finished while we waited may have asked for a stop.
                if self.handle.is_stopped() {
                    info!("stop requested, no further dispatch");
                    summary.stopped = true;
                    break;
                }

                let worker_id = match self.ctx.recorder.update(|s| s.allocate_worker_id()).await {
                    Ok(id) => id,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                };
                let mut worker = Worker::queued(worker_id, task.clone());
                let ws = match self.ctx.workspaces.create_workspace(&task, worker_id).await {
                    Ok(ws) => ws,
                    Err(e @ WorkspaceError::Allocation { .. }) => {
                        fatal = Some(e.into());
                        break;
                    }
                    Err(e) => {
                        warn!(worker_id, task_id = %task.id, error = %e, "workspace creation failed");
                        worker.fail(e.to_string());
                        summary.workers.push(worker);
                        continue;
                    }
                };

                worker.workspace_path = Some(ws.path.clone());
                worker.branch_name = Some(ws.branch.clone());
                worker.status = WorkerStatus::Running;
                worker.started_at = Some(Utc::now());
                dispatched += 1;
                info!(worker_id, task_id = %task.id, "worker dispatched");

                let ctx = Arc::clone(&self.ctx);
                let skeleton = worker.clone();
                let abort = join_set.spawn(async move {
                    let report = run_worker(&ctx, worker, ws).await;
                    drop(permit);
                    report
                });
                running.insert(abort.id(), skeleton);
            }

            // Barrier: the batch drains before anything else happens.
            while let Some(joined) = join_set.join_next_with_id().await {
                reap(&self.ctx, joined, &mut running, &mut summary, &mut blocks, &mut done, &mut fatal).await;
            }
            if fatal.is_some() || summary.stopped {
                break 'batches;
            }
        }

        for (task_id, reason) in &blocks {
            apply_block(&self.ctx.tracker, task_id, reason).await;
            summary.blocked.push(task_id.clone());
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let (all_done, counts) = {
            let mut tracker = self.ctx.tracker.lock().await;
            tracker.reload()?;
            (tracker.all_done(), tracker.counts())
        };
        summary.exit_code = if all_done {
            EXIT_COMPLETE
        } else if dispatched == 0 && !summary.stopped && counts.open > 0 {
            EXIT_ERROR
        } else {
            EXIT_INCOMPLETE
        };
        info!(
            exit_code = summary.exit_code,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped.len(),
            "parallel run finished"
        );
        Ok(summary)
    }
}

/// Queue flattens every group into one batch; group keeps them apart.
fn batches(groups: Vec<TaskGroup>, strategy: Strategy) -> Vec<Vec<Task>> {
    match strategy {
        Strategy::Queue => vec![groups.into_iter().flat_map(|g| g.tasks).collect()],
        Strategy::Group => groups.into_iter().map(|g| g.tasks).collect(),
    }
}

/// Fold a finished (or panicked) worker into the summary.
///
/// A panicked worker never reached its own record step, so its attempt is
/// recorded here as a failure.
async fn reap(
    ctx: &WorkerContext,
    joined: std::result::Result<(tokio::task::Id, WorkerReport), tokio::task::JoinError>,
    running: &mut HashMap<tokio::task::Id, Worker>,
    summary: &mut ParallelSummary,
    blocks: &mut Vec<(String, String)>,
    done: &mut HashSet<String>,
    fatal: &mut Option<LoopError>,
) {
    match joined {
        Ok((id, report)) => {
            running.remove(&id);
            if report.worker.completed {
                done.insert(report.worker.task.id.clone());
            }
            if let Some(reason) = report.block {
                blocks.push((report.worker.task.id.clone(), reason));
            }
            if let Some(e) = report.fatal {
                fatal.get_or_insert(e);
            }
            summary.workers.push(report.worker);
        }
        Err(e) => {
            let Some(mut worker) = running.remove(&e.id()) else {
                return;
            };
            warn!(worker_id = worker.worker_id, task_id = %worker.task.id, error = %e, "worker panicked");
            let failure = format!("worker panicked: {e}");
            worker.fail(failure.clone());
            let attempt = panicked_attempt(&worker, ctx.engine.agent_name(), failure);
            match ctx.recorder.record(attempt, ctx.max_attempts).await {
                Ok(Some(reason)) => blocks.push((worker.task.id.clone(), reason)),
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id = worker.worker_id, error = %e, "attempt could not be recorded");
                    fatal.get_or_insert(e);
                }
            }
            summary.workers.push(worker);
        }
    }
}

/// Failed attempt standing in for a worker that died mid-attempt.
fn panicked_attempt(worker: &Worker, agent: &str, failure: String) -> AttemptSummary {
    let finished_at = worker.completed_at.unwrap_or_else(Utc::now);
    AttemptSummary {
        attempt_id: uuid::Uuid::new_v4().to_string(),
        task_id: worker.task.id.clone(),
        agent: agent.to_string(),
        started_at: worker.started_at.unwrap_or(finished_at),
        finished_at,
        exit_signal: false,
        return_code: None,
        gates_ok: false,
        review_verdict: ReviewVerdict::None,
        progress_made: false,
        completed: false,
        failure: Some(failure),
        receipt: None,
        worker_id: Some(worker.worker_id),
    }
}

/// One worker from attempt to merge to record.
async fn run_worker(ctx: &WorkerContext, mut worker: Worker, ws: Workspace) -> WorkerReport {
    let mut attempt = ctx
        .engine
        .run_iteration(
            &ctx.tracker,
            IterationRequest {
                task: worker.task.clone(),
                workspace: ws.path.clone(),
                worker_id: Some(worker.worker_id),
                apply_completion: false,
            },
        )
        .await;
    worker.attempt_id = Some(attempt.attempt_id.clone());

    if attempt.eligible {
        apply_merge_policy(ctx, &ws, &mut attempt).await;
    }

    worker.completed = attempt.completed;
    worker.completed_at = Some(Utc::now());
    match &attempt.failure {
        None => worker.status = WorkerStatus::Success,
        Some(failure) => worker.fail(failure.clone()),
    }

    match ctx.recorder.record(attempt.summary(), ctx.max_attempts).await {
        Ok(block) => WorkerReport {
            worker,
            block,
            fatal: None,
        },
        Err(e) => {
            warn!(worker_id = worker.worker_id, error = %e, "attempt could not be recorded");
            worker.fail(format!("state write failed: {e}"));
            WorkerReport {
                worker,
                block: None,
                fatal: Some(e),
            }
        }
    }
}

async fn apply_merge_policy(ctx: &WorkerContext, ws: &Workspace, attempt: &mut Attempt) {
    let message = format!("taskloop: task {} (worker {})", attempt.task_id, ws.worker_id);
    match ctx.merge_policy {
        MergePolicy::Manual => {
            if let Err(e) = ctx.workspaces.commit(ws, &message).await {
                attempt.set_failed(e.to_string());
            } else {
                info!(branch = %ws.branch, task_id = %attempt.task_id, "branch left for review");
            }
        }
        MergePolicy::AutoMerge => match ctx.workspaces.merge(ws, &message).await {
            Ok(MergeOutcome::Merged) => {
                if let Err(e) = ctx.workspaces.remove_workspace(ws).await {
                    warn!(path = %ws.path.display(), error = %e, "workspace left behind after merge");
                }
                let mut tracker = ctx.tracker.lock().await;
                match tracker.mark_done(&attempt.task_id) {
                    Ok(()) => attempt.set_completed(),
                    Err(e) => attempt.set_failed(format!("merged but could not mark done: {e}")),
                }
            }
            Ok(MergeOutcome::Conflict(files)) => attempt.set_failed(
                LoopError::MergeConflict {
                    branch: ws.branch.clone(),
                    files,
                }
                .to_string(),
            ),
            Err(e) => attempt.set_failed(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, ids: &[&str]) -> TaskGroup {
        TaskGroup {
            name: name.to_string(),
            tasks: ids.iter().map(|id| Task::new(*id, *id)).collect(),
        }
    }

    #[test]
    fn test_queue_flattens_groups() {
        let b = batches(vec![group("a", &["1", "2"]), group("b", &["3"])], Strategy::Queue);
        assert_eq!(b.len(), 1);
        let ids: Vec<&str> = b[0].iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_group_keeps_batches() {
        let b = batches(vec![group("a", &["1", "2"]), group("b", &["3"])], Strategy::Group);
        assert_eq!(b.len(), 2);
        assert_eq!(b[1][0].id, "3");
    }

    #[test]
    fn test_panicked_attempt_is_a_failed_attempt() {
        let mut worker = Worker::queued(4, Task::new("7", "Seven"));
        worker.started_at = Some(Utc::now());
        worker.fail("worker panicked: boom");
        let attempt = panicked_attempt(&worker, "mock", "worker panicked: boom".to_string());
        assert_eq!(attempt.task_id, "7");
        assert_eq!(attempt.worker_id, Some(4));
        assert!(!attempt.completed);
        assert!(!attempt.progress_made);
        assert_eq!(attempt.failure.as_deref(), Some("worker panicked: boom"));
        assert!(attempt.started_at <= attempt.finished_at);
    }

    #[test]
    fn test_worker_fail_records_reason() {
        let mut worker = Worker::queued(1, Task::new("1", "One"));
        worker.fail("boom");
        assert_eq!(worker.status, WorkerStatus::Failed);
        assert_eq!(worker.error.as_deref(), Some("boom"));
        assert!(worker.completed_at.is_some());
    }
}
