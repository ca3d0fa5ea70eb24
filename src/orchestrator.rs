//! Control surface over both drivers.
//!
//! [`Orchestrator`] owns the explicit state handles a run needs (tracker,
//! state recorder, iteration engine) and hands them to whichever driver is
//! asked for. Nothing here is global; two orchestrators over two projects do
//! not share anything.
//!
//! # Dependency Injection
//!
//! External seams arrive through [`LoopDependencies`], so tests can drive the
//! full loop with mocks.
//!
//! ```rust,ignore
//! let deps = LoopDependencies::real(&config, &project_dir)?;
//! let orchestrator = Orchestrator::new(config, project_dir, deps)?;
//! let summary = orchestrator.run(None).await?;
//! std::process::exit(summary.exit_code());
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::agent::{AgentRunner, ProcessAgent};
use crate::atomic::write_atomic;
use crate::config::{LoopConfig, PromptMode};
use crate::controller::{LoopController, LoopHandle, RunSummary, Step};
use crate::error::{LoopError, Result};
use crate::git::{Git, RealGit};
use crate::iteration::IterationEngine;
use crate::parallel::{ParallelExecutor, ParallelSummary, WorkspaceManager};
use crate::state::{AttemptSummary, StateRecorder, StateStore};
use crate::tracker::{open_tracker, shared, SharedTracker, Task, TaskCounts, TaskStatus, Tracker};

/// External collaborators of a run.
pub struct LoopDependencies {
    pub agent: Arc<dyn AgentRunner>,
    /// Used only when review is configured.
    pub reviewer: Option<Arc<dyn AgentRunner>>,
    pub git: Arc<dyn Git>,
    pub tracker: Box<dyn Tracker>,
}

impl LoopDependencies {
    /// Production dependencies: child processes, the `git` binary and the
    /// configured tracker backend.
    pub fn real(config: &LoopConfig, project_dir: &Path) -> Result<Self> {
        let reviewer = config.review.is_enabled().then(|| {
            Arc::new(ProcessAgent::new("reviewer", config.review.argv.clone(), PromptMode::Stdin))
                as Arc<dyn AgentRunner>
        });
        Ok(Self {
            agent: Arc::new(ProcessAgent::from_config(&config.agent)),
            reviewer,
            git: Arc::new(RealGit),
            tracker: open_tracker(&config.tracker, project_dir)?,
        })
    }
}

/// Snapshot for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub tracker: &'static str,
    pub invocation_count: u64,
    pub no_progress_streak: u32,
    pub history_len: usize,
    pub last_attempt: Option<AttemptSummary>,
    pub blocked_tasks: BTreeMap<String, String>,
    pub counts: TaskCounts,
    pub next_task: Option<Task>,
    pub cycles: Vec<Vec<String>>,
    /// Why nothing is selectable, when that is the case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Entry point for `step`, `run`, `status` and operator actions.
pub struct Orchestrator {
    config: LoopConfig,
    project_dir: PathBuf,
    engine: Arc<IterationEngine>,
    tracker: SharedTracker,
    recorder: Arc<StateRecorder>,
    git: Arc<dyn Git>,
    handle: LoopHandle,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project_dir", &self.project_dir)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Orchestrator {
    /// Prepare the state directory and load the loop state.
    pub fn new(config: LoopConfig, project_dir: impl Into<PathBuf>, deps: LoopDependencies) -> Result<Self> {
        let project_dir = project_dir.into();
        let state_dir = config.state_path(&project_dir);
        prepare_state_dir(&state_dir)?;

        let tracker_name = deps.tracker.name();
        let engine = IterationEngine::from_config(
            &config,
            &project_dir,
            deps.agent,
            deps.reviewer,
            Arc::clone(&deps.git),
            tracker_name,
        );
        Ok(Self {
            recorder: Arc::new(StateRecorder::open(StateStore::new(&state_dir))),
            tracker: shared(deps.tracker),
            engine: Arc::new(engine),
            git: deps.git,
            handle: LoopHandle::new(),
            config,
            project_dir,
        })
    }

    /// Handle for stop/pause/resume from another task.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> SharedTracker {
        Arc::clone(&self.tracker)
    }

    fn controller(&self) -> LoopController {
        LoopController::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.tracker),
            Arc::clone(&self.recorder),
            self.config.limits.clone(),
            &self.project_dir,
        )
        .with_handle(self.handle.clone())
    }

    /// Run exactly one attempt, or report why none can run.
    pub async fn step(&self) -> Result<Step> {
        self.controller().step().await
    }

    /// Sequential run until a terminal condition.
    pub async fn run(&self, max_iterations: Option<u32>) -> Result<RunSummary> {
        self.controller().run(max_iterations).await
    }

    /// One parallel pass over every open task.
    pub async fn run_parallel(&self) -> Result<ParallelSummary> {
        let parallel = &self.config.parallel;
        let workspaces = WorkspaceManager::new(
            Arc::clone(&self.git),
            &self.project_dir,
            self.config.workspace_root(&self.project_dir),
            parallel.branch_prefix.clone(),
            parallel.base_branch.clone(),
        )?;
        ParallelExecutor::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.tracker),
            Arc::clone(&self.recorder),
            Arc::new(workspaces),
            parallel,
            &self.config.limits,
        )
        .with_handle(self.handle.clone())
        .run()
        .await
    }

    /// Loop state summary plus the next selectable task.
    pub async fn status(&self) -> Result<StatusReport> {
        let state = self.recorder.snapshot().await;
        let mut tracker = self.tracker.lock().await;
        tracker.reload()?;
        let next_task = tracker.claim_next_task();
        let diagnostic = (next_task.is_none() && !tracker.all_done() && !tracker.all_blocked())
            .then(|| tracker.selection_diagnostic());
        Ok(StatusReport {
            tracker: tracker.name(),
            invocation_count: state.invocation_count,
            no_progress_streak: state.no_progress_streak,
            history_len: state.history.len(),
            last_attempt: state.history.last().cloned(),
            blocked_tasks: state.blocked_tasks,
            counts: tracker.counts(),
            next_task,
            cycles: tracker.cycles(),
            diagnostic,
        })
    }

    /// Operator action: `blocked → open`, forgetting the failure streak.
    pub async fn unblock(&self, task_id: &str) -> Result<()> {
        {
            let mut tracker = self.tracker.lock().await;
            tracker.reload()?;
            match tracker.get_task(task_id).map(|t| t.status) {
                None => return Err(LoopError::tracker(format!("unknown task '{task_id}'"))),
                Some(TaskStatus::Blocked) => tracker.unblock_task(task_id)?,
                Some(status) => {
                    return Err(LoopError::tracker(format!("task '{task_id}' is {status}, not blocked")))
                }
            }
        }
        self.recorder.update(|state| state.clear_block(task_id)).await?;
        info!(%task_id, "task unblocked");
        Ok(())
    }
}

/// Create the state directory and keep it out of the repository.
fn prepare_state_dir(state_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(state_dir).map_err(|e| LoopError::StateWrite {
        path: state_dir.to_path_buf(),
        message: e.to_string(),
    })?;
    let ignore = state_dir.join(".gitignore");
    if !ignore.exists() {
        write_atomic(&ignore, b"*\n").map_err(|e| LoopError::StateWrite {
            path: ignore.clone(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}
