//! Task tracking across storage backends.
//!
//! Every backend exposes the same [`Tracker`] contract. Selection, grouping
//! and completeness checks are provided methods built on
//! [`Tracker::tasks`], so their semantics cannot drift between backends; a
//! backend only decides how tasks are loaded and how mutations are persisted.
//!
//! ```text
//! Tracker (trait)
//!   ├── MarkdownTracker  IMPLEMENTATION_PLAN.md
//!   ├── JsonTracker      tasks.json
//!   └── GithubTracker    issues via `gh`
//! ```
//!
//! # Task lifecycle
//!
//! ```text
//! open ──successful attempt──> done
//!   │
//!   └──attempt budget spent──> blocked ──operator unblock──> open
//! ```

mod github;
mod json;
mod markdown;
pub mod selection;

pub use github::{GhClient, GithubTracker, RealGhClient};
pub use json::JsonTracker;
pub use markdown::MarkdownTracker;
pub use selection::{detect_cycles, partition_groups, select_next, TaskGroup};

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{TrackerBackend, TrackerConfig};
use crate::error::Result;

/// Group name for tasks that do not name one.
pub const DEFAULT_GROUP: &str = "default";

/// Priority assigned when a backend has none recorded.
pub const DEFAULT_PRIORITY: u32 = 100;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Open,
    Done,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Lower runs sooner.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_group")]
    pub parallel_group: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

impl Task {
    /// Create an open task with default priority and group.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Open,
            priority: DEFAULT_PRIORITY,
            dependencies: Vec::new(),
            parallel_group: DEFAULT_GROUP.to_string(),
            acceptance: Vec::new(),
            blocked_reason: None,
            blocked_at: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = group.into();
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Open
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.status == TaskStatus::Blocked
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.title)
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub open: usize,
    pub done: usize,
    pub blocked: usize,
}

/// What an attempt left behind, used to check a task's completion marker.
#[derive(Debug, Clone, Copy)]
pub struct CompletionEvidence<'a> {
    /// Working copy the agent ran in.
    pub workspace: &'a Path,
    /// Combined agent output.
    pub agent_output: &'a str,
}

/// Task storage contract shared by every backend.
///
/// Implementations keep an in-memory snapshot returned by [`tasks`](Self::tasks)
/// in document order, which is the insertion order used for tie-breaking.
/// Mutations re-read the backing store first, so a change that is already
/// persisted is a no-op.
pub trait Tracker: Send {
    /// Backend name for logs and receipts.
    fn name(&self) -> &'static str;

    /// Current snapshot in insertion order.
    fn tasks(&self) -> &[Task];

    /// Refresh the snapshot from the backing store.
    fn reload(&mut self) -> Result<()>;

    /// `open → done`. Already done is a no-op; blocked or unknown is an error.
    fn mark_done(&mut self, id: &str) -> Result<()>;

    /// `open → blocked`, recording reason and timestamp.
    fn block_task(&mut self, id: &str, reason: &str) -> Result<()>;

    /// Operator action: `blocked → open`.
    fn unblock_task(&mut self, id: &str) -> Result<()>;

    /// Whether the agent updated the task's own completion marker.
    fn completion_marked(&self, task: &Task, evidence: &CompletionEvidence<'_>) -> Result<bool>;

    /// Copy of the task's completion marker as it stands in `workspace`.
    ///
    /// `None` means the backend keeps no marker in the working copy.
    fn marker_snapshot(&self, _task: &Task, _workspace: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    /// Undo an agent's edit to the task's completion marker in `workspace`,
    /// putting it back the way [`marker_snapshot`](Self::marker_snapshot)
    /// found it. Returns whether anything was rewritten.
    fn restore_marker(&mut self, _task: &Task, _workspace: &Path, _snapshot: &str) -> Result<bool> {
        Ok(false)
    }

    /// Whether selection requires dependencies to be done.
    fn enforce_dependencies(&self) -> bool {
        true
    }

    /// Lowest-priority selectable open task, ties broken by insertion order.
    fn claim_next_task(&self) -> Option<Task> {
        select_next(self.tasks(), self.enforce_dependencies()).cloned()
    }

    /// True iff every task is done (vacuously true when there are none).
    fn all_done(&self) -> bool {
        self.tasks().iter().all(Task::is_done)
    }

    /// True iff at least one task is not done and every such task is blocked.
    fn all_blocked(&self) -> bool {
        let mut pending = self.tasks().iter().filter(|t| !t.is_done()).peekable();
        pending.peek().is_some() && pending.all(Task::is_blocked)
    }

    /// Open tasks partitioned by `parallel_group`, in first-appearance order.
    fn get_parallel_groups(&self) -> Vec<TaskGroup> {
        partition_groups(self.tasks())
    }

    fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks().iter().find(|t| t.id == id)
    }

    fn counts(&self) -> TaskCounts {
        let tasks = self.tasks();
        TaskCounts {
            total: tasks.len(),
            open: tasks.iter().filter(|t| t.is_open()).count(),
            done: tasks.iter().filter(|t| t.is_done()).count(),
            blocked: tasks.iter().filter(|t| t.is_blocked()).count(),
        }
    }

    /// Dependency cycles among all tasks.
    fn cycles(&self) -> Vec<Vec<String>> {
        detect_cycles(self.tasks())
    }

    /// Human-readable reason why open tasks cannot be selected.
    fn selection_diagnostic(&self) -> String {
        selection::explain_unselectable(self.tasks())
    }
}

/// Tracker handle shared between the driver and workers.
///
/// Backends are not assumed to be internally concurrency-safe; this mutex is
/// the single point through which every mutation passes.
pub type SharedTracker = Arc<Mutex<Box<dyn Tracker>>>;

/// Wrap a tracker for shared use.
#[must_use]
pub fn shared(tracker: Box<dyn Tracker>) -> SharedTracker {
    Arc::new(Mutex::new(tracker))
}

/// Open the backend named by the configuration.
pub fn open_tracker(config: &TrackerConfig, project_dir: &Path) -> Result<Box<dyn Tracker>> {
    let enforce = config.enforce_dependencies;
    let tracker: Box<dyn Tracker> = match config.backend {
        TrackerBackend::Markdown => Box::new(MarkdownTracker::open(
            project_dir,
            config.document_path(),
            enforce,
        )?),
        TrackerBackend::Json => Box::new(JsonTracker::open(
            project_dir,
            config.document_path(),
            enforce,
        )?),
        TrackerBackend::Github => Box::new(GithubTracker::open(
            Box::new(RealGhClient::new(project_dir, config.repo.clone())),
            config.label.clone(),
            enforce,
        )?),
    };
    tracing::debug!(backend = tracker.name(), tasks = tracker.tasks().len(), "tracker opened");
    Ok(tracker)
}

/// Find a task by id or produce a tracker error.
pub(crate) fn find_task<'a>(tasks: &'a mut [Task], id: &str) -> Result<&'a mut Task> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| crate::error::LoopError::tracker(format!("unknown task '{id}'")))
}
