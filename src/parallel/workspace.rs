//! Isolated worker checkouts.
//!
//! Each worker gets its own git worktree on its own branch:
//!
//! ```text
//! <workspace_root>/worker-<id>-task-<task>     path
//! <prefix>/worker-<id>-task-<task>             branch
//! ```
//!
//! Worker ids never repeat, so neither do paths or branches. Every git
//! operation that touches the primary repository (adding or removing a
//! worktree, merging, deleting a branch) goes through one lock here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::LoopError;
use crate::git::{Git, MergeOutcome};
use crate::tracker::Task;

/// Workspace failures.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The path could not be claimed. Fatal to the run.
    #[error("cannot allocate workspace {}: {reason}", path.display())]
    Allocation { path: PathBuf, reason: String },

    /// A git operation failed. Fatal only to the worker.
    #[error("git failed for workspace {}: {source}", path.display())]
    Git {
        path: PathBuf,
        #[source]
        source: LoopError,
    },
}

impl From<WorkspaceError> for LoopError {
    fn from(err: WorkspaceError) -> Self {
        LoopError::WorkspaceCreation {
            message: err.to_string(),
        }
    }
}

/// One allocated checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub worker_id: u64,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates, merges and removes worker checkouts.
pub struct WorkspaceManager {
    git: Arc<dyn Git>,
    repo: PathBuf,
    root: PathBuf,
    branch_prefix: String,
    base_branch: String,
    repo_lock: Mutex<()>,
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("repo", &self.repo)
            .field("root", &self.root)
            .field("branch_prefix", &self.branch_prefix)
            .field("base_branch", &self.base_branch)
            .finish()
    }
}

impl WorkspaceManager {
    /// `base_branch` of `None` means the branch checked out in `repo`.
    pub fn new(
        git: Arc<dyn Git>,
        repo: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
        base_branch: Option<String>,
    ) -> crate::error::Result<Self> {
        let repo = repo.into();
        let base_branch = match base_branch {
            Some(branch) => branch,
            None => git.current_branch(&repo)?,
        };
        Ok(Self {
            git,
            repo,
            root: root.into(),
            branch_prefix: branch_prefix.into(),
            base_branch,
            repo_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Path and branch a worker would get, without creating anything.
    #[must_use]
    pub fn allocate(&self, task: &Task, worker_id: u64) -> Workspace {
        let name = format!("worker-{worker_id}-task-{}", sanitize_name(&task.id));
        Workspace {
            worker_id,
            path: self.root.join(&name),
            branch: format!("{}/{name}", self.branch_prefix),
        }
    }

    /// Create the checkout and branch for `task`.
    ///
    /// A partially created workspace is left in place for inspection.
    pub async fn create_workspace(&self, task: &Task, worker_id: u64) -> Result<Workspace, WorkspaceError> {
        let ws = self.allocate(task, worker_id);
        if ws.path.exists() {
            return Err(WorkspaceError::Allocation {
                path: ws.path,
                reason: "path already exists".to_string(),
            });
        }
        std::fs::create_dir_all(&self.root).map_err(|e| WorkspaceError::Allocation {
            path: ws.path.clone(),
            reason: e.to_string(),
        })?;

        let _guard = self.repo_lock.lock().await;
        let (repo, path, branch, base) = (
            self.repo.clone(),
            ws.path.clone(),
            ws.branch.clone(),
            self.base_branch.clone(),
        );
        self.blocking(&ws.path, move |git| git.worktree_add(&repo, &path, &branch, &base))
            .await?;
        info!(worker_id, task_id = %task.id, path = %ws.path.display(), branch = %ws.branch, "workspace created");
        Ok(ws)
    }

    /// Commit whatever the agent left uncommitted on the worker branch.
    pub async fn commit(&self, ws: &Workspace, message: &str) -> Result<bool, WorkspaceError> {
        let (path, message) = (ws.path.clone(), message.to_string());
        self.blocking(&ws.path, move |git| git.commit_all(&path, &message)).await
    }

    /// Commit the workspace, then merge its branch into the base branch.
    ///
    /// The merge lands in whatever the primary checkout has checked out, so it
    /// is refused when that is no longer the base branch.
    pub async fn merge(&self, ws: &Workspace, message: &str) -> Result<MergeOutcome, WorkspaceError> {
        self.commit(ws, message).await?;
        let _guard = self.repo_lock.lock().await;
        let (repo, branch, message, base) = (
            self.repo.clone(),
            ws.branch.clone(),
            message.to_string(),
            self.base_branch.clone(),
        );
        let outcome = self
            .blocking(&ws.path, move |git| {
                let current = git.current_branch(&repo)?;
                if current != base {
                    return Err(LoopError::git(
                        "merge",
                        format!("primary checkout is on '{current}', not base branch '{base}'"),
                    ));
                }
                git.merge(&repo, &branch, &message)
            })
            .await?;
        match &outcome {
            MergeOutcome::Merged => info!(branch = %ws.branch, "branch merged"),
            MergeOutcome::Conflict(files) => {
                warn!(branch = %ws.branch, files = ?files, "merge conflict, aborted");
            }
        }
        Ok(outcome)
    }

    /// Remove the checkout and its branch. Never touches the primary tree.
    pub async fn remove_workspace(&self, ws: &Workspace) -> Result<(), WorkspaceError> {
        if ws.path == self.repo || self.repo.starts_with(&ws.path) {
            return Err(WorkspaceError::Allocation {
                path: ws.path.clone(),
                reason: "refusing to remove the primary working tree".to_string(),
            });
        }
        let _guard = self.repo_lock.lock().await;
        let (repo, path, branch) = (self.repo.clone(), ws.path.clone(), ws.branch.clone());
        self.blocking(&ws.path, move |git| {
            git.worktree_remove(&repo, &path)?;
            git.delete_branch(&repo, &branch)
        })
        .await?;
        info!(path = %ws.path.display(), branch = %ws.branch, "workspace removed");
        Ok(())
    }

    async fn blocking<T, F>(&self, path: &Path, f: F) -> Result<T, WorkspaceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Git) -> crate::error::Result<T> + Send + 'static,
    {
        let git = Arc::clone(&self.git);
        let result = tokio::task::spawn_blocking(move || f(git.as_ref()))
            .await
            .map_err(|e| LoopError::git("spawn_blocking", e.to_string()))
            .and_then(|r| r);
        result.map_err(|source| WorkspaceError::Git {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` with `-`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .to_lowercase()
}
