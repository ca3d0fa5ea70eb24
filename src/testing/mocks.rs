//! Mock implementations of the agent and git seams.
//!
//! These doubles make the loop deterministic: agents answer through a
//! closure, and git operations act on plain directories.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::agent::{AgentRequest, AgentResponse, AgentRunner};
use crate::error::{LoopError, Result};
use crate::git::{Git, MergeOutcome};

/// What a [`MockAgent`] answers with.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub output: String,
    pub code: Option<i32>,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
    pub delay: Option<Duration>,
}

impl MockReply {
    /// Clean exit with `output`.
    #[must_use]
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            code: Some(0),
            timed_out: false,
            spawn_error: None,
            delay: None,
        }
    }

    /// The agent hit its timeout.
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            code: None,
            timed_out: true,
            ..Self::output("")
        }
    }

    /// The agent binary could not be started.
    #[must_use]
    pub fn spawn_error(message: impl Into<String>) -> Self {
        Self {
            code: None,
            spawn_error: Some(message.into()),
            ..Self::output("")
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Responder = dyn Fn(&AgentRequest) -> MockReply + Send + Sync;

/// Agent double driven by a closure.
///
/// # Example
///
/// ```rust,ignore
/// let agent = MockAgent::new("mock", |req| {
///     std::fs::write(req.workspace.join("out.txt"), "hi").unwrap();
///     MockReply::output("EXIT_SIGNAL: true")
/// });
/// ```
pub struct MockAgent {
    name: String,
    responder: Box<Responder>,
    calls: AtomicU32,
    requests: Mutex<Vec<AgentRequest>>,
}

impl std::fmt::Debug for MockAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAgent")
            .field("name", &self.name)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockAgent {
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&AgentRequest) -> MockReply + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            responder: Box::new(responder),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Task ids of every invocation, in call order.
    pub fn task_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.iter().map(|req| req.task_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Prompts of every invocation, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.iter().map(|req| req.prompt.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentRunner for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: AgentRequest) -> AgentResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = (self.responder)(&request);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        AgentResponse {
            code: reply.code,
            output: reply.output,
            timed_out: reply.timed_out,
            spawn_error: reply.spawn_error,
            duration: reply.delay.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
struct MockGitState {
    /// branch -> worktree path
    worktrees: BTreeMap<String, PathBuf>,
    branches: BTreeSet<String>,
    merged: Vec<String>,
    commits: Vec<String>,
}

/// [`Git`] double over plain directories.
///
/// Fingerprints hash every file under the directory. Worktrees are copies of
/// the repository, and a merge copies the worktree's files back. Branches
/// registered with [`with_conflict`](Self::with_conflict) refuse to merge.
#[derive(Debug, Clone, Default)]
pub struct MockGit {
    state: Arc<Mutex<MockGitState>>,
    conflicts: BTreeMap<String, Vec<String>>,
    diff: String,
}

impl MockGit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merging any branch whose name contains `pattern` conflicts on `files`.
    #[must_use]
    pub fn with_conflict(mut self, pattern: &str, files: &[&str]) -> Self {
        self.conflicts
            .insert(pattern.to_string(), files.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Diff returned for every review.
    #[must_use]
    pub fn with_diff(mut self, diff: &str) -> Self {
        self.diff = diff.to_string();
        self
    }

    /// Branches merged so far, in merge order.
    pub fn merged(&self) -> Vec<String> {
        self.lock().map(|s| s.merged.clone()).unwrap_or_default()
    }

    /// Branches that currently exist.
    pub fn branches(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.branches.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Commit messages recorded by [`Git::commit_all`].
    pub fn commits(&self) -> Vec<String> {
        self.lock().map(|s| s.commits.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockGitState>> {
        self.state
            .lock()
            .map_err(|_| LoopError::git("mock", "state poisoned"))
    }
}

/// Relative paths of every file under `dir`, skipping `.git` and `exclude`.
fn files_under(dir: &Path, exclude: &[&Path]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            // the root itself may sit under an excluded path (worker workspaces)
            e.depth() == 0 || (e.file_name() != ".git" && !exclude.iter().any(|x| e.path().starts_with(x)))
        })
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

fn copy_tree(from: &Path, to: &Path, exclude: &[&Path]) -> Result<()> {
    for relative in files_under(from, exclude) {
        let target = to.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from.join(&relative), target)?;
    }
    Ok(())
}

impl Git for MockGit {
    fn head(&self, _dir: &Path) -> Result<Option<String>> {
        Ok(Some("mock-head".to_string()))
    }

    fn current_branch(&self, _dir: &Path) -> Result<String> {
        Ok("main".to_string())
    }

    fn fingerprint(&self, dir: &Path, exclude: &[&Path]) -> Result<String> {
        let mut hasher = Sha256::new();
        for relative in files_under(dir, exclude) {
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(dir.join(&relative))?);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn diff(&self, _dir: &Path, _since: Option<&str>) -> Result<String> {
        Ok(self.diff.clone())
    }

    fn changed_files(&self, _dir: &Path, _since: Option<&str>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn commit_all(&self, _dir: &Path, message: &str) -> Result<bool> {
        self.lock()?.commits.push(message.to_string());
        Ok(true)
    }

    fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, _base: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.branches.contains(branch) {
            return Err(LoopError::git("worktree add", format!("branch '{branch}' already exists")));
        }
        // Keep the worktree out of its own copy.
        let state_dir = repo.join(".taskloop");
        copy_tree(repo, path, &[path, state_dir.as_path()])?;
        state.branches.insert(branch.to_string());
        state.worktrees.insert(branch.to_string(), path.to_path_buf());
        Ok(())
    }

    fn worktree_remove(&self, _repo: &Path, path: &Path) -> Result<()> {
        let mut state = self.lock()?;
        state.worktrees.retain(|_, p| p != path);
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn merge(&self, repo: &Path, branch: &str, _message: &str) -> Result<MergeOutcome> {
        if let Some((_, files)) = self.conflicts.iter().find(|(pattern, _)| branch.contains(pattern.as_str())) {
            return Ok(MergeOutcome::Conflict(files.clone()));
        }
        let mut state = self.lock()?;
        let source = state
            .worktrees
            .get(branch)
            .cloned()
            .ok_or_else(|| LoopError::git("merge", format!("unknown branch '{branch}'")))?;
        copy_tree(&source, repo, &[])?;
        state.merged.push(branch.to_string());
        Ok(MergeOutcome::Merged)
    }

    fn branch_exists(&self, _repo: &Path, branch: &str) -> bool {
        self.lock().map(|s| s.branches.contains(branch)).unwrap_or(false)
    }

    fn delete_branch(&self, _repo: &Path, branch: &str) -> Result<()> {
        self.lock()?.branches.remove(branch);
        Ok(())
    }
}
