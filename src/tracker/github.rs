//! GitHub issue backend.
//!
//! Issues carrying the configured label are tasks. State is read from the
//! issue itself:
//!
//! - closed ⇒ done, label `blocked` ⇒ blocked, otherwise open
//! - `priority:N` and `group:X` labels set priority and parallel group
//! - `Depends on #N` body lines add dependencies
//! - body checkboxes are acceptance criteria
//!
//! Agents cannot close issues from inside a workspace, so the completion
//! marker is a `TASK_COMPLETE: <id>` line in the agent output.
//!
//! All `gh` traffic goes through [`GhClient`] so tests can substitute a
//! scripted client.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{find_task, CompletionEvidence, Task, TaskStatus, Tracker, DEFAULT_GROUP, DEFAULT_PRIORITY};
use crate::error::{LoopError, Result};

/// Label marking a blocked issue.
pub const BLOCKED_LABEL: &str = "blocked";

/// Completion line printed by the agent.
pub const COMPLETION_PREFIX: &str = "TASK_COMPLETE:";

/// Issue as reported by `gh issue list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// `OPEN` or `CLOSED`.
    pub state: String,
    #[serde(default, deserialize_with = "label_names")]
    pub labels: Vec<String>,
}

fn label_names<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Label {
        name: String,
    }
    Ok(Vec::<Label>::deserialize(deserializer)?
        .into_iter()
        .map(|l| l.name)
        .collect())
}

/// Issue tracker operations used by [`GithubTracker`].
pub trait GhClient: Send {
    /// Every issue, open or closed, carrying `label`.
    fn list_issues(&self, label: &str) -> Result<Vec<Issue>>;

    fn close_issue(&self, number: u64, comment: &str) -> Result<()>;

    fn add_label(&self, number: u64, label: &str) -> Result<()>;

    fn remove_label(&self, number: u64, label: &str) -> Result<()>;

    fn comment(&self, number: u64, body: &str) -> Result<()>;
}

/// [`GhClient`] shelling out to the `gh` CLI.
#[derive(Debug, Clone)]
pub struct RealGhClient {
    project_dir: PathBuf,
    repo: Option<String>,
}

impl RealGhClient {
    #[must_use]
    pub fn new(project_dir: &Path, repo: Option<String>) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            repo,
        }
    }

    fn gh(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new("gh");
        command.args(args).current_dir(&self.project_dir);
        if let Some(repo) = &self.repo {
            command.args(["--repo", repo.as_str()]);
        }
        debug!(args = ?args, "running gh");

        let output = command
            .output()
            .map_err(|e| LoopError::tracker(format!("failed to run gh: {e}")))?;
        if !output.status.success() {
            return Err(LoopError::tracker(format!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GhClient for RealGhClient {
    fn list_issues(&self, label: &str) -> Result<Vec<Issue>> {
        let stdout = self.gh(&[
            "issue",
            "list",
            "--label",
            label,
            "--state",
            "all",
            "--limit",
            "500",
            "--json",
            "number,title,body,state,labels",
        ])?;
        Ok(serde_json::from_str(&stdout)?)
    }

    fn close_issue(&self, number: u64, comment: &str) -> Result<()> {
        self.gh(&["issue", "close", &number.to_string(), "--comment", comment])
            .map(drop)
    }

    fn add_label(&self, number: u64, label: &str) -> Result<()> {
        self.gh(&["issue", "edit", &number.to_string(), "--add-label", label])
            .map(drop)
    }

    fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        self.gh(&["issue", "edit", &number.to_string(), "--remove-label", label])
            .map(drop)
    }

    fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.gh(&["issue", "comment", &number.to_string(), "--body", body])
            .map(drop)
    }
}

fn depends_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*depends\s+on\s+((?:#\d+[\s,]*)+)").expect("valid depends regex"))
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s+\[[ xX]\]\s+(.+?)\s*$").expect("valid checkbox regex"))
}

fn task_from_issue(issue: &Issue) -> Task {
    let mut task = Task::new(issue.number.to_string(), issue.title.clone());

    for label in &issue.labels {
        if let Some(p) = label.strip_prefix("priority:") {
            task.priority = p.trim().parse().unwrap_or(DEFAULT_PRIORITY);
        } else if let Some(g) = label.strip_prefix("group:") {
            let g = g.trim();
            task.parallel_group = if g.is_empty() { DEFAULT_GROUP } else { g }.to_string();
        }
    }

    for caps in depends_re().captures_iter(&issue.body) {
        task.dependencies.extend(
            caps[1]
                .split(|c: char| c == '#' || c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
    task.acceptance = checkbox_re()
        .captures_iter(&issue.body)
        .map(|c| c[1].to_string())
        .collect();
    task.description = issue
        .body
        .lines()
        .filter(|l| !depends_re().is_match(l) && !checkbox_re().is_match(l))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    task.status = if issue.state.eq_ignore_ascii_case("closed") {
        TaskStatus::Done
    } else if issue.labels.iter().any(|l| l == BLOCKED_LABEL) {
        task.blocked_reason = Some("blocked label set on issue".to_string());
        TaskStatus::Blocked
    } else {
        TaskStatus::Open
    };
    task
}

fn issue_number(id: &str) -> Result<u64> {
    id.trim_start_matches('#')
        .parse()
        .map_err(|_| LoopError::tracker(format!("'{id}' is not an issue number")))
}

/// Tracker over labelled GitHub issues.
pub struct GithubTracker {
    client: Box<dyn GhClient>,
    label: String,
    tasks: Vec<Task>,
    enforce_dependencies: bool,
}

impl std::fmt::Debug for GithubTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubTracker")
            .field("label", &self.label)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl GithubTracker {
    pub fn open(client: Box<dyn GhClient>, label: impl Into<String>, enforce_dependencies: bool) -> Result<Self> {
        let mut tracker = Self {
            client,
            label: label.into(),
            tasks: Vec::new(),
            enforce_dependencies,
        };
        tracker.reload()?;
        Ok(tracker)
    }
}

impl Tracker for GithubTracker {
    fn name(&self) -> &'static str {
        "github"
    }

    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn reload(&mut self) -> Result<()> {
        let mut issues = self.client.list_issues(&self.label)?;
        // gh lists newest first; creation order is the natural plan order
        issues.sort_by_key(|i| i.number);
        self.tasks = issues.iter().map(task_from_issue).collect();
        debug!(tasks = self.tasks.len(), label = %self.label, "issues loaded");
        Ok(())
    }

    fn mark_done(&mut self, id: &str) -> Result<()> {
        self.reload()?;
        match find_task(&mut self.tasks, id)?.status {
            TaskStatus::Done => return Ok(()),
            TaskStatus::Blocked => {
                return Err(LoopError::tracker(format!("task '{id}' is blocked, not open")))
            }
            TaskStatus::Open => {}
        }
        self.client
            .close_issue(issue_number(id)?, "Completed by taskloop: gates passed.")?;
        find_task(&mut self.tasks, id)?.status = TaskStatus::Done;
        info!(task_id = id, "issue closed");
        Ok(())
    }

    fn block_task(&mut self, id: &str, reason: &str) -> Result<()> {
        self.reload()?;
        let task = find_task(&mut self.tasks, id)?;
        if task.is_done() {
            return Err(LoopError::tracker(format!("task '{id}' is done, not open")));
        }
        let number = issue_number(id)?;
        if !task.is_blocked() {
            self.client.add_label(number, BLOCKED_LABEL)?;
        }
        self.client
            .comment(number, &format!("Blocked by taskloop: {reason}"))?;

        let task = find_task(&mut self.tasks, id)?;
        task.status = TaskStatus::Blocked;
        task.blocked_reason = Some(reason.to_string());
        task.blocked_at = Some(chrono::Utc::now());
        info!(task_id = id, reason, "issue blocked");
        Ok(())
    }

    fn unblock_task(&mut self, id: &str) -> Result<()> {
        self.reload()?;
        if !find_task(&mut self.tasks, id)?.is_blocked() {
            return Ok(());
        }
        self.client.remove_label(issue_number(id)?, BLOCKED_LABEL)?;
        let task = find_task(&mut self.tasks, id)?;
        task.status = TaskStatus::Open;
        task.blocked_reason = None;
        task.blocked_at = None;
        info!(task_id = id, "issue unblocked");
        Ok(())
    }

    fn completion_marked(&self, task: &Task, evidence: &CompletionEvidence<'_>) -> Result<bool> {
        Ok(evidence.agent_output.lines().any(|line| {
            line.trim()
                .strip_prefix(COMPLETION_PREFIX)
                .is_some_and(|rest| rest.trim().trim_start_matches('#') == task.id)
        }))
    }

    fn enforce_dependencies(&self) -> bool {
        self.enforce_dependencies
    }
}
