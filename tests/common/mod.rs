//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub const PLAN: &str = "IMPLEMENTATION_PLAN.md";

/// A scratch project directory with a plan file.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    /// Empty project without a plan.
    pub fn empty() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    /// Project whose plan is `plan`.
    pub fn with_plan(plan: &str) -> Self {
        let project = Self::empty();
        project.write(PLAN, plan);
        project
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.temp.path().join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.join(relative)).unwrap()
    }

    pub fn plan(&self) -> String {
        self.read(PLAN)
    }

    /// Turn the project into a git repository on `main` with one commit.
    ///
    /// Returns false when `git` is not installed.
    pub fn init_git(&self) -> bool {
        if !git_available() {
            return false;
        }
        git(self.path(), &["init", "-q"]);
        git(self.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(self.path(), &["config", "user.email", "loop@example.com"]);
        git(self.path(), &["config", "user.name", "Loop Test"]);
        git(self.path(), &["config", "commit.gpgsign", "false"]);
        git(self.path(), &["add", "-A"]);
        git(self.path(), &["commit", "-q", "-m", "initial"]);
        true
    }
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run git in `dir`, panicking on failure, and return stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Plan with one section per `(id, title)`, no metadata.
pub fn plan_of(tasks: &[(&str, &str)]) -> String {
    let mut plan = String::from("# Plan\n\n");
    for (id, title) in tasks {
        plan.push_str(&format!("### {id}. {title}\nDo {title}.\n\n"));
    }
    plan
}

/// What an agent does to claim a task: append `[DONE]` to its header in
/// the plan inside `workspace`.
pub fn mark_done_in(workspace: &Path, task_id: &str) {
    let path = workspace.join(PLAN);
    let content = std::fs::read_to_string(&path).unwrap();
    let prefix = format!("### {task_id}. ");
    let updated: Vec<String> = content
        .lines()
        .map(|line| {
            if line.starts_with(&prefix) && !line.trim_end().ends_with("[DONE]") {
                format!("{} [DONE]", line.trim_end())
            } else {
                line.to_string()
            }
        })
        .collect();
    std::fs::write(&path, updated.join("\n") + "\n").unwrap();
}
