//! Git operations.
//!
//! Everything taskloop asks of git goes through the [`Git`] trait so the
//! drivers can be tested with [`MockGit`](crate::testing::MockGit) instead of
//! real repositories. [`RealGit`] shells out to the `git` binary.
//!
//! The fingerprint is how an attempt detects that it changed the repository:
//! a hash over HEAD, the diff of tracked files against HEAD, and the content
//! of untracked files. Paths under the state directory are excluded so that
//! receipts and state writes never count as progress.

use std::path::Path;
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{LoopError, Result};

/// Raw output of one git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Result of merging a worker branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge was aborted; the listed files conflicted.
    Conflict(Vec<String>),
}

/// Git operations used by the iteration engine and workspace manager.
pub trait Git: Send + Sync {
    /// Commit id of HEAD, `None` in a repository without commits.
    fn head(&self, dir: &Path) -> Result<Option<String>>;

    fn current_branch(&self, dir: &Path) -> Result<String>;

    /// Content fingerprint of the working tree, ignoring `exclude` paths.
    fn fingerprint(&self, dir: &Path, exclude: &[&Path]) -> Result<String>;

    /// Diff of the working tree against `since` (HEAD when `None`), with
    /// untracked files listed at the end.
    fn diff(&self, dir: &Path, since: Option<&str>) -> Result<String>;

    /// Paths changed relative to `since` plus untracked files.
    fn changed_files(&self, dir: &Path, since: Option<&str>) -> Result<Vec<String>>;

    /// Stage everything and commit. Returns false when there was nothing to
    /// commit.
    fn commit_all(&self, dir: &Path, message: &str) -> Result<bool>;

    /// `git worktree add -b <branch> <path> <base>`
    fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()>;

    fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()>;

    /// Merge `branch` into the current branch of `repo` with `--no-ff`,
    /// aborting on conflict.
    fn merge(&self, repo: &Path, branch: &str, message: &str) -> Result<MergeOutcome>;

    fn branch_exists(&self, repo: &Path, branch: &str) -> bool;

    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()>;
}

/// [`Git`] backed by the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealGit;

impl RealGit {
    fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| LoopError::git(args.first().copied().unwrap_or("git"), e.to_string()))?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and require success.
    fn check(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.run(dir, args)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(LoopError::git(args.join(" "), output.stderr.trim().to_string()))
        }
    }

    fn untracked(&self, dir: &Path, pathspec: &[String]) -> Result<Vec<String>> {
        let mut args = vec!["ls-files", "--others", "--exclude-standard", "-z", "--"];
        args.extend(pathspec.iter().map(String::as_str));
        Ok(self
            .check(dir, &args)?
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// `.` followed by one `:(exclude)` entry per excluded path.
fn pathspec(dir: &Path, exclude: &[&Path]) -> Vec<String> {
    let mut spec = vec![".".to_string()];
    for &path in exclude {
        let relative = path.strip_prefix(dir).unwrap_or(path);
        if relative.as_os_str().is_empty() || relative.is_absolute() {
            continue;
        }
        spec.push(format!(":(exclude){}", relative.display()));
    }
    spec
}

impl Git for RealGit {
    fn head(&self, dir: &Path) -> Result<Option<String>> {
        let output = self.run(dir, &["rev-parse", "--verify", "--quiet", "HEAD"])?;
        Ok(output.success.then(|| output.stdout.trim().to_string()))
    }

    fn current_branch(&self, dir: &Path) -> Result<String> {
        Ok(self
            .check(dir, &["symbolic-ref", "--short", "HEAD"])?
            .trim()
            .to_string())
    }

    fn fingerprint(&self, dir: &Path, exclude: &[&Path]) -> Result<String> {
        let spec = pathspec(dir, exclude);
        let head = self.head(dir)?;

        let mut hasher = Sha256::new();
        hasher.update(head.as_deref().unwrap_or("unborn").as_bytes());

        let mut diff_args = vec!["diff", "--no-color", "--binary"];
        if let Some(head) = head.as_deref() {
            diff_args.push(head);
        }
        diff_args.push("--");
        diff_args.extend(spec.iter().map(String::as_str));
        hasher.update(self.check(dir, &diff_args)?.as_bytes());

        for path in self.untracked(dir, &spec)? {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            match std::fs::read(dir.join(&path)) {
                Ok(bytes) => hasher.update(&bytes),
                Err(e) => debug!(path = %path, error = %e, "untracked file unreadable"),
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn diff(&self, dir: &Path, since: Option<&str>) -> Result<String> {
        let head = match since {
            Some(rev) => Some(rev.to_string()),
            None => self.head(dir)?,
        };
        let mut args = vec!["diff", "--no-color"];
        if let Some(rev) = head.as_deref() {
            args.push(rev);
        }
        let mut diff = self.check(dir, &args)?;

        let untracked = self.untracked(dir, &[".".to_string()])?;
        if !untracked.is_empty() {
            diff.push_str("\n# untracked files\n");
            for path in untracked {
                diff.push_str(&format!("+++ {path}\n"));
            }
        }
        Ok(diff)
    }

    fn changed_files(&self, dir: &Path, since: Option<&str>) -> Result<Vec<String>> {
        let head = match since {
            Some(rev) => Some(rev.to_string()),
            None => self.head(dir)?,
        };
        let mut args = vec!["diff", "--name-only"];
        if let Some(rev) = head.as_deref() {
            args.push(rev);
        }
        let mut files: Vec<String> = self
            .check(dir, &args)?
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        for path in self.untracked(dir, &[".".to_string()])? {
            if !files.contains(&path) {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn commit_all(&self, dir: &Path, message: &str) -> Result<bool> {
        self.check(dir, &["add", "-A"])?;
        let staged = self.run(dir, &["diff", "--cached", "--quiet"])?;
        if staged.success {
            return Ok(false);
        }
        self.check(dir, &["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.check(repo, &["worktree", "add", "-b", branch, &*path, base])?;
        info!(branch, path = %path, base, "worktree added");
        Ok(())
    }

    fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.check(repo, &["worktree", "remove", "--force", &*path])?;
        debug!(path = %path, "worktree removed");
        Ok(())
    }

    fn merge(&self, repo: &Path, branch: &str, message: &str) -> Result<MergeOutcome> {
        let output = self.run(repo, &["merge", "--no-ff", "--no-edit", "-m", message, branch])?;
        if output.success {
            info!(branch, "branch merged");
            return Ok(MergeOutcome::Merged);
        }

        let conflicts: Vec<String> = self
            .run(repo, &["diff", "--name-only", "--diff-filter=U"])
            .map(|o| {
                o.stdout
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if conflicts.is_empty() {
            // not a content conflict: refused before touching the tree
            let _ = self.run(repo, &["merge", "--abort"]);
            return Err(LoopError::git("merge", output.stderr.trim().to_string()));
        }

        let abort = self.run(repo, &["merge", "--abort"])?;
        if !abort.success {
            warn!(branch, stderr = %abort.stderr.trim(), "merge --abort failed");
        }
        warn!(branch, conflicts = ?conflicts, "merge conflict, aborted");
        Ok(MergeOutcome::Conflict(conflicts))
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        self.run(repo, &["show-ref", "--verify", "--quiet", &reference])
            .is_ok_and(|o| o.success)
    }

    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.check(repo, &["branch", "-D", branch]).map(drop)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Initialise a repository with one commit on `main`.
    pub(crate) fn init_repo(dir: &Path) {
        let git = RealGit;
        git.check(dir, &["init", "-q"]).unwrap();
        git.check(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]).unwrap();
        git.check(dir, &["config", "user.email", "loop@example.com"]).unwrap();
        git.check(dir, &["config", "user.name", "taskloop"]).unwrap();
        git.check(dir, &["config", "commit.gpgsign", "false"]).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        assert!(git.commit_all(dir, "initial").unwrap());
    }

    #[test]
    fn test_fingerprint_tracks_changes_but_not_excluded() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        let git = RealGit;
        let state = temp.path().join(".taskloop");
        std::fs::create_dir_all(&state).unwrap();

        let before = git.fingerprint(temp.path(), &[state.as_path()]).unwrap();
        std::fs::write(state.join("state.json"), "{}").unwrap();
        assert_eq!(git.fingerprint(temp.path(), &[state.as_path()]).unwrap(), before);

        std::fs::write(temp.path().join("new.txt"), "a").unwrap();
        let with_new = git.fingerprint(temp.path(), &[state.as_path()]).unwrap();
        assert_ne!(with_new, before);

        std::fs::write(temp.path().join("new.txt"), "b").unwrap();
        assert_ne!(git.fingerprint(temp.path(), &[state.as_path()]).unwrap(), with_new);
    }

    #[test]
    fn test_commit_all_and_changed_files() {
        let temp = TempDir::new().unwrap();
        init_repo(temp.path());
        let git = RealGit;
        let start = git.head(temp.path()).unwrap().unwrap();

        assert!(!git.commit_all(temp.path(), "nothing").unwrap());
        std::fs::write(temp.path().join("README.md"), "changed\n").unwrap();
        std::fs::write(temp.path().join("extra.txt"), "x").unwrap();
        let mut changed = git.changed_files(temp.path(), Some(&start)).unwrap();
        changed.sort();
        assert_eq!(changed, vec!["README.md", "extra.txt"]);

        assert!(git.commit_all(temp.path(), "work").unwrap());
        assert_ne!(git.head(temp.path()).unwrap().unwrap(), start);
        assert!(git.diff(temp.path(), Some(&start)).unwrap().contains("+changed"));
    }

    #[test]
    fn test_worktree_merge_and_conflict() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        let git = RealGit;

        let ws = temp.path().join("ws");
        git.worktree_add(&repo, &ws, "taskloop/w1", "main").unwrap();
        assert!(git.branch_exists(&repo, "taskloop/w1"));
        std::fs::write(ws.join("README.md"), "from worker\n").unwrap();
        git.commit_all(&ws, "worker").unwrap();

        std::fs::write(repo.join("README.md"), "from main\n").unwrap();
        git.commit_all(&repo, "main").unwrap();
        let main_head = git.head(&repo).unwrap();

        let outcome = git.merge(&repo, "taskloop/w1", "merge w1").unwrap();
        assert_eq!(outcome, MergeOutcome::Conflict(vec!["README.md".to_string()]));
        assert_eq!(git.head(&repo).unwrap(), main_head);
        assert_eq!(std::fs::read_to_string(repo.join("README.md")).unwrap(), "from main\n");

        git.worktree_remove(&repo, &ws).unwrap();
        assert!(!ws.exists());
        git.delete_branch(&repo, "taskloop/w1").unwrap();
        assert!(!git.branch_exists(&repo, "taskloop/w1"));
    }
}
