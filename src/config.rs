//! Configuration management for taskloop.
//!
//! Configuration is read from `taskloop.toml` in the project root, falling
//! back to the user-level `taskloop/config.toml` under the platform config
//! directory, falling back to defaults. Every field has a serde default, so a
//! partial file is always valid TOML for this schema.
//!
//! # Example taskloop.toml
//!
//! ```toml
//! [agent]
//! argv = ["claude", "-p", "--dangerously-skip-permissions"]
//! timeout_secs = 900
//!
//! [tracker]
//! backend = "markdown"
//! path = "IMPLEMENTATION_PLAN.md"
//!
//! [gates]
//! commands = [["cargo", "test"], ["cargo", "clippy", "--", "-D", "warnings"]]
//!
//! [review]
//! argv = ["claude", "-p"]
//!
//! [parallel]
//! max_workers = 3
//! strategy = "group"
//! merge_policy = "auto_merge"
//! ```

pub mod validation;

pub use validation::{ConfigValidator, ValidationReport};

use crate::error::{LoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project-level configuration file name.
pub const CONFIG_FILE: &str = "taskloop.toml";

/// How the prompt reaches the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Written to the child's standard input, which is then closed.
    #[default]
    Stdin,
    /// Appended as the final argv element.
    Argument,
}

/// Agent invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Display name recorded on every attempt.
    pub name: String,
    /// Command line; the first element is the program.
    pub argv: Vec<String>,
    pub prompt_mode: PromptMode,
    /// Hard wall-clock limit per invocation.
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "claude".to_string(),
            argv: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            prompt_mode: PromptMode::Stdin,
            timeout_secs: 900,
        }
    }
}

/// Which task storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerBackend {
    /// Markdown plan file.
    #[default]
    Markdown,
    /// JSON task document.
    Json,
    /// GitHub issues through the `gh` CLI.
    Github,
}

impl std::fmt::Display for TrackerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerBackend::Markdown => write!(f, "markdown"),
            TrackerBackend::Json => write!(f, "json"),
            TrackerBackend::Github => write!(f, "github"),
        }
    }
}

/// Task tracker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub backend: TrackerBackend,
    /// Document path relative to the project root (file backends).
    pub path: Option<PathBuf>,
    /// Issue label that marks tracked issues (github backend).
    pub label: String,
    /// `owner/name`; defaults to the repository `gh` infers.
    pub repo: Option<String>,
    /// When false, dependencies are ignored during selection.
    pub enforce_dependencies: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend: TrackerBackend::Markdown,
            path: None,
            label: "taskloop".to_string(),
            repo: None,
            enforce_dependencies: true,
        }
    }
}

impl TrackerConfig {
    /// Resolve the backing document path for file-based backends.
    #[must_use]
    pub fn document_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, TrackerBackend::Json) => PathBuf::from("tasks.json"),
            (None, _) => PathBuf::from("IMPLEMENTATION_PLAN.md"),
        }
    }
}

/// Validation gate commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    /// Ordered argv lists; each must exit zero.
    pub commands: Vec<Vec<String>>,
    /// Stop at the first failing gate.
    pub fail_fast: bool,
    pub timeout_secs: u64,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            fail_fast: true,
            timeout_secs: 600,
        }
    }
}

/// Optional review gate. Disabled while `argv` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub argv: Vec<String>,
    /// Exact token the review output must end with.
    pub ship_token: String,
    pub timeout_secs: u64,
    /// Diff bytes passed to the reviewer before truncation.
    pub max_diff_bytes: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            ship_token: "SHIP".to_string(),
            timeout_secs: 600,
            max_diff_bytes: 200_000,
        }
    }
}

impl ReviewConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.argv.is_empty()
    }
}

/// Sequential loop limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopLimits {
    /// Invocations allowed per `run`.
    pub max_iterations: u32,
    /// Consecutive no-progress iterations before exiting.
    pub no_progress_limit: u32,
    /// Consecutive failed attempts before a task is blocked.
    pub max_attempts: u32,
    /// Agent invocations per rolling hour; 0 disables the limit.
    pub max_calls_per_hour: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            no_progress_limit: 5,
            max_attempts: 3,
            max_calls_per_hour: 0,
        }
    }
}

/// Dispatch strategy for parallel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One FIFO queue across all groups.
    #[default]
    Queue,
    /// Groups in order with a barrier between them.
    Group,
}

/// What happens to a successful worker's branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Leave the branch for human review.
    #[default]
    Manual,
    /// Merge into the base branch, aborting on conflict.
    AutoMerge,
}

/// Parallel executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_workers: usize,
    pub strategy: Strategy,
    pub merge_policy: MergePolicy,
    pub branch_prefix: String,
    /// Defaults to `<state_dir>/workspaces`.
    pub workspace_root: Option<PathBuf>,
    /// Defaults to the branch checked out in the primary tree.
    pub base_branch: Option<String>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            strategy: Strategy::Queue,
            merge_policy: MergePolicy::Manual,
            branch_prefix: "taskloop".to_string(),
            workspace_root: None,
            base_branch: None,
        }
    }
}

/// Prompt context sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Instructions prepended to every prompt, if the file exists.
    pub prompt_file: PathBuf,
    /// Running notes the agent keeps; its tail is included.
    pub progress_file: PathBuf,
    pub progress_tail_lines: usize,
    /// Optional external context-pack generator.
    pub context_command: Vec<String>,
    pub context_timeout_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            prompt_file: PathBuf::from("PROMPT.md"),
            progress_file: PathBuf::from("progress.md"),
            progress_tail_lines: 60,
            context_command: Vec::new(),
            context_timeout_secs: 60,
        }
    }
}

/// Full taskloop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// State directory relative to the project root.
    pub state_dir: PathBuf,
    pub agent: AgentConfig,
    pub tracker: TrackerConfig,
    pub gates: GatesConfig,
    pub review: ReviewConfig,
    #[serde(rename = "loop")]
    pub limits: LoopLimits,
    pub parallel: ParallelConfig,
    pub context: ContextConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".taskloop"),
            agent: AgentConfig::default(),
            tracker: TrackerConfig::default(),
            gates: GatesConfig::default(),
            review: ReviewConfig::default(),
            limits: LoopLimits::default(),
            parallel: ParallelConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Load configuration for a project directory.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(project_dir: &Path) -> Result<Self> {
        match Self::locate(project_dir) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse a specific configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoopError::config_with_path(format!("cannot read: {e}"), path.to_path_buf())
        })?;
        toml::from_str(&content)
            .map_err(|e| LoopError::config_with_path(e.to_string(), path.to_path_buf()))
    }

    /// Find the configuration file that applies to a project, if any.
    #[must_use]
    pub fn locate(project_dir: &Path) -> Option<PathBuf> {
        let project = project_dir.join(CONFIG_FILE);
        if project.exists() {
            return Some(project);
        }
        Self::user_config_path().filter(|p| p.exists())
    }

    /// User-level configuration path.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("taskloop").join("config.toml"))
    }

    /// Absolute state directory for a project.
    #[must_use]
    pub fn state_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.state_dir)
    }

    /// Absolute workspace root for parallel workers.
    #[must_use]
    pub fn workspace_root(&self, project_dir: &Path) -> PathBuf {
        match &self.parallel.workspace_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_dir.join(root),
            None => self.state_path(project_dir).join("workspaces"),
        }
    }

    /// Render as TOML, used by `taskloop validate --print`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| LoopError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.state_dir, PathBuf::from(".taskloop"));
        assert_eq!(config.review.ship_token, "SHIP");
        assert!(!config.review.is_enabled());
        assert_eq!(config.limits.max_attempts, 3);
        assert_eq!(config.parallel.merge_policy, MergePolicy::Manual);
        assert!(config.tracker.enforce_dependencies);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: LoopConfig = toml::from_str(
            r#"
            [loop]
            max_iterations = 7

            [parallel]
            strategy = "group"
            merge_policy = "auto_merge"
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.max_iterations, 7);
        assert_eq!(config.limits.no_progress_limit, 5);
        assert_eq!(config.parallel.strategy, Strategy::Group);
        assert_eq!(config.parallel.merge_policy, MergePolicy::AutoMerge);
        assert_eq!(config.agent, AgentConfig::default());
    }

    #[test]
    fn test_load_missing_returns_default() {
        let temp = TempDir::new().unwrap();
        let config = LoopConfig::from_file(&temp.path().join(CONFIG_FILE));
        assert!(config.is_err());

        std::fs::write(temp.path().join(CONFIG_FILE), "").unwrap();
        let config = LoopConfig::load(temp.path()).unwrap();
        assert_eq!(config, LoopConfig::default());
    }

    #[test]
    fn test_load_malformed_is_config_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE), "[agent\nargv = ").unwrap();

        let err = LoopConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, LoopError::Config { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_ERROR);
    }

    #[test]
    fn test_document_path_defaults() {
        let mut tracker = TrackerConfig::default();
        assert_eq!(
            tracker.document_path(),
            PathBuf::from("IMPLEMENTATION_PLAN.md")
        );
        tracker.backend = TrackerBackend::Json;
        assert_eq!(tracker.document_path(), PathBuf::from("tasks.json"));
        tracker.path = Some(PathBuf::from("prd.json"));
        assert_eq!(tracker.document_path(), PathBuf::from("prd.json"));
    }

    #[test]
    fn test_workspace_root_resolution() {
        let project = Path::new("/repo");
        let mut config = LoopConfig::default();
        assert_eq!(
            config.workspace_root(project),
            PathBuf::from("/repo/.taskloop/workspaces")
        );
        config.parallel.workspace_root = Some(PathBuf::from("../wt"));
        assert_eq!(config.workspace_root(project), PathBuf::from("/repo/../wt"));
        config.parallel.workspace_root = Some(PathBuf::from("/tmp/wt"));
        assert_eq!(config.workspace_root(project), PathBuf::from("/tmp/wt"));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = LoopConfig::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[loop]"));
        let parsed: LoopConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
