//! Prompt assembly for one attempt.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ PROMPT.md (project standing) │  optional
//! ├──────────────────────────────┤
//! │ current task                 │  id, title, description,
//! │                              │  acceptance, dependencies
//! ├──────────────────────────────┤
//! │ progress.md tail             │  optional
//! ├──────────────────────────────┤
//! │ context command output       │  optional, bounded timeout
//! ├──────────────────────────────┤
//! │ output protocol              │  EXIT_SIGNAL / CITE / TASK_COMPLETE
//! └──────────────────────────────┘
//! ```
//!
//! Every file is read from the workspace the agent will run in, so a worker
//! sees its own branch's view of the project. Missing pieces are skipped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::process::{run_command, tail_lines};
use crate::tracker::Task;

/// Builds agent prompts.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    prompt_file: PathBuf,
    progress_file: PathBuf,
    progress_tail_lines: usize,
    context_command: Vec<String>,
    context_timeout: Duration,
    /// Tracker backend name, which decides how completion is reported.
    tracker: &'static str,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(config: &ContextConfig, tracker: &'static str) -> Self {
        Self {
            prompt_file: config.prompt_file.clone(),
            progress_file: config.progress_file.clone(),
            progress_tail_lines: config.progress_tail_lines,
            context_command: config.context_command.clone(),
            context_timeout: Duration::from_secs(config.context_timeout_secs),
            tracker,
        }
    }

    /// Assemble the prompt for `task` from files in `workspace`.
    pub async fn build(&self, workspace: &Path, task: &Task) -> String {
        let mut sections = Vec::new();

        if let Some(standing) = read_optional(&workspace.join(&self.prompt_file)) {
            sections.push(standing.trim_end().to_string());
        }

        sections.push(render_task(task));

        if let Some(progress) = read_optional(&workspace.join(&self.progress_file)) {
            let tail = tail_lines(&progress, self.progress_tail_lines);
            if !tail.trim().is_empty() {
                sections.push(format!("## Recent progress\n\n{tail}"));
            }
        }

        if let Some(extra) = self.run_context_command(workspace).await {
            sections.push(format!("## Project context\n\n{}", extra.trim_end()));
        }

        sections.push(self.protocol(task));
        sections.join("\n\n") + "\n"
    }

    async fn run_context_command(&self, workspace: &Path) -> Option<String> {
        if self.context_command.is_empty() {
            return None;
        }
        match run_command(&self.context_command, workspace, None, self.context_timeout).await {
            Ok(out) if out.success() => {
                debug!(bytes = out.stdout.len(), "context command finished");
                Some(out.stdout).filter(|s| !s.trim().is_empty())
            }
            Ok(out) => {
                warn!(code = ?out.code, timed_out = out.timed_out, "context command failed, skipping");
                None
            }
            Err(e) => {
                warn!(error = %e, "context command could not start, skipping");
                None
            }
        }
    }

    fn protocol(&self, task: &Task) -> String {
        let completion = match self.tracker {
            "markdown" => format!(
                "When task {} is complete, check every box of its checklist in the plan file, \
                 or append `[DONE]` to its header if it has no checklist.",
                task.id
            ),
            "json" => format!(
                "When task {} is complete, set its \"status\" to \"done\" in the task file.",
                task.id
            ),
            _ => format!("When task {} is complete, print the line `TASK_COMPLETE: {}`.", task.id, task.id),
        };
        format!(
            "## Protocol\n\n\
             Work only on task {id}. {completion}\n\
             Cite the files and tests that show your work, one per line: `CITE: <path or test>`.\n\
             Finish your reply with `EXIT_SIGNAL: true` if the task is done, otherwise `EXIT_SIGNAL: false`.",
            id = task.id
        )
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read context file");
            None
        }
    }
}

/// Markdown rendering of a task.
#[must_use]
pub fn render_task(task: &Task) -> String {
    let mut out = format!("## Current task: {}. {}\n", task.id, task.title);
    if !task.description.is_empty() {
        out.push('\n');
        out.push_str(&task.description);
        out.push('\n');
    }
    if !task.acceptance.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for item in &task.acceptance {
            out.push_str(&format!("- [ ] {item}\n"));
        }
    }
    if !task.dependencies.is_empty() {
        out.push_str(&format!("\nBuilds on: {}\n", task.dependencies.join(", ")));
    }
    out.trim_end().to_string()
}
