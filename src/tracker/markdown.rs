//! Markdown plan backend.
//!
//! Parses an implementation plan where each task is a level-3 header:
//!
//! ```markdown
//! ### 2. Add the parser
//! > priority: 1
//! > group: core
//! > depends: 1
//! Free text becomes the description.
//! - [ ] parses headers
//! - [x] parses checkboxes
//! ```
//!
//! A task's completion marker is its checklist: it is done once it has at
//! least one checkbox and every box is checked, or when its header ends in
//! `[DONE]`. Blocking writes a `> blocked:` line under the header. All edits
//! are line-level so the rest of the document is preserved byte for byte.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info};

use super::{find_task, CompletionEvidence, Task, TaskStatus, Tracker, DEFAULT_GROUP, DEFAULT_PRIORITY};
use crate::atomic::write_atomic;
use crate::error::{LoopError, Result};

const DONE_SUFFIX: &str = "[DONE]";

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^###\s+([A-Za-z0-9][A-Za-z0-9_-]*)\.\s+(.+?)\s*$").expect("valid header regex")
    })
}

fn meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^>\s*(priority|group|depends|blocked|blocked_at)\s*:\s*(.*?)\s*$")
            .expect("valid meta regex")
    })
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*[-*]\s+)\[([ xX])\](\s+.+)$").expect("valid checkbox regex"))
}

/// A parsed task plus the line span it occupies.
#[derive(Debug, Clone)]
struct Section {
    task: Task,
    /// Index of the header line.
    header: usize,
    /// One past the last line of the section.
    end: usize,
}

/// Parse tasks out of plan content.
fn parse_sections(content: &str) -> Vec<Section> {
    let lines: Vec<&str> = content.lines().collect();
    let mut sections = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let Some(caps) = header_re().captures(lines[i].trim_end()) else {
            i += 1;
            continue;
        };
        let header = i;
        let id = caps[1].to_string();
        let raw_title = caps[2].trim();
        let marked_done = raw_title.ends_with(DONE_SUFFIX);
        let title = raw_title.trim_end_matches(DONE_SUFFIX).trim_end().to_string();

        let mut end = header + 1;
        while end < lines.len() && !is_section_break(lines[end]) {
            end += 1;
        }

        let mut task = Task::new(id, title);
        let mut description = Vec::new();
        let mut checked = Vec::new();
        for line in &lines[header + 1..end] {
            let trimmed = line.trim();
            if let Some(meta) = meta_re().captures(trimmed) {
                apply_meta(&mut task, &meta[1].to_lowercase(), &meta[2]);
            } else if let Some(cb) = checkbox_re().captures(line) {
                task.acceptance.push(cb[3].trim().to_string());
                checked.push(&cb[2] != " ");
            } else if !trimmed.is_empty() {
                description.push(trimmed);
            }
        }
        task.description = description.join("\n");

        let checklist_done = !checked.is_empty() && checked.iter().all(|c| *c);
        task.status = if marked_done || checklist_done {
            TaskStatus::Done
        } else if task.blocked_reason.is_some() {
            TaskStatus::Blocked
        } else {
            TaskStatus::Open
        };

        sections.push(Section { task, header, end });
        i = end;
    }
    sections
}

fn is_section_break(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=3).contains(&hashes) && trimmed[hashes..].starts_with(' ')
}

fn apply_meta(task: &mut Task, key: &str, value: &str) {
    match key {
        "priority" => task.priority = value.parse().unwrap_or(DEFAULT_PRIORITY),
        "group" => {
            task.parallel_group = if value.is_empty() {
                DEFAULT_GROUP.to_string()
            } else {
                value.to_string()
            }
        }
        "depends" => {
            task.dependencies = value
                .split([',', ' '])
                .map(|d| d.trim().trim_start_matches('#'))
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        "blocked" => task.blocked_reason = Some(value.to_string()),
        "blocked_at" => {
            task.blocked_at = DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| t.with_timezone(&Utc));
        }
        _ => {}
    }
}

/// File-based tracker over a markdown plan.
#[derive(Debug)]
pub struct MarkdownTracker {
    root: PathBuf,
    relative: PathBuf,
    tasks: Vec<Task>,
    enforce_dependencies: bool,
}

impl MarkdownTracker {
    /// Open the plan at `root/relative`.
    pub fn open(root: &Path, relative: impl Into<PathBuf>, enforce_dependencies: bool) -> Result<Self> {
        let mut tracker = Self {
            root: root.to_path_buf(),
            relative: relative.into(),
            tasks: Vec::new(),
            enforce_dependencies,
        };
        tracker.reload()?;
        Ok(tracker)
    }

    /// Absolute path of the plan in the primary tree.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relative)
    }

    /// Parse plan content without touching disk.
    #[must_use]
    pub fn parse(content: &str) -> Vec<Task> {
        parse_sections(content).into_iter().map(|s| s.task).collect()
    }

    fn read(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| LoopError::tracker(format!("cannot read {}: {e}", path.display())))
    }

    /// Read the plan, apply a line edit to one task's section, write back if
    /// anything changed, then refresh the snapshot.
    fn edit_section<F>(&mut self, id: &str, edit: F) -> Result<bool>
    where
        F: FnOnce(&Section, &mut Vec<String>) -> Result<()>,
    {
        let path = self.path();
        let content = self.read(&path)?;
        let sections = parse_sections(&content);
        let section = sections
            .iter()
            .find(|s| s.task.id == id)
            .ok_or_else(|| LoopError::tracker(format!("unknown task '{id}'")))?;

        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        edit(section, &mut lines)?;

        let updated = render(&lines, &content);
        let changed = updated != content;
        if changed {
            write_atomic(&path, updated.as_bytes())?;
        }
        self.tasks = Self::parse(&updated);
        Ok(changed)
    }
}

/// Join edited lines, keeping the original's trailing newline.
fn render(lines: &[String], original: &str) -> String {
    let mut rendered = lines.join("\n");
    if original.ends_with('\n') {
        rendered.push('\n');
    }
    rendered
}

fn is_done_in(content: &str, id: &str) -> bool {
    parse_sections(content).iter().any(|s| s.task.id == id && s.task.is_done())
}

/// Index just past the header and any metadata lines.
fn meta_end(section: &Section, lines: &[String]) -> usize {
    let mut at = section.header + 1;
    while at < section.end && meta_re().is_match(lines[at].trim()) {
        at += 1;
    }
    at
}

fn remove_blocked_lines(section: &Section, lines: &mut Vec<String>) -> usize {
    let mut removed = 0;
    let mut at = section.header + 1;
    while at < section.end - removed {
        let is_block = meta_re()
            .captures(lines[at].trim())
            .is_some_and(|c| c[1].to_lowercase().starts_with("blocked"));
        if is_block {
            lines.remove(at);
            removed += 1;
        } else {
            at += 1;
        }
    }
    removed
}

impl Tracker for MarkdownTracker {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn reload(&mut self) -> Result<()> {
        let content = self.read(&self.path())?;
        self.tasks = Self::parse(&content);
        debug!(tasks = self.tasks.len(), path = %self.path().display(), "plan parsed");
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

        self.edit_section(id, |section, lines| {
            let mut boxes = 0;
            for line in &mut lines[section.header + 1..section.end] {
                let checked = checkbox_re()
                    .captures(line)
                    .map(|caps| format!("{}[x]{}", &caps[1], &caps[3]));
                if let Some(checked) = checked {
                    boxes += 1;
                    *line = checked;
                }
            }
            if boxes == 0 {
                let header = &mut lines[section.header];
                *header = format!("{} {DONE_SUFFIX}", header.trim_end());
            }
            Ok(())
        })?;
        info!(task_id = id, "task marked done");
        Ok(())
    }

    fn block_task(&mut self, id: &str, reason: &str) -> Result<()> {
        self.reload()?;
        if find_task(&mut self.tasks, id)?.status == TaskStatus::Done {
            return Err(LoopError::tracker(format!("task '{id}' is done, not open")));
        }
        let reason = reason.replace('\n', " ");
        let now = Utc::now().to_rfc3339();
        self.edit_section(id, |section, lines| {
            let removed = remove_blocked_lines(section, lines);
            let shrunk = Section {
                end: section.end - removed,
                ..section.clone()
            };
            let at = meta_end(&shrunk, lines);
            lines.insert(at, format!("> blocked_at: {now}"));
            lines.insert(at, format!("> blocked: {reason}"));
            Ok(())
        })?;
        info!(task_id = id, reason = %reason, "task blocked");
        Ok(())
    }

    fn unblock_task(&mut self, id: &str) -> Result<()> {
        self.reload()?;
        if find_task(&mut self.tasks, id)?.status != TaskStatus::Blocked {
            return Ok(());
        }
        self.edit_section(id, |section, lines| {
            remove_blocked_lines(section, lines);
            Ok(())
        })?;
        info!(task_id = id, "task unblocked");
        Ok(())
    }

    fn completion_marked(&self, task: &Task, evidence: &CompletionEvidence<'_>) -> Result<bool> {
        let path = evidence.workspace.join(&self.relative);
        let content = self.read(&path)?;
        Ok(is_done_in(&content, &task.id))
    }

    fn marker_snapshot(&self, task: &Task, workspace: &Path) -> Result<Option<String>> {
        let content = self.read(&workspace.join(&self.relative))?;
        let lines: Vec<&str> = content.lines().collect();
        Ok(parse_sections(&content)
            .into_iter()
            .find(|s| s.task.id == task.id)
            .map(|s| lines[s.header..s.end].join("\n")))
    }

    fn restore_marker(&mut self, task: &Task, workspace: &Path, snapshot: &str) -> Result<bool> {
        if is_done_in(snapshot, &task.id) {
            return Ok(false);
        }
        let path = workspace.join(&self.relative);
        let content = self.read(&path)?;
        let sections = parse_sections(&content);
        let Some(section) = sections.iter().find(|s| s.task.id == task.id && s.task.is_done()) else {
            return Ok(false);
        };

        // Uncheck only the boxes that were not already checked, so the
        // agent's other edits to the section survive.
        let checked_before: HashSet<String> = snapshot
            .lines()
            .filter_map(|line| checkbox_re().captures(line))
            .filter(|cb| &cb[2] != " ")
            .map(|cb| cb[3].trim().to_string())
            .collect();
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let header = &mut lines[section.header];
        *header = header.trim_end().trim_end_matches(DONE_SUFFIX).trim_end().to_string();
        for line in &mut lines[section.header + 1..section.end] {
            let unchecked = checkbox_re()
                .captures(line)
                .filter(|cb| &cb[2] != " " && !checked_before.contains(cb[3].trim()))
                .map(|cb| format!("{}[ ]{}", &cb[1], &cb[3]));
            if let Some(unchecked) = unchecked {
                *line = unchecked;
            }
        }
        if is_done_in(&render(&lines, &content), &task.id) {
            // the agent removed the open boxes; fall back to the old section
            lines.splice(section.header..section.end, snapshot.split('\n').map(str::to_string));
        }

        let updated = render(&lines, &content);
        write_atomic(&path, updated.as_bytes())?;
        if path == self.path() {
            self.tasks = Self::parse(&updated);
        }
        info!(task_id = %task.id, path = %path.display(), "completion marker restored");
        Ok(true)
    }

    fn enforce_dependencies(&self) -> bool {
        self.enforce_dependencies
    }
}
