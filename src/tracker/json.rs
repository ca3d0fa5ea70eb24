//! JSON task document backend.
//!
//! ```json
//! {
//!   "tasks": [
//!     {"id": "1", "title": "Setup", "priority": 1, "status": "open"},
//!     {"id": 2, "title": "Parser", "dependencies": ["1"], "passes": false}
//!   ]
//! }
//! ```
//!
//! Ids may be strings or numbers. A task is done when `status` is `"done"`
//! or `passes` is `true`. Mutations edit the raw document so fields taskloop
//! does not know about survive a rewrite.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{find_task, CompletionEvidence, Task, TaskStatus, Tracker, DEFAULT_GROUP, DEFAULT_PRIORITY};
use crate::atomic::write_atomic;
use crate::error::{LoopError, Result};

/// File-based tracker over a JSON task list.
#[derive(Debug)]
pub struct JsonTracker {
    root: PathBuf,
    relative: PathBuf,
    tasks: Vec<Task>,
    enforce_dependencies: bool,
}

fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(entry: &Map<String, Value>, key: &str) -> Option<String> {
    entry.get(key).and_then(Value::as_str).map(str::to_string)
}

fn task_from_entry(entry: &Map<String, Value>) -> Result<Task> {
    let id = entry
        .get("id")
        .and_then(id_of)
        .ok_or_else(|| LoopError::tracker("task entry is missing an id"))?;
    let title = str_field(entry, "title").unwrap_or_else(|| id.clone());

    let mut task = Task::new(id, title);
    task.description = str_field(entry, "description").unwrap_or_default();
    task.priority = entry
        .get("priority")
        .and_then(Value::as_u64)
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(DEFAULT_PRIORITY);
    task.parallel_group = str_field(entry, "parallel_group")
        .or_else(|| str_field(entry, "group"))
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GROUP.to_string());
    task.dependencies = entry
        .get("dependencies")
        .and_then(Value::as_array)
        .map(|deps| deps.iter().filter_map(id_of).collect())
        .unwrap_or_default();
    task.acceptance = entry
        .get("acceptance")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    task.blocked_reason = str_field(entry, "blocked_reason");
    task.blocked_at = str_field(entry, "blocked_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc));

    task.status = match str_field(entry, "status").as_deref() {
        _ if marks_done(entry) => TaskStatus::Done,
        Some("blocked") => TaskStatus::Blocked,
        _ if task.blocked_reason.is_some() => TaskStatus::Blocked,
        _ => TaskStatus::Open,
    };
    Ok(task)
}

/// Fields that together form a task's completion marker.
const MARKER_FIELDS: [&str; 2] = ["status", "passes"];

fn marks_done(entry: &Map<String, Value>) -> bool {
    entry.get("passes").and_then(Value::as_bool).unwrap_or(false)
        || entry.get("status").and_then(Value::as_str) == Some("done")
}

fn parse_document(content: &str) -> Result<Value> {
    let document: Value = serde_json::from_str(content)?;
    if !document.get("tasks").is_some_and(Value::is_array) {
        return Err(LoopError::tracker("task document has no \"tasks\" array"));
    }
    Ok(document)
}

fn entries_mut(document: &mut Value) -> Result<&mut Vec<Value>> {
    document
        .get_mut("tasks")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| LoopError::tracker("task document has no \"tasks\" array"))
}

impl JsonTracker {
    /// Open the document at `root/relative`.
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

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relative)
    }

    /// Parse document content without touching disk.
    pub fn parse(content: &str) -> Result<Vec<Task>> {
        let document = parse_document(content)?;
        document["tasks"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|entry| {
                entry
                    .as_object()
                    .ok_or_else(|| LoopError::tracker("task entry is not an object"))
                    .and_then(task_from_entry)
            })
            .collect()
    }

    fn read(path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| LoopError::tracker(format!("cannot read {}: {e}", path.display())))
    }

    /// Read-modify-write one entry of the primary document.
    fn edit_entry<F>(&mut self, id: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        Self::edit_entry_at(&self.path(), id, edit)?;
        self.reload()
    }

    /// Read-modify-write one entry of the document at `path`. Returns whether
    /// the file was rewritten.
    fn edit_entry_at<F>(path: &Path, id: &str, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let content = Self::read(path)?;
        let mut document = parse_document(&content)?;

        let entry = entries_mut(&mut document)?
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|e| e.get("id").and_then(id_of).as_deref() == Some(id))
            .ok_or_else(|| LoopError::tracker(format!("unknown task '{id}'")))?;
        let before = entry.clone();
        edit(&mut *entry);

        let changed = *entry != before;
        if changed {
            let mut updated = serde_json::to_string_pretty(&document)?;
            updated.push('\n');
            write_atomic(path, updated.as_bytes())?;
        }
        Ok(changed)
    }

    fn entry_in(path: &Path, id: &str) -> Result<Option<Map<String, Value>>> {
        let document = parse_document(&Self::read(path)?)?;
        Ok(document["tasks"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .find(|e| e.get("id").and_then(id_of).as_deref() == Some(id))
            .cloned())
    }
}

impl Tracker for JsonTracker {
    fn name(&self) -> &'static str {
        "json"
    }

    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn reload(&mut self) -> Result<()> {
        self.tasks = Self::parse(&Self::read(&self.path())?)?;
        debug!(tasks = self.tasks.len(), path = %self.path().display(), "task document parsed");
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
        self.edit_entry(id, |entry| {
            entry.insert("status".into(), Value::from("done"));
            if entry.contains_key("passes") {
                entry.insert("passes".into(), Value::Bool(true));
            }
        })?;
        info!(task_id = id, "task marked done");
        Ok(())
    }

    fn block_task(&mut self, id: &str, reason: &str) -> Result<()> {
        self.reload()?;
        if find_task(&mut self.tasks, id)?.is_done() {
            return Err(LoopError::tracker(format!("task '{id}' is done, not open")));
        }
        let now = Utc::now().to_rfc3339();
        self.edit_entry(id, |entry| {
            entry.insert("status".into(), Value::from("blocked"));
            entry.insert("blocked_reason".into(), Value::from(reason));
            entry.insert("blocked_at".into(), Value::from(now));
        })?;
        info!(task_id = id, reason, "task blocked");
        Ok(())
    }

    fn unblock_task(&mut self, id: &str) -> Result<()> {
        self.reload()?;
        if !find_task(&mut self.tasks, id)?.is_blocked() {
            return Ok(());
        }
        self.edit_entry(id, |entry| {
            entry.insert("status".into(), Value::from("open"));
            entry.remove("blocked_reason");
            entry.remove("blocked_at");
        })?;
        info!(task_id = id, "task unblocked");
        Ok(())
    }

    fn completion_marked(&self, task: &Task, evidence: &CompletionEvidence<'_>) -> Result<bool> {
        let content = Self::read(&evidence.workspace.join(&self.relative))?;
        Ok(Self::parse(&content)?
            .iter()
            .any(|t| t.id == task.id && t.is_done()))
    }

    fn marker_snapshot(&self, task: &Task, workspace: &Path) -> Result<Option<String>> {
        let Some(entry) = Self::entry_in(&workspace.join(&self.relative), &task.id)? else {
            return Ok(None);
        };
        let marker: Map<String, Value> = MARKER_FIELDS
            .iter()
            .map(|key| ((*key).to_string(), entry.get(*key).cloned().unwrap_or(Value::Null)))
            .collect();
        Ok(Some(Value::Object(marker).to_string()))
    }

    fn restore_marker(&mut self, task: &Task, workspace: &Path, snapshot: &str) -> Result<bool> {
        let Value::Object(marker) = serde_json::from_str::<Value>(snapshot)? else {
            return Err(LoopError::tracker("completion marker snapshot is not an object"));
        };
        let path = workspace.join(&self.relative);
        let done_now = Self::entry_in(&path, &task.id)?.is_some_and(|e| marks_done(&e));
        if marks_done(&marker) || !done_now {
            return Ok(false);
        }
        let changed = Self::edit_entry_at(&path, &task.id, |entry| {
            for key in MARKER_FIELDS {
                match marker.get(key) {
                    Some(Value::Null) | None => entry.remove(key),
                    Some(value) => entry.insert(key.to_string(), value.clone()),
                };
            }
        })?;
        if path == self.path() {
            self.reload()?;
        }
        info!(task_id = %task.id, path = %path.display(), "completion marker restored");
        Ok(changed)
    }

    fn enforce_dependencies(&self) -> bool {
        self.enforce_dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOC: &str = r#"{
  "project": "demo",
  "tasks": [
    {"id": "1", "title": "Setup", "priority": 2, "status": "done"},
    {"id": 2, "title": "Parser", "dependencies": [1], "passes": false, "notes": "keep me"},
    {"id": "3", "title": "Docs", "group": "docs", "acceptance": ["README updated"]}
  ]
}"#;

    fn doc_file(content: &str) -> (TempDir, JsonTracker) {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("tasks.json"), content).unwrap();
        let tracker = JsonTracker::open(temp.path(), "tasks.json", true).unwrap();
        (temp, tracker)
    }

    #[test]
    fn test_parse_document() {
        let tasks = JsonTracker::parse(DOC).unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks[0].is_done());
        assert_eq!(tasks[0].priority, 2);
        assert_eq!(tasks[1].id, "2");
        assert_eq!(tasks[1].dependencies, vec!["1"]);
        assert!(tasks[1].is_open());
        assert_eq!(tasks[2].parallel_group, "docs");
        assert_eq!(tasks[2].acceptance, vec!["README updated"]);
        assert_eq!(tasks[2].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_passes_flag_means_done() {
        let tasks = JsonTracker::parse(r#"{"tasks":[{"id":"a","passes":true}]}"#).unwrap();
        assert!(tasks[0].is_done());
        assert_eq!(tasks[0].title, "a");
    }

    #[test]
    fn test_missing_tasks_array_is_error() {
        assert!(JsonTracker::parse(r#"{"items":[]}"#).is_err());
        assert!(JsonTracker::parse(r#"{"tasks":[{"title":"no id"}]}"#).is_err());
    }

    #[test]
    fn test_mark_done_preserves_unknown_fields() {
        let (temp, mut tracker) = doc_file(DOC);
        tracker.mark_done("2").unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(temp.path().join("tasks.json")).unwrap()).unwrap();
        assert_eq!(raw["project"], "demo");
        assert_eq!(raw["tasks"][1]["notes"], "keep me");
        assert_eq!(raw["tasks"][1]["passes"], true);
        assert_eq!(raw["tasks"][1]["id"], 2);
        assert!(tracker.get_task("2").unwrap().is_done());
    }

    #[test]
    fn test_mark_done_already_done_does_not_rewrite() {
        let (temp, mut tracker) = doc_file(DOC);
        tracker.mark_done("1").unwrap();
        assert_eq!(std::fs::read_to_string(temp.path().join("tasks.json")).unwrap(), DOC);
    }

    #[test]
    fn test_block_then_unblock() {
        let (_temp, mut tracker) = doc_file(DOC);
        tracker.block_task("3", "3 failed attempts").unwrap();
        let task = tracker.get_task("3").unwrap();
        assert!(task.is_blocked());
        assert_eq!(task.blocked_reason.as_deref(), Some("3 failed attempts"));
        assert!(task.blocked_at.is_some());
        assert!(tracker.mark_done("3").is_err());

        tracker.unblock_task("3").unwrap();
        let task = tracker.get_task("3").unwrap();
        assert!(task.is_open());
        assert!(task.blocked_reason.is_none());
    }

    #[test]
    fn test_block_done_task_rejected() {
        let (_temp, mut tracker) = doc_file(DOC);
        assert!(tracker.block_task("1", "nope").is_err());
    }

    #[test]
    fn test_restore_marker_reverts_status_and_passes() {
        let (temp, mut tracker) = doc_file(DOC);
        let task = tracker.get_task("2").unwrap().clone();
        let snapshot = tracker.marker_snapshot(&task, temp.path()).unwrap().unwrap();
        tracker.mark_done("2").unwrap();
        assert!(tracker.get_task("2").unwrap().is_done());

        assert!(tracker.restore_marker(&task, temp.path(), &snapshot).unwrap());
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(temp.path().join("tasks.json")).unwrap()).unwrap();
        assert_eq!(raw["tasks"][1]["passes"], false);
        assert!(raw["tasks"][1].get("status").is_none());
        assert_eq!(raw["tasks"][1]["notes"], "keep me");
        assert!(tracker.get_task("2").unwrap().is_open());
    }

    #[test]
    fn test_restore_marker_ignores_task_done_before_attempt() {
        let (temp, mut tracker) = doc_file(DOC);
        let task = tracker.get_task("1").unwrap().clone();
        let snapshot = tracker.marker_snapshot(&task, temp.path()).unwrap().unwrap();
        assert!(!tracker.restore_marker(&task, temp.path(), &snapshot).unwrap());
        assert_eq!(std::fs::read_to_string(temp.path().join("tasks.json")).unwrap(), DOC);
    }

    #[test]
    fn test_completion_marked_in_workspace() {
        let (_temp, tracker) = doc_file(DOC);
        let workspace = TempDir::new().unwrap();
        std::fs::write(
            workspace.path().join("tasks.json"),
            DOC.replace(r#""passes": false"#, r#""passes": true"#),
        )
        .unwrap();
        let task = tracker.get_task("2").unwrap().clone();
        let evidence = CompletionEvidence {
            workspace: workspace.path(),
            agent_output: "",
        };
        assert!(tracker.completion_marked(&task, &evidence).unwrap());
    }
}
