//! Backend-independent selection, grouping and cycle detection.

use std::collections::{HashMap, HashSet};

use super::{Task, TaskStatus, DEFAULT_GROUP};

/// Open tasks sharing a `parallel_group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    pub name: String,
    /// Sorted by priority, then insertion order.
    pub tasks: Vec<Task>,
}

/// Pick the next task to run.
///
/// A task is selectable iff it is open and, when `enforce_dependencies` is
/// set, every dependency names a done task and the task is not part of a
/// dependency cycle. Among selectable tasks the lowest priority wins; ties
/// go to the earlier task in document order.
#[must_use]
pub fn select_next(tasks: &[Task], enforce_dependencies: bool) -> Option<&Task> {
    let cyclic = if enforce_dependencies {
        cyclic_ids(tasks)
    } else {
        HashSet::new()
    };
    let done = done_ids(tasks);

    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status == TaskStatus::Open)
        .filter(|(_, t)| {
            !enforce_dependencies
                || (!cyclic.contains(t.id.as_str())
                    && t.dependencies.iter().all(|d| done.contains(d.as_str())))
        })
        .min_by_key(|(index, t)| (t.priority, *index))
        .map(|(_, t)| t)
}

/// Partition open tasks by group.
///
/// Groups appear in the order their first open task appears; a blank group
/// name falls into [`DEFAULT_GROUP`].
#[must_use]
pub fn partition_groups(tasks: &[Task]) -> Vec<TaskGroup> {
    let mut groups: Vec<TaskGroup> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    let mut open: Vec<(usize, &Task)> = tasks.iter().enumerate().filter(|(_, t)| t.is_open()).collect();
    // stable: document order survives among equal priorities
    open.sort_by_key(|(index, t)| (t.priority, *index));

    let mut first_seen: Vec<String> = Vec::new();
    for task in tasks.iter().filter(|t| t.is_open()) {
        let name = group_name(task);
        if !first_seen.contains(&name) {
            first_seen.push(name);
        }
    }
    for name in first_seen {
        positions.insert(name.clone(), groups.len());
        groups.push(TaskGroup {
            name,
            tasks: Vec::new(),
        });
    }

    for (_, task) in open {
        let slot = positions[&group_name(task)];
        groups[slot].tasks.push(task.clone());
    }
    groups
}

fn group_name(task: &Task) -> String {
    let name = task.parallel_group.trim();
    if name.is_empty() {
        DEFAULT_GROUP.to_string()
    } else {
        name.to_string()
    }
}

/// Dependency cycles, each as the member ids in document order.
///
/// Self-dependencies count as cycles of one. Dependencies on unknown ids are
/// ignored here; they simply never become satisfied.
#[must_use]
pub fn detect_cycles(tasks: &[Task]) -> Vec<Vec<String>> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = tasks
        .iter()
        .map(|t| {
            t.dependencies
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut tarjan = Tarjan::new(tasks.len());
    for node in 0..tasks.len() {
        if tarjan.index[node].is_none() {
            tarjan.visit(node, &edges);
        }
    }

    tarjan
        .components
        .into_iter()
        .filter(|c| c.len() > 1 || edges[c[0]].contains(&c[0]))
        .map(|mut c| {
            c.sort_unstable();
            c.into_iter().map(|i| tasks[i].id.clone()).collect()
        })
        .collect()
}

fn cyclic_ids(tasks: &[Task]) -> HashSet<&str> {
    let cycles = detect_cycles(tasks);
    if cycles.is_empty() {
        return HashSet::new();
    }
    let members: HashSet<String> = cycles.into_iter().flatten().collect();
    tasks
        .iter()
        .filter(|t| members.contains(&t.id))
        .map(|t| t.id.as_str())
        .collect()
}

fn done_ids(tasks: &[Task]) -> HashSet<&str> {
    tasks
        .iter()
        .filter(|t| t.is_done())
        .map(|t| t.id.as_str())
        .collect()
}

/// Explain why no open task is selectable.
#[must_use]
pub fn explain_unselectable(tasks: &[Task]) -> String {
    let cyclic = cyclic_ids(tasks);
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let done = done_ids(tasks);

    let mut reasons = Vec::new();
    for task in tasks.iter().filter(|t| t.is_open()) {
        if cyclic.contains(task.id.as_str()) {
            reasons.push(format!("{} is in a dependency cycle", task.id));
            continue;
        }
        let unknown: Vec<&str> = task
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| !known.contains(d))
            .collect();
        let pending: Vec<&str> = task
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| known.contains(d) && !done.contains(d))
            .collect();
        if !unknown.is_empty() {
            reasons.push(format!("{} depends on unknown task(s) {}", task.id, unknown.join(", ")));
        }
        if !pending.is_empty() {
            reasons.push(format!("{} waits on {}", task.id, pending.join(", ")));
        }
    }

    if reasons.is_empty() {
        "no open tasks".to_string()
    } else {
        reasons.join("; ")
    }
}

/// Recursive Tarjan SCC. Recursion depth is bounded by the task count.
struct Tarjan {
    next: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            next: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize, edges: &[Vec<usize>]) {
        self.index[v] = Some(self.next);
        self.lowlink[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in &edges[v] {
            match self.index[w] {
                None => {
                    self.visit(w, edges);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
