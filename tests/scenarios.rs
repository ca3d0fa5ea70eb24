//! End-to-end loop scenarios over real trackers with a scripted agent.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::{git, mark_done_in, plan_of, TestProject, PLAN};
use taskloop::config::{MergePolicy, Strategy};
use taskloop::testing::{MockAgent, MockGit, MockReply};
use taskloop::tracker::{JsonTracker, MarkdownTracker};
use taskloop::{LoopConfig, LoopDependencies, LoopExit, LoopHandle, Orchestrator, Tracker, WorkerStatus};

fn markdown(project: &TestProject) -> Box<dyn Tracker> {
    Box::new(MarkdownTracker::open(project.path(), PLAN, true).unwrap())
}

fn orchestrator(
    project: &TestProject,
    config: LoopConfig,
    agent: &Arc<MockAgent>,
    git: Arc<dyn taskloop::git::Git>,
    tracker: Box<dyn Tracker>,
) -> Orchestrator {
    let deps = LoopDependencies {
        agent: Arc::clone(agent) as Arc<dyn taskloop::agent::AgentRunner>,
        reviewer: None,
        git,
        tracker,
    };
    Orchestrator::new(config, project.path(), deps).unwrap()
}

/// Agent that claims every task it is handed.
fn finisher() -> Arc<MockAgent> {
    Arc::new(MockAgent::new("mock", |req| {
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("implemented\nEXIT_SIGNAL: true")
    }))
}

// ============================================================================
// Sequential loop
// ============================================================================

#[tokio::test]
async fn test_three_open_tasks_complete_in_three_attempts() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One"), ("2", "Two"), ("3", "Three")]));
    let mut config = LoopConfig::default();
    config.limits.max_iterations = 10;
    let agent = finisher();
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));

    let summary = orc.run(None).await.unwrap();

    assert_eq!(summary.exit, LoopExit::Complete);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.attempts, 3);
    assert_eq!(summary.completed, vec!["1", "2", "3"]);
    assert_eq!(agent.task_ids(), vec!["1", "2", "3"]);

    let status = orc.status().await.unwrap();
    assert_eq!(status.history_len, 3);
    assert_eq!(status.counts.done, 3);
    assert!(status.next_task.is_none());
    assert_eq!(project.plan().matches("[DONE]").count(), 3);
}

#[tokio::test]
async fn test_all_blocked_exits_without_attempts() {
    let plan = "\
### 1. One
> blocked: waiting on design

### 2. Two
> blocked: waiting on design

### 3. Three
> blocked: waiting on design
";
    let project = TestProject::with_plan(plan);
    let agent = finisher();
    let orc = orchestrator(
        &project,
        LoopConfig::default(),
        &agent,
        Arc::new(MockGit::new()),
        markdown(&project),
    );

    let summary = orc.run(None).await.unwrap();

    assert_eq!(summary.exit, LoopExit::AllBlocked);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.attempts, 0);
    assert_eq!(agent.call_count(), 0);
    assert_eq!(orc.status().await.unwrap().history_len, 0);
}

#[tokio::test]
async fn test_repeated_gate_failure_blocks_task_and_moves_on() {
    let project = TestProject::with_plan(&plan_of(&[("1", "Flaky"), ("2", "Solid")]));
    let mut config = LoopConfig::default();
    config.limits.max_attempts = 3;
    config.gates.commands = vec![vec!["sh".into(), "-c".into(), "test -f gate-ok".into()]];

    let agent = Arc::new(MockAgent::new("mock", |req| {
        if req.task_id == "2" {
            std::fs::write(req.workspace.join("gate-ok"), "ok").unwrap();
            mark_done_in(&req.workspace, "2");
        }
        MockReply::output("EXIT_SIGNAL: true")
    }));
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));

    let summary = orc.run(None).await.unwrap();

    assert_eq!(agent.task_ids(), vec!["1", "1", "1", "2"]);
    assert_eq!(summary.blocked, vec!["1"]);
    assert_eq!(summary.completed, vec!["2"]);
    assert_eq!(summary.exit, LoopExit::AllBlocked);
    assert_eq!(summary.exit_code(), 1);

    let status = orc.status().await.unwrap();
    let reason = &status.blocked_tasks["1"];
    assert!(reason.contains("attempts"), "{reason}");
    assert!(reason.to_lowercase().contains("gate"), "{reason}");
    assert!(project.plan().contains("> blocked: 3 consecutive failed attempts"));
}

#[tokio::test]
async fn test_self_marked_task_stays_open_when_gate_fails() {
    let project = TestProject::with_plan(&plan_of(&[("1", "Eager")]));
    let mut config = LoopConfig::default();
    config.limits.max_attempts = 2;
    config.limits.no_progress_limit = 10;
    config.gates.commands = vec![vec!["false".into()]];

    let agent = finisher();
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));

    let summary = orc.run(None).await.unwrap();

    assert_ne!(summary.exit, LoopExit::Complete);
    assert_ne!(summary.exit_code(), 0);
    assert_eq!(summary.exit, LoopExit::AllBlocked);
    assert_eq!(summary.attempts, 2);
    assert!(summary.completed.is_empty());
    assert_eq!(summary.blocked, vec!["1"]);
    assert_eq!(agent.task_ids(), vec!["1", "1"]);

    let plan = project.plan();
    assert!(!plan.contains("[DONE]"), "{plan}");
    assert!(plan.contains("> blocked: 2 consecutive failed attempts"), "{plan}");

    let status = orc.status().await.unwrap();
    assert_eq!(status.counts.done, 0);
    assert_eq!(status.counts.blocked, 1);
    let last = status.last_attempt.unwrap();
    assert!(!last.completed);
    assert!(last.failure.unwrap().contains("Gate 'false' failed"));
}

#[tokio::test]
async fn test_state_survives_a_new_orchestrator() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One"), ("2", "Two")]));
    let agent = finisher();

    let first = orchestrator(
        &project,
        LoopConfig::default(),
        &agent,
        Arc::new(MockGit::new()),
        markdown(&project),
    );
    let summary = first.run(Some(1)).await.unwrap();
    assert_eq!(summary.exit, LoopExit::MaxIterations);
    drop(first);

    let second = orchestrator(
        &project,
        LoopConfig::default(),
        &agent,
        Arc::new(MockGit::new()),
        markdown(&project),
    );
    let summary = second.run(None).await.unwrap();
    assert_eq!(summary.exit, LoopExit::Complete);
    assert_eq!(summary.attempts, 1);

    let status = second.status().await.unwrap();
    assert_eq!(status.invocation_count, 2);
    assert_eq!(status.history_len, 2);
    assert_eq!(status.last_attempt.unwrap().task_id, "2");
}

#[tokio::test]
async fn test_crashing_agent_trips_no_progress_limit() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One")]));
    let mut config = LoopConfig::default();
    config.limits.no_progress_limit = 2;
    config.limits.max_attempts = 10;
    let agent = Arc::new(MockAgent::new("mock", |_| MockReply::output("panic").with_code(101)));
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));

    let summary = orc.run(None).await.unwrap();

    assert_eq!(summary.exit, LoopExit::NoProgress);
    assert_eq!(summary.attempts, 2);
    assert!(summary.completed.is_empty());

    let status = orc.status().await.unwrap();
    let last = status.last_attempt.unwrap();
    assert!(last.failure.unwrap().contains("101"));
    assert!(!last.gates_ok);
    assert!(last.receipt.unwrap().exists());
}

#[tokio::test]
async fn test_json_tracker_blocks_and_unblocks() {
    let project = TestProject::empty();
    project.write(
        "tasks.json",
        r#"{"tasks": [{"id": "a", "title": "Alpha", "status": "open"}]}"#,
    );
    let mut config = LoopConfig::default();
    config.limits.max_attempts = 1;
    let agent = Arc::new(MockAgent::new("mock", |_| MockReply::timeout()));
    let tracker = Box::new(JsonTracker::open(project.path(), "tasks.json", true).unwrap());
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), tracker);

    let summary = orc.run(None).await.unwrap();
    assert_eq!(summary.exit, LoopExit::AllBlocked);
    assert!(project.read("tasks.json").contains("\"blocked_reason\""));

    orc.unblock("a").await.unwrap();
    let status = orc.status().await.unwrap();
    assert_eq!(status.counts.open, 1);
    assert!(status.blocked_tasks.is_empty());
    assert_eq!(status.next_task.unwrap().id, "a");
}

// ============================================================================
// Parallel executor
// ============================================================================

#[tokio::test]
async fn test_group_strategy_drains_group_before_next() {
    let plan = "\
### 1. Slow
> group: A

### 2. Fast
> group: A

### 3. Later
> group: B
";
    let project = TestProject::with_plan(plan);
    let mut config = LoopConfig::default();
    config.parallel.max_workers = 2;
    config.parallel.strategy = Strategy::Group;
    config.parallel.merge_policy = MergePolicy::Manual;

    let agent = Arc::new(MockAgent::new("mock", |req| {
        mark_done_in(&req.workspace, &req.task_id);
        let delay = if req.task_id == "1" { 300 } else { 10 };
        MockReply::output("EXIT_SIGNAL: true").with_delay(Duration::from_millis(delay))
    }));
    let git = MockGit::new();
    let orc = orchestrator(&project, config, &agent, Arc::new(git.clone()), markdown(&project));

    let summary = orc.run_parallel().await.unwrap();

    let calls = agent.task_ids();
    assert_eq!(calls.len(), 3);
    let first: HashSet<&str> = calls[..2].iter().map(String::as_str).collect();
    assert_eq!(first, HashSet::from(["1", "2"]));
    assert_eq!(calls[2], "3");

    let worker = |id: &str| summary.workers.iter().find(|w| w.task.id == id).unwrap().clone();
    let slow = worker("1");
    let later = worker("3");
    assert!(later.started_at.unwrap() >= slow.completed_at.unwrap());

    // Manual policy leaves every branch for review and the plan untouched.
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(git.branches().len(), 3);
    assert!(git.merged().is_empty());
    assert!(!project.plan().contains("[DONE]"));
    assert_eq!(summary.exit_code, 1);
}

#[tokio::test]
async fn test_workers_get_distinct_workspaces() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One"), ("2", "Two"), ("3", "Three")]));
    let mut config = LoopConfig::default();
    config.parallel.max_workers = 3;

    let agent = Arc::new(MockAgent::new("mock", |req| {
        std::fs::write(req.workspace.join("scratch.txt"), &req.task_id).unwrap();
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true").with_delay(Duration::from_millis(50))
    }));
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));

    let summary = orc.run_parallel().await.unwrap();

    let paths: HashSet<_> = summary.workers.iter().map(|w| w.workspace_path.clone().unwrap()).collect();
    let branches: HashSet<_> = summary.workers.iter().map(|w| w.branch_name.clone().unwrap()).collect();
    assert_eq!(paths.len(), 3);
    assert_eq!(branches.len(), 3);
    for worker in &summary.workers {
        let scratch = worker.workspace_path.as_ref().unwrap().join("scratch.txt");
        assert_eq!(std::fs::read_to_string(scratch).unwrap(), worker.task.id);
    }
    // nothing leaked into the primary tree
    assert!(!project.join("scratch.txt").exists());

    let ids: Vec<u64> = summary.workers.iter().map(|w| w.worker_id).collect();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test]
async fn test_stop_from_first_worker_halts_dispatch() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One"), ("2", "Two"), ("3", "Three")]));
    let mut config = LoopConfig::default();
    config.parallel.max_workers = 1;

    let handle: Arc<OnceLock<LoopHandle>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&handle);
    let agent = Arc::new(MockAgent::new("mock", move |req| {
        if let Some(handle) = slot.get() {
            handle.stop();
        }
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true").with_delay(Duration::from_millis(20))
    }));
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));
    handle.set(orc.handle()).unwrap();

    let summary = orc.run_parallel().await.unwrap();

    assert!(summary.stopped);
    assert_eq!(agent.call_count(), 1);
    assert_eq!(summary.workers.len(), 1);
    // the in-flight worker still finished and was recorded
    assert_eq!(summary.workers[0].task.id, "1");
    assert_eq!(summary.workers[0].status, WorkerStatus::Success);
    assert_eq!(orc.status().await.unwrap().history_len, 1);
    assert_eq!(summary.exit_code, 1);
}

#[tokio::test]
async fn test_panicking_worker_does_not_take_down_siblings() {
    let project = TestProject::with_plan(&plan_of(&[("1", "Explodes"), ("2", "Works")]));
    let mut config = LoopConfig::default();
    config.parallel.max_workers = 2;
    config.parallel.merge_policy = MergePolicy::AutoMerge;
    config.limits.max_attempts = 1;

    let agent = Arc::new(MockAgent::new("mock", |req| {
        if req.task_id == "1" {
            panic!("agent blew up");
        }
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true").with_delay(Duration::from_millis(20))
    }));
    let orc = orchestrator(&project, config, &agent, Arc::new(MockGit::new()), markdown(&project));

    let summary = orc.run_parallel().await.unwrap();

    let worker = |id: &str| summary.workers.iter().find(|w| w.task.id == id).unwrap().clone();
    let sibling = worker("2");
    assert_eq!(sibling.status, WorkerStatus::Success);
    assert!(sibling.completed);
    let broken = worker("1");
    assert_eq!(broken.status, WorkerStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("panicked"));

    // the lost attempt still counts toward the task's failure budget
    let status = orc.status().await.unwrap();
    assert_eq!(status.history_len, 2);
    assert_eq!(status.invocation_count, 2);
    assert_eq!(summary.blocked, vec!["1"]);
    assert!(status.blocked_tasks["1"].contains("worker panicked"));

    let plan = project.plan();
    assert!(plan.contains("### 2. Works [DONE]"), "{plan}");
    assert!(plan.contains("> blocked: 1 consecutive failed attempts"), "{plan}");
    assert_eq!(summary.exit_code, 1);
}

#[tokio::test]
async fn test_auto_merge_marks_done_in_primary() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One")]));
    let mut config = LoopConfig::default();
    config.parallel.merge_policy = MergePolicy::AutoMerge;

    let agent = Arc::new(MockAgent::new("mock", |req| {
        std::fs::write(req.workspace.join("feature.txt"), "shipped").unwrap();
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true")
    }));
    let git = MockGit::new();
    let orc = orchestrator(&project, config, &agent, Arc::new(git.clone()), markdown(&project));

    let summary = orc.run_parallel().await.unwrap();

    assert_eq!(summary.exit_code, 0);
    assert!(summary.workers[0].completed);
    assert_eq!(git.merged().len(), 1);
    assert!(git.branches().is_empty());
    assert_eq!(project.read("feature.txt"), "shipped");
    assert!(project.plan().contains("### 1. One [DONE]"));
}

#[tokio::test]
async fn test_auto_merge_conflict_fails_worker_and_keeps_main() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One")]));
    project.write("shared.txt", "base\n");
    let mut config = LoopConfig::default();
    config.parallel.merge_policy = MergePolicy::AutoMerge;

    let agent = Arc::new(MockAgent::new("mock", |req| {
        std::fs::write(req.workspace.join("shared.txt"), "worker\n").unwrap();
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true")
    }));
    let git = MockGit::new().with_conflict("task-1", &["shared.txt"]);
    let orc = orchestrator(&project, config, &agent, Arc::new(git.clone()), markdown(&project));

    let summary = orc.run_parallel().await.unwrap();

    let worker = &summary.workers[0];
    assert_eq!(worker.status, WorkerStatus::Failed);
    assert!(worker.error.as_deref().unwrap().contains("Merge conflict"));
    assert!(!worker.completed);
    assert_eq!(git.branches().len(), 1);
    assert!(worker.workspace_path.as_ref().unwrap().exists());

    assert_eq!(project.read("shared.txt"), "base\n");
    assert!(!project.plan().contains("[DONE]"));
    assert_eq!(summary.exit_code, 1);
}

#[tokio::test]
async fn test_auto_merge_conflict_with_real_git() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One")]));
    project.write("shared.txt", "base\n");
    if !project.init_git() {
        eprintln!("git not installed, skipping");
        return;
    }
    let mut config = LoopConfig::default();
    config.parallel.merge_policy = MergePolicy::AutoMerge;

    let primary = project.path().to_path_buf();
    let agent = Arc::new(MockAgent::new("mock", move |req| {
        // main moves on while the worker edits the same line
        std::fs::write(primary.join("shared.txt"), "main\n").unwrap();
        git(&primary, &["commit", "-q", "-am", "main edit"]);

        std::fs::write(req.workspace.join("shared.txt"), "worker\n").unwrap();
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true")
    }));
    let orc = orchestrator(
        &project,
        config,
        &agent,
        Arc::new(taskloop::git::RealGit),
        markdown(&project),
    );

    let summary = orc.run_parallel().await.unwrap();

    let worker = &summary.workers[0];
    assert_eq!(worker.status, WorkerStatus::Failed);
    assert!(worker.error.as_deref().unwrap().contains("shared.txt"));

    let branch = worker.branch_name.clone().unwrap();
    let branches = git(project.path(), &["branch", "--list"]);
    assert!(branches.contains("main"));
    assert!(branches.contains(&branch));

    assert_eq!(project.read("shared.txt"), "main\n");
    assert!(!project.plan().contains("[DONE]"));
    let status = git(project.path(), &["status", "--porcelain"]);
    assert!(status.trim().is_empty(), "primary tree dirty: {status}");
}

#[tokio::test]
async fn test_auto_merge_refused_after_primary_switches_branch() {
    let project = TestProject::with_plan(&plan_of(&[("1", "One")]));
    if !project.init_git() {
        eprintln!("git not installed, skipping");
        return;
    }
    let mut config = LoopConfig::default();
    config.parallel.merge_policy = MergePolicy::AutoMerge;

    let primary = project.path().to_path_buf();
    let agent = Arc::new(MockAgent::new("mock", move |req| {
        git(&primary, &["checkout", "-q", "-b", "side"]);
        std::fs::write(req.workspace.join("feature.txt"), "shipped\n").unwrap();
        mark_done_in(&req.workspace, &req.task_id);
        MockReply::output("EXIT_SIGNAL: true")
    }));
    let orc = orchestrator(
        &project,
        config,
        &agent,
        Arc::new(taskloop::git::RealGit),
        markdown(&project),
    );

    let summary = orc.run_parallel().await.unwrap();

    let worker = &summary.workers[0];
    assert_eq!(worker.status, WorkerStatus::Failed);
    assert!(worker.error.as_deref().unwrap().contains("not base branch 'main'"));
    assert!(!worker.completed);
    assert!(!project.join("feature.txt").exists());
    assert!(!project.plan().contains("[DONE]"));
    assert_eq!(summary.exit_code, 1);
}
