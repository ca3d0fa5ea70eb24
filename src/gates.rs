//! Validation gates.
//!
//! A gate is an opaque command (`cargo test`, `npm run lint`, ...) run in the
//! attempt's workspace. A zero exit is a pass; anything else, including a
//! timeout or a command that cannot be started, is a failure. Gates run in
//! configured order. With `fail_fast` the first failure stops the sequence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GatesConfig;
use crate::process::{run_command, tail_lines};

/// Lines of gate output kept for receipts.
const OUTPUT_TAIL_LINES: usize = 40;

/// Result of one gate command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// Command line, space-joined.
    pub command: String,
    pub passed: bool,
    pub code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Tail of the combined output.
    #[serde(default)]
    pub output_tail: String,
}

/// Outcome of a gate run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    /// True when every gate that ran passed. No gates is a pass.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    #[must_use]
    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| !r.passed)
    }

    /// Human-readable description of the first failure.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.first_failure().map(|r| {
            if r.timed_out {
                format!("gate '{}' timed out", r.command)
            } else {
                match r.code {
                    Some(code) => format!("gate '{}' failed with exit code {code}", r.command),
                    None => format!("gate '{}' could not run", r.command),
                }
            }
        })
    }

    /// Commands that ran, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.results.iter().map(|r| r.command.clone()).collect()
    }
}

/// Runs the configured gate commands.
#[derive(Debug, Clone)]
pub struct GateRunner {
    commands: Vec<Vec<String>>,
    fail_fast: bool,
    timeout: Duration,
}

impl GateRunner {
    #[must_use]
    pub fn new(commands: Vec<Vec<String>>) -> Self {
        Self {
            commands,
            fail_fast: true,
            timeout: Duration::from_secs(600),
        }
    }

    #[must_use]
    pub fn from_config(config: &GatesConfig) -> Self {
        Self::new(config.commands.clone())
            .with_fail_fast(config.fail_fast)
            .with_timeout(Duration::from_secs(config.timeout_secs))
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run every gate in `workspace`.
    pub async fn run(&self, workspace: &Path) -> GateReport {
        let mut report = GateReport::default();

        for argv in &self.commands {
            let command = argv.join(" ");
            let result = match run_command(argv, workspace, None, self.timeout).await {
                Ok(out) => GateResult {
                    command,
                    passed: out.success(),
                    code: out.code,
                    timed_out: out.timed_out,
                    duration_ms: u64::try_from(out.duration.as_millis()).unwrap_or(u64::MAX),
                    output_tail: tail_lines(&out.combined(), OUTPUT_TAIL_LINES),
                },
                Err(e) => GateResult {
                    command,
                    passed: false,
                    code: None,
                    timed_out: false,
                    duration_ms: 0,
                    output_tail: format!("failed to start: {e}"),
                },
            };

            if result.passed {
                info!(gate = %result.command, duration_ms = result.duration_ms, "gate passed");
            } else {
                warn!(gate = %result.command, code = ?result.code, timed_out = result.timed_out, "gate failed");
            }
            let stop = !result.passed && self.fail_fast;
            report.results.push(result);
            if stop {
                break;
            }
        }
        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_no_gates_pass() {
        let report = GateRunner::new(vec![]).run(&std::env::temp_dir()).await;
        assert!(report.ok());
        assert!(report.failure_reason().is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_stops_sequence() {
        let runner = GateRunner::new(vec![sh("exit 0"), sh("exit 4"), sh("exit 0")]);
        let report = runner.run(&std::env::temp_dir()).await;
        assert!(!report.ok());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.first_failure().unwrap().code, Some(4));
        assert!(report.failure_reason().unwrap().contains("exit code 4"));
    }

    #[tokio::test]
    async fn test_without_fail_fast_runs_all() {
        let runner = GateRunner::new(vec![sh("exit 1"), sh("echo later")]).with_fail_fast(false);
        let report = runner.run(&std::env::temp_dir()).await;
        assert_eq!(report.results.len(), 2);
        assert!(!report.ok());
        assert_eq!(report.results[1].output_tail, "later");
    }

    #[tokio::test]
    async fn test_gate_runs_in_workspace() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker"), "x").unwrap();
        let report = GateRunner::new(vec![sh("test -f marker")]).run(temp.path()).await;
        assert!(report.ok());
    }

    #[tokio::test]
    async fn test_gate_timeout_is_failure() {
        let runner = GateRunner::new(vec![sh("sleep 20")]).with_timeout(Duration::from_millis(200));
        let report = runner.run(&std::env::temp_dir()).await;
        assert!(report.results[0].timed_out);
        assert!(report.failure_reason().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_program_is_failure() {
        let runner = GateRunner::new(vec![vec!["definitely-not-a-gate-xyz".into()]]);
        let report = runner.run(&std::env::temp_dir()).await;
        assert!(!report.ok());
        assert!(report.failure_reason().unwrap().contains("could not run"));
    }
}
