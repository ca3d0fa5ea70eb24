//! Agent invocation.
//!
//! An agent is any program that reads a prompt and works on the files in its
//! current directory. taskloop only sees its exit status and its combined
//! output, which is scanned for two protocol lines:
//!
//! ```text
//! CITE: src/parser.rs            evidence collected into the receipt
//! EXIT_SIGNAL: true              agent believes the task is finished
//! ```
//!
//! [`AgentRunner`] is the seam the iteration engine calls through;
//! [`ProcessAgent`] is the real implementation and
//! [`MockAgent`](crate::testing::MockAgent) the scripted one.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{AgentConfig, PromptMode};
use crate::process::run_command;

/// One invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// Working directory the agent runs in.
    pub workspace: PathBuf,
    pub task_id: String,
    pub timeout: Duration,
}

/// Outcome of one invocation. Spawn failures and timeouts are data here,
/// never errors.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    /// Exit code; `None` on timeout, signal or spawn failure.
    pub code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
    /// Why the process could not be started at all.
    pub spawn_error: Option<String>,
    pub duration: Duration,
}

impl AgentResponse {
    /// Clean exit with status zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.code == Some(0) && !self.timed_out && self.spawn_error.is_none()
    }

    /// Human-readable failure, if any.
    #[must_use]
    pub fn failure(&self, timeout: Duration) -> Option<String> {
        if let Some(e) = &self.spawn_error {
            Some(format!("agent failed to start: {e}"))
        } else if self.timed_out {
            Some(format!("agent timed out after {}s", timeout.as_secs()))
        } else if self.code != Some(0) {
            Some(match self.code {
                Some(code) => format!("agent exited with code {code}"),
                None => "agent was killed by a signal".to_string(),
            })
        } else {
            None
        }
    }
}

/// Runs an agent against a workspace.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Name recorded on attempts and receipts.
    fn name(&self) -> &str;

    /// Invoke once. Must not fail: every problem is folded into the response.
    async fn invoke(&self, request: AgentRequest) -> AgentResponse;
}

/// Agent backed by an external process.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    name: String,
    argv: Vec<String>,
    prompt_mode: PromptMode,
}

impl ProcessAgent {
    #[must_use]
    pub fn new(name: impl Into<String>, argv: Vec<String>, prompt_mode: PromptMode) -> Self {
        Self {
            name: name.into(),
            argv,
            prompt_mode,
        }
    }

    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.name.clone(), config.argv.clone(), config.prompt_mode)
    }

    /// Final argv for a prompt, plus what goes on stdin.
    fn command_for<'a>(&self, prompt: &'a str) -> (Vec<String>, Option<&'a [u8]>) {
        match self.prompt_mode {
            PromptMode::Stdin => (self.argv.clone(), Some(prompt.as_bytes())),
            PromptMode::Argument => {
                let mut argv = self.argv.clone();
                argv.push(prompt.to_string());
                (argv, None)
            }
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: AgentRequest) -> AgentResponse {
        let (argv, stdin) = self.command_for(&request.prompt);
        debug!(agent = %self.name, task_id = %request.task_id, prompt_chars = request.prompt.len(), "invoking agent");

        match run_command(&argv, &request.workspace, stdin, request.timeout).await {
            Ok(out) => AgentResponse {
                code: out.code,
                output: out.combined(),
                timed_out: out.timed_out,
                spawn_error: None,
                duration: out.duration,
            },
            Err(e) => {
                warn!(agent = %self.name, error = %e, "agent failed to start");
                AgentResponse {
                    spawn_error: Some(e.to_string()),
                    ..AgentResponse::default()
                }
            }
        }
    }
}

fn exit_signal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\W*EXIT_SIGNAL\s*[:=]\s*(true|false)\b").expect("valid exit signal regex"))
}

/// Value of the last `EXIT_SIGNAL: true|false` line; absent means false.
#[must_use]
pub fn parse_exit_signal(output: &str) -> bool {
    output
        .lines()
        .rev()
        .find_map(|line| exit_signal_re().captures(line.trim()))
        .is_some_and(|caps| caps[1].eq_ignore_ascii_case("true"))
}

/// Paths and test names from `CITE:` lines, deduplicated in order.
#[must_use]
pub fn parse_citations(output: &str) -> Vec<String> {
    let mut cites: Vec<String> = Vec::new();
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("CITE:") {
            let cite = rest.trim().to_string();
            if !cite.is_empty() && !cites.contains(&cite) {
                cites.push(cite);
            }
        }
    }
    cites
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_signal_last_line_wins() {
        assert!(parse_exit_signal("working\nEXIT_SIGNAL: false\nmore\nEXIT_SIGNAL: true\n"));
        assert!(!parse_exit_signal("EXIT_SIGNAL: true\nEXIT_SIGNAL: FALSE"));
        assert!(parse_exit_signal("**exit_signal: TRUE**"));
        assert!(!parse_exit_signal("no signal here"));
        assert!(!parse_exit_signal("the EXIT_SIGNAL: true token mid-sentence"));
    }

    #[test]
    fn test_citations() {
        let out = "CITE: src/lib.rs\nnoise\n  CITE: tests/cli.rs  \nCITE: src/lib.rs\nCITE:\n";
        assert_eq!(parse_citations(out), vec!["src/lib.rs", "tests/cli.rs"]);
    }

    #[test]
    fn test_failure_reasons() {
        let t = Duration::from_secs(5);
        assert!(AgentResponse { code: Some(0), ..Default::default() }.failure(t).is_none());
        assert_eq!(
            AgentResponse { code: Some(2), ..Default::default() }.failure(t).unwrap(),
            "agent exited with code 2"
        );
        let timed_out = AgentResponse { timed_out: true, ..Default::default() };
        assert!(timed_out.failure(t).unwrap().contains("timed out after 5s"));
        assert!(!timed_out.succeeded());
    }

    #[test]
    fn test_argument_mode_appends_prompt() {
        let agent = ProcessAgent::new("a", vec!["agent".into(), "-p".into()], PromptMode::Argument);
        let (argv, stdin) = agent.command_for("do it");
        assert_eq!(argv, vec!["agent", "-p", "do it"]);
        assert!(stdin.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_agent_runs_in_workspace() {
        let temp = tempfile::TempDir::new().unwrap();
        let agent = ProcessAgent::new(
            "sh",
            vec!["sh".into(), "-c".into(), "cat > prompt.txt; echo EXIT_SIGNAL: true".into()],
            PromptMode::Stdin,
        );
        let response = agent
            .invoke(AgentRequest {
                prompt: "build it".into(),
                workspace: temp.path().to_path_buf(),
                task_id: "1".into(),
                timeout: Duration::from_secs(10),
            })
            .await;
        assert!(response.succeeded());
        assert!(parse_exit_signal(&response.output));
        assert_eq!(std::fs::read_to_string(temp.path().join("prompt.txt")).unwrap(), "build it");
    }

    #[tokio::test]
    async fn test_missing_binary_is_data_not_error() {
        let agent = ProcessAgent::new("ghost", vec!["definitely-not-an-agent-xyz".into()], PromptMode::Stdin);
        let response = agent
            .invoke(AgentRequest {
                prompt: String::new(),
                workspace: std::env::temp_dir(),
                task_id: "1".into(),
                timeout: Duration::from_secs(1),
            })
            .await;
        assert!(response.spawn_error.is_some());
        assert!(response.failure(Duration::from_secs(1)).unwrap().contains("failed to start"));
    }
}
