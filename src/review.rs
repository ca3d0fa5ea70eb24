//! Review gate.
//!
//! After gates pass, a second agent can be asked to look at the diff the
//! attempt produced. The attempt ships only if the reviewer exits cleanly and
//! the final word of its output is exactly the configured token (`SHIP` by
//! default). Anything else blocks completion.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::{AgentRequest, AgentRunner};
use crate::process::tail_lines;
use crate::tracker::Task;

/// Verdict recorded on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    /// No review ran.
    #[default]
    None,
    Ship,
    Block,
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewVerdict::None => write!(f, "none"),
            ReviewVerdict::Ship => write!(f, "ship"),
            ReviewVerdict::Block => write!(f, "block"),
        }
    }
}

/// What the reviewer said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub verdict: ReviewVerdict,
    /// Tail of the reviewer output, kept for the receipt.
    pub output_tail: String,
    /// Why the verdict is block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Runs the review agent against a diff.
#[derive(Clone)]
pub struct ReviewGate {
    reviewer: Arc<dyn AgentRunner>,
    ship_token: String,
    timeout: Duration,
    max_diff_bytes: usize,
}

impl fmt::Debug for ReviewGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewGate")
            .field("reviewer", &self.reviewer.name())
            .field("ship_token", &self.ship_token)
            .finish()
    }
}

impl ReviewGate {
    #[must_use]
    pub fn new(reviewer: Arc<dyn AgentRunner>, ship_token: impl Into<String>) -> Self {
        Self {
            reviewer,
            ship_token: ship_token.into(),
            timeout: Duration::from_secs(600),
            max_diff_bytes: 200_000,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_diff_bytes(mut self, max: usize) -> Self {
        self.max_diff_bytes = max;
        self
    }

    /// True iff the final whitespace-delimited word of `output` is the token.
    #[must_use]
    pub fn ships(&self, output: &str) -> bool {
        output.split_whitespace().next_back() == Some(self.ship_token.as_str())
    }

    /// Ask the reviewer about `diff`.
    pub async fn review(&self, workspace: &Path, task: &Task, diff: &str) -> ReviewOutcome {
        let prompt = self.prompt(task, diff);
        let response = self
            .reviewer
            .invoke(AgentRequest {
                prompt,
                workspace: workspace.to_path_buf(),
                task_id: task.id.clone(),
                timeout: self.timeout,
            })
            .await;
        let output_tail = tail_lines(&response.output, 40);

        if let Some(failure) = response.failure(self.timeout) {
            warn!(task_id = %task.id, %failure, "reviewer failed");
            return ReviewOutcome {
                verdict: ReviewVerdict::Block,
                output_tail,
                reason: Some(format!("review {failure}")),
            };
        }
        if self.ships(&response.output) {
            info!(task_id = %task.id, "review: ship");
            ReviewOutcome {
                verdict: ReviewVerdict::Ship,
                output_tail,
                reason: None,
            }
        } else {
            info!(task_id = %task.id, "review: block");
            ReviewOutcome {
                verdict: ReviewVerdict::Block,
                output_tail,
                reason: Some(format!("reviewer did not end with {}", self.ship_token)),
            }
        }
    }

    fn prompt(&self, task: &Task, diff: &str) -> String {
        let (diff, cut) = truncate_at_char(diff, self.max_diff_bytes);
        let mut prompt = format!(
            "You are reviewing a change made for task {id}: {title}\n\n{description}\n\n",
            id = task.id,
            title = task.title,
            description = task.description
        );
        if !task.acceptance.is_empty() {
            prompt.push_str("Acceptance criteria:\n");
            for item in &task.acceptance {
                prompt.push_str(&format!("- {item}\n"));
            }
            prompt.push('\n');
        }
        prompt.push_str("```diff\n");
        prompt.push_str(diff);
        if cut > 0 {
            prompt.push_str(&format!("\n... [{cut} bytes of diff omitted]"));
        }
        prompt.push_str("\n```\n\n");
        prompt.push_str(&format!(
            "If the change is correct and complete, end your reply with the single word {token}. \
             Otherwise explain what is wrong and do not write {token}.\n",
            token = self.ship_token
        ));
        prompt
    }
}

/// Cut `text` to at most `max` bytes on a char boundary; returns the bytes cut.
fn truncate_at_char(text: &str, max: usize) -> (&str, usize) {
    if text.len() <= max {
        return (text, 0);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAgent;

    fn gate(output: &'static str, code: i32) -> ReviewGate {
        let reviewer = MockAgent::new("reviewer", move |_| crate::testing::MockReply::output(output).with_code(code));
        ReviewGate::new(Arc::new(reviewer), "SHIP")
    }

    #[test]
    fn test_ship_token_must_be_last_word() {
        let g = gate("", 0);
        assert!(g.ships("looks good\nSHIP\n"));
        assert!(g.ships("Verdict: SHIP"));
        assert!(!g.ships("SHIP\nbut actually no"));
        assert!(!g.ships("NOSHIP"));
        assert!(!g.ships("SHIP."));
        assert!(!g.ships(""));
    }

    #[tokio::test]
    async fn test_review_verdicts() {
        let task = Task::new("1", "Thing");
        let dir = std::env::temp_dir();

        let ship = gate("fine\nSHIP", 0).review(&dir, &task, "+a").await;
        assert_eq!(ship.verdict, ReviewVerdict::Ship);

        let block = gate("needs tests", 0).review(&dir, &task, "+a").await;
        assert_eq!(block.verdict, ReviewVerdict::Block);
        assert!(block.reason.unwrap().contains("SHIP"));

        let crashed = gate("SHIP", 1).review(&dir, &task, "+a").await;
        assert_eq!(crashed.verdict, ReviewVerdict::Block);
    }

    #[test]
    fn test_diff_truncation_respects_char_boundary() {
        let (cut, dropped) = truncate_at_char("héllo", 2);
        assert_eq!(cut, "h");
        assert_eq!(dropped, 5);
    }

    #[test]
    fn test_prompt_carries_task_and_diff() {
        let mut task = Task::new("9", "Add cache");
        task.acceptance = vec!["hits are fast".into()];
        let prompt = gate("", 0).with_max_diff_bytes(4).prompt(&task, "+line one");
        assert!(prompt.contains("task 9: Add cache"));
        assert!(prompt.contains("- hits are fast"));
        assert!(prompt.contains("+lin\n... [5 bytes of diff omitted]"));
    }
}
