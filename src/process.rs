//! Child processes with a wall-clock budget.
//!
//! Every external command taskloop runs (agent, gates, review, context
//! generator) goes through [`run_command`]. The child is started in its own
//! process group so that on timeout the whole group is killed, including any
//! helpers the command forked. Output is drained concurrently so a chatty
//! child can never deadlock on a full pipe.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes kept per stream; the rest is drained and counted.
pub const OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// How long to wait for pipes to close after the group was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Captured result of one child process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or timed out.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
    /// Bytes discarded beyond [`OUTPUT_LIMIT_BYTES`].
    pub truncated: usize,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let sep = if self.stdout.ends_with('\n') { "" } else { "\n" };
                format!("{}{sep}{}", self.stdout, self.stderr)
            }
        }
    }
}

/// Run `argv` in `cwd`, feeding `stdin`, killing the process group after
/// `timeout`.
///
/// Only a failure to spawn is an error; a timeout or non-zero exit is
/// reported in the returned [`CommandOutput`].
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    debug!(program = %program, pid = ?pid, "child spawned");

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_vec();
        tokio::spawn(async move {
            // a child that exits without reading stdin closes the pipe early
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let (code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            kill_group(pid, &mut child);
            let _ = child.wait().await;
            (None, true)
        }
    };

    let (stdout, out_dropped) = collect(stdout).await;
    let (stderr, err_dropped) = collect(stderr).await;
    let truncated = out_dropped + err_dropped;
    if truncated > 0 {
        warn!(program = %program, truncated, "command output truncated");
    }

    let output = CommandOutput {
        code,
        stdout,
        stderr,
        timed_out,
        duration: started.elapsed(),
        truncated,
    };
    debug!(program = %program, code = ?output.code, timed_out, elapsed_ms = output.duration.as_millis() as u64, "child finished");
    Ok(output)
}

fn spawn_reader<R>(mut stream: R) -> JoinHandle<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = OUTPUT_LIMIT_BYTES.saturating_sub(kept.len());
                    let take = n.min(room);
                    kept.extend_from_slice(&buf[..take]);
                    dropped += n - take;
                }
            }
        }
        (kept, dropped)
    })
}

async fn collect(reader: Option<JoinHandle<(Vec<u8>, usize)>>) -> (String, usize) {
    let Some(handle) = reader else {
        return (String::new(), 0);
    };
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok((bytes, dropped))) => (String::from_utf8_lossy(&bytes).into_owned(), dropped),
        _ => (String::new(), 0),
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: killpg only sends a signal; the group id is the child's pid
        // because it was spawned with process_group(0).
        let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>, child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

/// Keep the last `max_lines` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_code() {
        let cwd = std::env::temp_dir();
        let out = run_command(&sh("echo out; echo err >&2; exit 3"), &cwd, None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let cwd = std::env::temp_dir();
        let out = run_command(&["cat".to_string()], &cwd, Some(b"hello prompt"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello prompt");
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let cwd = std::env::temp_dir();
        let started = Instant::now();
        // the background sleep shares the group and must die too, or the
        // stdout pipe would stay open until it exits
        let out = run_command(&sh("sleep 30 & echo started; wait"), &cwd, None, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.code, None);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let cwd = std::env::temp_dir();
        let argv = vec!["definitely-not-a-real-binary-xyz".to_string()];
        assert!(run_command(&argv, &cwd, None, Duration::from_secs(1)).await.is_err());
        assert!(run_command(&[], &cwd, None, Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
