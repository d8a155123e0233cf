//! Shell command execution

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::chunker::Chunker;
use crate::error::{AgentError, Result};
use fleet_core::CommandStatus;

/// Terminal result of one execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub exit_code: i64,
    pub error_msg: Option<String>,
}

/// Run a shell command, wiring its output through the chunker.
///
/// The command string is interpreted by `sh -c`. When the deadline fires
/// the child is killed and the outcome is `timeout` with exit code -1;
/// otherwise the exit code decides between `success` and `failed`. Chunks
/// arrive on the receiver paired with the chunker; by the time this
/// returns, the chunker has emitted its final flush and closed the channel.
pub async fn run_shell_command(
    cmd: &str,
    deadline: Duration,
    chunker: Chunker,
) -> Result<ExecutionOutcome> {
    debug!(cmd = %cmd, timeout_sec = deadline.as_secs(), "executing command");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::generic("child stdout pipe missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::generic("child stderr pipe missing"))?;

    let tasks = chunker.start(stdout, stderr);

    let outcome = match timeout(deadline, child.wait()).await {
        Err(_) => {
            warn!(cmd = %cmd, "execution deadline exceeded, killing child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            ExecutionOutcome {
                status: CommandStatus::Timeout,
                exit_code: -1,
                error_msg: Some(format!(
                    "command timed out after {}s",
                    deadline.as_secs()
                )),
            }
        }
        Ok(Err(e)) => {
            let _ = child.start_kill();
            return Err(e.into());
        }
        Ok(Ok(status)) => {
            let exit_code = i64::from(status.code().unwrap_or(-1));
            if exit_code == 0 {
                ExecutionOutcome {
                    status: CommandStatus::Success,
                    exit_code,
                    error_msg: None,
                }
            } else {
                ExecutionOutcome {
                    status: CommandStatus::Failed,
                    exit_code,
                    error_msg: Some(format!("command exited with code {exit_code}")),
                }
            }
        }
    };

    // Killed or exited, the pipes are at EOF: drain the readers, then emit
    // the final flush and close the chunk channel.
    tasks.finish().await;
    chunker.final_flush().await;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::chunker::Chunk;
    use fleet_core::StreamKind;
    use tokio::sync::mpsc;

    async fn collect(mut rx: mpsc::Receiver<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_success_with_output() {
        let (chunker, rx) = Chunker::new(16 * 1024, Duration::from_secs(1), 100);
        let outcome = run_shell_command("echo hi", Duration::from_secs(5), chunker)
            .await
            .unwrap();

        assert_eq!(outcome.status, CommandStatus::Success);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.error_msg.is_none());

        let chunks = collect(rx).await;
        let stdout: String = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stdout)
            .map(|c| c.data.as_str())
            .collect();
        assert_eq!(stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (chunker, _rx) = Chunker::new(16 * 1024, Duration::from_secs(1), 100);
        let outcome = run_shell_command("exit 3", Duration::from_secs(5), chunker)
            .await
            .unwrap();

        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.error_msg.unwrap().contains("code 3"));
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout() {
        let (chunker, _rx) = Chunker::new(16 * 1024, Duration::from_secs(1), 100);
        let outcome = run_shell_command("sleep 5", Duration::from_millis(200), chunker)
            .await
            .unwrap();

        assert_eq!(outcome.status, CommandStatus::Timeout);
        assert_eq!(outcome.exit_code, -1);
    }

    #[tokio::test]
    async fn test_stderr_separated_from_stdout() {
        let (chunker, rx) = Chunker::new(16 * 1024, Duration::from_secs(1), 100);
        let outcome = run_shell_command(
            "echo out; echo err 1>&2",
            Duration::from_secs(5),
            chunker,
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, CommandStatus::Success);

        let chunks = collect(rx).await;
        let stdout: String = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stdout)
            .map(|c| c.data.as_str())
            .collect();
        let stderr: String = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stderr)
            .map(|c| c.data.as_str())
            .collect();
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");
    }

    #[tokio::test]
    async fn test_large_output_round_trips() {
        let (chunker, rx) = Chunker::new(4 * 1024, Duration::from_secs(1), 100);
        let outcome = run_shell_command(
            "seq 1 2000",
            Duration::from_secs(10),
            chunker,
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, CommandStatus::Success);

        let chunks = collect(rx).await;
        assert!(chunks.len() > 1, "large output must split into chunks");

        let mut sorted: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.stream == StreamKind::Stdout)
            .collect();
        sorted.sort_by_key(|c| c.chunk_index);
        let stdout: String = sorted.iter().map(|c| c.data.as_str()).collect();

        let expected: String = (1..=2000).map(|i| format!("{i}\n")).collect();
        assert_eq!(stdout, expected);
    }
}
