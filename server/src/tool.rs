//! External tool invocation.
//!
//! Every call into `nmcli`, `mmcli` or `ip` ends up in [`CommandRunner::run`].
//! The system implementation spawns the program directly (no shell), captures
//! stdout, and kills it when the timeout expires. Controllers hold a
//! [`SharedRunner`] so tests can script tool output.

use std::fmt::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Max output size per stream (1 MB). Tool output beyond this is drained and dropped.
const MAX_TOOL_OUTPUT: usize = 1024 * 1024;

/// Errors from a single tool invocation.
///
/// The core treats every variant as "state unchanged, retry later".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The binary could not be started (not installed, permission denied).
    SpawnFailed(String),
    /// The tool ran and exited non-zero.
    Failed { code: i32, stderr: String },
    /// The tool exceeded its timeout and was killed.
    Timeout,
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::SpawnFailed(e) => write!(f, "Failed to spawn tool: {e}"),
            ToolError::Failed { code, stderr } => write!(f, "Tool exited with {code}: {stderr}"),
            ToolError::Timeout => write!(f, "Tool timed out"),
        }
    }
}

impl ToolError {
    /// Stderr text of a failed invocation, empty for spawn failures and timeouts.
    pub fn stderr(&self) -> &str {
        match self {
            ToolError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Runs an external program and returns its stdout.
pub trait CommandRunner: Send + Sync {
    fn run_with_timeout<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, ToolError>>;

    /// Timeout applied by [`CommandRunner::run`].
    fn default_timeout(&self) -> Duration;

    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        self.run_with_timeout(program, args, self.default_timeout())
    }
}

pub type SharedRunner = Arc<dyn CommandRunner>;

/// [`CommandRunner`] backed by real child processes.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run_with_timeout<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(run_command(program, args, timeout))
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Spawn `program args...`, read stdout and stderr concurrently, and wait
/// for exit within `timeout`.
///
/// `LC_ALL=C` keeps tool output in the untranslated form the parsers expect.
async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, ToolError> {
    debug!("tool: {program} {}", args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::SpawnFailed(format!("{program}: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ToolError::SpawnFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ToolError::SpawnFailed("Failed to take stderr pipe".to_string()))?;

    match Box::pin(tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_TOOL_OUTPUT),
            read_capped(&mut stderr, MAX_TOOL_OUTPUT),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ToolError::SpawnFailed(e.to_string()))?;

        if status.success() {
            Ok(stdout_data)
        } else {
            Err(ToolError::Failed {
                code: status.code().unwrap_or(-1),
                stderr: if stderr_data.trim().is_empty() {
                    stdout_data.trim().to_string()
                } else {
                    stderr_data.trim().to_string()
                },
            })
        }
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ToolError::Timeout),
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest. Keeps reading past the cap so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(s, "\n[truncated: {total_read} bytes total]");
    }
    s
}

/// Convenience for building owned argument vectors from literals.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let out = runner.run("echo", &args(["hello"])).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_nonzero_exit() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let err = runner.run("false", &[]).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let err = runner
            .run("/nonexistent/definitely-not-a-tool", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new(Duration::from_millis(100));
        let err = runner.run("sleep", &args(["5"])).await.unwrap_err();
        assert_eq!(err, ToolError::Timeout);
    }

    #[tokio::test]
    async fn test_scripted_runner_latest_rule_wins() {
        let runner = testing::ScriptedRunner::new();
        runner.ok("nmcli", "first");
        runner.once("nmcli -t", Ok("second".to_string()));
        let a = runner.run("nmcli", &args(["-t"])).await.unwrap();
        let b = runner.run("nmcli", &args(["-t"])).await.unwrap();
        assert_eq!(a, "second");
        assert_eq!(b, "first");
        assert_eq!(runner.calls().len(), 2);
    }
}
