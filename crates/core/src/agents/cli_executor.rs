//! Subprocess executor for command-backed agents.
//!
//! Spawns a CLI tool, optionally writes a request document to its stdin and
//! parses its stdout as JSON Lines / NDJSON.

use crate::agents::base::AgentError;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_stream::Stream;

/// Maximum number of stderr bytes quoted in a failure message.
const STDERR_TAIL: usize = 2048;

/// A single subprocess invocation.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: String,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl CliInvocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: ".".to_string(),
            stdin: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// CLI executor for command-backed agents.
pub struct CliExecutor;

impl CliExecutor {
    /// Execute a CLI command and parse its stdout as JSON Lines/NDJSON.
    ///
    /// Empty lines are skipped. Lines that fail to parse yield
    /// `AgentError::StreamParseError`. A non-zero exit status yields a final
    /// `AgentError::ExecutionError` quoting the tail of stderr.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rd_core::agents::cli_executor::{CliExecutor, CliInvocation};
    /// use tokio_stream::StreamExt;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let stream = CliExecutor::execute(
    ///         CliInvocation::new("echo").with_args(vec![r#"{"type":"thought"}"#.to_string()]),
    ///     );
    ///
    ///     let values: Vec<_> = stream.collect().await;
    ///     println!("Got {} values", values.len());
    /// }
    /// ```
    pub fn execute(
        invocation: CliInvocation,
    ) -> Pin<Box<dyn Stream<Item = Result<serde_json::Value, AgentError>> + Send>> {
        let stream = async_stream::stream! {
            let CliInvocation { command, args, working_dir, stdin } = invocation;

            let mut cmd = Command::new(&command);
            cmd.args(&args);
            cmd.current_dir(&working_dir);
            cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    yield Err(AgentError::ExecutionError(format!(
                        "Failed to spawn command '{}': {}",
                        command, e
                    )));
                    return;
                }
            };

            if let (Some(input), Some(mut child_stdin)) = (stdin, child.stdin.take()) {
                // The child may exit without reading its input; that is not an error here.
                let _ = child_stdin.write_all(input.as_bytes()).await;
                drop(child_stdin);
            }

            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    yield Err(AgentError::ExecutionError(
                        "Failed to capture stdout".to_string()
                    ));
                    return;
                }
            };

            // Drain stderr concurrently so a chatty child cannot block on a full pipe.
            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let _ = stderr.read_to_end(&mut buf).await;
                    buf
                })
            });

            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => yield Ok(value),
                    Err(e) => {
                        yield Err(AgentError::StreamParseError(format!(
                            "Failed to parse JSON: {} (line: {})",
                            e, line
                        )));
                    }
                }
            }

            let status = child.wait().await;
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };

            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let text = String::from_utf8_lossy(&stderr);
                    let start = text.len().saturating_sub(STDERR_TAIL);
                    let tail = text.get(start..).unwrap_or(&text).trim();
                    yield Err(AgentError::ExecutionError(format!(
                        "Command '{}' exited with {}: {}",
                        command, status, tail
                    )));
                }
                Err(e) => {
                    yield Err(AgentError::ExecutionError(format!(
                        "Failed to wait for command '{}': {}",
                        command, e
                    )));
                }
            }
        };

        Box::pin(stream)
    }
}
