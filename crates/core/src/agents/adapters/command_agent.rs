//! Agent backed by an external executable.
//!
//! The executable receives a JSON request on stdin and answers with JSON
//! Lines on stdout:
//!
//! ```text
//! {"type":"thought","text":"Scanning manifests"}
//! {"type":"tool_call","name":"read_file"}
//! {"type":"output","key":"structure","value":{"modules":12}}
//! {"type":"error","message":"rate limited","transient":true}
//! {"type":"done"}
//! ```

use crate::agents::base::{Agent, AgentError, AgentEvent, AgentStream, ExecutionContext};
use crate::agents::cli_executor::{CliExecutor, CliInvocation};
use async_trait::async_trait;
use rd_protocol::run_models::RunContext;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_stream::StreamExt;
use uuid::Uuid;

pub struct CommandAgent {
    name: String,
    command: String,
    args: Vec<String>,
    system_prompt: String,
    working_dir: PathBuf,
}

impl CommandAgent {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            system_prompt: system_prompt.into(),
            working_dir: PathBuf::from("."),
        }
    }

    /// Directory the command is started in; relative commands resolve against it.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolved_command(&self) -> PathBuf {
        let path = Path::new(&self.command);
        if path.components().count() > 1 && path.is_relative() {
            self.working_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

/// Request document written to the agent's stdin.
#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    run_id: Uuid,
    stage: &'a str,
    system_prompt: &'a str,
    instruction: &'a str,
    inputs: &'a RunContext,
    expected_outputs: &'a [String],
    attempt: u32,
}

/// One line of agent stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentLine {
    Thought {
        text: String,
    },
    ToolCall {
        name: String,
    },
    Message {
        text: String,
    },
    Output {
        key: String,
        value: serde_json::Value,
    },
    Error {
        message: String,
        #[serde(default)]
        transient: bool,
    },
    Done,
}

fn convert_line(value: serde_json::Value) -> Result<AgentEvent, AgentError> {
    let line: AgentLine = serde_json::from_value(value)
        .map_err(|e| AgentError::StreamParseError(format!("Unrecognized agent line: {}", e)))?;
    match line {
        AgentLine::Thought { text } => Ok(AgentEvent::Thought(text)),
        AgentLine::ToolCall { name } => Ok(AgentEvent::ToolCall(name)),
        AgentLine::Message { text } => Ok(AgentEvent::MessageChunk(text)),
        AgentLine::Output { key, value } => Ok(AgentEvent::Output { key, value }),
        AgentLine::Error { message, transient: true } => Err(AgentError::Transient(message)),
        AgentLine::Error { message, transient: false } => Err(AgentError::ExecutionError(message)),
        AgentLine::Done => Ok(AgentEvent::Completed),
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn check_availability(&self) -> bool {
        let command = self.resolved_command();
        if command.components().count() > 1 {
            command.is_file()
        } else {
            which::which(&command).is_ok()
        }
    }

    async fn execute(&self, context: &ExecutionContext) -> Result<AgentStream, AgentError> {
        let request = AgentRequest {
            run_id: context.run_id,
            stage: &context.stage,
            system_prompt: &self.system_prompt,
            instruction: &context.instruction,
            inputs: &context.inputs,
            expected_outputs: &context.expected_outputs,
            attempt: context.attempt,
        };
        let mut stdin = serde_json::to_string(&request)
            .map_err(|e| AgentError::ExecutionError(format!("Failed to encode request: {}", e)))?;
        stdin.push('\n');

        let invocation = CliInvocation::new(self.resolved_command().to_string_lossy())
            .with_args(self.args.clone())
            .with_working_dir(self.working_dir.to_string_lossy())
            .with_stdin(stdin);

        let events = CliExecutor::execute(invocation).map(|item| item.and_then(convert_line));
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convert_lines() {
        assert_eq!(
            convert_line(json!({"type": "thought", "text": "hm"})),
            Ok(AgentEvent::Thought("hm".into()))
        );
        assert_eq!(
            convert_line(json!({"type": "output", "key": "k", "value": [1, 2]})),
            Ok(AgentEvent::Output {
                key: "k".into(),
                value: json!([1, 2])
            })
        );
        assert_eq!(
            convert_line(json!({"type": "error", "message": "slow", "transient": true})),
            Err(AgentError::Transient("slow".into()))
        );
        assert_eq!(
            convert_line(json!({"type": "error", "message": "bad"})),
            Err(AgentError::ExecutionError("bad".into()))
        );
        assert_eq!(convert_line(json!({"type": "done"})), Ok(AgentEvent::Completed));
        assert!(matches!(
            convert_line(json!({"type": "mystery"})),
            Err(AgentError::StreamParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_command_is_unavailable() {
        let agent = CommandAgent::new("ghost", "repodoc-no-such-agent-xyz", vec![], "");
        assert!(!agent.check_availability().await);

        let relative = CommandAgent::new("ghost", "./agents/missing.sh", vec![], "")
            .with_working_dir(std::env::temp_dir());
        assert!(!relative.check_availability().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reads_request_from_stdin() {
        // The script echoes the stage name from its request back as an output.
        let script = r#"read req; stage=$(printf '%s' "$req" | sed 's/.*"stage":"\([^"]*\)".*/\1/'); printf '{"type":"output","key":"seen","value":"%s"}\n{"type":"done"}\n' "$stage""#;
        let agent = CommandAgent::new(
            "echo",
            "sh",
            vec!["-c".to_string(), script.to_string()],
            "prompt",
        );
        assert!(agent.check_availability().await);

        let context = ExecutionContext::new("structure", "");
        let events: Vec<_> = agent.execute(&context).await.unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                Ok(AgentEvent::Output {
                    key: "seen".into(),
                    value: json!("structure")
                }),
                Ok(AgentEvent::Completed),
            ]
        );
    }
}
