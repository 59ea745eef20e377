//! `command` step: runs a subprocess.
//!
//! Input: `program` (required), `args` (list of strings), `stdin` (string).
//! The input text is piped to stdin and stdout is collected. A non-zero exit
//! is an execution error carrying stderr as detail.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{StepFailure, StepImplementation};

#[derive(Debug, Deserialize)]
struct CommandInput {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    stdin: Option<String>,
}

fn parse_input(input: &Value) -> Result<CommandInput, StepFailure> {
    serde_json::from_value(input.clone())
        .map_err(|e| StepFailure::invalid_input(format!("invalid command input: {}", e)))
}

/// Subprocess step
pub struct CommandStep {
    /// Working directory for spawned processes (inherits when unset)
    working_dir: Option<std::path::PathBuf>,
}

impl Default for CommandStep {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStep {
    pub fn new() -> Self {
        Self { working_dir: None }
    }

    /// Run every command from a fixed directory
    pub fn with_working_dir(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }

    async fn execute_subprocess(
        &self,
        input: CommandInput,
        step_timeout: Duration,
    ) -> Result<Value, StepFailure> {
        let mut command = Command::new(&input.program);
        command
            .args(&input.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            StepFailure::execution(format!("failed to spawn '{}': {}", input.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(text) = &input.stdin {
                stdin.write_all(text.as_bytes()).await.map_err(|e| {
                    StepFailure::execution(format!("failed to write to stdin: {}", e))
                })?;
            }
            // Drop stdin to signal EOF
        }

        let output = timeout(step_timeout, child.wait_with_output())
            .await
            .map_err(|_| StepFailure::timeout(step_timeout))?
            .map_err(|e| {
                StepFailure::execution(format!("failed to wait for '{}': {}", input.program, e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(StepFailure::execution(format!(
                "'{}' failed with exit code {}",
                input.program, exit_code
            ))
            .with_detail(stderr.trim()));
        }

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
        }))
    }
}

#[async_trait]
impl StepImplementation for CommandStep {
    fn step_type(&self) -> &str {
        "command"
    }

    fn validate(&self, input: &Value) -> Result<(), StepFailure> {
        parse_input(input).map(|_| ())
    }

    async fn run(&self, input: &Value, timeout: Duration) -> Result<Value, StepFailure> {
        let input = parse_input(input)?;
        self.execute_subprocess(input, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        let step = CommandStep::new();
        assert!(step.validate(&json!({"program": "echo"})).is_ok());
        assert!(step.validate(&json!({"args": ["x"]})).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_pipes_stdin() {
        let step = CommandStep::new();
        let output = step
            .run(&json!({"program": "cat", "stdin": "hello"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output["stdout"], "hello");
        assert_eq!(output["exit_code"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let step = CommandStep::new();
        let err = step
            .run(
                &json!({"program": "sh", "args": ["-c", "echo oops >&2; exit 3"]}),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, 500);
        assert!(err.message.contains("exit code 3"));
        assert_eq!(err.detail.as_deref(), Some("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let step = CommandStep::new();
        let err = step
            .run(&json!({"program": "sleep", "args": ["5"]}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.status, 504);
    }
}
