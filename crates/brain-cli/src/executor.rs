//! Runs tasks as external commands.
//!
//! The task payload is written to the child's stdin as JSON. On exit code
//! zero, stdout is the result: parsed as JSON when it is JSON, kept as a
//! string otherwise, `null` when empty. A non-zero exit is a retryable
//! failure carrying the exit code and the tail of stderr.
//!
//! The child is killed when the attempt is cancelled or abandoned at its
//! deadline.

use std::process::Stdio;

use async_trait::async_trait;
use brain::{ExecutionContext, ExecutionError, Executor};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt as _;

use crate::config::CommandSpec;

const STDERR_TAIL: usize = 2048;

/// An [`Executor`] backed by a command line.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    spec: CommandSpec,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    fn command(&self, ctx: &ExecutionContext) -> Result<tokio::process::Command, ExecutionError> {
        let Some((program, args)) = self.spec.command.split_first() else {
            return Err(ExecutionError::permanent("empty command"));
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.envs(&self.spec.env);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("BRAIN_TASK_ID", &ctx.task().id);
        cmd.env("BRAIN_TASK_TYPE", ctx.task().task_type.as_str());
        cmd.env("BRAIN_ATTEMPT", ctx.attempt().to_string());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        ctx.checkpoint().await?;

        let program = self.spec.command.first().cloned().unwrap_or_default();
        let mut child = self.command(&ctx)?.spawn().map_err(|e| {
            ExecutionError::permanent(format!("failed to start {program}: {e}"))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(ctx.payload())
                .map_err(|e| ExecutionError::permanent(format!("unserializable payload: {e}")))?;
            // A child that never reads its input closes the pipe early.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(task_id = %ctx.task().id, error = %e, "stdin closed by child");
            }
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| ExecutionError::new(format!("failed to wait for {program}: {e}")))?,
            _ = ctx.cancellation_token().cancelled() => {
                tracing::info!(task_id = %ctx.task().id, program = %program, "killing cancelled command");
                return Err(ExecutionError::cancelled());
            }
        };

        if output.status.success() {
            return Ok(parse_stdout(&output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr
            .char_indices()
            .find(|(i, _)| *i >= tail_start)
            .map(|(i, _)| &stderr[i..])
            .unwrap_or_default();
        Err(ExecutionError::new(format!("{program} exited with {}", output.status))
            .with_details(json!({
                "exit_code": output.status.code(),
                "stderr": tail.trim_end(),
            })))
    }
}

fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
