//! Executor boundary: the coding agent that carries out a batch.
//!
//! The orchestrator only sees the `Executor` trait. `CommandExecutor` runs a
//! headless agent CLI with the rendered prompt as its last argument and
//! reads the stop marker, artifacts and summary from its stdout.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::prompt::PromptPayload;
use crate::pwlog_debug;

/// Default executor timeout (30 minutes).
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// What the executor reports back for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub status: ExecutionStatus,
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Raw executor output, kept for gates and diagnostics.
    #[serde(default)]
    pub output: String,
}

impl ExecutorResult {
    pub fn success(summary: &str) -> Self {
        Self {
            status: ExecutionStatus::Success,
            summary: summary.to_string(),
            artifacts: Vec::new(),
            output: String::new(),
        }
    }

    pub fn failure(summary: &str) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            summary: summary.to_string(),
            artifacts: Vec::new(),
            output: String::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Carries out one batch. The caller enforces timeout and cancellation by
/// dropping the returned future.
pub trait Executor: Send + Sync {
    fn execute<'a>(&'a self, prompt: &'a PromptPayload) -> BoxFuture<'a, Result<ExecutorResult>>;
}

/// `[executor]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Working directory for the agent; the current directory when unset.
    pub workdir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            timeout_secs: DEFAULT_EXECUTOR_TIMEOUT_SECS,
            workdir: None,
        }
    }
}

/// Runs an agent CLI as a child process.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    binary: PathBuf,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    /// Resolve the configured command on `PATH`.
    ///
    /// # Errors
    /// Returns `ExecutorFailed` if the binary cannot be found.
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let binary = which::which(&config.command).map_err(|_| {
            Error::ExecutorFailed(format!("executor binary not found: {}", config.command))
        })?;
        Ok(Self {
            binary,
            args: config.args.clone(),
            workdir: config.workdir.clone(),
        })
    }

    /// Use a specific binary without a `PATH` lookup.
    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            workdir: None,
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    async fn run(&self, prompt: &PromptPayload) -> Result<ExecutorResult> {
        pwlog_debug!(
            "CommandExecutor: batch={} binary={} prompt_tokens={}",
            prompt.batch_id,
            self.binary.display(),
            prompt.token_estimate
        );
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .arg(&prompt.text)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        let output = command.output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let artifacts = prompt
            .artifacts(&stdout)
            .into_iter()
            .map(PathBuf::from)
            .collect();

        let (status, summary) = if !output.status.success() {
            let reason = if stderr.trim().is_empty() {
                format!(
                    "executor exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            (ExecutionStatus::Failure, reason)
        } else if !prompt.is_complete(&stdout) {
            (
                ExecutionStatus::Failure,
                format!("executor finished without printing '{}'", prompt.stop_marker),
            )
        } else {
            let summary = prompt
                .summary(&stdout)
                .unwrap_or_else(|| format!("batch {} completed", prompt.batch_id));
            (ExecutionStatus::Success, summary)
        };

        Ok(ExecutorResult {
            status,
            summary,
            artifacts,
            output: stdout,
        })
    }
}

impl Executor for CommandExecutor {
    fn execute<'a>(&'a self, prompt: &'a PromptPayload) -> BoxFuture<'a, Result<ExecutorResult>> {
        Box::pin(self.run(prompt))
    }
}
