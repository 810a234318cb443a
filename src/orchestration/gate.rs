//! Verification gates run between a batch's execution and its completion.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::planning::BatchId;
use crate::pwlog_debug;

use super::executor::ExecutorResult;

/// Default limit on a single gate run, in seconds.
pub const DEFAULT_GATE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum GateVerdict {
    Pass,
    Fail { reason: String },
}

impl GateVerdict {
    pub fn fail(reason: impl Into<String>) -> Self {
        GateVerdict::Fail {
            reason: reason.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }
}

/// Confirms a batch before its tasks are marked completed.
pub trait VerificationGate: Send + Sync {
    fn verify<'a>(
        &'a self,
        batch_id: &'a BatchId,
        result: &'a ExecutorResult,
    ) -> BoxFuture<'a, Result<GateVerdict>>;
}

/// Passes whenever the executor reported success.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoGate;

impl VerificationGate for AutoGate {
    fn verify<'a>(
        &'a self,
        _batch_id: &'a BatchId,
        result: &'a ExecutorResult,
    ) -> BoxFuture<'a, Result<GateVerdict>> {
        Box::pin(async move {
            Ok(if result.is_success() {
                GateVerdict::Pass
            } else {
                GateVerdict::fail(format!("executor reported failure: {}", result.summary))
            })
        })
    }
}

/// Runs a shell command (e.g. the test suite); exit status 0 passes.
#[derive(Debug, Clone)]
pub struct CommandGate {
    command: String,
    workdir: Option<PathBuf>,
}

impl CommandGate {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: PathBuf) -> Self {
        self.workdir = Some(dir);
        self
    }

    async fn run(&self, batch_id: &BatchId, result: &ExecutorResult) -> Result<GateVerdict> {
        if !result.is_success() {
            return Ok(GateVerdict::fail(format!(
                "executor reported failure: {}",
                result.summary
            )));
        }
        pwlog_debug!("CommandGate: batch={} command={}", batch_id, self.command);
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env("PLANWRIGHT_BATCH", batch_id.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        let output = command.output().await?;
        if output.status.success() {
            return Ok(GateVerdict::Pass);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let detail: Vec<&str> = tail.into_iter().rev().collect();
        Ok(GateVerdict::fail(format!(
            "`{}` exited with code {}{}{}",
            self.command,
            output.status.code().unwrap_or(-1),
            if detail.is_empty() { "" } else { ": " },
            detail.join(" | ")
        )))
    }
}

impl VerificationGate for CommandGate {
    fn verify<'a>(
        &'a self,
        batch_id: &'a BatchId,
        result: &'a ExecutorResult,
    ) -> BoxFuture<'a, Result<GateVerdict>> {
        Box::pin(self.run(batch_id, result))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    #[default]
    Auto,
    Command,
}

/// `[gate]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub kind: GateKind,
    pub command: Option<String>,
    /// A gate still running after this long halts the batch.
    pub timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            kind: GateKind::Auto,
            command: None,
            timeout_secs: DEFAULT_GATE_TIMEOUT_SECS,
        }
    }
}

impl GateConfig {
    /// Build the configured gate.
    ///
    /// # Errors
    /// Returns `Validation` for a command gate without a command.
    pub fn build(&self, workdir: Option<PathBuf>) -> Result<Arc<dyn VerificationGate>> {
        match self.kind {
            GateKind::Auto => Ok(Arc::new(AutoGate)),
            GateKind::Command => {
                let command = self.command.as_deref().ok_or_else(|| {
                    Error::Validation("gate kind 'command' requires gate.command".to_string())
                })?;
                let gate = CommandGate::new(command);
                Ok(Arc::new(match workdir {
                    Some(dir) => gate.with_workdir(dir),
                    None => gate,
                }))
            }
        }
    }
}
