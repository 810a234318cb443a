use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::ContextBudget;
use crate::orchestration::{ExecutorConfig, GateConfig, OrchestratorSettings, RetryPolicy};
use crate::planning::DomainKeywords;
use crate::{pwlog_debug, Error, Result};

const DEFAULT_CHECKPOINT: &str = ".planwright/checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Checkpoint file; relative paths resolve against the working directory.
    pub checkpoint_path: Option<String>,
    #[serde(default)]
    pub context: ContextBudget,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub keywords: DomainKeywords,
}

impl Config {
    pub fn planwright_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".planwright"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::planwright_dir()?.join("planwright.toml"))
    }

    pub fn effective_checkpoint_path(&self) -> PathBuf {
        match &self.checkpoint_path {
            Some(path) => expand_tilde(path),
            None => PathBuf::from(DEFAULT_CHECKPOINT),
        }
    }

    /// Loop settings with the checkpoint path resolved.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            checkpoint_path: Some(self.effective_checkpoint_path()),
            context: self.context,
            retry: self.retry,
            executor_timeout: Duration::from_secs(self.executor.timeout_secs),
            gate_timeout: Duration::from_secs(self.gate.timeout_secs),
        }
    }

    /// Load from `~/.planwright/planwright.toml`.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        pwlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            pwlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        pwlog_debug!(
            "Config loaded: checkpoint={:?}, executor={}, gate={:?}, budget={}",
            config.checkpoint_path,
            config.executor.command,
            config.gate.kind,
            config.context.budget_tokens
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::planwright_dir()?;
        if !dir.exists() {
            pwlog_debug!("Creating planwright directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        pwlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
