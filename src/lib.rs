pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod planning;
pub mod prompt;
pub mod spec;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{ExecutionState, Orchestrator, OrchestratorPhase, RunSummary};
