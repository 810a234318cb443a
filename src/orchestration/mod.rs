//! Orchestration layer: the control loop and its collaborators.
//!
//! The loop itself lives in `orchestrator`; the executor and verification
//! gate are trait seams so a headless agent CLI, a test double or a human
//! review step can be plugged in. Checkpointing and retry policy are kept in
//! their own modules.

mod executor;
mod gate;
mod orchestrator;
mod retry;
mod state;

pub use executor::{
    CommandExecutor, ExecutionStatus, Executor, ExecutorConfig, ExecutorResult,
    DEFAULT_EXECUTOR_TIMEOUT_SECS,
};
pub use gate::{
    AutoGate, CommandGate, GateConfig, GateKind, GateVerdict, VerificationGate,
    DEFAULT_GATE_TIMEOUT_SECS,
};
pub use orchestrator::{
    Orchestrator, OrchestratorEvent, OrchestratorSettings, Plan, RunSummary,
};
pub use retry::{backoff_delay, RetryPolicy};
pub use state::{ExecutionState, HaltInfo, OrchestratorPhase, CHECKPOINT_VERSION};
