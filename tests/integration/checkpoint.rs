//! Checkpoint persistence and crash/resume behaviour.

use std::sync::Arc;
use std::time::Duration;

use planwright::core::{TaskId, TaskStatus};
use planwright::orchestration::{
    AutoGate, ExecutionState, GateVerdict, Orchestrator, OrchestratorPhase, CHECKPOINT_VERSION,
};
use planwright::planning::{BatchId, TaskDecomposer};
use planwright::Error;

use crate::fixtures::*;

async fn start(workspace: &TestWorkspace, executor: Arc<MockExecutor>) -> Orchestrator {
    Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        executor,
        Arc::new(AutoGate),
        workspace.settings(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_checkpoint_written_at_plan_time() {
    let workspace = TestWorkspace::new(SHOP);
    let _orch = start(&workspace, MockExecutor::new()).await;

    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.version, CHECKPOINT_VERSION);
    assert_eq!(saved.phase, OrchestratorPhase::Init);
    assert_eq!(saved.tasks.len(), 9);
    assert_eq!(saved.graph_layers.len(), 8);
    assert_eq!(saved.features.len(), 4);
    assert_eq!(saved.spec_path.as_deref(), Some(workspace.spec_path.as_path()));
}

#[tokio::test]
async fn test_resume_after_crash_mid_batch() {
    let workspace = TestWorkspace::new(SHOP);
    let first = MockExecutor::new();
    let mut orch = start(&workspace, first.clone()).await;

    // Init -> Planning -> Dispatching -> AwaitingVerification, then crash.
    for _ in 0..3 {
        orch.step().await.unwrap();
    }
    assert_eq!(orch.phase(), OrchestratorPhase::AwaitingVerification);
    drop(orch);
    assert_eq!(first.batch_ids(), vec!["L0-B1"]);

    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.phase, OrchestratorPhase::Planning);
    assert!(saved.active_batch.is_none());
    let queued: Vec<String> = saved.batch_queue.iter().map(|b| b.id.to_string()).collect();
    assert_eq!(queued, vec!["L0-B1", "L0-B2"]);
    assert_eq!(
        saved
            .task(&TaskId::from("user-accounts-database"))
            .unwrap()
            .status,
        TaskStatus::Ready
    );
    assert_eq!(saved.count_status(TaskStatus::InProgress), 0);

    let second = MockExecutor::new();
    let mut resumed =
        Orchestrator::resume(second.clone(), Arc::new(AutoGate), workspace.settings())
            .await
            .unwrap();
    let summary = resumed.run().await.unwrap();

    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(summary.completed, 9);
    assert_eq!(second.batch_ids()[..2], ["L0-B1", "L0-B2"]);
    assert_eq!(second.call_count(), 9);
}

#[tokio::test]
async fn test_checkpoint_replaced_atomically() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let mut orch = start(&workspace, MockExecutor::new()).await;
    orch.run().await.unwrap();

    let dir = workspace.checkpoint_path.parent().unwrap();
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&workspace.checkpoint_path).unwrap())
            .unwrap();
    assert_eq!(raw["version"], 1);
    assert_eq!(raw["phase"], "done");
    assert_eq!(raw["current_layer"], 2);
}

#[tokio::test]
async fn test_retry_counts_survive_resume() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let gate = ScriptedGate::new(vec![
        GateVerdict::fail("red"),
        GateVerdict::fail("red"),
        GateVerdict::fail("red"),
    ]);
    let mut orch = Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        MockExecutor::new(),
        gate,
        workspace.settings(),
    )
    .await
    .unwrap();
    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    drop(orch);

    // Picked up later by a fresh process: still halted, nothing dispatched.
    let executor = MockExecutor::new();
    let mut resumed = Orchestrator::resume(executor.clone(), Arc::new(AutoGate), workspace.settings())
        .await
        .unwrap();
    assert_eq!(resumed.phase(), OrchestratorPhase::Halted);
    assert_eq!(resumed.state().retry_count(&TaskId::from("a-backend")), 3);
    let halt = resumed.state().halt.clone().unwrap();
    assert!(halt.exhausted);
    assert_eq!(halt.batch.id, BatchId::new(0, 1));

    resumed.run().await.unwrap();
    assert_eq!(executor.call_count(), 0);

    resumed.retry_halted().await.unwrap();
    let summary = resumed.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(executor.batch_ids(), vec!["L0-B1", "L1-B1"]);
}

#[tokio::test]
async fn test_cancelled_run_is_resumable() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let mut orch = Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        Arc::new(PendingExecutor),
        Arc::new(AutoGate),
        workspace.settings(),
    )
    .await
    .unwrap();
    let token = orch.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    let halt = summary.halt.unwrap();
    assert!(halt.exhausted);
    assert_eq!(halt.reason, Error::Cancelled.to_string());
    drop(orch);

    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.phase, OrchestratorPhase::Halted);
    assert_eq!(
        saved.task(&TaskId::from("a-backend")).unwrap().status,
        TaskStatus::Failed
    );

    let executor = MockExecutor::new();
    let mut resumed = Orchestrator::resume(executor.clone(), Arc::new(AutoGate), workspace.settings())
        .await
        .unwrap();
    resumed.retry_halted().await.unwrap();
    let summary = resumed.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(summary.completed, 2);
}

#[tokio::test]
async fn test_failed_planning_is_checkpointed() {
    let workspace = TestWorkspace::new(CYCLIC);
    let executor = MockExecutor::new();
    let result = Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        executor.clone(),
        Arc::new(AutoGate),
        workspace.settings(),
    )
    .await;
    assert!(matches!(result, Err(Error::CyclicDependency { .. })));

    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.phase, OrchestratorPhase::Failed);
    assert!(saved.failure.as_deref().unwrap().contains("Cyclic dependency"));

    // Resuming a failed run is a no-op.
    let mut resumed = Orchestrator::resume(executor.clone(), Arc::new(AutoGate), workspace.settings())
        .await
        .unwrap();
    let summary = resumed.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Failed);
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_malformed_spec_is_checkpointed() {
    let workspace = TestWorkspace::new(MALFORMED);
    let result = Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        MockExecutor::new(),
        Arc::new(AutoGate),
        workspace.settings(),
    )
    .await;
    assert!(matches!(result, Err(Error::MalformedSpec { .. })));
    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.phase, OrchestratorPhase::Failed);
    assert!(saved.tasks.is_empty());
}

#[tokio::test]
async fn test_newer_checkpoint_rejected() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let _orch = start(&workspace, MockExecutor::new()).await;

    let mut raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&workspace.checkpoint_path).unwrap())
            .unwrap();
    raw["version"] = serde_json::json!(CHECKPOINT_VERSION + 1);
    std::fs::write(&workspace.checkpoint_path, raw.to_string()).unwrap();

    assert!(matches!(
        ExecutionState::load_sync(&workspace.checkpoint_path),
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_resume_requires_checkpoint_path() {
    let result = Orchestrator::resume(MockExecutor::new(), Arc::new(AutoGate), settings(None)).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}
