//! Full orchestration runs against scripted executors and gates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use planwright::core::{TaskId, TaskStatus};
use planwright::orchestration::{
    AutoGate, ExecutionState, ExecutorResult, GateConfig, GateKind, GateVerdict, Orchestrator,
    OrchestratorEvent, OrchestratorPhase, OrchestratorSettings, VerificationGate,
};
use planwright::planning::{BatchId, TaskDecomposer};
use planwright::Error;

use crate::fixtures::*;

async fn start(
    workspace: &TestWorkspace,
    executor: Arc<MockExecutor>,
    gate: Arc<dyn VerificationGate>,
) -> Orchestrator {
    Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        executor,
        gate,
        workspace.settings(),
    )
    .await
    .expect("planning should succeed")
}

fn status(orch: &Orchestrator, id: &str) -> TaskStatus {
    orch.state().task(&TaskId::from(id)).unwrap().status
}

#[tokio::test]
async fn test_shop_runs_to_completion() {
    let workspace = TestWorkspace::new(SHOP);
    let executor = MockExecutor::new();
    let mut orch = start(&workspace, executor.clone(), Arc::new(AutoGate)).await;

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(summary.completed, 9);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.layers, 8);
    assert!(summary.halt.is_none());

    assert_eq!(
        executor.batch_ids(),
        vec![
            "L0-B1", "L0-B2", "L1-B1", "L2-B1", "L3-B1", "L4-B1", "L5-B1", "L6-B1", "L7-B1"
        ]
    );

    // Downstream prompts carry upstream completion summaries.
    let prompts = executor.prompts();
    let catalog = prompts
        .iter()
        .find(|p| p.batch_id == BatchId::new(2, 1))
        .unwrap();
    assert!(catalog.text.contains("user-accounts-frontend: L1-B1 implemented"));
    assert!(catalog.text.contains("Feature: Catalog (catalog)"));

    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.phase, OrchestratorPhase::Done);
    assert_eq!(saved.count_status(TaskStatus::Completed), 9);
    assert_eq!(saved.current_layer, 8);
}

#[tokio::test]
async fn test_gate_failure_retries_the_batch() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::new();
    let gate = ScriptedGate::new(vec![GateVerdict::fail("tests red")]);
    let mut orch = start(&workspace, executor.clone(), gate.clone()).await;

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(summary.completed, 2);
    assert_eq!(executor.batch_ids(), vec!["L0-B1", "L0-B1", "L1-B1"]);
    assert_eq!(gate.seen(), vec!["L0-B1", "L0-B1", "L1-B1"]);
    assert_eq!(orch.state().retry_count(&TaskId::from("a-backend")), 1);
    assert_eq!(orch.state().retry_count(&TaskId::from("b-backend")), 0);
}

#[tokio::test]
async fn test_exhausted_gate_halts_then_force_advance() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::new();
    let gate = ScriptedGate::new(vec![
        GateVerdict::fail("tests red 1"),
        GateVerdict::fail("tests red 2"),
        GateVerdict::fail("tests red 3"),
    ]);
    let mut orch = start(&workspace, executor.clone(), gate).await;

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    assert_eq!(summary.failed, 1);
    let halt = summary.halt.expect("halt info recorded");
    assert!(halt.exhausted);
    assert_eq!(halt.retry_count, 3);
    assert_eq!(halt.reason, "tests red 3");
    assert_eq!(halt.batch.id, BatchId::new(0, 1));
    assert_eq!(status(&orch, "a-backend"), TaskStatus::Failed);
    assert_eq!(status(&orch, "b-backend"), TaskStatus::Pending);

    // A halted run stays put.
    let again = orch.run().await.unwrap();
    assert_eq!(again.phase, OrchestratorPhase::Halted);
    assert_eq!(executor.call_count(), 3);

    orch.force_advance("fixed by hand").await.unwrap();
    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(summary.completed, 2);
    assert_eq!(executor.call_count(), 4);
    assert_eq!(
        orch.state()
            .task(&TaskId::from("a-backend"))
            .and_then(|t| t.summary.as_deref()),
        Some("fixed by hand")
    );
}

#[tokio::test]
async fn test_executor_failures_exhaust_then_manual_retry() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::scripted(vec![
        ExecutorResult::failure("no marker"),
        ExecutorResult::failure("no marker"),
        ExecutorResult::failure("no marker"),
    ]);
    let mut orch = start(&workspace, executor.clone(), Arc::new(AutoGate)).await;

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    assert!(summary.halt.unwrap().exhausted);

    orch.retry_halted().await.unwrap();
    assert_eq!(orch.phase(), OrchestratorPhase::Planning);
    assert_eq!(status(&orch, "a-backend"), TaskStatus::Ready);
    assert_eq!(orch.state().retry_count(&TaskId::from("a-backend")), 0);
    assert!(matches!(
        orch.force_advance("too late").await,
        Err(Error::NotHalted(_))
    ));

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Done);
    assert_eq!(
        executor.batch_ids(),
        vec!["L0-B1", "L0-B1", "L0-B1", "L0-B1", "L1-B1"]
    );
}

#[tokio::test]
async fn test_event_stream() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::scripted(vec![ExecutorResult::failure("compile error")]);
    let (tx, mut rx) = mpsc::channel(256);
    let mut orch = start(&workspace, executor, Arc::new(AutoGate))
        .await
        .with_events(tx);

    orch.run().await.unwrap();
    drop(orch);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        events.first(),
        Some(&OrchestratorEvent::PhaseChanged {
            from: OrchestratorPhase::Init,
            to: OrchestratorPhase::Planning,
        })
    );
    assert_eq!(
        events.last(),
        Some(&OrchestratorEvent::PhaseChanged {
            from: OrchestratorPhase::Advancing,
            to: OrchestratorPhase::Done,
        })
    );

    let progress: Vec<OrchestratorEvent> = events
        .into_iter()
        .filter(|e| !matches!(e, OrchestratorEvent::PhaseChanged { .. }))
        .collect();
    assert_eq!(
        progress,
        vec![
            OrchestratorEvent::BatchDispatched {
                batch_id: BatchId::new(0, 1),
                tasks: vec![TaskId::from("a-backend")],
                attempt: 1,
            },
            OrchestratorEvent::BatchHalted {
                batch_id: BatchId::new(0, 1),
                reason: "compile error".to_string(),
                retry_count: 1,
                exhausted: false,
            },
            OrchestratorEvent::BatchDispatched {
                batch_id: BatchId::new(0, 1),
                tasks: vec![TaskId::from("a-backend")],
                attempt: 2,
            },
            OrchestratorEvent::BatchVerified {
                batch_id: BatchId::new(0, 1),
            },
            OrchestratorEvent::LayerAdvanced { layer: 1 },
            OrchestratorEvent::BatchDispatched {
                batch_id: BatchId::new(1, 1),
                tasks: vec![TaskId::from("b-backend")],
                attempt: 1,
            },
            OrchestratorEvent::BatchVerified {
                batch_id: BatchId::new(1, 1),
            },
            OrchestratorEvent::LayerAdvanced { layer: 2 },
        ]
    );
}

#[tokio::test]
async fn test_command_gate_blocks_batch() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::new();
    let gate = GateConfig {
        kind: GateKind::Command,
        command: Some("test \"$PLANWRIGHT_BATCH\" != L0-B1".to_string()),
        ..GateConfig::default()
    }
    .build(Some(workspace.temp_dir.path().to_path_buf()))
    .unwrap();
    let mut orch = Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        executor.clone(),
        gate,
        workspace.settings(),
    )
    .await
    .unwrap();

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    let halt = summary.halt.unwrap();
    assert!(halt.exhausted);
    assert!(halt.reason.contains("exited with code 1"));
    assert_eq!(executor.call_count(), 3);
}

#[tokio::test]
async fn test_step_is_single_phase() {
    let workspace = TestWorkspace::new(SHOP);
    let mut orch = start(&workspace, MockExecutor::new(), Arc::new(AutoGate)).await;

    let phases = [
        OrchestratorPhase::Planning,
        OrchestratorPhase::Dispatching,
        OrchestratorPhase::AwaitingVerification,
        OrchestratorPhase::Advancing,
        // Second batch of layer 0 is still queued.
        OrchestratorPhase::Planning,
        OrchestratorPhase::Dispatching,
    ];
    for expected in phases {
        let summary = orch.step().await.unwrap();
        assert_eq!(summary.phase, expected);
    }
    assert_eq!(orch.state().current_layer, 0);
    assert_eq!(
        orch.state().active_batch.as_ref().map(|b| b.id.clone()),
        Some(BatchId::new(0, 2))
    );
    assert_eq!(status(&orch, "user-accounts-database"), TaskStatus::Completed);
}

#[tokio::test]
async fn test_ctrl_c_interrupts_hung_gate() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::new();
    let mut orch = start(&workspace, executor.clone(), Arc::new(PendingGate)).await;
    let token = orch.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(2), orch.run())
        .await
        .expect("run stops once cancelled")
        .unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    assert_eq!(summary.halt.unwrap().reason, Error::Cancelled.to_string());
    assert_eq!(executor.call_count(), 1);
    assert_eq!(status(&orch, "a-backend"), TaskStatus::Failed);

    let saved = ExecutionState::load_sync(&workspace.checkpoint_path).unwrap();
    assert_eq!(saved.phase, OrchestratorPhase::Halted);
}

#[tokio::test]
async fn test_gate_timeout_is_retried() {
    let workspace = TestWorkspace::new(TWO_FEATURES);
    let executor = MockExecutor::new();
    let settings = OrchestratorSettings {
        gate_timeout: Duration::from_millis(30),
        ..workspace.settings()
    };
    let mut orch = Orchestrator::from_spec(
        &workspace.spec_path,
        &TaskDecomposer::default(),
        executor.clone(),
        Arc::new(PendingGate),
        settings,
    )
    .await
    .unwrap();

    let summary = orch.run().await.unwrap();
    assert_eq!(summary.phase, OrchestratorPhase::Halted);
    let halt = summary.halt.unwrap();
    assert!(halt.exhausted);
    assert!(halt.reason.contains("timed out"));
    assert_eq!(executor.call_count(), 3);
}
