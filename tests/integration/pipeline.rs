//! Spec → tasks → layers → batches, without executing anything.

use std::collections::HashMap;

use planwright::context::{ContextBudget, ContextManager};
use planwright::core::{Complexity, Domain, Task, TaskId, TaskStatus};
use planwright::orchestration::{ExecutionState, Plan};
use planwright::planning::{
    validate_batch, validate_layer, Batch, BatchId, BatchOptimizer, TaskDecomposer,
    MAX_BATCH_MINUTES,
};
use planwright::prompt::PromptBuilder;
use planwright::spec::{SpecParser, SpecWriter};
use planwright::Error;

use crate::fixtures::*;

fn plan(spec: &str) -> Plan {
    let doc = SpecParser::new().parse(spec).unwrap();
    Plan::from_document(doc, &TaskDecomposer::default()).unwrap()
}

fn ids(layer: &[TaskId]) -> Vec<&str> {
    layer.iter().map(|id| id.as_str()).collect()
}

fn task<'a>(plan: &'a Plan, id: &str) -> &'a Task {
    plan.tasks
        .iter()
        .find(|t| t.id.as_str() == id)
        .unwrap_or_else(|| panic!("no task {}", id))
}

#[test]
fn test_written_spec_parses_back_identically() {
    let parser = SpecParser::new();
    let writer = SpecWriter::new();

    let first = parser.parse(SHOP).unwrap();
    let rendered = writer.render(&first);
    let second = parser.parse(&rendered).unwrap();

    assert_eq!(second, first);
    assert_eq!(writer.render(&second), rendered);
}

#[test]
fn test_bold_text_survives_rewrite() {
    let parser = SpecParser::new();
    let first = parser.parse(BOLD_MARKUP).unwrap();
    let secrets = &first.features[0];
    assert_eq!(
        secrets.description,
        "**Important** intro text More in **bold**"
    );
    assert_eq!(
        secrets.requirements,
        vec![
            "Store secrets in **encrypted** columns",
            "**Rotate** keys nightly"
        ]
    );
    assert_eq!(
        secrets.acceptance_criteria,
        vec!["**Must** reject plaintext writes"]
    );
    assert_eq!(secrets.status.as_deref(), Some("Planned"));

    let second = parser.parse(&SpecWriter::new().render(&first)).unwrap();
    assert_eq!(second, first);
}

#[test]
fn test_dependent_feature_lands_in_later_layer() {
    let plan = plan(TWO_FEATURES);
    let layers = plan.graph.layers();

    assert_eq!(layers.len(), 2);
    assert_eq!(ids(&layers[0]), vec!["a-backend"]);
    assert_eq!(ids(&layers[1]), vec!["b-backend"]);
    assert!(plan
        .graph
        .has_dependency(&TaskId::from("a-backend"), &TaskId::from("b-backend")));
}

#[test]
fn test_shop_decomposition_and_layers() {
    let plan = plan(SHOP);

    assert_eq!(plan.tasks.len(), 9);
    let layers = plan.graph.layers();
    assert_eq!(layers.len(), 8);
    assert_eq!(ids(&layers[0]), vec!["docs-site-docs", "user-accounts-database"]);
    assert_eq!(ids(&layers[1]), vec!["user-accounts-frontend"]);
    assert_eq!(ids(&layers[2]), vec!["catalog-database"]);
    assert_eq!(ids(&layers[7]), vec!["checkout-test"]);

    // Every task of a dependent feature waits on every task upstream.
    let catalog_db = task(&plan, "catalog-database");
    assert!(catalog_db
        .dependencies
        .contains(&TaskId::from("user-accounts-database")));
    assert!(catalog_db
        .dependencies
        .contains(&TaskId::from("user-accounts-frontend")));

    for id in ["checkout-database", "checkout-backend", "checkout-test"] {
        assert_eq!(task(&plan, id).complexity, Complexity::Critical, "{}", id);
    }
    assert_eq!(task(&plan, "catalog-backend").complexity, Complexity::Simple);
    assert_eq!(task(&plan, "docs-site-docs").domain, Domain::Docs);
}

#[test]
fn test_acceptance_criteria_follow_domain() {
    let plan = plan(SHOP);
    assert_eq!(
        task(&plan, "user-accounts-database").acceptance_criteria,
        vec!["Users table enforces unique email"]
    );
    assert_eq!(
        task(&plan, "user-accounts-frontend").acceptance_criteria,
        vec!["Profile page shows the user name"]
    );
}

#[test]
fn test_every_layer_is_covered_by_valid_batches() {
    let plan = plan(SHOP);
    let lookup: HashMap<&TaskId, &Task> = plan.tasks.iter().map(|t| (&t.id, t)).collect();
    let batches = plan.preview_batches().unwrap();
    assert_eq!(batches.len(), plan.graph.layers().len());

    for (layer, layer_batches) in plan.graph.layers().iter().zip(&batches) {
        validate_layer(layer, layer_batches).unwrap();

        let mut covered: Vec<TaskId> = layer_batches
            .iter()
            .flat_map(|b| b.tasks.iter().cloned())
            .collect();
        covered.sort();
        assert_eq!(&covered, layer);

        for batch in layer_batches {
            validate_batch(batch, &lookup).unwrap();
            assert!(batch.total_estimated_minutes <= MAX_BATCH_MINUTES);
            assert!(batch.len() <= batch.max_complexity.batch_capacity());
        }
    }

    // Layer 0 mixes domains, so it splits.
    let first = &batches[0];
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].id, BatchId::new(0, 1));
    assert_eq!(first[0].domain, Domain::Database);
    assert_eq!(first[1].id, BatchId::new(0, 2));
    assert_eq!(first[1].domain, Domain::Docs);
}

#[test]
fn test_payment_and_schema_work_batches_alone() {
    let plan = plan(BILLING);
    let batches = plan.preview_batches().unwrap();

    assert_eq!(batches.len(), 2);
    for layer in &batches {
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].len(), 1);
        assert_eq!(layer[0].max_complexity, Complexity::Critical);
    }
    assert_eq!(batches[0][0].tasks, vec![TaskId::from("billing-database")]);
    assert_eq!(batches[1][0].tasks, vec![TaskId::from("billing-backend")]);
    assert_eq!(batches[0][0].total_estimated_minutes, 120);
}

#[test]
fn test_critical_tasks_in_one_layer_split() {
    let plan = plan(
        "# Project\n## Features\n\
         ### Payments\nRequirements:\n- Payment endpoint\n\
         ### Login\nRequirements:\n- Auth endpoint\n",
    );
    let batches = plan.preview_batches().unwrap();

    assert_eq!(batches.len(), 1);
    let tasks: Vec<Vec<TaskId>> = batches[0].iter().map(|b| b.tasks.clone()).collect();
    assert_eq!(
        tasks,
        vec![
            vec![TaskId::from("login-backend")],
            vec![TaskId::from("payments-backend")]
        ]
    );
}

#[test]
fn test_simple_tasks_fill_batches_of_three() {
    let plan = plan(
        "# Project\n## Features\n\
         ### A\nRequirements:\n- API endpoint\n\
         ### B\nRequirements:\n- API endpoint\n\
         ### C\nRequirements:\n- API endpoint\n\
         ### D\nRequirements:\n- API endpoint\n",
    );
    let layer = &plan.preview_batches().unwrap()[0];

    assert_eq!(layer.len(), 2);
    assert_eq!(
        layer[0].tasks,
        vec![
            TaskId::from("a-backend"),
            TaskId::from("b-backend"),
            TaskId::from("c-backend")
        ]
    );
    assert_eq!(layer[0].total_estimated_minutes, 180);
    assert_eq!(layer[1].tasks, vec![TaskId::from("d-backend")]);
}

#[test]
fn test_validate_batch_rejects_hand_built_batches() {
    let plan = plan(SHOP);
    let lookup: HashMap<&TaskId, &Task> = plan.tasks.iter().map(|t| (&t.id, t)).collect();

    let mixed = Batch {
        id: BatchId::new(0, 1),
        domain: Domain::Database,
        tasks: vec![
            TaskId::from("user-accounts-database"),
            TaskId::from("docs-site-docs"),
        ],
        total_estimated_minutes: 120,
        max_complexity: Complexity::Simple,
        complexity_weight: 2,
    };
    assert!(matches!(
        validate_batch(&mixed, &lookup),
        Err(Error::InvalidBatch { .. })
    ));

    let empty = Batch {
        tasks: Vec::new(),
        total_estimated_minutes: 0,
        ..mixed.clone()
    };
    assert!(matches!(validate_batch(&empty, &lookup), Err(Error::EmptyBatch)));

    let over_capacity = Batch {
        id: BatchId::new(5, 1),
        domain: Domain::Database,
        tasks: vec![TaskId::from("checkout-database"), TaskId::from("catalog-database")],
        total_estimated_minutes: 180,
        max_complexity: Complexity::Critical,
        complexity_weight: 5,
    };
    assert!(matches!(
        validate_batch(&over_capacity, &lookup),
        Err(Error::InvalidBatch { .. })
    ));

    // Coverage gap across the layer.
    let layer = plan.graph.layers()[0].clone();
    let only_db = BatchOptimizer::new()
        .optimize(0, &layer[1..], &plan.tasks)
        .unwrap();
    assert!(matches!(
        validate_layer(&layer, &only_db),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_cycle_is_reported_with_its_path() {
    let doc = SpecParser::new().parse(CYCLIC).unwrap();
    match Plan::from_document(doc, &TaskDecomposer::default()) {
        Err(Error::CyclicDependency { cycle }) => {
            assert!(cycle.len() >= 4);
            assert_eq!(cycle.first(), cycle.last());
            for id in ["a-backend", "b-backend", "c-backend"] {
                assert!(cycle.contains(&TaskId::from(id)), "{} missing from cycle", id);
            }
        }
        other => panic!("expected a cycle, got {:?}", other.map(|p| p.tasks.len())),
    }
}

#[test]
fn test_parse_errors() {
    let parser = SpecParser::new();

    assert!(matches!(
        parser.parse(MALFORMED),
        Err(Error::MalformedSpec { .. })
    ));

    match parser.parse(UNKNOWN_DEPENDENCY) {
        Err(Error::UnknownDependency { feature, reference }) => {
            assert_eq!(feature, "a");
            assert_eq!(reference, "Ghost");
        }
        other => panic!("expected unknown dependency, got {:?}", other),
    }

    match parser.parse(DUPLICATE_IDS) {
        Err(Error::DuplicateFeatureId { id }) => assert_eq!(id, "same"),
        other => panic!("expected duplicate id, got {:?}", other),
    }
}

#[test]
fn test_context_and_prompt_for_downstream_batch() {
    let plan = plan(SHOP);
    let mut state = ExecutionState::new(None, plan.features, plan.tasks, &plan.graph);
    for (id, summary) in [
        ("docs-site-docs", "setup guide written"),
        ("user-accounts-database", "users table created"),
        ("user-accounts-frontend", "profile page done"),
    ] {
        state.task_mut(&TaskId::from(id)).unwrap().complete(summary);
    }
    state.refresh_readiness();
    assert_eq!(
        state.task(&TaskId::from("catalog-database")).unwrap().status,
        TaskStatus::Ready
    );

    let batches = BatchOptimizer::new()
        .optimize(2, &state.graph_layers[2], &state.tasks)
        .unwrap();
    let batch = &batches[0];

    let (context, warning) = ContextManager::new(ContextBudget::default())
        .build(batch, &state, &plan.graph)
        .unwrap();
    assert!(warning.is_none());
    let upstream: Vec<&str> = context
        .included_dependencies
        .keys()
        .map(|id| id.as_str())
        .collect();
    assert_eq!(upstream, vec!["user-accounts-database", "user-accounts-frontend"]);
    assert_eq!(context.transitive_dependency_count, 0);
    assert!(context.token_estimate <= 4000);

    let members: Vec<&Task> = batch
        .tasks
        .iter()
        .map(|id| state.task(id).unwrap())
        .collect();
    let prompt = PromptBuilder::new().build(batch, &members, &context).unwrap();
    assert_eq!(prompt.stop_marker, "BATCH_COMPLETE: L2-B1");
    assert!(prompt.text.contains("[catalog-database]"));
    assert!(prompt.text.contains("user-accounts-frontend: profile page done"));
    assert!(prompt.text.trim_end().ends_with("BATCH_COMPLETE: L2-B1"));
}

#[test]
fn test_context_over_budget_is_flagged() {
    let plan = plan(SHOP);
    let state = ExecutionState::new(None, plan.features, plan.tasks, &plan.graph);
    let batch = &BatchOptimizer::new()
        .optimize(0, &state.graph_layers[0], &state.tasks)
        .unwrap()[0];

    let tight = ContextBudget {
        budget_tokens: 1,
        ..ContextBudget::default()
    };
    let (context, warning) = ContextManager::new(tight)
        .build(batch, &state, &plan.graph)
        .unwrap();
    let warning = warning.expect("payload cannot fit in one token");
    assert_eq!(warning.batch_id, batch.id);
    assert_eq!(warning.budget, 1);
    assert_eq!(warning.token_estimate, context.token_estimate);
    assert!(warning.token_estimate > 1);
}
