//! Readiness, ordering, and dispatch scenarios.

use foreman::{PlanTask, SessionId, TaskGraph, TaskId, TaskStatus, TestPolicy};

use crate::fixtures::plan;

fn graph_of(specs: &[PlanTask]) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for task in specs {
        graph
            .add_plan_task(task, SessionId::new("main"))
            .expect("add plan task");
    }
    graph.recompute_readiness();
    graph
}

fn complete(graph: &mut TaskGraph, id: &str) {
    let id = TaskId::new(id);
    graph.transition(&id, TaskStatus::Dispatched, "test").unwrap();
    graph.transition(&id, TaskStatus::InProgress, "test").unwrap();
    graph.transition(&id, TaskStatus::Completed, "test").unwrap();
    graph.recompute_readiness();
}

#[test]
fn dependent_becomes_dispatchable_only_after_dependency_completes() {
    let mut graph = graph_of(&[plan("t1", &[]), plan("t2", &["t1"])]);

    let candidates: Vec<String> = graph
        .dispatch_candidates()
        .iter()
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(candidates, vec!["T1"]);

    complete(&mut graph, "t1");
    let candidates: Vec<String> = graph
        .dispatch_candidates()
        .iter()
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(candidates, vec!["T2"]);
}

#[test]
fn readiness_invariant_holds_for_any_completion_order() {
    // Diamond: d depends on b and c, both depend on a.
    let specs = [
        plan("a", &[]),
        plan("b", &["a"]),
        plan("c", &["a"]),
        plan("d", &["b", "c"]),
    ];
    for order in [["b", "c"], ["c", "b"]] {
        let mut graph = graph_of(&specs);
        complete(&mut graph, "a");
        for id in order {
            assert!(graph
                .dispatch_candidates()
                .iter()
                .all(|t| t.id.as_str() != "D"));
            complete(&mut graph, id);
        }
        let candidates: Vec<String> = graph
            .dispatch_candidates()
            .iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(candidates, vec!["D"], "order {:?}", order);
    }
}

#[test]
fn dependents_are_exact_inverse_of_dependencies() {
    let graph = graph_of(&[
        plan("a", &[]),
        plan("b", &["a"]),
        plan("c", &["a", "b"]),
    ]);
    let a = graph.get(&TaskId::new("a")).unwrap();
    assert_eq!(
        a.dependents,
        vec![TaskId::new("b"), TaskId::new("c")]
    );
    let b = graph.get(&TaskId::new("b")).unwrap();
    assert_eq!(b.dependents, vec![TaskId::new("c")]);
    let c = graph.get(&TaskId::new("c")).unwrap();
    assert!(c.dependents.is_empty());
}

#[test]
fn dispatch_order_respects_priority_then_insertion() {
    let mut graph = graph_of(&[plan("t1", &[]), plan("t2", &[]), plan("t3", &[])]);
    // Lower priority number dispatches first.
    graph.get_mut(&TaskId::new("t3")).unwrap().priority = 0;
    let candidates: Vec<String> = graph
        .dispatch_candidates()
        .iter()
        .map(|t| t.id.to_string())
        .collect();
    assert_eq!(candidates, vec!["T3", "T1", "T2"]);
}

#[test]
fn cycle_rejected_at_ingestion() {
    let mut graph = TaskGraph::new();
    graph
        .add_plan_task(&plan("a", &["b"]), SessionId::new("main"))
        .unwrap();
    let err = graph.add_plan_task(&plan("b", &["a"]), SessionId::new("main"));
    assert!(err.is_err());
    // The failed insert left no partial state behind.
    assert!(graph.get(&TaskId::new("b")).is_none());
}

#[test]
fn invalid_transition_leaves_task_untouched() {
    let mut graph = graph_of(&[plan("t1", &[])]);
    let id = TaskId::new("t1");
    let before = graph.get(&id).unwrap().clone();
    assert!(graph
        .transition(&id, TaskStatus::Completed, "test")
        .is_err());
    let after = graph.get(&id).unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.updated_at, before.updated_at);
}

#[test]
fn test_policy_inference_is_deterministic() {
    let cases = [
        ("Refactor the inventory manager", TestPolicy::CompileOnly),
        ("Polish the pause menu layout", TestPolicy::ManualVerify),
        ("Add physics to the player movement", TestPolicy::PlayModeTest),
        ("Implement the save system serializer", TestPolicy::UnitTests),
    ];
    for (description, expected) in cases {
        for _ in 0..3 {
            assert_eq!(
                TaskGraph::infer_test_policy(description),
                expected,
                "{}",
                description
            );
        }
    }
}
