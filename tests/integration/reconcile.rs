//! Plan re-ingestion scenarios: the three-way merge between an edited plan
//! and the live task store.

use foreman::core::graph::ConflictReason;
use foreman::{PlanTask, SessionId, TaskGraph, TaskId, TaskStage, TaskStatus};

use crate::fixtures::plan;

fn session() -> SessionId {
    SessionId::new("main")
}

#[test]
fn same_plan_twice_is_idempotent() {
    let mut graph = TaskGraph::new();
    let plan_tasks = vec![plan("t1", &[]), plan("t2", &["t1"]), plan("t3", &["t2"])];

    let first = graph.reconcile(&plan_tasks, session(), false).unwrap();
    assert_eq!(first.created.len(), 3);
    assert!(first.updated.is_empty());
    assert!(first.deleted.is_empty());

    let second = graph.reconcile(&plan_tasks, session(), false).unwrap();
    assert!(second.is_empty(), "second pass should be a no-op: {:?}", second);
}

#[test]
fn edited_inert_task_is_updated_in_place() {
    let mut graph = TaskGraph::new();
    graph
        .reconcile(&[plan("t1", &[]), plan("t2", &["t1"])], session(), false)
        .unwrap();

    let mut edited = plan("t2", &["t1"]);
    edited.description = "rewritten t2 work item".to_string();
    let diff = graph
        .reconcile(&[plan("t1", &[]), edited], session(), false)
        .unwrap();

    assert_eq!(diff.updated, vec![TaskId::new("t2")]);
    assert_eq!(
        graph.get(&TaskId::new("t2")).unwrap().description,
        "rewritten t2 work item"
    );
}

#[test]
fn edited_active_task_is_deferred_and_reported() {
    let mut graph = TaskGraph::new();
    graph.reconcile(&[plan("t1", &[])], session(), false).unwrap();
    let id = TaskId::new("t1");
    graph.transition(&id, TaskStatus::Dispatched, "test").unwrap();
    graph.transition(&id, TaskStatus::InProgress, "test").unwrap();

    let mut edited = plan("t1", &[]);
    edited.description = "changed while running".to_string();
    let diff = graph.reconcile(&[edited], session(), false).unwrap();

    assert_eq!(diff.conflicts.len(), 1);
    assert_eq!(diff.conflicts[0].reason, ConflictReason::ActiveTaskEdited);
    let task = graph.get(&id).unwrap();
    assert_eq!(task.stage, TaskStage::Deferred);
    // The in-flight work was not silently replaced.
    assert_ne!(task.description, "changed while running");
}

#[test]
fn orphaned_in_progress_task_survives_and_conflicts() {
    // Store has T5 in progress; the new plan dropped it.
    let mut graph = TaskGraph::new();
    graph
        .reconcile(&[plan("t4", &[]), plan("t5", &[])], session(), false)
        .unwrap();
    let t5 = TaskId::new("t5");
    graph.transition(&t5, TaskStatus::Dispatched, "test").unwrap();
    graph.transition(&t5, TaskStatus::InProgress, "test").unwrap();

    let diff = graph.reconcile(&[plan("t4", &[])], session(), false).unwrap();
    assert!(diff.deleted.is_empty());
    assert_eq!(diff.conflicts.len(), 1);
    assert_eq!(diff.conflicts[0].id, t5);
    assert_eq!(diff.conflicts[0].reason, ConflictReason::ActiveTaskOrphaned);
    assert!(graph.get(&t5).is_some(), "active orphan retained");
}

#[test]
fn force_deletes_active_orphans() {
    let mut graph = TaskGraph::new();
    graph
        .reconcile(&[plan("t4", &[]), plan("t5", &[])], session(), false)
        .unwrap();
    let t5 = TaskId::new("t5");
    graph.transition(&t5, TaskStatus::Dispatched, "test").unwrap();

    let diff = graph.reconcile(&[plan("t4", &[])], session(), true).unwrap();
    assert_eq!(diff.deleted, vec![t5.clone()]);
    assert!(graph.get(&t5).is_none());
}

#[test]
fn completed_orphans_are_preserved_silently() {
    let mut graph = TaskGraph::new();
    graph.reconcile(&[plan("t1", &[])], session(), false).unwrap();
    let id = TaskId::new("t1");
    graph.transition(&id, TaskStatus::Dispatched, "test").unwrap();
    graph.transition(&id, TaskStatus::InProgress, "test").unwrap();
    graph.transition(&id, TaskStatus::Completed, "test").unwrap();

    let diff = graph.reconcile(&[plan("t2", &[])], session(), false).unwrap();
    assert!(diff.conflicts.is_empty());
    assert!(diff.deleted.is_empty());
    assert!(graph.get(&id).is_some());
}

#[test]
fn inert_orphans_are_deleted() {
    let mut graph = TaskGraph::new();
    graph
        .reconcile(&[plan("t1", &[]), plan("t2", &[])], session(), false)
        .unwrap();

    let diff = graph.reconcile(&[plan("t1", &[])], session(), false).unwrap();
    assert_eq!(diff.deleted, vec![TaskId::new("t2")]);
    assert!(graph.get(&TaskId::new("t2")).is_none());
}

#[test]
fn plan_with_cycle_is_rejected_without_mutation() {
    let mut graph = TaskGraph::new();
    graph.reconcile(&[plan("t1", &[])], session(), false).unwrap();

    let bad = vec![plan("a", &["b"]), plan("b", &["a"])];
    assert!(graph.reconcile(&bad, session(), false).is_err());
    // The store kept its previous shape.
    assert_eq!(graph.len(), 1);
    assert!(graph.get(&TaskId::new("t1")).is_some());
}

#[test]
fn readiness_recomputed_after_reconcile() {
    let mut graph = TaskGraph::new();
    graph
        .reconcile(&[plan("t1", &[]), plan("t2", &["t1"])], session(), false)
        .unwrap();
    assert_eq!(graph.get(&TaskId::new("t1")).unwrap().status, TaskStatus::Ready);
    assert_eq!(graph.get(&TaskId::new("t2")).unwrap().status, TaskStatus::Created);

    // Dropping the dependency edge frees t2 on the next reconcile.
    let diff = graph
        .reconcile(&[plan("t1", &[]), plan("t2", &[])], session(), false)
        .unwrap();
    assert_eq!(diff.updated, vec![TaskId::new("t2")]);
    assert_eq!(graph.get(&TaskId::new("t2")).unwrap().status, TaskStatus::Ready);
}
