//! Full workflow execution against the mock runner.

use std::time::Duration;

use foreman::workflow::compile_event_type;
use foreman::{
    ConflictResolution, Error, OccupancyMode, TaskStage, TaskStatus, WorkflowId, WorkflowKind,
    WorkflowRequest, WorkflowStatus,
};
use serde_json::json;

use crate::fixtures::{plan, scratch_cwd, summary_block, Harness, MockRunner};

#[tokio::test]
async fn review_workflow_reads_summary_block_verdict() {
    let harness = Harness::new(
        2,
        vec![MockRunner::ok(&summary_block("approved", "none"))],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;

    let request = WorkflowRequest::new(
        WorkflowKind::ReviewTask,
        vec![task.clone()],
        "review the finished work on T1",
        scratch_cwd(),
    );
    let handle = harness.engine.prepare(&request);
    let summary = harness.engine.execute(&request, &handle).await.unwrap();

    assert_eq!(summary.status, WorkflowStatus::Succeeded);
    // The agent and the occupancy claim were both returned.
    assert_eq!(harness.pool.available_count().await, 2);
    assert!(!harness.occupancy.is_occupied(&task));
    // The prompt carried the summary-block instructions.
    let prompts = harness.runner.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("===TASK_SUMMARY_START==="));
}

#[tokio::test]
async fn implement_workflow_runs_all_phases_and_completes_task() {
    let harness = Harness::new(
        2,
        vec![
            MockRunner::ok(&summary_block("success", "Player.cs, Inventory.cs")),
            MockRunner::ok("running suite... all tests passed"),
            MockRunner::ok(&summary_block("approved", "none")),
        ],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;

    let request = WorkflowRequest::new(
        WorkflowKind::ImplementTask,
        vec![task.clone()],
        "implement T1",
        scratch_cwd(),
    );
    let handle = harness.engine.prepare(&request);

    // Feed the external compile verdict once the engine blocks on it.
    let events = harness.events.clone();
    let event_type = compile_event_type(&handle.id);
    let feeder = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if events.pending(&event_type) > 0 {
                break;
            }
        }
        events.deliver(&event_type, json!({"success": true}));
    });

    let summary = harness.engine.execute(&request, &handle).await.unwrap();
    feeder.await.unwrap();

    assert_eq!(summary.status, WorkflowStatus::Succeeded);
    assert_eq!(summary.progress_percent, 100);

    let graph = harness.graph.lock().await;
    let task = graph.get(&task).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stage, TaskStage::Completed);
    // Files from the summary block were recorded on the task.
    assert!(task
        .files_touched
        .iter()
        .any(|f| f.to_string_lossy().contains("Player.cs")));
}

#[tokio::test]
async fn failed_review_fails_workflow_and_cleans_up() {
    let harness = Harness::new(
        1,
        vec![MockRunner::ok(&summary_block("changes_requested", "none"))],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;

    let request = WorkflowRequest::new(
        WorkflowKind::ReviewTask,
        vec![task.clone()],
        "review",
        scratch_cwd(),
    );
    let handle = harness.engine.prepare(&request);
    let err = harness.engine.execute(&request, &handle).await.unwrap_err();

    assert!(matches!(err, Error::PhaseFailed { .. }));
    assert_eq!(handle.status().await, WorkflowStatus::Failed);
    assert_eq!(handle.summary().await.last_error.as_deref().map(|e| e.is_empty()), Some(false));
    assert_eq!(harness.pool.available_count().await, 1);
    assert!(!harness.occupancy.is_occupied(&task));
    let graph = harness.graph.lock().await;
    assert!(!graph.get(&task).unwrap().errors.is_empty());
}

#[tokio::test]
async fn queued_workflow_proceeds_after_holder_releases() {
    let harness = Harness::new(
        2,
        vec![MockRunner::ok(&summary_block("approved", "none"))],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;

    let holder = WorkflowId::new();
    harness
        .occupancy
        .declare(&task, &holder, OccupancyMode::Exclusive)
        .unwrap();

    let request = WorkflowRequest::new(
        WorkflowKind::ReviewTask,
        vec![task.clone()],
        "review",
        scratch_cwd(),
    );
    let handle = harness.engine.prepare(&request);

    let occupancy = harness.occupancy.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        occupancy.release_workflow(&holder);
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        harness.engine.execute(&request, &handle),
    )
    .await
    .expect("workflow finished")
    .unwrap();
    assert_eq!(summary.status, WorkflowStatus::Succeeded);
    // The queueing left an auditable conflict record.
    assert!(harness
        .occupancy
        .conflict_log()
        .iter()
        .any(|c| c.task == task));
}

#[tokio::test]
async fn abort_if_occupied_cancels_instead_of_queueing() {
    let harness = Harness::new(
        2,
        vec![MockRunner::ok(&summary_block("approved", "none"))],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;
    harness
        .occupancy
        .declare(&task, &WorkflowId::new(), OccupancyMode::Exclusive)
        .unwrap();

    let request = WorkflowRequest::new(
        WorkflowKind::ReviewTask,
        vec![task],
        "review",
        scratch_cwd(),
    )
    .with_conflict_resolution(ConflictResolution::AbortIfOccupied);
    let handle = harness.engine.prepare(&request);

    let err = harness.engine.execute(&request, &handle).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowCancelled(_)));
    assert_eq!(handle.status().await, WorkflowStatus::Cancelled);
    assert_eq!(harness.pool.available_count().await, 2);
}

#[tokio::test]
async fn cancellation_before_start_releases_nothing_and_reports_cancelled() {
    let harness = Harness::new(
        1,
        vec![MockRunner::ok(&summary_block("approved", "none"))],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;
    let request = WorkflowRequest::new(
        WorkflowKind::ReviewTask,
        vec![task],
        "review",
        scratch_cwd(),
    );
    let handle = harness.engine.prepare(&request);
    handle.cancel();

    let err = harness.engine.execute(&request, &handle).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowCancelled(_)));
    assert_eq!(handle.status().await, WorkflowStatus::Cancelled);
    assert!(harness.runner.prompts().is_empty(), "no phase ran");
    assert_eq!(harness.pool.available_count().await, 1);
}

#[tokio::test]
async fn compile_fix_loop_stops_after_three_iterations() {
    let harness = Harness::new(
        2,
        vec![
            MockRunner::ok(&summary_block("success", "none")), // implement
            MockRunner::ok(&summary_block("success", "none")), // fix 1
            MockRunner::ok(&summary_block("success", "none")), // fix 2
            MockRunner::ok(&summary_block("success", "none")), // fix 3
        ],
    );
    let task = harness.seed_dispatched(&[plan("t1", &[])], "t1").await;
    let request = WorkflowRequest::new(
        WorkflowKind::ImplementTask,
        vec![task],
        "implement",
        scratch_cwd(),
    );
    let handle = harness.engine.prepare(&request);

    let events = harness.events.clone();
    let event_type = compile_event_type(&handle.id);
    let feeder = tokio::spawn(async move {
        for _ in 0..4 {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if events.pending(&event_type) > 0 {
                    break;
                }
            }
            events.deliver(
                &event_type,
                json!({"success": false, "errors": ["CS1002: ; expected"]}),
            );
        }
    });

    let err = harness.engine.execute(&request, &handle).await.unwrap_err();
    feeder.await.unwrap();
    match err {
        Error::PhaseFailed { phase, .. } => assert_eq!(phase, "compile_check"),
        other => panic!("expected PhaseFailed, got {:?}", other),
    }
    // One implement run plus exactly three fix runs.
    assert_eq!(harness.runner.prompts().len(), 4);
}
