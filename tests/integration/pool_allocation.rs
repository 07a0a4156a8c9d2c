//! Agent pool contention scenarios.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use foreman::{AgentPool, AgentState, WorkflowId};

fn pool_of(n: usize) -> Arc<AgentPool> {
    let names: Vec<String> = ["Alex", "Betty", "Cleo", "Dany", "Eddy"]
        .iter()
        .take(n)
        .map(|s| s.to_string())
        .collect();
    let (tx, mut rx) = mpsc::channel(256);
    // Drain events in the background so the channel never fills.
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    Arc::new(AgentPool::new(&names, tx))
}

#[tokio::test]
async fn exhausted_pool_suspends_second_workflow_until_release() {
    let pool = pool_of(2);
    let wf_a = WorkflowId::new();
    let wf_b = WorkflowId::new();

    let first = pool.acquire(&wf_a, "implementer").await.unwrap();
    let second = pool.acquire(&wf_a, "implementer").await.unwrap();
    assert_eq!(pool.available_count().await, 0);

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire(&wf_b, "reviewer").await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished(), "workflow B should be suspended");

    pool.release(&first).await.unwrap();
    let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter resolved")
        .unwrap()
        .unwrap();
    // B got exactly the agent A released.
    assert_eq!(granted, first);
    match pool.state_of(&granted).await.unwrap() {
        AgentState::Busy { workflow, role } => {
            assert_eq!(workflow, wf_b);
            assert_eq!(role, "reviewer");
        }
        other => panic!("expected busy under B, got {:?}", other),
    }

    // Conservation: the other agent is still A's, nothing duplicated.
    assert_eq!(pool.size().await, 2);
    assert_eq!(pool.allocated_to(&wf_a).await, 1);
    assert_eq!(pool.allocated_to(&wf_b).await, 1);
    let _ = second;
}

#[tokio::test]
async fn conservation_invariant_under_concurrent_churn() {
    let pool = pool_of(3);
    let mut handles = Vec::new();
    for _ in 0..6 {
        let p = pool.clone();
        handles.push(tokio::spawn(async move {
            let wf = WorkflowId::new();
            for _ in 0..10 {
                let agent = p.acquire(&wf, "worker").await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                p.release(&agent).await.unwrap();
            }
        }));
    }
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("churn worker finished")
            .unwrap();
    }

    let snapshot = pool.snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.iter().all(|r| r.state == AgentState::Available));
}

#[tokio::test]
async fn benched_agents_survive_shrink_and_stay_owned() {
    let pool = pool_of(3);
    let wf = WorkflowId::new();
    let agent = pool.acquire(&wf, "implementer").await.unwrap();
    pool.demote_to_bench(&agent).await.unwrap();

    let size = pool.resize(1).await;
    assert_eq!(size, 1, "only the benched agent survives");
    assert!(matches!(
        pool.state_of(&agent).await.unwrap(),
        AgentState::Benched { .. }
    ));

    // And it still promotes back for its own workflow.
    pool.promote_to_busy(&agent, &wf, "tester").await.unwrap();
    pool.release_all(&wf).await;
    assert_eq!(pool.available_count().await, 1);
}
