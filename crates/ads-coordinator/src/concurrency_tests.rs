use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ads_protocol::{TaskSpec, VerificationSpec};
use ads_store::{Scope, TaskStore};

use crate::coordinator::test_support::ScriptedRunner;
use crate::coordinator::{CoordinatorConfig, TaskCoordinator};
use crate::verify::VerificationContext;

fn spec(task_id: &str, agent: &str) -> TaskSpec {
    TaskSpec {
        task_id: task_id.to_string(),
        parent_task_id: None,
        agent_id: agent.to_string(),
        revision: 1,
        goal: "do the thing".to_string(),
        constraints: Vec::new(),
        deliverables: Vec::new(),
        acceptance_criteria: Vec::new(),
        verification: VerificationSpec::default(),
    }
}

async fn coordinator(runner: Arc<ScriptedRunner>, parallel: usize) -> TaskCoordinator {
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    TaskCoordinator::new(
        CoordinatorConfig {
            max_parallel_delegations: parallel,
            ..Default::default()
        },
        Scope::new("ws", "sess"),
        store,
        runner,
        VerificationContext {
            enabled: false,
            ..Default::default()
        },
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn same_agent_send_intervals_are_disjoint() {
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(80)));
    runner.script("claude", ScriptedRunner::submitted_result("one"));
    runner.script("claude", ScriptedRunner::submitted_result("two"));
    let coordinator = Arc::new(coordinator(runner.clone(), 4).await);

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute_one(spec("t-1", "claude"), None).await })
    };
    let second = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute_one(spec("t-2", "claude"), None).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let intervals = runner.intervals.lock().unwrap();
    assert_eq!(intervals.len(), 2);
    let (_, start_a, end_a) = &intervals[0];
    let (_, start_b, end_b) = &intervals[1];
    let overlap = (*start_a).max(*start_b) < (*end_a).min(*end_b);
    assert!(!overlap, "same-agent invocations must not overlap");
}

#[tokio::test]
async fn different_agents_do_overlap() {
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(120)));
    runner.script("claude", ScriptedRunner::submitted_result("a"));
    runner.script("codex2", ScriptedRunner::submitted_result("b"));
    let coordinator = Arc::new(coordinator(runner.clone(), 4).await);

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute_one(spec("t-1", "claude"), None).await })
    };
    let second = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute_one(spec("t-2", "codex2"), None).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let intervals = runner.intervals.lock().unwrap();
    assert_eq!(intervals.len(), 2);
    let (_, start_a, end_a) = &intervals[0];
    let (_, start_b, end_b) = &intervals[1];
    let overlap = (*start_a).max(*start_b) < (*end_a).min(*end_b);
    assert!(overlap, "distinct agents should run concurrently");
}
