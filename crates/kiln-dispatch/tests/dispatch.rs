//! Dispatch happy paths, capacity handling, and node eligibility.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::*;
use kiln_balancer::Strategy;
use kiln_core::{HealthSettings, NodeStatus, Resolution, TaskState};
use kiln_dispatch::{DispatchError, TaskEvent};
use kiln_health::HealthMonitor;

#[tokio::test]
async fn task_runs_to_completion_and_releases_its_slot() {
    let h = HarnessBuilder::new().node("n1", 2).build();
    h.node("n1").on_status(OnStatus::Run);
    let mut events = h.dispatcher.subscribe();

    let task_id = h.dispatcher.submit(request("t1")).await.unwrap();
    assert_eq!(task_id, "t1");

    h.wait_for("t1", TaskState::Running).await;
    assert_eq!(h.load("n1"), 1);
    let running = h.dispatcher.get_status("t1").await.unwrap();
    assert_eq!(running.progress, Some(0.5));

    h.node("n1").on_status(OnStatus::Complete);
    let task = h.wait_for("t1", TaskState::Completed).await;
    assert_eq!(task.result, Some(serde_json::json!({ "node": "n1" })));
    assert_eq!(task.retries, 0);
    assert_eq!(h.load("n1"), 0);

    let rows = task.assignments();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].node_id, "n1");
    assert_eq!(rows[0].resolution, Some(Resolution::Completed));
    assert!(rows[0].node_job_id.is_some());

    let states: Vec<TaskState> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e: TaskEvent| e.state)
        .collect();
    assert_eq!(
        states,
        vec![
            TaskState::Queued,
            TaskState::Assigned,
            TaskState::Running,
            TaskState::Completed
        ]
    );
}

#[tokio::test]
async fn ledger_is_written_to_the_store() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.dispatcher.submit(request("t1")).await.unwrap();
    h.wait_for("t1", TaskState::Completed).await;

    let rows = h.store.list_assignments("t1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].resolution, Some(Resolution::Completed));
    assert!(rows[0].resolved_at.is_some());

    let record = h.store.get_task("t1").unwrap().unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts, 1);

    let node = h.store.get_node("n1").unwrap().unwrap();
    assert_eq!(node.node.current_load, 0);
}

#[tokio::test]
async fn single_slot_node_serialises_two_tasks() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.node("n1").on_status(OnStatus::Run);

    h.dispatcher.submit(request("first")).await.unwrap();
    h.wait_for("first", TaskState::Running).await;
    h.dispatcher.submit(request("second")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = h.dispatcher.get_status("second").await.unwrap();
    assert_eq!(second.state(), TaskState::Queued);
    assert_eq!(second.attempts(), 0);
    assert_eq!(second.retries, 0);
    assert_eq!(h.load("n1"), 1);

    h.node("n1").on_status(OnStatus::Complete);
    h.wait_for("first", TaskState::Completed).await;
    let second = h.wait_for("second", TaskState::Completed).await;
    assert_eq!(second.assignments()[0].node_id, "n1");
    assert_eq!(second.retries, 0);
    assert_eq!(h.load("n1"), 0);
}

#[tokio::test]
async fn load_never_exceeds_capacity_under_contention() {
    let h = Arc::new(
        HarnessBuilder::new()
            .node("n1", 2)
            .node("n2", 1)
            .node("n3", 3)
            .strategy(Strategy::round_robin())
            .build(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let h = h.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                for node in h.registry.snapshot() {
                    assert!(
                        node.current_load <= node.max_concurrent,
                        "{} at {}/{}",
                        node.id,
                        node.current_load,
                        node.max_concurrent
                    );
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    for i in 0..30 {
        h.dispatcher.submit(request(&format!("t{i}"))).await.unwrap();
    }
    for i in 0..30 {
        let task = h.wait_terminal(&format!("t{i}")).await;
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.retries, 0);
    }

    stop.store(true, Ordering::SeqCst);
    sampler.await.unwrap();
    assert_eq!(h.total_load(), 0);
}

#[tokio::test]
async fn no_eligible_node_keeps_task_queued_without_spending_budget() {
    let h = HarnessBuilder::new().node("n1", 1).max_retries(0).build();
    let mut video = request("render");
    video.job_kind = "video".to_string();
    h.dispatcher.submit(video).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = h.dispatcher.get_status("render").await.unwrap();
    assert_eq!(task.state(), TaskState::Queued);
    assert_eq!(task.retries, 0);
    assert!(task.assignments().is_empty());

    // A capable node joins at runtime.
    h.registry
        .register(descriptor("gpu", 1, &["video"]))
        .unwrap();
    h.registry.record_heartbeat("gpu", NodeStatus::Online).unwrap();

    let task = h.wait_for("render", TaskState::Completed).await;
    assert_eq!(task.assignments()[0].node_id, "gpu");
}

#[tokio::test]
async fn nodes_out_of_rotation_are_never_selected() {
    let h = HarnessBuilder::new().node("a", 4).node("b", 4).node("c", 4).build();
    for id in ["a", "b", "c"] {
        h.node(id).on_status(OnStatus::Run);
    }
    h.registry.update_status("a", NodeStatus::Busy).unwrap();
    h.registry.set_maintenance("b", true).unwrap();

    for i in 0..4 {
        h.dispatcher.submit(request(&format!("t{i}"))).await.unwrap();
    }
    for i in 0..4 {
        let task = h.wait_for(&format!("t{i}"), TaskState::Running).await;
        assert_eq!(task.assignments()[0].node_id, "c");
    }
    assert_eq!(h.load("a"), 0);
    assert_eq!(h.load("b"), 0);
    assert_eq!(h.load("c"), 4);
}

#[tokio::test]
async fn node_failing_heartbeats_is_skipped_until_it_recovers() {
    let h = HarnessBuilder::new().node("n1", 4).node("n2", 4).build();
    let monitor = HealthMonitor::new(
        h.registry.clone(),
        h.clients.clone(),
        HealthSettings {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(50),
        },
    );
    monitor.start().await;

    h.node("n1").set_healthy(false);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.registry.get("n1").unwrap().status != NodeStatus::Offline {
        assert!(tokio::time::Instant::now() < deadline, "n1 never went offline");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Least-loaded would prefer n1 on id; it must not be chosen.
    for i in 0..3 {
        let id = format!("while-down-{i}");
        h.dispatcher.submit(request(&id)).await.unwrap();
        let task = h.wait_for(&id, TaskState::Completed).await;
        assert_eq!(task.assignments()[0].node_id, "n2");
    }
    assert_eq!(h.node("n1").submit_count(), 0);

    h.node("n1").set_healthy(true);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.registry.get("n1").unwrap().status != NodeStatus::Online {
        assert!(tokio::time::Instant::now() < deadline, "n1 never recovered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.dispatcher.submit(request("after")).await.unwrap();
    let task = h.wait_for("after", TaskState::Completed).await;
    assert_eq!(task.assignments()[0].node_id, "n1");
    monitor.stop_all().await;
}

#[tokio::test]
async fn duplicate_and_invalid_submissions_are_refused() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.dispatcher.submit(request("t1")).await.unwrap();

    assert!(matches!(
        h.dispatcher.submit(request("t1")).await,
        Err(DispatchError::DuplicateTask(id)) if id == "t1"
    ));
    assert!(matches!(
        h.dispatcher.submit(request("  ")).await,
        Err(DispatchError::InvalidTask(_))
    ));
    let mut no_kind = request("t2");
    no_kind.job_kind = String::new();
    assert!(matches!(
        h.dispatcher.submit(no_kind).await,
        Err(DispatchError::InvalidTask(_))
    ));
    assert!(matches!(
        h.dispatcher.get_status("missing").await,
        Err(DispatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn archive_only_accepts_terminal_tasks() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.node("n1").on_status(OnStatus::Run);
    h.dispatcher.submit(request("t1")).await.unwrap();
    h.wait_for("t1", TaskState::Running).await;

    assert!(matches!(
        h.dispatcher.archive("t1").await,
        Err(DispatchError::NotTerminal { state: TaskState::Running, .. })
    ));

    h.node("n1").on_status(OnStatus::Complete);
    h.wait_for("t1", TaskState::Completed).await;
    let archived = h.dispatcher.archive("t1").await.unwrap();
    assert_eq!(archived.state(), TaskState::Completed);

    assert!(matches!(
        h.dispatcher.get_status("t1").await,
        Err(DispatchError::NotFound(_))
    ));
    // History survives in the audit store.
    let rows = h.dispatcher.assignments("t1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(matches!(
        h.dispatcher.assignments("never-seen").await,
        Err(DispatchError::NotFound(_))
    ));

    // The id is free again.
    h.dispatcher.submit(request("t1")).await.unwrap();
}

#[tokio::test]
async fn list_nodes_reflects_registry() {
    let h = HarnessBuilder::new()
        .node("n1", 1)
        .descriptor(descriptor("n2", 2, &["video"]))
        .build();
    let all = h.dispatcher.list_nodes(None, None);
    assert_eq!(all.len(), 2);
    let video = h.dispatcher.list_nodes(Some("video"), Some(NodeStatus::Online));
    assert_eq!(video.len(), 1);
    assert_eq!(video[0].id, "n2");
}

#[tokio::test]
async fn at_most_one_open_assignment_while_reassigning() {
    let h = HarnessBuilder::new()
        .node("n1", 1)
        .node("n2", 1)
        .node("n3", 1)
        .max_retries(3)
        .build();
    h.node("n1").on_status(OnStatus::Unreachable);
    h.node("n2").on_submit(OnSubmit::Reject);

    h.dispatcher.submit(request("t1")).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let task = loop {
        let task = h.dispatcher.get_status("t1").await.unwrap();
        let open = task.assignments().iter().filter(|a| a.is_open()).count();
        assert!(open <= 1, "{open} open assignments");
        if task.state().is_terminal() {
            break task;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(1)).await;
    };

    assert_eq!(task.state(), TaskState::Completed);
    let nodes: Vec<&str> = task.assignments().iter().map(|a| a.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["n1", "n2", "n3"]);
    assert_eq!(h.total_load(), 0);
}

#[tokio::test]
async fn release_after_node_is_removed_and_re_added_leaves_new_load_alone() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.node("n1").on_status(OnStatus::Run);

    h.dispatcher.submit(request("t1")).await.unwrap();
    h.wait_for("t1", TaskState::Running).await;

    h.registry.reload(vec![]).unwrap();
    h.registry.reload(vec![descriptor("n1", 1, &["image"])]).unwrap();
    h.registry.record_heartbeat("n1", NodeStatus::Online).unwrap();

    h.dispatcher.submit(request("t2")).await.unwrap();
    h.wait_for("t2", TaskState::Running).await;
    assert_eq!(h.load("n1"), 1);

    // t1's slot belonged to the removed node; cancelling it must not free
    // the slot t2 holds on the new one.
    h.dispatcher.cancel("t1").await.unwrap();
    h.wait_for("t1", TaskState::Cancelled).await;
    assert_eq!(h.load("n1"), 1);

    h.dispatcher.submit(request("t3")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let t3 = h.dispatcher.get_status("t3").await.unwrap();
    assert_eq!(t3.state(), TaskState::Queued);
    assert_eq!(h.node("n1").submit_count(), 2);
}
