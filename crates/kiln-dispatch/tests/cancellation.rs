//! Cancellation from every task state.

mod common;

use common::*;
use kiln_core::{Resolution, TaskState};
use kiln_dispatch::DispatchError;

#[tokio::test]
async fn cancelling_running_task_releases_load_even_if_node_refuses() {
    let h = HarnessBuilder::new().node("n1", 2).build();
    h.node("n1").on_status(OnStatus::Run).fail_cancels();

    h.dispatcher.submit(request("t1")).await.unwrap();
    h.wait_for("t1", TaskState::Running).await;
    assert_eq!(h.load("n1"), 1);

    h.dispatcher.cancel("t1").await.unwrap();

    let task = h.dispatcher.get_status("t1").await.unwrap();
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(h.load("n1"), 0);
    assert_eq!(h.node("n1").cancel_count(), 1);
    assert_eq!(task.assignments().len(), 1);
    assert_eq!(task.assignments()[0].resolution, Some(Resolution::Cancelled));

    let stored = h.store.list_assignments("t1").unwrap();
    assert_eq!(stored[0].resolution, Some(Resolution::Cancelled));
}

#[tokio::test]
async fn second_cancel_reports_already_terminal_without_side_effects() {
    let h = HarnessBuilder::new().node("n1", 2).build();
    h.node("n1").on_status(OnStatus::Run);
    h.dispatcher.submit(request("t1")).await.unwrap();
    h.wait_for("t1", TaskState::Running).await;

    h.dispatcher.cancel("t1").await.unwrap();
    for _ in 0..2 {
        let err = h.dispatcher.cancel("t1").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::AlreadyTerminal {
                state: TaskState::Cancelled,
                ..
            }
        ));
    }

    assert_eq!(h.node("n1").cancel_count(), 1);
    assert_eq!(h.load("n1"), 0);
    let task = h.dispatcher.get_status("t1").await.unwrap();
    assert_eq!(task.assignments().len(), 1);
}

#[tokio::test]
async fn cancelling_queued_task_never_touches_a_node() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.node("n1").on_status(OnStatus::Run);

    h.dispatcher.submit(request("busy")).await.unwrap();
    h.wait_for("busy", TaskState::Running).await;
    h.dispatcher.submit(request("waiting")).await.unwrap();

    h.dispatcher.cancel("waiting").await.unwrap();

    let task = h.dispatcher.get_status("waiting").await.unwrap();
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(task.assignments().is_empty());
    assert_eq!(h.node("n1").submit_count(), 1);
    assert_eq!(h.node("n1").cancel_count(), 0);
    assert_eq!(h.load("n1"), 1);
    assert_eq!(h.state("busy").await, TaskState::Running);
}

#[tokio::test]
async fn cancel_during_hanging_submit_settles_as_cancelled() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.node("n1").on_submit(OnSubmit::Hang);

    h.dispatcher.submit(request("t1")).await.unwrap();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while h.node("n1").submit_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    h.dispatcher.cancel("t1").await.unwrap();
    assert_eq!(h.state("t1").await, TaskState::Cancelled);
    assert_eq!(h.load("n1"), 0);
}

#[tokio::test]
async fn cancelling_completed_task_is_already_terminal() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    h.dispatcher.submit(request("t1")).await.unwrap();
    h.wait_for("t1", TaskState::Completed).await;

    let err = h.dispatcher.cancel("t1").await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::AlreadyTerminal {
            state: TaskState::Completed,
            ..
        }
    ));
    assert_eq!(h.node("n1").cancel_count(), 0);
    assert_eq!(h.load("n1"), 0);
}

#[tokio::test]
async fn cancelling_unknown_task_is_not_found() {
    let h = HarnessBuilder::new().node("n1", 1).build();
    assert!(matches!(
        h.dispatcher.cancel("ghost").await,
        Err(DispatchError::NotFound(id)) if id == "ghost"
    ));
}

#[tokio::test]
async fn shutdown_cancels_tasks_still_waiting_for_intake() {
    let h = HarnessBuilder::new().node("n1", 4).build();
    for i in 0..5 {
        h.dispatcher.submit(request(&format!("t{i}"))).await.unwrap();
    }
    h.dispatcher.shutdown();

    for i in 0..5 {
        let task = h.wait_terminal(&format!("t{i}")).await;
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.assignments().is_empty());
    }
    assert_eq!(h.node("n1").submit_count(), 0);
    assert!(matches!(
        h.dispatcher.submit(request("late")).await,
        Err(DispatchError::ShuttingDown)
    ));
}
