//! The per-task owner.
//!
//! One owner future runs per submitted task and is the only code that
//! mutates that task. It loops over attempts until the task is terminal:
//!
//! 1. select a node; with none eligible, wait for a released slot or the
//!    requeue backoff and select again;
//! 2. reserve a slot lease; losing the race to another owner
//!    (`CapacityExceeded`) goes straight back to selection;
//! 3. submit; a failed submission releases the slot and fails the attempt;
//! 4. poll the node job until it is terminal, releasing the slot when it
//!    is; repeated poll failures presume the job lost.
//!
//! Every failed attempt consumes one unit of retry budget. Load is
//! released exactly once per reserved slot on every path out of an
//! attempt, cancellation included. Releases go through the lease, so a
//! slot taken on a node that was since removed and re-added is never
//! returned to the new node's counter.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kiln_balancer::BalancerError;
use kiln_core::{NodeId, NodeSnapshot, Resolution, Task, TaskState};
use kiln_node::{JobState, JobStatusReport, NodeClient, SubmitRequest, with_timeout};
use kiln_registry::{RegistryError, SlotLease};
use kiln_state::TaskRecord;

use crate::dispatcher::Shared;
use crate::error::{DispatchError, DispatchResult};
use crate::event::TaskEvent;
use crate::intake::Pending;

/// How one attempt ended.
enum AttemptEnd {
    Completed,
    Cancelled,
    /// The attempt failed; its slot is released and its ledger row closed.
    Failed(DispatchError),
}

pub(crate) struct TaskOwner {
    shared: Arc<Shared>,
    task: Task,
    tx: watch::Sender<Task>,
    token: CancellationToken,
    /// Nodes on which an attempt of this task failed.
    failed_on: HashSet<NodeId>,
    /// The slot held by the current attempt.
    lease: Option<SlotLease>,
    published: TaskState,
}

impl TaskOwner {
    pub(crate) fn new(shared: Arc<Shared>, pending: Pending) -> Self {
        let published = pending.task.state();
        Self {
            shared,
            task: pending.task,
            tx: pending.tx,
            token: pending.token,
            failed_on: HashSet::new(),
            lease: None,
            published,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self.drive().await {
            error!(task_id = %self.task.id, error = %e, "task owner aborted");
            self.abort(e);
        }
    }

    async fn drive(&mut self) -> DispatchResult<()> {
        loop {
            let Some((node, lease)) = self.reserve_node().await else {
                return self.cancel_queued();
            };
            self.lease = Some(lease);

            let end = self.attempt(&node).await?;
            let err = match end {
                AttemptEnd::Completed | AttemptEnd::Cancelled => return Ok(()),
                AttemptEnd::Failed(err) => err,
            };

            self.task.retries += 1;
            self.task.last_error = Some(err.to_string());
            if self.shared.policy.failover {
                self.failed_on.insert(node.id.clone());
            }

            if self.task.retries > self.shared.policy.max_retries {
                let exhausted = DispatchError::RetryBudgetExhausted {
                    attempts: self.task.attempts(),
                    last_error: err.to_string(),
                };
                error!(task_id = %self.task.id, attempts = self.task.attempts(), error = %err, "task failed");
                self.task.last_error = Some(exhausted.to_string());
                self.task.transition(TaskState::Failed)?;
                self.publish();
                return Ok(());
            }

            warn!(
                task_id = %self.task.id,
                node_id = %node.id,
                retries = self.task.retries,
                max_retries = self.shared.policy.max_retries,
                error = %err,
                "attempt failed; requeueing"
            );
            if self.task.state() != TaskState::Queued {
                self.task.transition(TaskState::Queued)?;
            }
            self.publish();

            tokio::select! {
                _ = tokio::time::sleep(self.shared.settings.requeue_backoff) => {}
                _ = self.token.cancelled() => {}
            }
        }
    }

    /// Select a node and reserve one of its slots. `None` once the task
    /// is cancelled; no slot is held in that case.
    async fn reserve_node(&self) -> Option<(NodeSnapshot, SlotLease)> {
        let no_avoid = HashSet::new();
        let avoid = if self.shared.policy.failover {
            &self.failed_on
        } else {
            &no_avoid
        };

        loop {
            if self.token.is_cancelled() {
                return None;
            }

            let nodes = self.shared.registry.snapshot();
            let node = match self.shared.balancer.select(&self.task.job_kind, &nodes, avoid) {
                Ok(node) => node,
                Err(BalancerError::NoEligibleNode { .. }) => {
                    debug!(task_id = %self.task.id, job_kind = %self.task.job_kind, "no eligible node; waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(self.shared.settings.requeue_backoff) => {}
                        _ = self.shared.registry.capacity_released() => {}
                        _ = self.token.cancelled() => return None,
                    }
                    continue;
                }
            };

            let lease = match self.shared.registry.reserve(&node.id) {
                Ok(lease) => lease,
                Err(RegistryError::CapacityExceeded { .. }) => {
                    debug!(task_id = %self.task.id, node_id = %node.id, "lost slot race; reselecting");
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => {
                    debug!(task_id = %self.task.id, node_id = %node.id, error = %e, "slot reservation failed; reselecting");
                    continue;
                }
            };

            if self.token.is_cancelled() {
                if let Err(e) = self.shared.registry.release(lease) {
                    warn!(task_id = %self.task.id, node_id = %node.id, error = %e, "failed to release load slot");
                }
                return None;
            }
            return Some((node, lease));
        }
    }

    /// Run one attempt on `node`, whose slot is already reserved.
    async fn attempt(&mut self, node: &NodeSnapshot) -> DispatchResult<AttemptEnd> {
        let row = self.task.open_assignment(&node.id)?.clone();
        if let Err(e) = self.shared.store.open_assignment(&row) {
            error!(task_id = %self.task.id, attempt = row.attempt, error = %e, "failed to record assignment");
        }
        info!(task_id = %self.task.id, node_id = %node.id, attempt = row.attempt, "attempt started");

        let client = self.shared.clients.client_for(&node.id, &node.address);
        let request = SubmitRequest {
            job_kind: self.task.job_kind.clone(),
            parameters: self.task.parameters.clone(),
            client_ref: Some(self.task.id.clone()),
        };

        let submitted = with_timeout(
            "submit",
            self.shared.settings.submit_timeout,
            client.submit(&request),
        )
        .await;
        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(e) => {
                let err = DispatchError::from_node(&node.id, e);
                self.release();
                self.resolve(Resolution::Failed, Some(err.to_string()))?;
                return Ok(AttemptEnd::Failed(err));
            }
        };

        self.task.set_node_job_id(&job_id)?;
        if let Some(row) = self.task.active_assignment() {
            if let Err(e) = self.shared.store.annotate_assignment(row) {
                error!(task_id = %self.task.id, error = %e, "failed to record node job id");
            }
        }
        self.task.transition(TaskState::Assigned)?;
        self.publish();
        debug!(task_id = %self.task.id, node_id = %node.id, %job_id, "job submitted");

        if self.token.is_cancelled() {
            return self.cancel_active(&node.id, client.as_ref(), &job_id).await;
        }
        self.supervise(&node.id, client.as_ref(), &job_id).await
    }

    /// Poll the node job until it ends, the node is presumed lost, or the
    /// task is cancelled.
    async fn supervise(
        &mut self,
        node_id: &str,
        client: &dyn NodeClient,
        job_id: &str,
    ) -> DispatchResult<AttemptEnd> {
        let settings = self.shared.settings.clone();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                _ = self.token.cancelled() => {
                    return self.cancel_active(node_id, client, job_id).await;
                }
            }

            let polled = with_timeout("status", settings.poll_timeout, client.status(job_id)).await;
            let report = match polled {
                Ok(report) => report,
                Err(e) => {
                    failures += 1;
                    debug!(task_id = %self.task.id, %node_id, failures, error = %e, "status poll failed");
                    if failures < settings.max_poll_failures {
                        continue;
                    }

                    if settings.late_result_check {
                        let late =
                            with_timeout("status", settings.poll_timeout, client.status(job_id))
                                .await;
                        if let Ok(report) = late {
                            info!(task_id = %self.task.id, %node_id, state = ?report.state, "node answered late status check");
                            failures = 0;
                            match self.apply_report(node_id, report)? {
                                Some(end) => return Ok(end),
                                None => continue,
                            }
                        }
                    }

                    warn!(task_id = %self.task.id, %node_id, failures, "node lost mid-job; reassigning");
                    let err = DispatchError::from_node(node_id, e);
                    self.release();
                    self.resolve(Resolution::Reassigned, Some(err.to_string()))?;
                    return Ok(AttemptEnd::Failed(err));
                }
            };

            failures = 0;
            if let Some(end) = self.apply_report(node_id, report)? {
                return Ok(end);
            }
        }
    }

    /// Fold a node status report into the task. `Some` when the attempt
    /// has ended.
    fn apply_report(
        &mut self,
        node_id: &str,
        report: JobStatusReport,
    ) -> DispatchResult<Option<AttemptEnd>> {
        if report.progress.is_some() {
            self.task.progress = report.progress;
        }

        match report.state {
            JobState::Queued => {
                self.publish();
                Ok(None)
            }
            JobState::Running => {
                self.mark_running()?;
                self.publish();
                Ok(None)
            }
            JobState::Completed => {
                self.release();
                self.mark_running()?;
                self.resolve(Resolution::Completed, None)?;
                self.task.result = report.result;
                self.task.last_error = None;
                self.task.transition(TaskState::Completed)?;
                self.publish();
                info!(task_id = %self.task.id, %node_id, attempts = self.task.attempts(), "task completed");
                Ok(Some(AttemptEnd::Completed))
            }
            JobState::Failed => {
                let err = DispatchError::JobFailed {
                    node_id: node_id.to_string(),
                    reason: report
                        .error
                        .unwrap_or_else(|| "node reported failure".to_string()),
                };
                self.release();
                self.resolve(Resolution::Failed, Some(err.to_string()))?;
                Ok(Some(AttemptEnd::Failed(err)))
            }
        }
    }

    fn mark_running(&mut self) -> DispatchResult<()> {
        if self.task.state() == TaskState::Assigned {
            self.task.transition(TaskState::Running)?;
            self.publish();
            info!(task_id = %self.task.id, "task running");
        }
        Ok(())
    }

    /// Best-effort node cancel, then unconditional slot release.
    async fn cancel_active(
        &mut self,
        node_id: &str,
        client: &dyn NodeClient,
        job_id: &str,
    ) -> DispatchResult<AttemptEnd> {
        let cancelled = with_timeout(
            "cancel",
            self.shared.settings.cancel_timeout,
            client.cancel(job_id),
        )
        .await;
        if let Err(e) = cancelled {
            warn!(task_id = %self.task.id, %node_id, error = %e, "node cancel failed; releasing slot anyway");
        }
        self.release();
        self.resolve(Resolution::Cancelled, None)?;
        self.task.transition(TaskState::Cancelled)?;
        self.publish();
        info!(task_id = %self.task.id, %node_id, "task cancelled");
        Ok(AttemptEnd::Cancelled)
    }

    fn cancel_queued(&mut self) -> DispatchResult<()> {
        self.task.transition(TaskState::Cancelled)?;
        self.publish();
        info!(task_id = %self.task.id, "queued task cancelled");
        Ok(())
    }

    /// Last-resort cleanup after an internal error: close the open
    /// attempt, free its slot, and fail the task.
    fn abort(&mut self, cause: DispatchError) {
        self.release();
        if self.task.active_assignment().is_some() {
            let _ = self.resolve(Resolution::Failed, Some(cause.to_string()));
        }
        self.task.last_error = Some(cause.to_string());
        if !self.task.state().is_terminal() && self.task.transition(TaskState::Failed).is_ok() {
            self.publish();
        }
    }

    /// Give back the current attempt's slot, if one is still held.
    fn release(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let node_id = lease.node_id().to_string();
        match self.shared.registry.release(lease) {
            Ok(_) => {}
            Err(RegistryError::StaleLease { .. }) => {
                debug!(task_id = %self.task.id, %node_id, "node removed since reservation; nothing to release");
            }
            Err(e) => {
                warn!(task_id = %self.task.id, %node_id, error = %e, "failed to release load slot");
            }
        }
    }

    fn resolve(&mut self, resolution: Resolution, error: Option<String>) -> DispatchResult<()> {
        let row = self.task.resolve_assignment(resolution, error)?;
        if let Err(e) = self.shared.store.resolve_assignment(row) {
            error!(task_id = %row.task_id, attempt = row.attempt, error = %e, "failed to record resolution");
        }
        Ok(())
    }

    /// Persist, expose to readers, and emit an event on state change.
    fn publish(&mut self) {
        if let Err(e) = self.shared.store.put_task(&TaskRecord::from(&self.task)) {
            error!(task_id = %self.task.id, error = %e, "failed to persist task");
        }
        self.tx.send_replace(self.task.clone());
        if self.task.state() != self.published {
            self.published = self.task.state();
            // No subscribers is fine.
            let _ = self.shared.events.send(TaskEvent::from_task(&self.task));
        }
    }
}
