//! The caller-facing dispatcher and its intake loop.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use kiln_balancer::LoadBalancer;
use kiln_core::{
    Assignment, BalancerSettings, DispatchSettings, NodeSnapshot, NodeStatus, Task, TaskId,
    TaskRequest, TaskState,
};
use kiln_node::NodeClients;
use kiln_registry::NodeRegistry;
use kiln_state::{StateStore, TaskRecord};

use crate::error::{DispatchError, DispatchResult};
use crate::event::TaskEvent;
use crate::intake::Pending;
use crate::owner::TaskOwner;

const EVENT_CAPACITY: usize = 1024;

/// Retry behaviour shared by every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// A task gets `max_retries + 1` attempts.
    pub max_retries: u32,
    /// Retries avoid nodes that already failed the task when possible.
    pub failover: bool,
}

impl From<&BalancerSettings> for RetryPolicy {
    fn from(settings: &BalancerSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            failover: settings.failover,
        }
    }
}

/// Collaborators every task owner reads.
pub(crate) struct Shared {
    pub registry: Arc<NodeRegistry>,
    pub balancer: LoadBalancer,
    pub clients: Arc<NodeClients>,
    pub store: StateStore,
    pub policy: RetryPolicy,
    pub settings: DispatchSettings,
    pub events: broadcast::Sender<TaskEvent>,
}

/// Reader side of a tracked task.
struct TaskHandle {
    snapshot: watch::Receiver<Task>,
    token: CancellationToken,
}

/// Accepts tasks from the job queue and drives each to a terminal state.
pub struct Dispatcher {
    shared: Arc<Shared>,
    tasks: Arc<RwLock<HashMap<TaskId, TaskHandle>>>,
    intake: mpsc::UnboundedSender<Pending>,
    seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its intake loop on the current
    /// tokio runtime.
    pub fn new(
        registry: Arc<NodeRegistry>,
        clients: Arc<NodeClients>,
        store: StateStore,
        balancer: LoadBalancer,
        policy: RetryPolicy,
        settings: DispatchSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            registry,
            balancer,
            clients,
            store,
            policy,
            settings,
            events,
        });

        let (intake, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_intake(Arc::clone(&shared), rx, shutdown.clone()));

        info!(
            strategy = %shared.balancer.strategy(),
            max_retries = policy.max_retries,
            failover = policy.failover,
            "dispatcher started"
        );

        Self {
            shared,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            intake,
            seq: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Accept a task. It starts `queued` and is dispatched in the
    /// background.
    pub async fn submit(&self, request: TaskRequest) -> DispatchResult<TaskId> {
        if request.id.trim().is_empty() {
            return Err(DispatchError::InvalidTask("task id must not be empty".to_string()));
        }
        if request.job_kind.trim().is_empty() {
            return Err(DispatchError::InvalidTask(format!(
                "task {} has no job kind",
                request.id
            )));
        }
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let task = Task::new(request);
        let task_id = task.id.clone();
        let (tx, rx) = watch::channel(task.clone());
        let token = CancellationToken::new();

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(DispatchError::DuplicateTask(task_id));
            }
            tasks.insert(
                task_id.clone(),
                TaskHandle {
                    snapshot: rx,
                    token: token.clone(),
                },
            );
        }

        if let Err(e) = self.shared.store.put_task(&TaskRecord::from(&task)) {
            error!(%task_id, error = %e, "failed to persist task");
        }
        let _ = self.shared.events.send(TaskEvent::from_task(&task));

        let pending = Pending {
            priority: task.priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
            tx,
            token,
        };
        let job_kind = pending.task.job_kind.clone();
        let priority = pending.priority;
        if self.intake.send(pending).is_err() {
            self.tasks.write().await.remove(&task_id);
            return Err(DispatchError::ShuttingDown);
        }

        info!(%task_id, %job_kind, priority, "task accepted");
        Ok(task_id)
    }

    /// Current snapshot of a tracked task.
    pub async fn get_status(&self, task_id: &str) -> DispatchResult<Task> {
        let tasks = self.tasks.read().await;
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;
        Ok(handle.snapshot.borrow().clone())
    }

    /// Cancel a task and wait until its owner has wound it down.
    ///
    /// A queued task is dropped from dispatch. An assigned or running task
    /// gets a best-effort cancel call to its node, and its slot is released
    /// whatever that call returns. A task that is (or ends up) terminal for
    /// another reason yields `AlreadyTerminal`, with no side effects.
    pub async fn cancel(&self, task_id: &str) -> DispatchResult<()> {
        let (mut snapshot, token) = {
            let tasks = self.tasks.read().await;
            let handle = tasks
                .get(task_id)
                .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;
            (handle.snapshot.clone(), handle.token.clone())
        };

        let state = snapshot.borrow().state();
        if state.is_terminal() {
            return Err(DispatchError::AlreadyTerminal {
                task_id: task_id.to_string(),
                state,
            });
        }

        debug!(%task_id, %state, "cancel requested");
        token.cancel();

        let state = snapshot
            .wait_for(|task| task.state().is_terminal())
            .await
            .map(|task| task.state())
            .map_err(|_| DispatchError::ShuttingDown)?;
        match state {
            TaskState::Cancelled => Ok(()),
            state => Err(DispatchError::AlreadyTerminal {
                task_id: task_id.to_string(),
                state,
            }),
        }
    }

    /// Attempt history of a task: live while tracked, from the audit store
    /// once archived.
    pub async fn assignments(&self, task_id: &str) -> DispatchResult<Vec<Assignment>> {
        {
            let tasks = self.tasks.read().await;
            if let Some(handle) = tasks.get(task_id) {
                return Ok(handle.snapshot.borrow().assignments().to_vec());
            }
        }
        let rows = self.shared.store.list_assignments(task_id)?;
        if rows.is_empty() && self.shared.store.get_task(task_id)?.is_none() {
            return Err(DispatchError::NotFound(task_id.to_string()));
        }
        Ok(rows)
    }

    /// Forget a terminal task once the job queue has consumed its result.
    /// Its audit records stay in the store.
    pub async fn archive(&self, task_id: &str) -> DispatchResult<Task> {
        let mut tasks = self.tasks.write().await;
        let state = tasks
            .get(task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?
            .snapshot
            .borrow()
            .state();
        if !state.is_terminal() {
            return Err(DispatchError::NotTerminal {
                task_id: task_id.to_string(),
                state,
            });
        }
        let handle = tasks
            .remove(task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;
        info!(%task_id, %state, "task archived");
        let task = handle.snapshot.borrow().clone();
        Ok(task)
    }

    /// Node snapshots for display, optionally filtered.
    pub fn list_nodes(
        &self,
        capability: Option<&str>,
        status: Option<NodeStatus>,
    ) -> Vec<NodeSnapshot> {
        self.shared.registry.list(capability, status)
    }

    /// Stream of task state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.shared.store
    }

    /// Stop accepting tasks. Owners already running finish on their own;
    /// accepted tasks that have no owner yet are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("dispatcher stopped accepting tasks");
    }
}

/// Start an owner for every submitted task, highest priority first among
/// those waiting together.
async fn run_intake(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Pending>,
    shutdown: CancellationToken,
) {
    let mut ready = BinaryHeap::new();
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                cancel_unstarted(&shared, &mut rx);
                break;
            }
            pending = rx.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
        };
        ready.push(first);
        while let Ok(more) = rx.try_recv() {
            ready.push(more);
        }

        while let Some(pending) = ready.pop() {
            debug!(task_id = %pending.task.id, priority = pending.priority, "starting task owner");
            let owner = TaskOwner::new(Arc::clone(&shared), pending);
            tokio::spawn(owner.run());
        }
    }
    debug!("intake loop stopped");
}

/// Close the intake and hand every task still waiting in it to an owner
/// that finds it already cancelled.
fn cancel_unstarted(shared: &Arc<Shared>, rx: &mut mpsc::UnboundedReceiver<Pending>) {
    rx.close();
    let mut cancelled = 0usize;
    while let Ok(pending) = rx.try_recv() {
        pending.token.cancel();
        let owner = TaskOwner::new(Arc::clone(shared), pending);
        tokio::spawn(owner.run());
        cancelled += 1;
    }
    if cancelled > 0 {
        info!(cancelled, "cancelled tasks accepted before shutdown");
    }
}
