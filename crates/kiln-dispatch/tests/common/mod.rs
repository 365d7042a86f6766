//! Scripted worker nodes and a dispatcher harness.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kiln_balancer::{LoadBalancer, Strategy};
use kiln_core::{
    DispatchSettings, NodeDescriptor, NodeMetadata, NodeStatus, Task, TaskRequest, TaskState,
};
use kiln_dispatch::{Dispatcher, RetryPolicy};
use kiln_node::{
    HealthReport, JobState, JobStatusReport, NodeClient, NodeClients, NodeConnector, NodeError,
    NodeResult, ReportedHealth, SubmitRequest,
};
use kiln_registry::NodeRegistry;
use kiln_state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSubmit {
    Accept,
    Reject,
    Unreachable,
    /// Never answers; only the submit timeout ends the call.
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnStatus {
    /// Jobs report `running` forever.
    Run,
    /// Jobs report `completed` on the first poll.
    Complete,
    /// Jobs report `failed` on the first poll.
    Fail,
    /// Status calls fail at the network level.
    Unreachable,
    /// The first `n` status calls fail, then jobs report `completed`.
    UnreachableThenComplete(u32),
}

struct Script {
    submit: OnSubmit,
    status: OnStatus,
    healthy: bool,
    cancel_fails: bool,
}

/// In-process stand-in for a worker node.
pub struct MockNode {
    pub id: String,
    script: Mutex<Script>,
    jobs: AtomicU32,
    pub submits: AtomicUsize,
    pub polls: AtomicU32,
    pub cancels: AtomicUsize,
}

impl MockNode {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(Script {
                submit: OnSubmit::Accept,
                status: OnStatus::Complete,
                healthy: true,
                cancel_fails: false,
            }),
            jobs: AtomicU32::new(0),
            submits: AtomicUsize::new(0),
            polls: AtomicU32::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn on_submit(&self, behaviour: OnSubmit) -> &Self {
        self.script.lock().unwrap().submit = behaviour;
        self
    }

    pub fn on_status(&self, behaviour: OnStatus) -> &Self {
        self.script.lock().unwrap().status = behaviour;
        self
    }

    pub fn set_healthy(&self, healthy: bool) -> &Self {
        self.script.lock().unwrap().healthy = healthy;
        self
    }

    pub fn fail_cancels(&self) -> &Self {
        self.script.lock().unwrap().cancel_fails = true;
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn submit(&self, _request: &SubmitRequest) -> NodeResult<String> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.script.lock().unwrap().submit;
        match behaviour {
            OnSubmit::Accept => {
                let n = self.jobs.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{}-job-{n}", self.id))
            }
            OnSubmit::Reject => Err(NodeError::Rejected {
                status: 503,
                reason: "engine busy".to_string(),
            }),
            OnSubmit::Unreachable => Err(NodeError::Unreachable("connection refused".to_string())),
            OnSubmit::Hang => std::future::pending().await,
        }
    }

    async fn status(&self, _node_job_id: &str) -> NodeResult<JobStatusReport> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.script.lock().unwrap().status;
        let completed = || JobStatusReport {
            state: JobState::Completed,
            progress: Some(1.0),
            result: Some(serde_json::json!({ "node": self.id })),
            error: None,
        };
        match behaviour {
            OnStatus::Run => Ok(JobStatusReport {
                progress: Some(0.5),
                ..JobStatusReport::new(JobState::Running)
            }),
            OnStatus::Complete => Ok(completed()),
            OnStatus::Fail => Ok(JobStatusReport {
                error: Some("out of memory".to_string()),
                ..JobStatusReport::new(JobState::Failed)
            }),
            OnStatus::Unreachable => Err(NodeError::Unreachable("connection reset".to_string())),
            OnStatus::UnreachableThenComplete(n) if poll < n => {
                Err(NodeError::Unreachable("connection reset".to_string()))
            }
            OnStatus::UnreachableThenComplete(_) => Ok(completed()),
        }
    }

    async fn health(&self) -> NodeResult<HealthReport> {
        if self.script.lock().unwrap().healthy {
            Ok(HealthReport {
                status: ReportedHealth::Ok,
                load: None,
            })
        } else {
            Err(NodeError::Unreachable("connection refused".to_string()))
        }
    }

    async fn cancel(&self, _node_job_id: &str) -> NodeResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.script.lock().unwrap().cancel_fails {
            Err(NodeError::Rejected {
                status: 500,
                reason: "cancel not supported".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Hands out the scripted node for known ids and a fresh, well-behaved
/// node for ids registered later.
pub struct MockConnector {
    nodes: HashMap<String, Arc<MockNode>>,
}

impl NodeConnector for MockConnector {
    fn connect(&self, node_id: &str, _address: &str) -> Arc<dyn NodeClient> {
        match self.nodes.get(node_id) {
            Some(node) => node.clone(),
            None => MockNode::new(node_id),
        }
    }
}

pub fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        submit_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_millis(30),
        cancel_timeout: Duration::from_millis(30),
        max_poll_failures: 3,
        requeue_backoff: Duration::from_millis(10),
        late_result_check: false,
    }
}

pub fn descriptor(id: &str, max_concurrent: u32, capabilities: &[&str]) -> NodeDescriptor {
    NodeDescriptor {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 9000,
        max_concurrent,
        capabilities: capabilities
            .iter()
            .map(|c| c.to_string())
            .collect::<BTreeSet<_>>(),
        metadata: NodeMetadata::default(),
    }
}

pub fn request(id: &str) -> TaskRequest {
    TaskRequest {
        id: id.to_string(),
        job_kind: "image".to_string(),
        priority: 0,
        parameters: serde_json::json!({ "prompt": id }),
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub registry: Arc<NodeRegistry>,
    pub clients: Arc<NodeClients>,
    pub store: StateStore,
    pub nodes: HashMap<String, Arc<MockNode>>,
}

impl Harness {
    pub fn node(&self, id: &str) -> &Arc<MockNode> {
        &self.nodes[id]
    }

    pub fn load(&self, node_id: &str) -> u32 {
        self.registry.get(node_id).unwrap().current_load
    }

    pub fn total_load(&self) -> u32 {
        self.registry.snapshot().iter().map(|n| n.current_load).sum()
    }

    pub async fn state(&self, task_id: &str) -> TaskState {
        self.dispatcher.get_status(task_id).await.unwrap().state()
    }

    /// Poll until the task reaches `state`, panicking after a few seconds.
    pub async fn wait_for(&self, task_id: &str, state: TaskState) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.dispatcher.get_status(task_id).await.unwrap();
            if task.state() == state {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {task_id} stuck in {} waiting for {state}", task.state());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_terminal(&self, task_id: &str) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.dispatcher.get_status(task_id).await.unwrap();
            if task.state().is_terminal() {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {task_id} stuck in {}", task.state());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub struct HarnessBuilder {
    nodes: Vec<NodeDescriptor>,
    strategy: Strategy,
    policy: RetryPolicy,
    settings: DispatchSettings,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            strategy: Strategy::LeastLoaded,
            policy: RetryPolicy {
                max_retries: 3,
                failover: true,
            },
            settings: fast_settings(),
        }
    }

    pub fn node(mut self, id: &str, max_concurrent: u32) -> Self {
        self.nodes.push(descriptor(id, max_concurrent, &["image"]));
        self
    }

    pub fn descriptor(mut self, descriptor: NodeDescriptor) -> Self {
        self.nodes.push(descriptor);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn failover(mut self, failover: bool) -> Self {
        self.policy.failover = failover;
        self
    }

    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build with every node online.
    pub fn build(self) -> Harness {
        let nodes: HashMap<String, Arc<MockNode>> = self
            .nodes
            .iter()
            .map(|d| (d.id.clone(), MockNode::new(&d.id)))
            .collect();

        let store = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(
            NodeRegistry::new(self.nodes)
                .unwrap()
                .with_store(store.clone()),
        );
        for node in registry.snapshot() {
            registry.record_heartbeat(&node.id, NodeStatus::Online).unwrap();
        }

        let clients = Arc::new(NodeClients::new(Arc::new(MockConnector {
            nodes: nodes.clone(),
        })));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            clients.clone(),
            store.clone(),
            LoadBalancer::new(self.strategy),
            self.policy,
            self.settings,
        );

        Harness {
            dispatcher,
            registry,
            clients,
            store,
            nodes,
        }
    }
}
