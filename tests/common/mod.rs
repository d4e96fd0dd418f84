//! Shared helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tasker_dag::config::EngineConfig;
use tasker_dag::messaging::InMemoryQueue;
use tasker_dag::orchestration::{handler_fn, StepHandler, WorkflowEngine};
use tasker_dag::store::InMemoryWorkflowStore;
use tasker_dag::worker::TaskWorker;
use tasker_dag::{Run, Workflow};
use uuid::Uuid;

/// Short polls and retry delays so scenarios finish quickly
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.poll_timeout_ms = 20;
    config.worker.poll_interval_ms = 5;
    config.worker.heartbeat_interval_ms = 20;
    config.backoff.base_retry_delay_ms = 5;
    config.backoff.max_retry_delay_ms = 20;
    config
}

/// In-memory engine with the queue and store exposed for inspection
pub struct Harness {
    pub engine: WorkflowEngine,
    pub queue: Arc<InMemoryQueue>,
    pub store: Arc<InMemoryWorkflowStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryWorkflowStore::new(queue.clone()));
        let engine = WorkflowEngine::new(store.clone(), queue.clone(), config);
        Self {
            engine,
            queue,
            store,
        }
    }

    /// Process batches with a single worker until the run is terminal
    pub async fn drive(&self, worker: &TaskWorker, run_id: Uuid) -> Run {
        for _ in 0..500 {
            let run = self.engine.run(run_id).await.unwrap();
            if run.is_terminal() {
                return run;
            }
            worker.process_batch().await.unwrap();
        }
        panic!("run {run_id} did not finish");
    }

    pub async fn start_and_drive(&self, workflow: &Arc<Workflow>, input: Value) -> Run {
        let run_id = self.engine.start(workflow, input).await.unwrap();
        let worker = self.engine.worker(workflow.clone());
        self.drive(&worker, run_id).await
    }
}

pub fn echo() -> impl StepHandler {
    handler_fn(|input| async move { Ok(input) })
}

pub fn constant(value: Value) -> impl StepHandler {
    handler_fn(move |_input| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

pub const SETTLE: Duration = Duration::from_millis(10);
