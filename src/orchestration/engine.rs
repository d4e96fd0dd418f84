//! # Workflow Engine
//!
//! Facade wiring a store, a queue and configuration together. Callers start runs,
//! read run state and spawn workers through it; workers in other processes only need
//! an engine built over the same database.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::run_initializer::RunInitializer;
use super::step_result_processor::StepResultProcessor;
use crate::config::EngineConfig;
use crate::database::DatabaseConnection;
use crate::error::{EngineError, Result};
use crate::messaging::{DurableQueue, InMemoryQueue, PgmqClient};
use crate::models::{Run, StepDependency, StepState, Task, Worker};
use crate::store::{InMemoryWorkflowStore, PgWorkflowStore, WorkflowStore};
use crate::worker::{TaskWorker, WorkerHandle};
use crate::workflow::Workflow;

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn DurableQueue>,
    config: Arc<EngineConfig>,
    initializer: RunInitializer,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("queue_provider", &self.queue.provider_name())
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn DurableQueue>,
        config: EngineConfig,
    ) -> Self {
        let initializer = RunInitializer::new(store.clone(), queue.clone(), config.queue.clone());
        Self {
            store,
            queue,
            config: Arc::new(config),
            initializer,
        }
    }

    /// Everything in process memory; state is lost on exit
    pub fn in_memory(config: EngineConfig) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryWorkflowStore::new(queue.clone()));
        Self::new(store, queue, config)
    }

    /// PostgreSQL + pgmq over an existing pool
    pub fn with_pool(pool: PgPool, config: EngineConfig) -> Self {
        let queue = Arc::new(PgmqClient::new_with_pool(pool.clone()));
        let store = Arc::new(PgWorkflowStore::new(pool));
        Self::new(store, queue, config)
    }

    /// Validate configuration, connect, migrate if enabled
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let connection = DatabaseConnection::new(&config.database).await?;
        info!(
            max_connections = config.database.max_connections,
            "✅ Connected to workflow database"
        );
        Ok(Self::with_pool(connection.into_pool(), config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.queue
    }

    pub fn queue_name_for(&self, workflow: &Workflow) -> String {
        self.initializer.queue_name_for(workflow)
    }

    /// Persist a new run and publish its root tasks
    pub async fn start(&self, workflow: &Workflow, input: Value) -> Result<Uuid> {
        Ok(self.initializer.start(workflow, input).await?.run_id)
    }

    pub async fn run(&self, run_id: Uuid) -> Result<Run> {
        self.store
            .run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn step_states(&self, run_id: Uuid) -> Result<Vec<StepState>> {
        Ok(self.store.step_states(run_id).await?)
    }

    pub async fn step_dependencies(&self, run_id: Uuid) -> Result<Vec<StepDependency>> {
        Ok(self.store.step_dependencies(run_id).await?)
    }

    pub async fn tasks(&self, run_id: Uuid) -> Result<Vec<Task>> {
        Ok(self.store.tasks(run_id).await?)
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        Ok(self.store.workers().await?)
    }

    /// Poll the store until the run is terminal or `timeout` elapses; returns the last state
    pub async fn wait_for_run(&self, run_id: Uuid, timeout: Duration) -> Result<Run> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(run_id).await?;
            if run.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(self.config.worker.poll_interval()).await;
        }
    }

    /// A worker for `workflow` that has not been started; drive it with
    /// [`TaskWorker::process_batch`] or [`TaskWorker::spawn`]
    pub fn worker(&self, workflow: Arc<Workflow>) -> TaskWorker {
        let queue_name = self.queue_name_for(&workflow);
        let processor = StepResultProcessor::new(
            self.store.clone(),
            self.config.retry_policy(),
            queue_name.clone(),
        );
        TaskWorker::new(
            workflow,
            queue_name,
            self.store.clone(),
            self.queue.clone(),
            processor,
            self.config.worker.clone(),
            self.config.queue.default_visibility_timeout(),
        )
    }

    /// Ensure the queue exists, then run a worker in the background
    pub async fn spawn_worker(&self, workflow: Arc<Workflow>) -> Result<WorkerHandle> {
        self.initializer.ensure_queue(&workflow).await?;
        self.worker(workflow).spawn().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::handler_fn;
    use crate::state_machine::RunStatus;
    use crate::workflow::{StepDefinition, WorkflowDefinition};
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_run_is_an_error() {
        let engine = WorkflowEngine::in_memory(EngineConfig::default());
        let missing = Uuid::new_v4();
        assert!(matches!(
            engine.run(missing).await,
            Err(EngineError::RunNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_worker_batches_drive_run_to_completion() {
        let mut config = EngineConfig::default();
        config.worker.poll_timeout_ms = 20;
        let engine = WorkflowEngine::in_memory(config);
        let workflow = Arc::new(
            WorkflowDefinition::new("echo")
                .step(StepDefinition::new(
                    "only",
                    handler_fn(|input| async move { Ok(json!({"seen": input["run"]})) }),
                ))
                .build()
                .unwrap(),
        );

        let run_id = engine.start(&workflow, json!(5)).await.unwrap();
        let worker = engine.worker(workflow.clone());
        let summary = worker.process_batch().await.unwrap();
        assert_eq!(summary.completed, 1);

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({"only": {"seen": 5}})));
    }
}
