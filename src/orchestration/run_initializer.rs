//! # Run Initializer
//!
//! Turns `start(workflow, input)` into persisted state. The store creates the run,
//! every step state with its counters, the dependency edges and the root tasks in one
//! atomic operation, publishing one queue message per root task. Nothing is written
//! for a workflow that failed validation, since a [`Workflow`] only exists once its
//! DAG is valid.

use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::logging::log_run_operation;
use crate::messaging::DurableQueue;
use crate::models::Run;
use crate::store::WorkflowStore;
use crate::workflow::Workflow;

#[derive(Clone)]
pub struct RunInitializer {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn DurableQueue>,
    queue_config: QueueConfig,
    /// Queues already created by this process
    ensured_queues: Arc<DashSet<String>>,
}

impl RunInitializer {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn DurableQueue>,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            queue_config,
            ensured_queues: Arc::new(DashSet::new()),
        }
    }

    pub fn queue_name_for(&self, workflow: &Workflow) -> String {
        self.queue_config.queue_name_for(workflow.name())
    }

    /// Create the workflow's queue once per process; `pgmq.create` is idempotent anyway
    pub async fn ensure_queue(&self, workflow: &Workflow) -> Result<String> {
        let queue_name = self.queue_name_for(workflow);
        if !self.ensured_queues.contains(&queue_name) {
            self.queue.ensure_queue(&queue_name).await?;
            debug!(queue = %queue_name, provider = self.queue.provider_name(), "Queue ready");
            self.ensured_queues.insert(queue_name.clone());
        }
        Ok(queue_name)
    }

    #[instrument(skip(self, workflow, input), fields(workflow = %workflow.name()))]
    pub async fn start(&self, workflow: &Workflow, input: Value) -> Result<Run> {
        let queue_name = self.ensure_queue(workflow).await?;
        let run = self.store.create_run(workflow, input, &queue_name).await?;

        let roots: Vec<&str> = workflow.root_steps().iter().map(|s| s.name()).collect();
        log_run_operation(
            "start",
            run.run_id,
            Some(workflow.name()),
            run.status.as_str(),
            Some(&format!(
                "{} steps, roots [{}]",
                workflow.step_count(),
                roots.join(", ")
            )),
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryQueue;
    use crate::orchestration::handler_fn;
    use crate::state_machine::RunStatus;
    use crate::store::InMemoryWorkflowStore;
    use crate::workflow::{StepDefinition, WorkflowDefinition};
    use serde_json::json;

    #[tokio::test]
    async fn test_start_creates_queue_and_root_tasks() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryWorkflowStore::new(queue.clone()));
        let initializer = RunInitializer::new(store.clone(), queue.clone(), QueueConfig::default());

        let workflow = WorkflowDefinition::new("fan")
            .step(StepDefinition::new("left", handler_fn(|i| async move { Ok(i) })))
            .step(StepDefinition::new("right", handler_fn(|i| async move { Ok(i) })))
            .build()
            .unwrap();

        let run = initializer.start(&workflow, json!({"n": 1})).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.remaining_steps, 2);
        assert_eq!(queue.live_count("fan_tasks"), 2);

        initializer.start(&workflow, json!({"n": 2})).await.unwrap();
        assert_eq!(queue.live_count("fan_tasks"), 4);
    }
}
