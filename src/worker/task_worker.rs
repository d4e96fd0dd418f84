//! # Task Worker
//!
//! The claim/execute loop of one worker process for one workflow queue.
//!
//! ## Flow
//!
//! ```text
//! read_with_poll ─► decode ─► claim (concurrent) ─► extend visibility to step timeout
//!                                     │
//!                                     ▼
//!                     [Semaphore] ─► handler (timeout + panic guard) ─► report
//! ```
//!
//! Claims are idempotent, so a message delivered twice (or to two workers) executes at
//! most once at a time. A worker that dies after claiming leaves its message hidden
//! until the step timeout lapses; the next delivery re-claims the task as a new attempt.
//! Reports carry the attempt they ran as, so a slow worker's late result cannot override
//! the attempt that replaced it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::WorkerRegistry;
use crate::config::WorkerConfig;
use crate::error::{EngineError, Result};
use crate::messaging::{DurableQueue, QueuedMessage, TaskMessage};
use crate::orchestration::backoff::RetryPolicy;
use crate::orchestration::step_handler::HandlerError;
use crate::orchestration::step_result_processor::StepResultProcessor;
use crate::store::{ClaimOutcome, ClaimedTask, CompletionOutcome, FailureOutcome, WorkflowStore};
use crate::workflow::Workflow;

/// What happened to one claimed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retrying,
    Failed,
    /// Reported after another delivery had already finalized the task
    Ignored,
}

/// Counters for one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub claimed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub ignored: usize,
    /// Undecodable messages, archived
    pub malformed: usize,
    pub errors: usize,
}

impl BatchSummary {
    pub fn is_empty(&self) -> bool {
        self.received == 0
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Retrying => self.retried += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Ignored => self.ignored += 1,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Polls one workflow's queue and executes its tasks
#[derive(Clone)]
pub struct TaskWorker {
    worker_id: String,
    workflow: Arc<Workflow>,
    queue_name: String,
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn DurableQueue>,
    processor: StepResultProcessor,
    config: WorkerConfig,
    read_visibility_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("worker_id", &self.worker_id)
            .field("workflow", &self.workflow.name())
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

impl TaskWorker {
    pub fn new(
        workflow: Arc<Workflow>,
        queue_name: impl Into<String>,
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn DurableQueue>,
        processor: StepResultProcessor,
        config: WorkerConfig,
        read_visibility_timeout: Duration,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            workflow,
            queue_name: queue_name.into(),
            store,
            queue,
            processor,
            config,
            read_visibility_timeout,
            permits,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// One long-poll and everything it delivered
    pub async fn process_batch(&self) -> Result<BatchSummary> {
        let messages = self.poll().await?;
        Ok(self.handle_messages(messages).await)
    }

    async fn poll(&self) -> Result<Vec<QueuedMessage<Value>>> {
        Ok(self
            .queue
            .read_with_poll(
                &self.queue_name,
                self.config.batch_size,
                self.read_visibility_timeout,
                self.config.poll_timeout(),
            )
            .await?)
    }

    #[instrument(skip_all, fields(worker_id = %self.worker_id, count = messages.len()))]
    async fn handle_messages(&self, messages: Vec<QueuedMessage<Value>>) -> BatchSummary {
        let mut summary = BatchSummary {
            received: messages.len(),
            ..BatchSummary::default()
        };
        if messages.is_empty() {
            return summary;
        }

        let mut deliveries = Vec::with_capacity(messages.len());
        for raw in messages {
            match raw.task_message() {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    warn!(msg_id = raw.msg_id, error = %e, "Archiving undecodable message");
                    summary.malformed += 1;
                    if let Err(e) = self.queue.archive(&self.queue_name, raw.msg_id).await {
                        warn!(msg_id = raw.msg_id, error = %e, "Archive failed");
                        summary.errors += 1;
                    }
                }
            }
        }

        let claims = join_all(deliveries.iter().map(|delivery| {
            self.store.claim_task(
                &delivery.message,
                delivery.msg_id,
                &self.worker_id,
                &self.queue_name,
            )
        }))
        .await;

        let mut claimed = Vec::new();
        for (delivery, result) in deliveries.into_iter().zip(claims) {
            match result {
                Ok(ClaimOutcome::Claimed(task)) => {
                    if task.reclaimed {
                        info!(task = %delivery.message, attempt = task.task.attempts_count, "Re-claimed task after lapsed claim");
                    }
                    claimed.push((delivery, task));
                }
                Ok(ClaimOutcome::Skipped(reason)) => {
                    debug!(task = %delivery.message, reason = ?reason, "Delivery skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(task = %delivery.message, error = %e, "Claim failed, message will be redelivered");
                    summary.errors += 1;
                }
            }
        }
        summary.claimed = claimed.len();

        self.extend_visibility(&claimed).await;

        let mut running = JoinSet::new();
        for (delivery, task) in claimed {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                error!("Worker semaphore closed, leaving claimed tasks for redelivery");
                break;
            };
            let worker = self.clone();
            running.spawn(async move {
                let _permit = permit;
                worker.execute(delivery.message, task).await
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(outcome)) => summary.record(outcome),
                Ok(Err(e)) => {
                    error!(error = %e, "Task report failed");
                    summary.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Task execution aborted");
                    summary.errors += 1;
                }
            }
        }

        if summary.claimed > 0 {
            debug!(?summary, "Batch processed");
        }
        summary
    }

    /// Hide claimed messages for their step's timeout, one call per distinct timeout
    async fn extend_visibility(&self, claimed: &[(QueuedMessage<TaskMessage>, ClaimedTask)]) {
        let mut by_timeout: HashMap<Duration, Vec<i64>> = HashMap::new();
        for (delivery, task) in claimed {
            by_timeout
                .entry(task.step.timeout())
                .or_default()
                .push(delivery.msg_id);
        }
        for (timeout, ids) in by_timeout {
            if let Err(e) = self
                .queue
                .set_visibility_timeout_batch(&self.queue_name, &ids, timeout)
                .await
            {
                warn!(error = %e, count = ids.len(), "Failed to extend visibility of claimed messages");
            }
        }
    }

    async fn execute(&self, message: TaskMessage, claimed: ClaimedTask) -> Result<TaskOutcome> {
        let attempt = claimed.task.attempts_count;
        let Some(step) = self.workflow.step(&message.step_name) else {
            let failure = HandlerError::permanent(format!(
                "no handler registered for step '{}'",
                message.step_name
            ));
            return self.report_failure(&message, attempt, &failure).await;
        };

        let inputs = self.store.step_inputs(message.run_id, &message.step_name).await?;
        let input = match inputs.task_input(message.task_index) {
            Ok(input) => input,
            Err(violation) => {
                let outcome = self
                    .processor
                    .handle_map_violation(&message, attempt, &violation)
                    .await?;
                return Ok(Self::failure_outcome(&outcome));
            }
        };

        let timeout = claimed.step.timeout();
        let handler = step.handler().clone();
        let started = Instant::now();
        let result =
            tokio::time::timeout(timeout, AssertUnwindSafe(handler.call(input)).catch_unwind())
                .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(Ok(Ok(output))) => {
                debug!(task = %message, elapsed_ms, "Handler completed");
                match self.processor.handle_success(&message, attempt, output).await {
                    Ok(CompletionOutcome::Completed(_)) => Ok(TaskOutcome::Completed),
                    Ok(
                        CompletionOutcome::AlreadyFinalized { .. }
                        | CompletionOutcome::Superseded { .. },
                    ) => Ok(TaskOutcome::Ignored),
                    // The task itself completed; the violation is already recorded on the run
                    Err(
                        violation @ (EngineError::TypeViolation(_)
                        | EngineError::MapSizeMismatch(_)),
                    ) => {
                        error!(error = %violation, "Map step failed to start");
                        Ok(TaskOutcome::Completed)
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(Ok(Err(failure))) => {
                debug!(task = %message, elapsed_ms, error = %failure, "Handler returned error");
                self.report_failure(&message, attempt, &failure).await
            }
            Ok(Err(panic)) => {
                let failure = HandlerError::permanent(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ));
                error!(task = %message, error = %failure, "Handler panicked");
                self.report_failure(&message, attempt, &failure).await
            }
            Err(_) => {
                let failure = HandlerError::retryable(format!(
                    "handler timed out after {}ms",
                    timeout.as_millis()
                ));
                warn!(task = %message, "Handler timed out");
                self.report_failure(&message, attempt, &failure).await
            }
        }
    }

    async fn report_failure(
        &self,
        message: &TaskMessage,
        attempt: i32,
        failure: &HandlerError,
    ) -> Result<TaskOutcome> {
        let outcome = self.processor.handle_failure(message, attempt, failure).await?;
        Ok(Self::failure_outcome(&outcome))
    }

    fn failure_outcome(outcome: &FailureOutcome) -> TaskOutcome {
        match outcome {
            FailureOutcome::Retrying { .. } => TaskOutcome::Retrying,
            FailureOutcome::Failed { .. } => TaskOutcome::Failed,
            FailureOutcome::AlreadyFinalized { .. } | FailureOutcome::Superseded { .. } => {
                TaskOutcome::Ignored
            }
        }
    }

    /// Run until shutdown is signalled. The long poll is interrupted by shutdown; a batch
    /// already delivered is always finished.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue_name,
            workflow = %self.workflow.name(),
            "🚀 Worker started"
        );
        let mut connection_failures: u32 = 0;
        loop {
            let polled = tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.poll() => polled,
            };
            match polled {
                Ok(messages) => {
                    connection_failures = 0;
                    self.handle_messages(messages).await;
                }
                Err(e) => {
                    let delay = poll_backoff(&e, connection_failures, self.config.poll_interval());
                    if is_connection_failure(&e) {
                        connection_failures = connection_failures.saturating_add(1);
                    }
                    warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Poll failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "Worker loop exited");
    }

    /// Register, start the heartbeat and the poll loop
    pub async fn spawn(self) -> Result<WorkerHandle> {
        let registry = WorkerRegistry::new(
            self.store.clone(),
            self.worker_id.clone(),
            self.queue_name.clone(),
            self.config.heartbeat_interval(),
        );
        registry.register().await?;

        let (shutdown, _) = broadcast::channel(1);
        let heartbeat = registry.spawn_heartbeat(shutdown.subscribe());
        let worker_id = self.worker_id.clone();
        let receiver = shutdown.subscribe();
        let poll_loop = tokio::spawn(async move {
            self.run(receiver).await;
            if let Err(e) = registry.deregister().await {
                warn!(error = %e, "Failed to mark worker stopped");
            }
        });

        Ok(WorkerHandle {
            worker_id,
            shutdown,
            poll_loop,
            heartbeat,
        })
    }
}

/// Control handle for a spawned worker. Dropping it also stops the worker after its
/// current batch.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: String,
    shutdown: broadcast::Sender<()>,
    poll_loop: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Signal shutdown and wait for in-flight tasks to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.poll_loop.await {
            error!(worker_id = %self.worker_id, error = %e, "Worker loop panicked");
        }
        if let Err(e) = self.heartbeat.await {
            error!(worker_id = %self.worker_id, error = %e, "Heartbeat task panicked");
        }
    }
}

/// Ceiling for the poll loop's backoff while the database is unreachable
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

fn is_connection_failure(error: &EngineError) -> bool {
    matches!(error, EngineError::Queue(e) if e.is_connection_error())
}

/// Lost connections back off exponentially from `poll_interval`; other poll errors wait
/// one interval.
fn poll_backoff(error: &EngineError, connection_failures: u32, poll_interval: Duration) -> Duration {
    if is_connection_failure(error) {
        RetryPolicy::new(poll_interval, MAX_POLL_BACKOFF.max(poll_interval))
            .delay_for(connection_failures)
    } else {
        poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessagingError;

    #[test]
    fn test_poll_backoff_grows_only_for_connection_errors() {
        let interval = Duration::from_millis(100);
        let lost: EngineError = MessagingError::database_connection("refused").into();
        assert_eq!(poll_backoff(&lost, 0, interval), Duration::from_millis(100));
        assert_eq!(poll_backoff(&lost, 3, interval), Duration::from_millis(800));
        assert_eq!(poll_backoff(&lost, 20, interval), MAX_POLL_BACKOFF);

        let missing: EngineError = MessagingError::queue_not_found("etl_tasks").into();
        assert!(!is_connection_failure(&missing));
        assert_eq!(poll_backoff(&missing, 5, interval), interval);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_summary_records_outcomes() {
        let mut summary = BatchSummary {
            received: 3,
            ..BatchSummary::default()
        };
        summary.record(TaskOutcome::Completed);
        summary.record(TaskOutcome::Retrying);
        summary.record(TaskOutcome::Ignored);
        assert_eq!(
            (summary.completed, summary.retried, summary.ignored),
            (1, 1, 1)
        );
        assert!(!summary.is_empty());
    }
}
