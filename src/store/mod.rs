//! # Workflow Store
//!
//! The source of truth for runs, steps, dependencies, tasks and workers. Every
//! mutating operation is atomic: counters, status transitions and the queue operations
//! they imply (publish, archive, hide) commit together or not at all.
//!
//! Two implementations share the decision logic in this module:
//!
//! - [`PgWorkflowStore`]: PostgreSQL + pgmq, one transaction per operation, the run row
//!   locked `FOR UPDATE` to serialize cascades of a run, claims via `FOR UPDATE SKIP LOCKED`
//! - [`InMemoryWorkflowStore`]: a single mutex over all state, paired with an
//!   [`InMemoryQueue`](crate::messaging::InMemoryQueue)

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::MapStepError;
use crate::messaging::{MessagingError, TaskMessage};
use crate::models::{Run, StepDependency, StepState, Task, Worker};
use crate::orchestration::backoff::RetryPolicy;
use crate::state_machine::{RunStatus, TaskStatus};
use crate::workflow::payload::{build_task_input, MapSourceError};
use crate::workflow::Workflow;

pub use in_memory::InMemoryWorkflowStore;
pub use postgres::PgWorkflowStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Queue error: {0}")]
    Queue(#[from] MessagingError),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Step '{step_name}' not found in run {run_id}")]
    StepNotFound { run_id: Uuid, step_name: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskMessage),

    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn database(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.into(),
            message: error.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::database("query", error)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a delivered message did not produce a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Started by another worker whose claim has not lapsed
    InFlight,
    /// Row locked by a concurrent claim or cascade
    Contended,
    /// Task already completed or failed; message archived
    Finished,
    /// Not the task's current message; archived
    Superseded,
    /// No such task; archived
    UnknownTask,
    /// Claim lapsed with no attempts left; task failed permanently
    AttemptsExhausted,
}

impl SkipReason {
    /// Whether the store archived the delivered message
    pub fn archives_message(&self) -> bool {
        !matches!(self, Self::InFlight | Self::Contended)
    }
}

/// A task this worker now owns
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task: Task,
    pub step: StepState,
    /// Taken over from a worker whose claim lapsed
    pub reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ClaimedTask),
    Skipped(SkipReason),
}

/// Effects of completing one task
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeReport {
    /// The task was its step's last outstanding task
    pub step_completed: bool,
    /// Dependents that became ready and had their tasks published
    pub started_steps: Vec<String>,
    pub run_status: RunStatus,
    /// Ready map steps whose input could not be split; each failed its step and the run
    pub map_violations: Vec<MapStepError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed(CascadeReport),
    /// The task was not started; nothing changed
    AlreadyFinalized { status: TaskStatus },
    /// The task was re-claimed after this report's claim lapsed; nothing changed
    Superseded { current_attempt: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying { attempts_count: i32, delay: Duration },
    /// `run_failed` is true when this failure transitioned the run
    Failed { attempts_count: i32, run_failed: bool },
    AlreadyFinalized { status: TaskStatus },
    Superseded { current_attempt: i32 },
}

/// Everything needed to build a task's handler input
#[derive(Debug, Clone, PartialEq)]
pub struct StepInputs {
    pub run_id: Uuid,
    pub step_name: String,
    pub run_input: Value,
    pub initial_tasks: i32,
    /// Aggregated output of each dependency, ordered by name
    pub dependency_outputs: Vec<(String, Value)>,
}

impl StepInputs {
    pub fn task_input(&self, task_index: i32) -> Result<Value, MapStepError> {
        build_task_input(
            &self.run_input,
            &self.dependency_outputs,
            usize::try_from(task_index).unwrap_or(0),
            usize::try_from(self.initial_tasks).unwrap_or(1),
        )
        .map_err(|e: MapSourceError| MapStepError::from_source(self.run_id, &self.step_name, e))
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Create the run, its steps and dependencies, and publish the root tasks
    async fn create_run(&self, workflow: &Workflow, input: Value, queue_name: &str)
        -> StoreResult<Run>;

    /// Move the task to `started` for `worker_id` if the delivered message entitles it
    async fn claim_task(
        &self,
        message: &TaskMessage,
        msg_id: i64,
        worker_id: &str,
        queue_name: &str,
    ) -> StoreResult<ClaimOutcome>;

    async fn step_inputs(&self, run_id: Uuid, step_name: &str) -> StoreResult<StepInputs>;

    /// Record the output and run the completion cascade; idempotent per task.
    ///
    /// `attempt` is the `attempts_count` returned by the claim being reported on. Reports
    /// from an older claim are ignored.
    async fn complete_task(
        &self,
        message: &TaskMessage,
        attempt: i32,
        output: Value,
        queue_name: &str,
    ) -> StoreResult<CompletionOutcome>;

    /// Requeue with backoff or fail permanently; idempotent per attempt
    async fn fail_task(
        &self,
        message: &TaskMessage,
        attempt: i32,
        error: &str,
        permanent: bool,
        policy: &RetryPolicy,
        queue_name: &str,
    ) -> StoreResult<FailureOutcome>;

    async fn run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    /// Ordered by step name
    async fn step_states(&self, run_id: Uuid) -> StoreResult<Vec<StepState>>;

    async fn step_dependencies(&self, run_id: Uuid) -> StoreResult<Vec<StepDependency>>;

    /// Ordered by step name, then task index
    async fn tasks(&self, run_id: Uuid) -> StoreResult<Vec<Task>>;

    /// Upsert the worker row; registers it on first call
    async fn record_heartbeat(&self, worker_id: &str, queue_name: &str) -> StoreResult<()>;

    async fn mark_worker_stopped(&self, worker_id: &str) -> StoreResult<()>;

    async fn workers(&self) -> StoreResult<Vec<Worker>>;
}

/// What a delivered message means for its task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimDecision {
    Claim { reclaimed: bool },
    Skip(SkipReason),
    /// Lapsed claim with attempts used up: fail the task permanently
    Exhaust,
}

pub(crate) fn decide_claim(
    task: &Task,
    step: &StepState,
    msg_id: i64,
    now: DateTime<Utc>,
) -> ClaimDecision {
    if task.status.is_terminal() {
        return ClaimDecision::Skip(SkipReason::Finished);
    }
    if task.queue_message_id.is_some_and(|current| current != msg_id) {
        return ClaimDecision::Skip(SkipReason::Superseded);
    }
    match task.status {
        TaskStatus::Queued => ClaimDecision::Claim { reclaimed: false },
        TaskStatus::Started => {
            let lapsed = task
                .lease_expires_at(step.timeout())
                .map_or(true, |expires_at| expires_at <= now);
            if !lapsed {
                ClaimDecision::Skip(SkipReason::InFlight)
            } else if task.attempts_count >= step.max_attempts {
                ClaimDecision::Exhaust
            } else {
                ClaimDecision::Claim { reclaimed: true }
            }
        }
        TaskStatus::Completed | TaskStatus::Failed => ClaimDecision::Skip(SkipReason::Finished),
    }
}

pub(crate) fn exhausted_error(attempts_count: i32) -> String {
    format!("claim lapsed without a result after {attempts_count} attempt(s)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StepStatus;

    fn step(timeout_ms: i64, max_attempts: i32) -> StepState {
        StepState {
            step_state_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            step_name: "s".to_string(),
            status: StepStatus::Started,
            remaining_tasks: 1,
            remaining_deps: 0,
            initial_tasks: 1,
            timeout_ms,
            max_attempts,
            error: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            failed_at: None,
        }
    }

    fn task(status: TaskStatus, attempts: i32, started_ago_ms: i64) -> Task {
        let mut task = Task::new(Uuid::new_v4(), "s", 0);
        task.status = status;
        task.attempts_count = attempts;
        task.queue_message_id = Some(10);
        if status != TaskStatus::Queued {
            task.started_at = Some(Utc::now() - chrono::Duration::milliseconds(started_ago_ms));
        }
        task
    }

    #[test]
    fn test_queued_task_is_claimed() {
        let decision = decide_claim(&task(TaskStatus::Queued, 0, 0), &step(1000, 3), 10, Utc::now());
        assert_eq!(decision, ClaimDecision::Claim { reclaimed: false });
    }

    #[test]
    fn test_started_task_within_lease_is_skipped() {
        let decision =
            decide_claim(&task(TaskStatus::Started, 1, 10), &step(60_000, 3), 10, Utc::now());
        assert_eq!(decision, ClaimDecision::Skip(SkipReason::InFlight));
    }

    #[test]
    fn test_lapsed_lease_is_reclaimed_or_exhausted() {
        let now = Utc::now();
        assert_eq!(
            decide_claim(&task(TaskStatus::Started, 1, 5_000), &step(1000, 3), 10, now),
            ClaimDecision::Claim { reclaimed: true }
        );
        assert_eq!(
            decide_claim(&task(TaskStatus::Started, 3, 5_000), &step(1000, 3), 10, now),
            ClaimDecision::Exhaust
        );
    }

    #[test]
    fn test_terminal_and_superseded_messages_are_orphans() {
        let now = Utc::now();
        assert_eq!(
            decide_claim(&task(TaskStatus::Completed, 1, 0), &step(1000, 3), 10, now),
            ClaimDecision::Skip(SkipReason::Finished)
        );
        assert_eq!(
            decide_claim(&task(TaskStatus::Queued, 0, 0), &step(1000, 3), 11, now),
            ClaimDecision::Skip(SkipReason::Superseded)
        );
        assert!(SkipReason::Finished.archives_message());
        assert!(!SkipReason::InFlight.archives_message());
    }
}
