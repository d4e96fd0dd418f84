//! # Step Result Processor
//!
//! Reports a task's handler outcome back to the store and logs what the store did with
//! it: the completion cascade on success, the retry decision on failure.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use super::backoff::RetryPolicy;
use super::step_handler::HandlerError;
use crate::error::{MapStepError, Result};
use crate::logging::log_run_operation;
use crate::logging::log_task_operation;
use crate::messaging::TaskMessage;
use crate::store::{CompletionOutcome, FailureOutcome, WorkflowStore};

#[derive(Clone)]
pub struct StepResultProcessor {
    store: Arc<dyn WorkflowStore>,
    retry_policy: RetryPolicy,
    queue_name: String,
}

impl StepResultProcessor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        retry_policy: RetryPolicy,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry_policy,
            queue_name: queue_name.into(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Run the completion cascade.
    ///
    /// The cascade commits even when a dependent map step cannot be split; that
    /// violation is returned as an error afterwards.
    pub async fn handle_success(
        &self,
        message: &TaskMessage,
        attempt: i32,
        output: Value,
    ) -> Result<CompletionOutcome> {
        let outcome = self
            .store
            .complete_task(message, attempt, output, &self.queue_name)
            .await?;

        let report = match &outcome {
            CompletionOutcome::AlreadyFinalized { status } => {
                info!(task = %message, status = %status, "Completion ignored, task already finalized");
                return Ok(outcome);
            }
            CompletionOutcome::Superseded { current_attempt } => {
                warn!(task = %message, attempt, current_attempt, "Completion ignored, task was re-claimed");
                return Ok(outcome);
            }
            CompletionOutcome::Completed(report) => report,
        };

        log_task_operation(
            "complete",
            message.run_id,
            &message.step_name,
            message.task_index,
            "completed",
            report.step_completed.then_some("step completed"),
        );
        if !report.started_steps.is_empty() {
            info!(
                run_id = %message.run_id,
                steps = ?report.started_steps,
                "Dependents ready, tasks published"
            );
        }
        if report.run_status.is_terminal() {
            log_run_operation(
                "finish",
                message.run_id,
                None,
                report.run_status.as_str(),
                None,
            );
        }

        match report.map_violations.split_first() {
            None => Ok(outcome),
            Some((first, rest)) => {
                for violation in rest {
                    error!(error = %violation, "Map step could not start");
                }
                Err(first.clone().into())
            }
        }
    }

    pub async fn handle_failure(
        &self,
        message: &TaskMessage,
        attempt: i32,
        failure: &HandlerError,
    ) -> Result<FailureOutcome> {
        let outcome = self
            .store
            .fail_task(
                message,
                attempt,
                failure.message(),
                failure.is_permanent(),
                &self.retry_policy,
                &self.queue_name,
            )
            .await?;
        self.log_failure(message, failure.message(), &outcome);
        Ok(outcome)
    }

    /// A claimed map task whose input cannot be built fails permanently without running
    pub async fn handle_map_violation(
        &self,
        message: &TaskMessage,
        attempt: i32,
        violation: &MapStepError,
    ) -> Result<FailureOutcome> {
        let reason = violation.to_string();
        let outcome = self
            .store
            .fail_task(
                message,
                attempt,
                &reason,
                true,
                &self.retry_policy,
                &self.queue_name,
            )
            .await?;
        self.log_failure(message, &reason, &outcome);
        Ok(outcome)
    }

    fn log_failure(&self, message: &TaskMessage, reason: &str, outcome: &FailureOutcome) {
        match outcome {
            FailureOutcome::Retrying {
                attempts_count,
                delay,
            } => {
                warn!(
                    task = %message,
                    attempts = attempts_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %reason,
                    "Task failed, retry scheduled"
                );
            }
            FailureOutcome::Failed {
                attempts_count,
                run_failed,
            } => {
                log_task_operation(
                    "fail",
                    message.run_id,
                    &message.step_name,
                    message.task_index,
                    "failed",
                    Some(&format!("after {attempts_count} attempt(s): {reason}")),
                );
                if *run_failed {
                    log_run_operation(
                        "finish",
                        message.run_id,
                        None,
                        "failed",
                        Some(&format!("step '{}' failed", message.step_name)),
                    );
                }
            }
            FailureOutcome::AlreadyFinalized { status } => {
                info!(task = %message, status = %status, "Failure ignored, task already finalized");
            }
            FailureOutcome::Superseded { current_attempt } => {
                warn!(task = %message, current_attempt, error = %reason, "Failure ignored, task was re-claimed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::messaging::InMemoryQueue;
    use crate::orchestration::handler_fn;
    use crate::state_machine::{RunStatus, StepStatus};
    use crate::store::{ClaimOutcome, InMemoryWorkflowStore};
    use crate::workflow::{StepDefinition, WorkflowDefinition};
    use serde_json::json;
    use std::time::Duration;

    const QUEUE: &str = "proc_tasks";

    async fn claim_next(store: &InMemoryWorkflowStore) -> (TaskMessage, i32) {
        let batch = store
            .queue()
            .read_now(QUEUE, 1, Duration::from_secs(30))
            .unwrap();
        let delivered = batch[0].task_message().unwrap();
        let outcome = store
            .claim_task(&delivered.message, delivered.msg_id, "w", QUEUE)
            .await
            .unwrap();
        let ClaimOutcome::Claimed(claimed) = outcome else {
            panic!("expected a claim");
        };
        (delivered.message, claimed.task.attempts_count)
    }

    #[tokio::test]
    async fn test_success_surfaces_type_violation_after_commit() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue(QUEUE);
        let store = Arc::new(InMemoryWorkflowStore::new(queue));
        let processor = StepResultProcessor::new(store.clone(), RetryPolicy::default(), QUEUE);

        let workflow = WorkflowDefinition::new("proc")
            .step(StepDefinition::new("source", handler_fn(|i| async move { Ok(i) })))
            .step(
                StepDefinition::new("fan", handler_fn(|i| async move { Ok(i) }))
                    .depends_on(["source"])
                    .initial_tasks(3),
            )
            .build()
            .unwrap();
        let run = store.create_run(&workflow, json!({}), QUEUE).await.unwrap();

        let (source, attempt) = claim_next(&store).await;
        let result = processor.handle_success(&source, attempt, json!(42)).await;
        assert!(matches!(result, Err(EngineError::TypeViolation(_))));

        let run = store.run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_step_name.as_deref(), Some("fan"));
        let steps = store.step_states(run.run_id).await.unwrap();
        let fan = steps.iter().find(|s| s.step_name == "fan").unwrap();
        assert_eq!(fan.status, StepStatus::Failed);
        assert!(store
            .tasks(run.run_id)
            .await
            .unwrap()
            .iter()
            .all(|t| t.step_name != "fan"));
    }

    #[tokio::test]
    async fn test_success_surfaces_size_mismatch_separately() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue(QUEUE);
        let store = Arc::new(InMemoryWorkflowStore::new(queue));
        let processor = StepResultProcessor::new(store.clone(), RetryPolicy::default(), QUEUE);

        let workflow = WorkflowDefinition::new("proc")
            .step(StepDefinition::new("source", handler_fn(|i| async move { Ok(i) })))
            .step(
                StepDefinition::new("fan", handler_fn(|i| async move { Ok(i) }))
                    .depends_on(["source"])
                    .initial_tasks(3),
            )
            .build()
            .unwrap();
        let run = store.create_run(&workflow, json!({}), QUEUE).await.unwrap();

        let (source, attempt) = claim_next(&store).await;
        let result = processor
            .handle_success(&source, attempt, json!([1, 2, 3, 4]))
            .await;
        let Err(EngineError::MapSizeMismatch(mismatch)) = result else {
            panic!("expected a size mismatch");
        };
        assert_eq!((mismatch.expected, mismatch.actual), (3, 4));
        assert_eq!(mismatch.source_step, "source");

        let run = store.run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_step_name.as_deref(), Some("fan"));
    }

    #[tokio::test]
    async fn test_permanent_handler_error_skips_retries() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue(QUEUE);
        let store = Arc::new(InMemoryWorkflowStore::new(queue));
        let processor = StepResultProcessor::new(store.clone(), RetryPolicy::default(), QUEUE);

        let workflow = WorkflowDefinition::new("proc")
            .step(StepDefinition::new("only", handler_fn(|i| async move { Ok(i) })).max_attempts(5))
            .build()
            .unwrap();
        store.create_run(&workflow, json!({}), QUEUE).await.unwrap();

        let (task, attempt) = claim_next(&store).await;
        let outcome = processor
            .handle_failure(&task, attempt, &HandlerError::permanent("bad input"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Failed {
                attempts_count: 1,
                run_failed: true
            }
        );
    }
}
