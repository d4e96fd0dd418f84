//! # PostgreSQL Workflow Store
//!
//! One transaction per operation. pgmq calls run on the same connection, so publishing a
//! ready step's tasks, archiving a finished task's message and hiding a retried one
//! commit or roll back with the row changes that imply them.
//!
//! ## Locking
//!
//! - Cascades (complete, fail) lock the run row `FOR UPDATE` first, then the task row.
//!   Two tasks of the same run finishing at once are serialized on the run row, which is
//!   what makes the `remaining_*` counters safe.
//! - Claims lock only the task row with `FOR UPDATE SKIP LOCKED`. A locked row is reported
//!   as contended and the message is left for redelivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    decide_claim, exhausted_error, CascadeReport, ClaimDecision, ClaimOutcome, ClaimedTask,
    CompletionOutcome, FailureOutcome, SkipReason, StepInputs, StoreError, StoreResult,
    WorkflowStore,
};
use crate::error::MapStepError;
use crate::messaging::{PgmqClient, TaskMessage};
use crate::models::{Run, StepDependency, StepState, Task, Worker};
use crate::orchestration::backoff::{RetryDecision, RetryPolicy};
use crate::state_machine::{RunStatus, StepStatus, TaskStatus};
use crate::workflow::payload::{
    aggregate_step_output, merge_leaf_outputs, validate_map_source, MapSourceError,
};
use crate::workflow::Workflow;

/// One completed task output of a step, or a step with none yet
#[derive(Debug, FromRow)]
struct StepOutputRow {
    step_name: String,
    initial_tasks: i32,
    task_index: Option<i32>,
    output: Option<Value>,
}

/// Fold rows ordered by step name into `(step_name, aggregated output)` pairs
fn group_step_outputs(rows: Vec<StepOutputRow>) -> Vec<(String, Value)> {
    let mut grouped: Vec<(String, i32, Vec<(i32, Value)>)> = Vec::new();
    for row in rows {
        match grouped.last_mut() {
            Some((name, _, outputs)) if *name == row.step_name => {
                if let (Some(index), Some(output)) = (row.task_index, row.output) {
                    outputs.push((index, output));
                }
            }
            _ => {
                let outputs = match (row.task_index, row.output) {
                    (Some(index), Some(output)) => vec![(index, output)],
                    _ => Vec::new(),
                };
                grouped.push((row.step_name, row.initial_tasks, outputs));
            }
        }
    }
    grouped
        .into_iter()
        .map(|(name, initial_tasks, outputs)| {
            let initial_tasks = usize::try_from(initial_tasks).unwrap_or(1);
            (name, aggregate_step_output(initial_tasks, outputs))
        })
        .collect()
}

#[derive(Debug, FromRow)]
struct DependentRow {
    step_name: String,
    remaining_deps: i32,
    #[sqlx(try_from = "String")]
    status: StepStatus,
}

#[derive(Debug, FromRow)]
struct RunCounterRow {
    remaining_steps: i32,
    #[sqlx(try_from = "String")]
    status: RunStatus,
}

async fn lock_run(conn: &mut PgConnection, run_id: Uuid) -> StoreResult<Run> {
    let sql = format!(
        "SELECT {} FROM tasker_dag_runs WHERE run_id = $1 FOR UPDATE",
        Run::COLUMNS
    );
    sqlx::query_as::<_, Run>(&sql)
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))
}

async fn fetch_step(conn: &mut PgConnection, run_id: Uuid, step_name: &str) -> StoreResult<StepState> {
    let sql = format!(
        "SELECT {} FROM tasker_dag_step_states WHERE run_id = $1 AND step_name = $2",
        StepState::COLUMNS
    );
    sqlx::query_as::<_, StepState>(&sql)
        .bind(run_id)
        .bind(step_name)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::StepNotFound {
            run_id,
            step_name: step_name.to_string(),
        })
}

async fn lock_task(conn: &mut PgConnection, message: &TaskMessage) -> StoreResult<Task> {
    let sql = format!(
        "SELECT {} FROM tasker_dag_tasks \
         WHERE run_id = $1 AND step_name = $2 AND task_index = $3 FOR UPDATE",
        Task::COLUMNS
    );
    sqlx::query_as::<_, Task>(&sql)
        .bind(message.run_id)
        .bind(&message.step_name)
        .bind(message.task_index)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::TaskNotFound(message.clone()))
}

async fn dependency_outputs(
    conn: &mut PgConnection,
    run_id: Uuid,
    step_name: &str,
) -> StoreResult<Vec<(String, Value)>> {
    let rows = sqlx::query_as::<_, StepOutputRow>(
        r#"
        SELECT d.depends_on_step_name AS step_name, s.initial_tasks, t.task_index, t.output
        FROM tasker_dag_step_dependencies d
        JOIN tasker_dag_step_states s
          ON s.run_id = d.run_id AND s.step_name = d.depends_on_step_name
        LEFT JOIN tasker_dag_tasks t
          ON t.run_id = d.run_id AND t.step_name = d.depends_on_step_name
         AND t.status = 'completed'
        WHERE d.run_id = $1 AND d.step_name = $2
        ORDER BY d.depends_on_step_name, t.task_index
        "#,
    )
    .bind(run_id)
    .bind(step_name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(group_step_outputs(rows))
}

async fn leaf_output(conn: &mut PgConnection, run_id: Uuid) -> StoreResult<Value> {
    let rows = sqlx::query_as::<_, StepOutputRow>(
        r#"
        SELECT s.step_name, s.initial_tasks, t.task_index, t.output
        FROM tasker_dag_step_states s
        LEFT JOIN tasker_dag_tasks t
          ON t.run_id = s.run_id AND t.step_name = s.step_name AND t.status = 'completed'
        WHERE s.run_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM tasker_dag_step_dependencies d
              WHERE d.run_id = s.run_id AND d.depends_on_step_name = s.step_name
          )
        ORDER BY s.step_name, t.task_index
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(merge_leaf_outputs(group_step_outputs(rows)))
}

async fn publish_task(
    conn: &mut PgConnection,
    run_id: Uuid,
    step_name: &str,
    task_index: i32,
    queue_name: &str,
) -> StoreResult<()> {
    let task = Task::new(run_id, step_name, task_index);
    let msg_id =
        PgmqClient::send_with(&mut *conn, queue_name, &task.message().to_json()?, Duration::ZERO)
            .await?;
    sqlx::query(
        r#"
        INSERT INTO tasker_dag_tasks
            (task_id, run_id, step_name, task_index, status, attempts_count,
             queue_message_id, queued_at)
        VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
        "#,
    )
    .bind(task.task_id)
    .bind(run_id)
    .bind(step_name)
    .bind(task_index)
    .bind(TaskStatus::Queued.as_str())
    .bind(msg_id)
    .bind(task.queued_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Returns whether the run transitioned to failed
async fn fail_step_and_run(
    conn: &mut PgConnection,
    run_id: Uuid,
    step_name: &str,
    error: &str,
) -> StoreResult<bool> {
    sqlx::query(
        r#"
        UPDATE tasker_dag_step_states
        SET status = 'failed', error = $3, failed_at = now()
        WHERE run_id = $1 AND step_name = $2 AND status IN ('pending', 'started')
        "#,
    )
    .bind(run_id)
    .bind(step_name)
    .bind(error)
    .execute(&mut *conn)
    .await?;

    let result = sqlx::query(
        r#"
        UPDATE tasker_dag_runs
        SET status = 'failed', error = $2, failed_step_name = $3, failed_at = now()
        WHERE run_id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(error)
    .bind(step_name)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Start a ready step, or fail it and the run when its map source cannot be split
async fn start_step(
    conn: &mut PgConnection,
    run_id: Uuid,
    step_name: &str,
    queue_name: &str,
) -> StoreResult<Option<MapStepError>> {
    let step = fetch_step(conn, run_id, step_name).await?;

    if step.is_map() {
        let sources = dependency_outputs(conn, run_id, step_name).await?;
        let expected = usize::try_from(step.initial_tasks).unwrap_or(0);
        let check = match sources.as_slice() {
            [(source, output)] => validate_map_source(source, output, expected),
            other => Err(MapSourceError::SourceCount(other.len())),
        };
        if let Err(reason) = check {
            let violation = MapStepError::from_source(run_id, step_name, reason);
            fail_step_and_run(conn, run_id, step_name, &violation.to_string()).await?;
            return Ok(Some(violation));
        }
    }

    sqlx::query(
        r#"
        UPDATE tasker_dag_step_states
        SET status = 'started', started_at = now()
        WHERE run_id = $1 AND step_name = $2
        "#,
    )
    .bind(run_id)
    .bind(step_name)
    .execute(&mut *conn)
    .await?;

    for task_index in 0..step.initial_tasks {
        publish_task(conn, run_id, step_name, task_index, queue_name).await?;
    }
    Ok(None)
}

/// PostgreSQL + pgmq store shared by every worker process
#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> StoreResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::database("begin", e))
    }

    async fn fail_in_transaction(
        &self,
        message: &TaskMessage,
        attempt: i32,
        error: &str,
        permanent: bool,
        policy: &RetryPolicy,
        queue_name: &str,
    ) -> StoreResult<FailureOutcome> {
        let mut tx = self.begin().await?;
        lock_run(&mut tx, message.run_id).await?;
        let task = lock_task(&mut tx, message).await?;
        if task.status != TaskStatus::Started {
            return Ok(FailureOutcome::AlreadyFinalized {
                status: task.status,
            });
        }
        if task.attempts_count != attempt {
            return Ok(FailureOutcome::Superseded {
                current_attempt: task.attempts_count,
            });
        }
        let step = fetch_step(&mut tx, message.run_id, &message.step_name).await?;

        let decision = policy.decide(
            u32::try_from(task.attempts_count).unwrap_or(0),
            u32::try_from(step.max_attempts).unwrap_or(0),
            permanent,
        );
        let outcome = match decision {
            RetryDecision::Retry { delay } => {
                sqlx::query(
                    "UPDATE tasker_dag_tasks SET status = 'queued', error = $2 WHERE task_id = $1",
                )
                .bind(task.task_id)
                .bind(error)
                .execute(&mut *tx)
                .await?;

                let reused = match task.queue_message_id {
                    Some(msg_id) => {
                        PgmqClient::set_vt_with(&mut *tx, queue_name, msg_id, delay).await?
                    }
                    None => false,
                };
                if !reused {
                    warn!(task = %message, "Task message missing on retry, publishing a new one");
                    let msg_id =
                        PgmqClient::send_with(&mut *tx, queue_name, &message.to_json()?, delay)
                            .await?;
                    sqlx::query("UPDATE tasker_dag_tasks SET queue_message_id = $2 WHERE task_id = $1")
                        .bind(task.task_id)
                        .bind(msg_id)
                        .execute(&mut *tx)
                        .await?;
                }
                FailureOutcome::Retrying {
                    attempts_count: task.attempts_count,
                    delay,
                }
            }
            RetryDecision::Fail => {
                sqlx::query(
                    r#"
                    UPDATE tasker_dag_tasks
                    SET status = 'failed', error = $2, failed_at = now()
                    WHERE task_id = $1
                    "#,
                )
                .bind(task.task_id)
                .bind(error)
                .execute(&mut *tx)
                .await?;
                if let Some(msg_id) = task.queue_message_id {
                    PgmqClient::archive_with(&mut *tx, queue_name, msg_id).await?;
                }
                let run_failed =
                    fail_step_and_run(&mut tx, message.run_id, &message.step_name, error).await?;
                FailureOutcome::Failed {
                    attempts_count: task.attempts_count,
                    run_failed,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::database("commit", e))?;
        Ok(outcome)
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    #[instrument(skip(self, workflow, input), fields(workflow = %workflow.name()))]
    async fn create_run(
        &self,
        workflow: &Workflow,
        input: Value,
        queue_name: &str,
    ) -> StoreResult<Run> {
        let step_count = i32::try_from(workflow.step_count())
            .map_err(|_| StoreError::Inconsistent("too many steps".to_string()))?;
        let run = Run::new(workflow.name(), input, step_count);
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasker_dag_runs
                (run_id, workflow_name, input, status, remaining_steps, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.workflow_name)
        .bind(&run.input)
        .bind(run.status.as_str())
        .bind(run.remaining_steps)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        for step in workflow.steps() {
            let state = StepState::for_step(run.run_id, step);
            sqlx::query(
                r#"
                INSERT INTO tasker_dag_step_states
                    (step_state_id, run_id, step_name, status, remaining_tasks, remaining_deps,
                     initial_tasks, timeout_ms, max_attempts, created_at, started_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(state.step_state_id)
            .bind(state.run_id)
            .bind(&state.step_name)
            .bind(state.status.as_str())
            .bind(state.remaining_tasks)
            .bind(state.remaining_deps)
            .bind(state.initial_tasks)
            .bind(state.timeout_ms)
            .bind(state.max_attempts)
            .bind(state.created_at)
            .bind(state.started_at)
            .execute(&mut *tx)
            .await?;
        }

        // Edges after all steps so both foreign keys resolve
        for step in workflow.steps() {
            for upstream in step.dependencies() {
                sqlx::query(
                    r#"
                    INSERT INTO tasker_dag_step_dependencies
                        (run_id, step_name, depends_on_step_name)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(run.run_id)
                .bind(step.name())
                .bind(upstream)
                .execute(&mut *tx)
                .await?;
            }
        }

        for step in workflow.root_steps() {
            let initial_tasks = i32::try_from(step.initial_tasks()).unwrap_or(i32::MAX);
            for task_index in 0..initial_tasks {
                publish_task(&mut tx, run.run_id, step.name(), task_index, queue_name).await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::database("commit", e))?;
        debug!(run_id = %run.run_id, "Run created");
        Ok(run)
    }

    #[instrument(skip(self), fields(task = %message))]
    async fn claim_task(
        &self,
        message: &TaskMessage,
        msg_id: i64,
        worker_id: &str,
        queue_name: &str,
    ) -> StoreResult<ClaimOutcome> {
        let now: DateTime<Utc> = Utc::now();
        let mut tx = self.begin().await?;

        let sql = format!(
            "SELECT {} FROM tasker_dag_tasks \
             WHERE run_id = $1 AND step_name = $2 AND task_index = $3 \
             FOR UPDATE SKIP LOCKED",
            Task::COLUMNS
        );
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(message.run_id)
            .bind(&message.step_name)
            .bind(message.task_index)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(task) = task else {
            let exists = sqlx::query_scalar::<_, bool>(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM tasker_dag_tasks
                    WHERE run_id = $1 AND step_name = $2 AND task_index = $3
                )
                "#,
            )
            .bind(message.run_id)
            .bind(&message.step_name)
            .bind(message.task_index)
            .fetch_one(&mut *tx)
            .await?;
            if exists {
                return Ok(ClaimOutcome::Skipped(SkipReason::Contended));
            }
            PgmqClient::archive_with(&mut *tx, queue_name, msg_id).await?;
            tx.commit()
                .await
                .map_err(|e| StoreError::database("commit", e))?;
            return Ok(ClaimOutcome::Skipped(SkipReason::UnknownTask));
        };

        let step = fetch_step(&mut tx, message.run_id, &message.step_name).await?;

        match decide_claim(&task, &step, msg_id, now) {
            ClaimDecision::Claim { reclaimed } => {
                let sql = format!(
                    r#"
                    UPDATE tasker_dag_tasks
                    SET status = 'started', attempts_count = attempts_count + 1,
                        last_worker_id = $2, started_at = $3, queue_message_id = $4
                    WHERE task_id = $1
                    RETURNING {}
                    "#,
                    Task::COLUMNS
                );
                let task = sqlx::query_as::<_, Task>(&sql)
                    .bind(task.task_id)
                    .bind(worker_id)
                    .bind(now)
                    .bind(msg_id)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit()
                    .await
                    .map_err(|e| StoreError::database("commit", e))?;
                Ok(ClaimOutcome::Claimed(ClaimedTask {
                    task,
                    step,
                    reclaimed,
                }))
            }
            ClaimDecision::Skip(reason) => {
                if reason.archives_message() {
                    PgmqClient::archive_with(&mut *tx, queue_name, msg_id).await?;
                    tx.commit()
                        .await
                        .map_err(|e| StoreError::database("commit", e))?;
                }
                Ok(ClaimOutcome::Skipped(reason))
            }
            ClaimDecision::Exhaust => {
                // Release the task lock; failing takes the run lock first
                drop(tx);
                // A claim that slips in before the re-lock makes this report stale
                self.fail_in_transaction(
                    message,
                    task.attempts_count,
                    &exhausted_error(task.attempts_count),
                    true,
                    &RetryPolicy::default(),
                    queue_name,
                )
                .await?;
                Ok(ClaimOutcome::Skipped(SkipReason::AttemptsExhausted))
            }
        }
    }

    async fn step_inputs(&self, run_id: Uuid, step_name: &str) -> StoreResult<StepInputs> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::database("acquire", e))?;
        let run_input = sqlx::query_scalar::<_, Value>(
            "SELECT input FROM tasker_dag_runs WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;
        let step = fetch_step(&mut conn, run_id, step_name).await?;
        let dependency_outputs = dependency_outputs(&mut conn, run_id, step_name).await?;
        Ok(StepInputs {
            run_id,
            step_name: step_name.to_string(),
            run_input,
            initial_tasks: step.initial_tasks,
            dependency_outputs,
        })
    }

    #[instrument(skip(self, output), fields(task = %message))]
    async fn complete_task(
        &self,
        message: &TaskMessage,
        attempt: i32,
        output: Value,
        queue_name: &str,
    ) -> StoreResult<CompletionOutcome> {
        let run_id = message.run_id;
        let step_name = message.step_name.as_str();
        let mut tx = self.begin().await?;

        lock_run(&mut tx, run_id).await?;
        let task = lock_task(&mut tx, message).await?;
        if task.status != TaskStatus::Started {
            return Ok(CompletionOutcome::AlreadyFinalized {
                status: task.status,
            });
        }
        if task.attempts_count != attempt {
            return Ok(CompletionOutcome::Superseded {
                current_attempt: task.attempts_count,
            });
        }

        sqlx::query(
            r#"
            UPDATE tasker_dag_tasks
            SET status = 'completed', output = $2, completed_at = now()
            WHERE task_id = $1
            "#,
        )
        .bind(task.task_id)
        .bind(&output)
        .execute(&mut *tx)
        .await?;
        if let Some(msg_id) = task.queue_message_id {
            PgmqClient::archive_with(&mut *tx, queue_name, msg_id).await?;
        }

        let sql = format!(
            r#"
            UPDATE tasker_dag_step_states
            SET remaining_tasks = remaining_tasks - 1
            WHERE run_id = $1 AND step_name = $2
            RETURNING {}
            "#,
            StepState::COLUMNS
        );
        let step = sqlx::query_as::<_, StepState>(&sql)
            .bind(run_id)
            .bind(step_name)
            .fetch_one(&mut *tx)
            .await?;
        let step_completed = step.remaining_tasks == 0 && step.status == StepStatus::Started;

        let mut report = CascadeReport {
            step_completed,
            started_steps: Vec::new(),
            run_status: RunStatus::Running,
            map_violations: Vec::new(),
        };

        if step_completed {
            sqlx::query(
                r#"
                UPDATE tasker_dag_step_states
                SET status = 'completed', completed_at = now()
                WHERE run_id = $1 AND step_name = $2
                "#,
            )
            .bind(run_id)
            .bind(step_name)
            .execute(&mut *tx)
            .await?;

            let mut dependents = sqlx::query_as::<_, DependentRow>(
                r#"
                UPDATE tasker_dag_step_states s
                SET remaining_deps = s.remaining_deps - 1
                FROM tasker_dag_step_dependencies d
                WHERE d.run_id = $1 AND d.depends_on_step_name = $2
                  AND s.run_id = d.run_id AND s.step_name = d.step_name
                RETURNING s.step_name, s.remaining_deps, s.status
                "#,
            )
            .bind(run_id)
            .bind(step_name)
            .fetch_all(&mut *tx)
            .await?;
            dependents.sort_by(|a, b| a.step_name.cmp(&b.step_name));

            for dependent in dependents {
                if dependent.remaining_deps > 0 || dependent.status != StepStatus::Pending {
                    continue;
                }
                match start_step(&mut tx, run_id, &dependent.step_name, queue_name).await? {
                    Some(violation) => report.map_violations.push(violation),
                    None => report.started_steps.push(dependent.step_name),
                }
            }

            let counter = sqlx::query_as::<_, RunCounterRow>(
                r#"
                UPDATE tasker_dag_runs
                SET remaining_steps = remaining_steps - 1
                WHERE run_id = $1
                RETURNING remaining_steps, status
                "#,
            )
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;

            if counter.remaining_steps == 0 && counter.status == RunStatus::Running {
                let output = leaf_output(&mut tx, run_id).await?;
                sqlx::query(
                    r#"
                    UPDATE tasker_dag_runs
                    SET status = 'completed', output = $2, completed_at = now()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .bind(&output)
                .execute(&mut *tx)
                .await?;
            }
        }

        report.run_status = sqlx::query_as::<_, RunCounterRow>(
            "SELECT remaining_steps, status FROM tasker_dag_runs WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?
        .status;

        tx.commit()
            .await
            .map_err(|e| StoreError::database("commit", e))?;
        Ok(CompletionOutcome::Completed(report))
    }

    #[instrument(skip(self, policy), fields(task = %message))]
    async fn fail_task(
        &self,
        message: &TaskMessage,
        attempt: i32,
        error: &str,
        permanent: bool,
        policy: &RetryPolicy,
        queue_name: &str,
    ) -> StoreResult<FailureOutcome> {
        self.fail_in_transaction(message, attempt, error, permanent, policy, queue_name)
            .await
    }

    async fn run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let sql = format!("SELECT {} FROM tasker_dag_runs WHERE run_id = $1", Run::COLUMNS);
        Ok(sqlx::query_as::<_, Run>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn step_states(&self, run_id: Uuid) -> StoreResult<Vec<StepState>> {
        let sql = format!(
            "SELECT {} FROM tasker_dag_step_states WHERE run_id = $1 ORDER BY step_name",
            StepState::COLUMNS
        );
        Ok(sqlx::query_as::<_, StepState>(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn step_dependencies(&self, run_id: Uuid) -> StoreResult<Vec<StepDependency>> {
        Ok(sqlx::query_as::<_, StepDependency>(
            r#"
            SELECT run_id, step_name, depends_on_step_name
            FROM tasker_dag_step_dependencies
            WHERE run_id = $1
            ORDER BY step_name, depends_on_step_name
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn tasks(&self, run_id: Uuid) -> StoreResult<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasker_dag_tasks WHERE run_id = $1 ORDER BY step_name, task_index",
            Task::COLUMNS
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn record_heartbeat(&self, worker_id: &str, queue_name: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasker_dag_workers (worker_id, queue_name, started_at, last_heartbeat_at)
            VALUES ($1, $2, now(), now())
            ON CONFLICT (worker_id) DO UPDATE
            SET queue_name = EXCLUDED.queue_name,
                last_heartbeat_at = now(),
                stopped_at = NULL
            "#,
        )
        .bind(worker_id)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_worker_stopped(&self, worker_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE tasker_dag_workers SET stopped_at = now() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn workers(&self) -> StoreResult<Vec<Worker>> {
        Ok(sqlx::query_as::<_, Worker>(
            r#"
            SELECT worker_id, queue_name, started_at, last_heartbeat_at, stopped_at
            FROM tasker_dag_workers
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
