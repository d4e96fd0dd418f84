//! # Task Model
//!
//! One executable unit of a step, identified by `(run_id, step_name, task_index)`.
//! Maps to `tasker_dag_tasks`.
//!
//! A non-terminal task has exactly one live queue message, `queue_message_id`; retries
//! reuse it by changing its visibility. `attempts_count` counts claims and never resets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use crate::messaging::TaskMessage;
use crate::state_machine::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    pub task_index: i32,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub attempts_count: i32,
    pub output: Option<Value>,
    pub queue_message_id: Option<i64>,
    pub last_worker_id: Option<String>,
    /// Most recent failure, kept across retries
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) const COLUMNS: &'static str = "task_id, run_id, step_name, task_index, status, \
         attempts_count, output, queue_message_id, last_worker_id, error, queued_at, \
         started_at, completed_at, failed_at";

    pub fn new(run_id: Uuid, step_name: impl Into<String>, task_index: i32) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            run_id,
            step_name: step_name.into(),
            task_index,
            status: TaskStatus::Queued,
            attempts_count: 0,
            output: None,
            queue_message_id: None,
            last_worker_id: None,
            error: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn message(&self) -> TaskMessage {
        TaskMessage::new(self.run_id, self.step_name.clone(), self.task_index)
    }

    /// When a started task's claim lapses and its message may be re-claimed
    pub fn lease_expires_at(&self, timeout: Duration) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(timeout).ok()?;
        self.started_at.map(|started_at| started_at + timeout)
    }
}
