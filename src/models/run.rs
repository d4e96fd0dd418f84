//! # Run Model
//!
//! One execution of a workflow against an input. Maps to `tasker_dag_runs`.
//!
//! `remaining_steps` starts at the workflow's step count and reaches zero exactly when
//! the run completes. A failed run keeps the first permanent failure in
//! `failed_step_name` / `error` and never completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::state_machine::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub remaining_steps: i32,
    /// `{leaf_step: output}` once completed
    pub output: Option<Value>,
    pub error: Option<String>,
    pub failed_step_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub(crate) const COLUMNS: &'static str = "run_id, workflow_name, input, status, remaining_steps, \
         output, error, failed_step_name, created_at, completed_at, failed_at";

    pub fn new(workflow_name: impl Into<String>, input: Value, step_count: i32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            input,
            status: RunStatus::Running,
            remaining_steps: step_count,
            output: None,
            error: None,
            failed_step_name: None,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
