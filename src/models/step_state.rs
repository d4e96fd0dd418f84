//! # Step State Model
//!
//! Per-run state of one workflow step. Maps to `tasker_dag_step_states`.
//!
//! `remaining_deps` counts upstream steps not yet completed; the step's tasks are
//! created when it reaches zero. `remaining_tasks` counts tasks not yet completed; the
//! step completes when it reaches zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use crate::state_machine::StepStatus;
use crate::workflow::WorkflowStep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StepState {
    pub step_state_id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    #[sqlx(try_from = "String")]
    pub status: StepStatus,
    pub remaining_tasks: i32,
    pub remaining_deps: i32,
    pub initial_tasks: i32,
    pub timeout_ms: i64,
    pub max_attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub(crate) const COLUMNS: &'static str = "step_state_id, run_id, step_name, status, \
         remaining_tasks, remaining_deps, initial_tasks, timeout_ms, max_attempts, error, \
         created_at, started_at, completed_at, failed_at";

    /// Initial row for a step; roots start immediately
    pub fn for_step(run_id: Uuid, step: &WorkflowStep) -> Self {
        let now = Utc::now();
        let initial_tasks = i32::try_from(step.initial_tasks()).unwrap_or(i32::MAX);
        let is_root = step.is_root();
        Self {
            step_state_id: Uuid::new_v4(),
            run_id,
            step_name: step.name().to_string(),
            status: if is_root {
                StepStatus::Started
            } else {
                StepStatus::Pending
            },
            remaining_tasks: initial_tasks,
            remaining_deps: i32::try_from(step.dependencies().len()).unwrap_or(i32::MAX),
            initial_tasks,
            timeout_ms: i64::try_from(step.timeout().as_millis()).unwrap_or(i64::MAX),
            max_attempts: i32::try_from(step.max_attempts()).unwrap_or(i32::MAX),
            error: None,
            created_at: now,
            started_at: is_root.then_some(now),
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.timeout_ms).unwrap_or(0))
    }

    pub fn is_map(&self) -> bool {
        self.initial_tasks > 1
    }
}
