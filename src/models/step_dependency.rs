use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// `step_name` waits on `depends_on_step_name` within one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, FromRow)]
pub struct StepDependency {
    pub run_id: Uuid,
    pub step_name: String,
    pub depends_on_step_name: String,
}

impl StepDependency {
    pub fn new(run_id: Uuid, step_name: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            depends_on_step_name: depends_on.into(),
        }
    }
}
