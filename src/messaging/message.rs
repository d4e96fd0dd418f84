//! # Queue Message Structures
//!
//! Task messages carry only the task's identity; inputs are read from the store when
//! the task is claimed, so a redelivered message always sees current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};

/// Identity of one task: `(run_id, step_name, task_index)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskMessage {
    pub run_id: Uuid,
    pub step_name: String,
    pub task_index: i32,
}

impl TaskMessage {
    pub fn new(run_id: Uuid, step_name: impl Into<String>, task_index: i32) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            task_index,
        }
    }

    pub fn to_json(&self) -> MessagingResult<Value> {
        serde_json::to_value(self).map_err(MessagingError::from)
    }

    pub fn from_json(value: &Value) -> MessagingResult<Self> {
        Self::deserialize(value)
            .map_err(|e| MessagingError::message_deserialization(format!("task message: {e}")))
    }
}

impl fmt::Display for TaskMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.run_id, self.step_name, self.task_index)
    }
}

/// A message as read from a queue, with delivery metadata
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage<T = Value> {
    pub msg_id: i64,
    /// Deliveries so far, including this one
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    /// When the message becomes visible again if not archived
    pub visible_at: DateTime<Utc>,
    pub message: T,
}

impl QueuedMessage<Value> {
    /// Decode the payload as a [`TaskMessage`]
    pub fn task_message(&self) -> MessagingResult<QueuedMessage<TaskMessage>> {
        Ok(QueuedMessage {
            msg_id: self.msg_id,
            read_count: self.read_count,
            enqueued_at: self.enqueued_at,
            visible_at: self.visible_at,
            message: TaskMessage::from_json(&self.message)?,
        })
    }
}
