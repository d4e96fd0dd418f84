use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Heartbeat row of a worker process. Informational only; never used for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub worker_id: String,
    pub queue_name: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// No heartbeat within `threshold` of `now`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.last_heartbeat_at > threshold
    }
}
