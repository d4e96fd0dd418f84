//! # In-Memory Durable Queue
//!
//! Thread-safe queue with pgmq semantics for tests and single-process use.
//!
//! ## Features
//!
//! - **Visibility Timeout**: read messages stay hidden until their timeout lapses
//! - **Long Polling**: readers park on a [`Notify`] instead of spinning
//! - **Archive Retention**: the most recent archived messages per queue are kept for
//!   inspection, like pgmq's `a_` tables; older ones are dropped

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::errors::{MessagingError, MessagingResult};
use super::message::QueuedMessage;
use super::queue::DurableQueue;

/// Re-check cadence while long-polling; covers messages whose delay lapses mid-poll
const POLL_RECHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Archived messages retained per queue
pub const DEFAULT_ARCHIVE_RETENTION: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    payload: Value,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    read_count: i32,
}

impl StoredMessage {
    fn to_queued(&self) -> QueuedMessage<Value> {
        QueuedMessage {
            msg_id: self.id,
            read_count: self.read_count,
            enqueued_at: self.enqueued_at,
            visible_at: self.visible_at,
            message: self.payload.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// FIFO by enqueue order
    messages: VecDeque<StoredMessage>,
    /// Keyed by message id; ids grow, so the first entry is the oldest
    archived: BTreeMap<i64, StoredMessage>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// In-memory queue provider
///
/// ```rust
/// use std::time::Duration;
/// use tasker_dag::messaging::{DurableQueue, InMemoryQueue};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = InMemoryQueue::new();
/// queue.ensure_queue("demo_tasks").await?;
/// let id = queue.send("demo_tasks", &serde_json::json!({"k": "v"})).await?;
/// let batch = queue
///     .read_with_poll("demo_tasks", 10, Duration::from_secs(30), Duration::from_millis(50))
///     .await?;
/// assert_eq!(batch[0].msg_id, id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryQueue {
    queues: DashMap<String, QueueState>,
    next_id: AtomicI64,
    notify: Notify,
    archive_retention: usize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_archive_retention(DEFAULT_ARCHIVE_RETENTION)
    }

    /// Keep at most `archive_retention` archived messages per queue
    pub fn with_archive_retention(archive_retention: usize) -> Self {
        Self {
            queues: DashMap::new(),
            next_id: AtomicI64::new(1),
            notify: Notify::new(),
            archive_retention,
        }
    }

    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    pub fn create_queue(&self, queue_name: &str) {
        self.queues.entry(queue_name.to_string()).or_default();
    }

    /// Publish a message that becomes visible after `delay`
    pub fn enqueue(&self, queue_name: &str, payload: Value, delay: Duration) -> MessagingResult<i64> {
        let id = {
            let mut queue = self
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
            let now = Utc::now();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            queue.messages.push_back(StoredMessage {
                id,
                payload,
                enqueued_at: now,
                visible_at: now + to_chrono(delay),
                read_count: 0,
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Read without waiting
    pub fn read_now(
        &self,
        queue_name: &str,
        limit: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<QueuedMessage<Value>>> {
        let mut queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        let now = Utc::now();
        let hidden_until = now + to_chrono(visibility_timeout);

        let mut batch = Vec::new();
        for message in queue.messages.iter_mut() {
            if batch.len() >= limit {
                break;
            }
            if message.visible_at <= now {
                message.visible_at = hidden_until;
                message.read_count += 1;
                batch.push(message.to_queued());
            }
        }
        Ok(batch)
    }

    /// `false` when the message is not live
    pub fn set_visibility(
        &self,
        queue_name: &str,
        message_id: i64,
        timeout: Duration,
    ) -> MessagingResult<bool> {
        let updated = {
            let mut queue = self
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
            let visible_at = Utc::now() + to_chrono(timeout);
            match queue.messages.iter_mut().find(|m| m.id == message_id) {
                Some(message) => {
                    message.visible_at = visible_at;
                    true
                }
                None => false,
            }
        };
        if updated && timeout.is_zero() {
            self.notify.notify_waiters();
        }
        Ok(updated)
    }

    /// Move a live message to the archive
    pub fn archive_now(&self, queue_name: &str, message_id: i64) -> MessagingResult<bool> {
        let mut queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        let Some(position) = queue.messages.iter().position(|m| m.id == message_id) else {
            return Ok(false);
        };
        if let Some(message) = queue.messages.remove(position) {
            queue.archived.insert(message.id, message);
            while queue.archived.len() > self.archive_retention {
                queue.archived.pop_first();
            }
        }
        Ok(true)
    }

    /// Live (unarchived) messages, visible or not
    pub fn live_count(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Retained archived messages; at most the archive retention
    pub fn archived_count(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map(|q| q.archived.len())
            .unwrap_or(0)
    }

    /// False for messages archived long enough ago to have been dropped
    pub fn is_archived(&self, queue_name: &str, message_id: i64) -> bool {
        self.queues
            .get(queue_name)
            .map(|q| q.archived.contains_key(&message_id))
            .unwrap_or(false)
    }

    /// Snapshot of a live message, including hidden ones
    pub fn peek(&self, queue_name: &str, message_id: i64) -> Option<QueuedMessage<Value>> {
        self.queues.get(queue_name).and_then(|q| {
            q.messages
                .iter()
                .find(|m| m.id == message_id)
                .map(StoredMessage::to_queued)
        })
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.create_queue(queue_name);
        Ok(())
    }

    async fn send(&self, queue_name: &str, message: &Value) -> MessagingResult<i64> {
        self.enqueue(queue_name, message.clone(), Duration::ZERO)
    }

    async fn read_with_poll(
        &self,
        queue_name: &str,
        limit: usize,
        visibility_timeout: Duration,
        poll_timeout: Duration,
    ) -> MessagingResult<Vec<QueuedMessage<Value>>> {
        let deadline = Instant::now() + poll_timeout;
        loop {
            // Register interest before checking so a concurrent send cannot be missed
            let notified = self.notify.notified();
            let batch = self.read_now(queue_name, limit, visibility_timeout)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let wait = (deadline - now).min(POLL_RECHECK_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn set_visibility_timeout_batch(
        &self,
        queue_name: &str,
        message_ids: &[i64],
        timeout: Duration,
    ) -> MessagingResult<()> {
        for &message_id in message_ids {
            self.set_visibility(queue_name, message_id, timeout)?;
        }
        Ok(())
    }

    async fn archive(&self, queue_name: &str, message_id: i64) -> MessagingResult<bool> {
        self.archive_now(queue_name, message_id)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
