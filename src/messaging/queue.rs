//! # Durable Queue Abstraction
//!
//! Visibility-timeout queue semantics shared by pgmq and the in-memory provider:
//! a read hides messages for the visibility timeout, an unarchived message reappears
//! once that timeout lapses, and archiving removes it for good.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::errors::MessagingResult;
use super::message::QueuedMessage;

#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    /// Create the queue if it does not exist
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()>;

    async fn send(&self, queue_name: &str, message: &Value) -> MessagingResult<i64>;

    /// Read up to `limit` visible messages, hiding them for `visibility_timeout`.
    ///
    /// Blocks up to `poll_timeout` while the queue is empty.
    async fn read_with_poll(
        &self,
        queue_name: &str,
        limit: usize,
        visibility_timeout: Duration,
        poll_timeout: Duration,
    ) -> MessagingResult<Vec<QueuedMessage<Value>>>;

    /// Hide each message for `timeout` from now
    async fn set_visibility_timeout_batch(
        &self,
        queue_name: &str,
        message_ids: &[i64],
        timeout: Duration,
    ) -> MessagingResult<()>;

    /// Returns `false` when the message was already archived or never existed
    async fn archive(&self, queue_name: &str, message_id: i64) -> MessagingResult<bool>;

    fn provider_name(&self) -> &'static str;
}

/// pgmq takes whole seconds; round up so a timeout never shrinks
pub fn duration_to_whole_seconds(duration: Duration) -> i32 {
    let seconds = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i32::try_from(seconds).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_round_up() {
        assert_eq!(duration_to_whole_seconds(Duration::ZERO), 0);
        assert_eq!(duration_to_whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(duration_to_whole_seconds(Duration::from_millis(1000)), 1);
        assert_eq!(duration_to_whole_seconds(Duration::from_millis(2500)), 3);
        assert_eq!(duration_to_whole_seconds(Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
