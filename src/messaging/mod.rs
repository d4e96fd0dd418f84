//! # Messaging
//!
//! Durable queue abstraction with pgmq and in-memory providers.

pub mod errors;
pub mod in_memory;
pub mod message;
pub mod pgmq_client;
pub mod queue;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::{InMemoryQueue, DEFAULT_ARCHIVE_RETENTION};
pub use message::{QueuedMessage, TaskMessage};
pub use pgmq_client::PgmqClient;
pub use queue::{duration_to_whole_seconds, DurableQueue};
