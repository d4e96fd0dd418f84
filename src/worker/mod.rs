//! # Worker
//!
//! Independent worker processes coordinate only through the store and the queue: any
//! number of them may poll the same workflow queue.

pub mod registry;
pub mod task_worker;

pub use registry::WorkerRegistry;
pub use task_worker::{BatchSummary, TaskOutcome, TaskWorker, WorkerHandle};
