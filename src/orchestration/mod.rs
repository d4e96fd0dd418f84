//! # Orchestration
//!
//! Step handler contract, retry policy, run initialization and result processing,
//! tied together by [`WorkflowEngine`].
//!
//! ## Core Components
//!
//! - **StepHandler**: caller-supplied business logic, one per step
//! - **RunInitializer**: creates a run and publishes its root tasks
//! - **StepResultProcessor**: feeds handler outcomes into the completion cascade or
//!   the retry decision
//! - **RetryPolicy**: exponential backoff between attempts

pub mod backoff;
pub mod engine;
pub mod run_initializer;
pub mod step_handler;
pub mod step_result_processor;

pub use backoff::{RetryDecision, RetryPolicy};
pub use engine::WorkflowEngine;
pub use run_initializer::RunInitializer;
pub use step_handler::{handler_fn, FnHandler, HandlerError, StepHandler};
pub use step_result_processor::StepResultProcessor;
