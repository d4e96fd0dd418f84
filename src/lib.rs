#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker DAG
//!
//! Durable, crash-tolerant DAG workflow execution engine.
//!
//! ## Overview
//!
//! A workflow is declared as a set of named steps with dependencies. Starting a run
//! materializes the DAG as rows in a relational store (one row per step with
//! dependency and task counters) and publishes the root steps' tasks to a durable
//! queue. Any number of independent worker processes long-poll that queue, claim
//! tasks, execute the caller's step handlers and report back. Completions cascade
//! through counter decrements until every step is done and the run completes.
//!
//! ## Key Features
//!
//! - **Transactional Counters**: `remaining_deps`, `remaining_tasks` and
//!   `remaining_steps` are mutated in the same transaction as the transitions they gate
//! - **Map Steps**: a step declared with `initial_tasks = N` fans out over its upstream
//!   array, one task per element
//! - **At-Least-Once Delivery**: idempotent claim and completion, visibility-timeout
//!   based crash recovery
//! - **Retry With Backoff**: `base * 2^attempts`, capped, reusing the task's queue message
//! - **Pluggable Backends**: PostgreSQL + pgmq for production, in-memory for tests
//!
//! ## Module Organization
//!
//! - [`workflow`] - Workflow definition, DAG validation and payload shaping
//! - [`orchestration`] - Step handlers, run initialization, result processing, retry policy
//! - [`worker`] - Claim/execute loop and worker heartbeat registry
//! - [`store`] - Persistence trait with PostgreSQL and in-memory implementations
//! - [`messaging`] - Durable queue trait with pgmq and in-memory implementations
//! - [`models`] - Persisted entities
//! - [`state_machine`] - Run, step and task status enums
//! - [`config`] - Configuration loading
//! - [`database`] - Connection pooling and migrations
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-wide error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tasker_dag::config::EngineConfig;
//! use tasker_dag::orchestration::{handler_fn, WorkflowEngine};
//! use tasker_dag::workflow::{StepDefinition, WorkflowDefinition};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = WorkflowDefinition::new("greeting")
//!     .step(StepDefinition::new("hello", handler_fn(|_input| async move { Ok(json!("hello")) })))
//!     .step(
//!         StepDefinition::new("world", handler_fn(|input| async move { Ok(json!({"got": input})) }))
//!             .depends_on(["hello"]),
//!     )
//!     .build()?;
//! let workflow = Arc::new(workflow);
//!
//! let engine = WorkflowEngine::in_memory(EngineConfig::default());
//! let worker = engine.spawn_worker(workflow.clone()).await?;
//! let run_id = engine.start(&workflow, json!({"name": "tasker"})).await?;
//!
//! // ... later
//! let run = engine.run(run_id).await?;
//! println!("run {} is {}", run.run_id, run.status);
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;
pub mod worker;
pub mod workflow;

pub use config::{BackoffConfig, DatabaseConfig, EngineConfig, QueueConfig, WorkerConfig};
pub use error::{EngineError, MapSizeError, MapStepError, Result, TypeViolationError};
pub use models::{Run, StepDependency, StepState, Task, Worker};
pub use orchestration::{handler_fn, HandlerError, StepHandler, WorkflowEngine};
pub use state_machine::{RunStatus, StepStatus, TaskStatus};
pub use workflow::{DefinitionError, StepDefinition, Workflow, WorkflowDefinition};
