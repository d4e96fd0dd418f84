//! # Models
//!
//! Persisted entities, shared by the PostgreSQL and in-memory stores.

pub mod run;
pub mod step_dependency;
pub mod step_state;
pub mod task;
pub mod worker;

pub use run::Run;
pub use step_dependency::StepDependency;
pub use step_state::StepState;
pub use task::Task;
pub use worker::Worker;
