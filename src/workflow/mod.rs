//! # Workflow Definitions
//!
//! Declaration, validation and payload shaping for DAG workflows.

mod dag;
pub mod definition;
pub mod payload;

pub use definition::{
    DefinitionError, StepDefaults, StepDefinition, Workflow, WorkflowDefinition, WorkflowStep,
    RUN_INPUT_KEY,
};
pub use payload::MapSourceError;
