//! # Error Handling
//!
//! Crate-wide error type. Component errors convert into [`EngineError`] so callers can
//! use `?` across layers; the component enums stay available for precise matching.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::store::StoreError;
use crate::workflow::{DefinitionError, MapSourceError};

/// A map step's upstream output is not a collection.
///
/// Raised when a map step becomes ready (the run is failed before any of its tasks
/// exist), and when a claimed map task builds its input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Type violation in run {run_id}, step '{step_name}': {reason}")]
pub struct TypeViolationError {
    pub run_id: Uuid,
    pub step_name: String,
    pub reason: String,
}

impl TypeViolationError {
    pub fn new(run_id: Uuid, step_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            reason: reason.into(),
        }
    }
}

/// A map step's upstream array does not have one element per declared task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Map size mismatch in run {run_id}, step '{step_name}': source '{source_step}' produced {actual} elements, {expected} tasks declared"
)]
pub struct MapSizeError {
    pub run_id: Uuid,
    pub step_name: String,
    pub source_step: String,
    pub expected: usize,
    pub actual: usize,
}

/// Why a ready map step could not fan out over its source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapStepError {
    #[error(transparent)]
    TypeViolation(#[from] TypeViolationError),

    #[error(transparent)]
    SizeMismatch(#[from] MapSizeError),
}

impl MapStepError {
    pub fn from_source(run_id: Uuid, step_name: &str, source: MapSourceError) -> Self {
        match source {
            MapSourceError::LengthMismatch {
                source_step,
                expected,
                actual,
            } => MapSizeError {
                run_id,
                step_name: step_name.to_string(),
                source_step,
                expected,
                actual,
            }
            .into(),
            other => TypeViolationError::new(run_id, step_name, other.to_string()).into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    TypeViolation(#[from] TypeViolationError),

    #[error(transparent)]
    MapSizeMismatch(#[from] MapSizeError),

    #[error("Queue error: {0}")]
    Queue(#[from] MessagingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),
}

impl From<MapStepError> for EngineError {
    fn from(err: MapStepError) -> Self {
        match err {
            MapStepError::TypeViolation(e) => Self::TypeViolation(e),
            MapStepError::SizeMismatch(e) => Self::MapSizeMismatch(e),
        }
    }
}

impl EngineError {
    /// Queue and store failures are transient from the poll loop's point of view.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
