//! # Step Handlers
//!
//! The user-supplied unit of work behind every step. A handler receives the merged step
//! input and returns an output or a classified failure.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

/// Handler failure classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Requeued with backoff while attempts remain
    #[error("Retryable step error: {0}")]
    Retryable(String),

    /// Fails the task, its step and the run immediately
    #[error("Permanent step error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::Permanent(message) => message,
        }
    }
}

/// Unclassified errors from `?` inside handlers are retried
impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Retryable(format!("{error:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Permanent(format!("JSON error: {error}"))
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn call(&self, input: Value) -> Result<Value, HandlerError>;
}

/// Adapter created by [`handler_fn`]
pub struct FnHandler<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`StepHandler`]
///
/// ```rust
/// use serde_json::json;
/// use tasker_dag::orchestration::{handler_fn, HandlerError};
///
/// let double = handler_fn(|input| async move {
///     let n = input["run"]["n"].as_i64().ok_or_else(|| HandlerError::permanent("missing n"))?;
///     Ok(json!(n * 2))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    FnHandler {
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, input: Value) -> Result<Value, HandlerError> {
        (self.f)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_passes_input_through() {
        let handler = handler_fn(|input| async move { Ok(json!({"echo": input})) });
        let output = handler.call(json!({"a": 1})).await.unwrap();
        assert_eq!(output, json!({"echo": {"a": 1}}));
    }

    #[tokio::test]
    async fn test_anyhow_errors_are_retryable() {
        let handler = handler_fn(|_input| async move {
            let parsed: i32 = "not a number".parse::<i32>().map_err(anyhow::Error::from)?;
            Ok(json!(parsed))
        });
        let err = handler.call(json!(null)).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(err.message().contains("invalid digit"));
    }

    #[test]
    fn test_classification_helpers() {
        assert!(HandlerError::permanent("bad input").is_permanent());
        assert_eq!(HandlerError::retryable("later").message(), "later");
    }
}
