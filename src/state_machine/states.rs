use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A status column held a value outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind} status: {value}")]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle of a whole workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created and not yet terminal
    Running,
    /// Every step completed; output holds the leaf outputs
    Completed,
    /// A step failed permanently or a map input was malformed
    Failed,
}

impl RunStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle of one step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on upstream steps
    Pending,
    /// Tasks have been created and published
    Started,
    /// All tasks completed
    Completed,
    /// A task failed permanently or the map input was malformed
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Only a completed step unblocks its dependents.
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle of a single unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Published and waiting for a worker (also the state while a retry is delayed)
    Queued,
    /// Claimed by a worker
    Started,
    /// Handler returned an output
    Completed,
    /// Attempts exhausted or a permanent error
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if this task is currently owned by a worker
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Legal task transitions.
    ///
    /// `Started -> Started` is a re-claim after the previous holder's lease lapsed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Started)
                | (Self::Started, Self::Started)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::Queued)
                | (Self::Started, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

macro_rules! status_string_conversions {
    ($ty:ident, $kind:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = StatusParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == Self::$variant.as_str() {
                        return Ok(Self::$variant);
                    }
                )+
                Err(StatusParseError::new($kind, s))
            }
        }

        impl TryFrom<String> for $ty {
            type Error = StatusParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

status_string_conversions!(RunStatus, "run", [Running, Completed, Failed]);
status_string_conversions!(StepStatus, "step", [Pending, Started, Completed, Failed]);
status_string_conversions!(TaskStatus, "task", [Queued, Started, Completed, Failed]);

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_checks() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());

        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Started.is_terminal());

        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(TaskStatus::Started.is_active());
    }

    #[test]
    fn test_step_dependency_satisfaction() {
        assert!(StepStatus::Completed.satisfies_dependencies());
        assert!(!StepStatus::Pending.satisfies_dependencies());
        assert!(!StepStatus::Started.satisfies_dependencies());
        assert!(!StepStatus::Failed.satisfies_dependencies());
    }

    #[test]
    fn test_task_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Started));
        assert!(TaskStatus::Started.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Started.can_transition_to(TaskStatus::Started));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Started));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(TaskStatus::Started.to_string(), "started");
        assert_eq!("completed".parse::<RunStatus>().unwrap(), RunStatus::Completed);
        assert_eq!(
            StepStatus::try_from("pending".to_string()).unwrap(),
            StepStatus::Pending
        );

        let err = "in_progress".parse::<TaskStatus>().unwrap_err();
        assert_eq!(err.kind, "task");
        assert_eq!(err.value, "in_progress");
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&StepStatus::Started).unwrap();
        assert_eq!(json, "\"started\"");

        let parsed: RunStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, RunStatus::Failed);
    }
}
