// Status definitions for runs, steps and tasks.
//
// Transitions are applied by the store inside the same transaction as the counters
// that gate them; these enums only carry the vocabulary and the legal-transition table.

pub mod states;

pub use states::{RunStatus, StatusParseError, StepStatus, TaskStatus};
