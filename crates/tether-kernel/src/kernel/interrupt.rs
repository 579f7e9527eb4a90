//! Interruption signals: a step stopped by its environment rather than by an internal fault.
//!
//! A [StepInterrupted] carries the terminal [StepResult] the step should be recorded with
//! and one or more machine-readable [InterruptionCause]s.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal classification of a step or run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepResult {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl StepResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepResult::Success => "SUCCESS",
            StepResult::Unstable => "UNSTABLE",
            StepResult::Failure => "FAILURE",
            StepResult::NotBuilt => "NOT_BUILT",
            StepResult::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step was interrupted.
///
/// `code` is stable and meant for machines (`removed-node`, `queue-task-cancelled`, ...);
/// `description` is shown to users.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionCause {
    pub code: String,
    pub description: String,
}

impl InterruptionCause {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for InterruptionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Terminal interruption of a step, distinct from a crash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("step interrupted ({result}): {}", describe_causes(.causes))]
pub struct StepInterrupted {
    pub result: StepResult,
    /// Whether the interruption stopped work that was actually in progress.
    pub actually_interrupting: bool,
    pub causes: Vec<InterruptionCause>,
}

impl StepInterrupted {
    pub fn new(result: StepResult, actually_interrupting: bool, causes: Vec<InterruptionCause>) -> Self {
        Self {
            result,
            actually_interrupting,
            causes,
        }
    }

    /// Aborted interruption with a single cause.
    pub fn aborted(cause: InterruptionCause) -> Self {
        Self::new(StepResult::Aborted, true, vec![cause])
    }

    pub fn has_cause(&self, code: &str) -> bool {
        self.causes.iter().any(|c| c.code == code)
    }
}

fn describe_causes(causes: &[InterruptionCause]) -> String {
    if causes.is_empty() {
        return "no cause recorded".to_string();
    }
    causes
        .iter()
        .map(|c| c.description.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
