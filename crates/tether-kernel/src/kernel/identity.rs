//! Run and step identity types.
//!
//! RunId identifies the run a step belongs to; StepId identifies one step within it.

/// Identifies a run (one execution of a workflow).
pub type RunId = String;

/// Identifies a single step within a run.
pub type StepId = String;
