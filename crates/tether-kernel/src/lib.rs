//! Tether kernel: step context, typed context resolution, nested body scopes and
//! interruption signals for steps that outlive a process restart.

pub mod kernel;

pub use kernel::*;
