//! Tether Kernel API.
//!
//! A step runs against a [StepContext]: a chain of scopes holding explicit values,
//! backed by a [ResolverRegistry] that produces capabilities (directory handles,
//! slots, leases, ...) on demand. Steps with a body open nested scopes through
//! [BodyInvoker] and report their outcome through a [BodyExecutionCallback].

pub mod body;
pub mod context;
pub mod descriptor;
pub mod identity;
pub mod interrupt;
pub mod listener;
pub mod step_context;

pub use body::{BodyExecutionCallback, BodyInvoker, BodyOutcome, ForwardingCallback, StepFailure};
pub use context::{
    AgentOffline, ContextError, ContextValues, DelegatedContext, ResolverRegistry, TypedResolver,
};
pub use descriptor::{check_required_context, ContextKey, StepDescriptor};
pub use identity::{RunId, StepId};
pub use interrupt::{InterruptionCause, StepInterrupted, StepResult};
pub use listener::{MemoryLog, TaskListener};
pub use step_context::{StepCompletion, StepContext};
