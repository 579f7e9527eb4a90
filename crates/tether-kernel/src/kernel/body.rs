//! Nested body scopes and their completion callbacks.
//!
//! A step that takes a body builds a [BodyInvoker] from its context, adds the values the body
//! should see, installs a [BodyExecutionCallback], and starts the body on the tokio runtime.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::kernel::context::ContextValues;
use crate::kernel::interrupt::StepInterrupted;
use crate::kernel::step_context::StepContext;

/// Outcome of a step or of a body scope.
pub type BodyOutcome = Result<Value, StepFailure>;

/// Why a step or body did not complete normally.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    /// Stopped by the environment, with a terminal classification.
    #[error(transparent)]
    Interrupted(#[from] StepInterrupted),
    /// Internal or I/O failure.
    #[error("{0}")]
    Error(String),
}

impl StepFailure {
    pub fn is_interruption(&self) -> bool {
        matches!(self, StepFailure::Interrupted(_))
    }
}

/// Receives the outcome of a body scope.
pub trait BodyExecutionCallback: Send + Sync + 'static {
    fn on_start(&self, _context: &StepContext) {}

    fn on_success(&self, context: &StepContext, result: Value);

    fn on_failure(&self, context: &StepContext, failure: StepFailure);
}

/// Callback that completes the enclosing step with whatever its body produced.
pub struct ForwardingCallback {
    outer: Arc<StepContext>,
}

impl ForwardingCallback {
    pub fn wrap(outer: &Arc<StepContext>) -> Self {
        Self {
            outer: Arc::clone(outer),
        }
    }
}

impl BodyExecutionCallback for ForwardingCallback {
    fn on_success(&self, _context: &StepContext, result: Value) {
        self.outer.on_success(result);
    }

    fn on_failure(&self, _context: &StepContext, failure: StepFailure) {
        self.outer.on_failure(failure);
    }
}

/// Builder for a nested body scope.
pub struct BodyInvoker {
    parent: Arc<StepContext>,
    values: ContextValues,
    callback: Option<Arc<dyn BodyExecutionCallback>>,
}

impl BodyInvoker {
    pub(crate) fn new(parent: Arc<StepContext>) -> Self {
        Self {
            parent,
            values: ContextValues::new(),
            callback: None,
        }
    }

    /// Makes `value` visible to the body, shadowing any value or resolver for its type.
    pub fn with_context<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(value);
        self
    }

    pub fn with_callback(mut self, callback: impl BodyExecutionCallback) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Spawns the body in its own scope. Must be called from within a tokio runtime.
    pub fn start<F, Fut>(self, body: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<StepContext>) -> Fut + Send + 'static,
        Fut: Future<Output = BodyOutcome> + Send + 'static,
    {
        let scope = Arc::new(StepContext::child(self.parent, self.values));
        let callback = self.callback;
        tokio::spawn(async move {
            if let Some(callback) = &callback {
                callback.on_start(&scope);
            }
            let outcome = body(Arc::clone(&scope)).await;
            match (callback, outcome) {
                (Some(callback), Ok(result)) => callback.on_success(&scope, result),
                (Some(callback), Err(failure)) => callback.on_failure(&scope, failure),
                (None, outcome) => {
                    log::debug!("body finished without a callback: {:?}", outcome)
                }
            }
        })
    }
}
