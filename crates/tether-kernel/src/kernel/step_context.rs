//! StepContext: the scope chain a step runs against, plus its completion sink.

use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::kernel::body::{BodyInvoker, BodyOutcome, StepFailure};
use crate::kernel::context::{
    downcast, AnyValue, ContextError, ContextValues, DelegatedContext, ResolverRegistry,
};
use crate::kernel::descriptor::ContextKey;

/// Execution context of one step.
///
/// Lookups check explicit values from this scope outwards through its parents, then fall
/// back to the resolver registered for the requested type.
pub struct StepContext {
    values: ContextValues,
    parent: Option<Arc<StepContext>>,
    resolvers: Arc<ResolverRegistry>,
    completion: Mutex<Option<oneshot::Sender<BodyOutcome>>>,
}

impl StepContext {
    /// Creates a top-level context and the handle its outcome will be delivered to.
    pub fn root(
        resolvers: Arc<ResolverRegistry>,
        values: ContextValues,
    ) -> (Arc<Self>, StepCompletion) {
        let (tx, rx) = oneshot::channel();
        let context = Self {
            values,
            parent: None,
            resolvers,
            completion: Mutex::new(Some(tx)),
        };
        (Arc::new(context), StepCompletion { rx })
    }

    pub(crate) fn child(parent: Arc<StepContext>, values: ContextValues) -> Self {
        Self {
            values,
            resolvers: Arc::clone(&parent.resolvers),
            parent: Some(parent),
            completion: Mutex::new(None),
        }
    }

    /// Number of enclosing scopes.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut scope = self.parent.as_deref();
        while let Some(current) = scope {
            depth += 1;
            scope = current.parent.as_deref();
        }
        depth
    }

    /// Looks up a capability; `Ok(None)` means it is not (or no longer) available.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, ContextError> {
        let visiting = RefCell::new(Vec::new());
        Ok(self
            .lookup(TypeId::of::<T>(), &visiting)?
            .and_then(downcast::<T>))
    }

    /// Like [StepContext::get], but a missing capability is an error.
    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContextError> {
        self.get::<T>()?.ok_or_else(ContextError::missing::<T>)
    }

    pub fn contains_key(&self, key: &ContextKey) -> Result<bool, ContextError> {
        let visiting = RefCell::new(Vec::new());
        Ok(self.lookup(key.type_id(), &visiting)?.is_some())
    }

    pub(crate) fn lookup(
        &self,
        key: TypeId,
        visiting: &RefCell<Vec<TypeId>>,
    ) -> Result<Option<AnyValue>, ContextError> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(value) = current.values.get_raw(key) {
                return Ok(Some(Arc::clone(value)));
            }
            scope = current.parent.as_deref();
        }

        let Some(resolver) = self.resolvers.get(key) else {
            return Ok(None);
        };
        if visiting.borrow().contains(&key) {
            return Ok(None);
        }
        visiting.borrow_mut().push(key);
        let result = resolver.resolve_erased(&DelegatedContext::new(self, visiting));
        visiting.borrow_mut().pop();
        result
    }

    /// Starts building a nested scope for this step's body.
    pub fn new_body_invoker(self: &Arc<Self>) -> BodyInvoker {
        BodyInvoker::new(Arc::clone(self))
    }

    pub fn on_success(&self, result: Value) {
        self.complete(Ok(result));
    }

    pub fn on_failure(&self, failure: StepFailure) {
        self.complete(Err(failure));
    }

    /// Delivers the outcome once; later calls are logged and dropped.
    fn complete(&self, outcome: BodyOutcome) {
        let sender = match self.completion.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    log::debug!("step outcome dropped: nobody is waiting for completion");
                }
            }
            None => log::warn!(
                "ignoring outcome for a scope at depth {} that is already completed or has no completion sink: {:?}",
                self.depth(),
                outcome
            ),
        }
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("depth", &self.depth())
            .field("values", &self.values)
            .field("resolvers", &self.resolvers)
            .finish()
    }
}

/// Receives the outcome of a root [StepContext].
#[derive(Debug)]
pub struct StepCompletion {
    rx: oneshot::Receiver<BodyOutcome>,
}

impl StepCompletion {
    pub async fn wait(self) -> BodyOutcome {
        self.rx.await.unwrap_or_else(|_| {
            Err(StepFailure::Error(
                "step context dropped before completing".to_string(),
            ))
        })
    }
}
