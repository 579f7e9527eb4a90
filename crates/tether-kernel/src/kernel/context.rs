//! Typed context resolution.
//!
//! A step asks its [StepContext](crate::kernel::StepContext) for a capability by type. Values
//! placed explicitly into a scope ([ContextValues]) win; otherwise the lookup is dispatched by
//! [TypeId] to the single [TypedResolver] registered for that type in the [ResolverRegistry].
//!
//! Resolution has three outcomes: a value, "not available" (`Ok(None)`, a normal result
//! callers must handle), or a [ContextError].

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::kernel::step_context::StepContext;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Errors raised while resolving context.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ContextError {
    /// The node backing the requested capability is offline.
    #[error(transparent)]
    AgentOffline(#[from] AgentOffline),
    #[error("required context {type_name} is not available")]
    Missing { type_name: &'static str },
    #[error("a resolver for {type_name} is already registered")]
    DuplicateResolver { type_name: &'static str },
    #[error("resolver for {type_name} failed: {message}")]
    Resolver {
        type_name: &'static str,
        message: String,
    },
}

impl ContextError {
    pub fn missing<T: ?Sized + 'static>() -> Self {
        ContextError::Missing {
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// A capability could not be produced because its node is offline.
///
/// Carries the best-known offline cause in `message` and any pending termination reasons
/// so callers can decide to wait, abort, or report precisely.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentOffline {
    pub message: String,
    pub termination_reasons: Vec<String>,
}

impl AgentOffline {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            termination_reasons: Vec::new(),
        }
    }

    pub fn add_termination_reason(&mut self, reason: impl Into<String>) {
        self.termination_reasons.push(reason.into());
    }
}

/// Values placed explicitly into one context scope, keyed by type.
#[derive(Clone, Default)]
pub struct ContextValues {
    values: HashMap<TypeId, AnyValue>,
}

impl ContextValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Inserts `value`, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.insert_arc(Arc::new(value))
    }

    pub fn insert_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.values.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn get_raw(&self, key: TypeId) -> Option<&AnyValue> {
        self.values.get(&key)
    }
}

impl fmt::Debug for ContextValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextValues")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Produces the currently valid instance of one capability type, or declines.
///
/// Each implementation owns its own validity policy: some return stored handles as-is,
/// others check liveness and re-derive a fresh handle.
pub trait TypedResolver: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn resolve(
        &self,
        context: &DelegatedContext<'_>,
    ) -> Result<Option<Arc<Self::Output>>, ContextError>;
}

pub(crate) trait ErasedResolver: Send + Sync {
    fn output_type_name(&self) -> &'static str;

    fn resolve_erased(&self, context: &DelegatedContext<'_>)
        -> Result<Option<AnyValue>, ContextError>;
}

impl<R: TypedResolver> ErasedResolver for R {
    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<R::Output>()
    }

    fn resolve_erased(
        &self,
        context: &DelegatedContext<'_>,
    ) -> Result<Option<AnyValue>, ContextError> {
        Ok(self.resolve(context)?.map(|value| value as AnyValue))
    }
}

/// Explicit table from capability type to the resolver producing it.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<TypeId, Arc<dyn ErasedResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resolver` for its output type.
    ///
    /// Returns an error if a resolver for the same type is already registered.
    pub fn register<R: TypedResolver>(&mut self, resolver: R) -> Result<&mut Self, ContextError> {
        let key = TypeId::of::<R::Output>();
        if self.resolvers.contains_key(&key) {
            return Err(ContextError::DuplicateResolver {
                type_name: std::any::type_name::<R::Output>(),
            });
        }
        self.resolvers.insert(key, Arc::new(resolver));
        Ok(self)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.resolvers.contains_key(&TypeId::of::<T>())
    }

    /// Registered output type names in stable order.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names = self
            .resolvers
            .values()
            .map(|r| r.output_type_name())
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub(crate) fn get(&self, key: TypeId) -> Option<&Arc<dyn ErasedResolver>> {
        self.resolvers.get(&key)
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// View of the context handed to a resolver while it runs.
///
/// Lookups through it see the full scope chain and the other resolvers, but never
/// re-enter a resolver that is already running higher up the same lookup.
pub struct DelegatedContext<'a> {
    context: &'a StepContext,
    visiting: &'a RefCell<Vec<TypeId>>,
}

impl<'a> DelegatedContext<'a> {
    pub(crate) fn new(context: &'a StepContext, visiting: &'a RefCell<Vec<TypeId>>) -> Self {
        Self { context, visiting }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, ContextError> {
        Ok(self
            .context
            .lookup(TypeId::of::<T>(), self.visiting)?
            .and_then(downcast::<T>))
    }
}

pub(crate) fn downcast<T: Send + Sync + 'static>(value: AnyValue) -> Option<Arc<T>> {
    value.downcast::<T>().ok()
}
