//! Step descriptors: static metadata about a step and the context it needs.

use std::any::TypeId;
use std::fmt;

use crate::kernel::context::ContextError;
use crate::kernel::step_context::StepContext;

/// Identifies a capability type in a context.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl ContextKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// Static description of a step kind.
pub trait StepDescriptor: Send + Sync {
    /// Name the step is invoked by.
    fn function_name(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Whether the step wraps a body block.
    fn takes_implicit_body(&self) -> bool {
        false
    }

    /// Capabilities that must be resolvable before the step starts.
    fn required_context(&self) -> Vec<ContextKey>;

    /// Capabilities the step supplies to its body.
    fn provided_context(&self) -> Vec<ContextKey> {
        Vec::new()
    }
}

/// Fails with [ContextError::Missing] for the first required capability that does not resolve.
pub fn check_required_context(
    descriptor: &dyn StepDescriptor,
    context: &StepContext,
) -> Result<(), ContextError> {
    for key in descriptor.required_context() {
        if !context.contains_key(&key)? {
            return Err(ContextError::Missing {
                type_name: key.type_name(),
            });
        }
    }
    Ok(())
}
