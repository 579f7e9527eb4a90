//! `dir` step: runs its body with a different current directory.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use tether_kernel::body::{BodyOutcome, ForwardingCallback};
use tether_kernel::context::ContextError;
use tether_kernel::descriptor::{check_required_context, ContextKey, StepDescriptor};
use tether_kernel::listener::TaskListener;
use tether_kernel::step_context::StepContext;

use crate::topology::DirHandle;

pub struct PushdDescriptor;

impl StepDescriptor for PushdDescriptor {
    fn function_name(&self) -> &'static str {
        "dir"
    }

    fn display_name(&self) -> &'static str {
        "Change current directory"
    }

    fn takes_implicit_body(&self) -> bool {
        true
    }

    fn required_context(&self) -> Vec<ContextKey> {
        vec![ContextKey::of::<TaskListener>(), ContextKey::of::<DirHandle>()]
    }

    fn provided_context(&self) -> Vec<ContextKey> {
        vec![ContextKey::of::<DirHandle>()]
    }
}

/// Changes directory for the duration of its body. Takes no lease on the new directory.
#[derive(Clone, Debug)]
pub struct PushdStep {
    path: String,
}

impl PushdStep {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Starts `body` in a scope whose directory is `path` under the current one.
    ///
    /// The body's outcome completes `context`.
    pub fn start<F, Fut>(
        &self,
        context: &Arc<StepContext>,
        body: F,
    ) -> Result<JoinHandle<()>, ContextError>
    where
        F: FnOnce(Arc<StepContext>) -> Fut + Send + 'static,
        Fut: Future<Output = BodyOutcome> + Send + 'static,
    {
        check_required_context(&PushdDescriptor, context)?;
        let cwd = context.require::<DirHandle>()?;
        let dir = cwd.child(&self.path);
        context
            .require::<TaskListener>()?
            .println(format!("Running in {}", dir));
        Ok(context
            .new_body_invoker()
            .with_context(dir)
            .with_callback(ForwardingCallback::wrap(context))
            .start(body))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether_kernel::context::{ContextValues, ResolverRegistry};

    use super::*;
    use crate::topology::Worker;

    #[tokio::test]
    async fn body_sees_child_directory_and_completes_outer_step() {
        let worker = Worker::new("worker-1");
        worker.connect();
        let (listener, log) = TaskListener::in_memory();
        let (context, completion) = StepContext::root(
            Arc::new(ResolverRegistry::new()),
            ContextValues::new()
                .with(listener)
                .with(worker.dir("/ws/T").unwrap()),
        );

        PushdStep::new("sub")
            .start(&context, |scope| async move {
                let dir = scope.require::<DirHandle>().map_err(|e| {
                    tether_kernel::body::StepFailure::Error(e.to_string())
                })?;
                Ok(json!(dir.remote()))
            })
            .unwrap()
            .await
            .unwrap();

        assert_eq!(completion.wait().await, Ok(json!("/ws/T/sub")));
        assert_eq!(log.lines(), vec!["Running in /ws/T/sub"]);
        assert_eq!(context.require::<DirHandle>().unwrap().remote(), "/ws/T");
    }

    #[tokio::test]
    async fn missing_directory_is_reported_before_starting() {
        let (context, _completion) = StepContext::root(
            Arc::new(ResolverRegistry::new()),
            ContextValues::new().with(TaskListener::null()),
        );
        let err = PushdStep::new("sub")
            .start(&context, |_| async { Ok(json!(null)) })
            .unwrap_err();
        assert!(matches!(err, ContextError::Missing { .. }));
        assert!(PushdDescriptor.takes_implicit_body());
    }
}
