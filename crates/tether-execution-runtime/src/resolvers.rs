//! Context resolvers backed by a [ResumptionRecord] found in the step context.
//!
//! Each capability type gets its own validity policy. Directory handles are checked for
//! liveness and re-derived after a reconnect; leases and slots are handed out as stored.

use std::sync::Arc;

use tether_kernel::context::{
    AgentOffline, ContextError, DelegatedContext, ResolverRegistry, TypedResolver,
};

use crate::lease::Lease;
use crate::resumption::{RecoveredHandles, ResumptionRecord};
use crate::topology::{DirHandle, ExecutorSlot, Node, NodeTopology, Worker};

/// Resolver policy that only applies once the record has been resumed.
pub trait RecordResolver: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn resolve_record(
        &self,
        record: &ResumptionRecord,
        handles: &RecoveredHandles,
    ) -> Result<Option<Arc<Self::Output>>, ContextError>;
}

/// Adapts a [RecordResolver]: no record, or a record without handles, resolves to nothing.
pub struct LeaseGated<R>(pub R);

impl<R: RecordResolver> TypedResolver for LeaseGated<R> {
    type Output = R::Output;

    fn resolve(
        &self,
        context: &DelegatedContext<'_>,
    ) -> Result<Option<Arc<Self::Output>>, ContextError> {
        let Some(record) = context.get::<ResumptionRecord>()? else {
            return Ok(None);
        };
        match record.handles() {
            Some(handles) => self.0.resolve_record(&record, handles),
            None => Ok(None),
        }
    }
}

pub struct DirHandleResolver {
    topology: Arc<dyn NodeTopology>,
}

impl DirHandleResolver {
    pub fn new(topology: Arc<dyn NodeTopology>) -> Self {
        Self { topology }
    }

    fn offline(&self, node: &str) -> AgentOffline {
        let display = self
            .topology
            .worker(node)
            .map(|worker| worker.display_name().to_string())
            .unwrap_or_else(|| node.to_string());
        let mut message = format!("Unable to create live directory handle for {}", display);
        if let Some(cause) = self.topology.offline_cause(node) {
            message.push_str(&format!("; {} was marked offline: {}", display, cause));
        }
        let mut err = AgentOffline::new(message);
        for request in self.topology.termination_reasons(node) {
            err.add_termination_reason(request.to_string());
        }
        err
    }
}

impl RecordResolver for DirHandleResolver {
    type Output = DirHandle;

    fn resolve_record(
        &self,
        record: &ResumptionRecord,
        handles: &RecoveredHandles,
    ) -> Result<Option<Arc<DirHandle>>, ContextError> {
        log::trace!("resolving directory handle from {}", record);
        let leased = handles.lease.path();
        if leased.is_live() {
            return Ok(Some(Arc::new(leased.clone())));
        }
        match self.topology.find_dir(record.node(), leased.remote()) {
            Some(fresh) => {
                log::debug!(
                    "{} on {} was disconnected and reconnected; using the new channel",
                    leased,
                    record.node()
                );
                Ok(Some(Arc::new(fresh)))
            }
            None => Err(self.offline(record.node()).into()),
        }
    }
}

/// Returns the recovered lease as stored, even if its handle has gone stale.
pub struct LeaseResolver;

impl RecordResolver for LeaseResolver {
    type Output = Lease;

    fn resolve_record(
        &self,
        _record: &ResumptionRecord,
        handles: &RecoveredHandles,
    ) -> Result<Option<Arc<Lease>>, ContextError> {
        Ok(Some(Arc::clone(&handles.lease)))
    }
}

pub struct ExecutorSlotResolver;

impl RecordResolver for ExecutorSlotResolver {
    type Output = ExecutorSlot;

    fn resolve_record(
        &self,
        _record: &ResumptionRecord,
        handles: &RecoveredHandles,
    ) -> Result<Option<Arc<ExecutorSlot>>, ContextError> {
        Ok(Some(Arc::clone(&handles.slot)))
    }
}

/// Owner of the recovered slot.
pub struct WorkerResolver;

impl RecordResolver for WorkerResolver {
    type Output = Worker;

    fn resolve_record(
        &self,
        _record: &ResumptionRecord,
        handles: &RecoveredHandles,
    ) -> Result<Option<Arc<Worker>>, ContextError> {
        Ok(Some(Arc::clone(handles.slot.owner())))
    }
}

/// Node named by the record. Works before resumption too.
pub struct NodeResolver {
    topology: Arc<dyn NodeTopology>,
}

impl NodeResolver {
    pub fn new(topology: Arc<dyn NodeTopology>) -> Self {
        Self { topology }
    }
}

impl TypedResolver for NodeResolver {
    type Output = Node;

    fn resolve(&self, context: &DelegatedContext<'_>) -> Result<Option<Arc<Node>>, ContextError> {
        let Some(record) = context.get::<ResumptionRecord>()? else {
            return Ok(None);
        };
        if record.node().is_empty() {
            return Ok(Some(self.topology.controller()));
        }
        Ok(self.topology.node(record.node()))
    }
}

/// Registers the resolvers for every capability a [ResumptionRecord] can back.
pub fn register_resumption_resolvers(
    registry: &mut ResolverRegistry,
    topology: Arc<dyn NodeTopology>,
) -> Result<(), ContextError> {
    registry
        .register(LeaseGated(DirHandleResolver::new(Arc::clone(&topology))))?
        .register(LeaseGated(LeaseResolver))?
        .register(LeaseGated(ExecutorSlotResolver))?
        .register(LeaseGated(WorkerResolver))?
        .register(NodeResolver::new(topology))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tether_kernel::context::ContextValues;
    use tether_kernel::step_context::StepContext;

    use super::*;
    use crate::lease::{LeaseRegistry, WorkspaceList};
    use crate::models::PlaceholderTask;
    use crate::resumption::ResumptionKey;
    use crate::topology::InMemoryTopology;

    fn registry(topology: Arc<InMemoryTopology>) -> Arc<ResolverRegistry> {
        let mut registry = ResolverRegistry::new();
        register_resumption_resolvers(&mut registry, topology).unwrap();
        Arc::new(registry)
    }

    #[test]
    fn registering_twice_is_rejected() {
        let topology = Arc::new(InMemoryTopology::new());
        let mut registry = ResolverRegistry::new();
        register_resumption_resolvers(&mut registry, topology.clone()).unwrap();
        assert_eq!(registry.type_names().len(), 5);
        let err = register_resumption_resolvers(&mut registry, topology).unwrap_err();
        assert!(matches!(err, ContextError::DuplicateResolver { .. }));
    }

    #[test]
    fn resumed_record_backs_every_capability() {
        let topology = Arc::new(InMemoryTopology::new());
        let worker = topology.add_node(Node::new("worker-1"));
        let lease = worker
            .lease_registry()
            .allocate(&worker.dir("/ws/T").unwrap())
            .unwrap();
        let slot = Arc::new(ExecutorSlot::new(worker, 0));
        let record = ResumptionRecord::new(PlaceholderTask::new("run-1", "step-3"), lease, slot, 0);
        let (context, _completion) =
            StepContext::root(registry(topology), ContextValues::new().with(record));

        assert_eq!(context.get::<DirHandle>().unwrap().unwrap().remote(), "/ws/T");
        assert_eq!(context.get::<Lease>().unwrap().unwrap().path().remote(), "/ws/T");
        assert_eq!(context.get::<ExecutorSlot>().unwrap().unwrap().number(), 0);
        assert_eq!(context.get::<Worker>().unwrap().unwrap().name(), "worker-1");
        assert_eq!(context.get::<Node>().unwrap().unwrap().name, "worker-1");
    }

    #[test]
    fn controller_record_resolves_controller_node() {
        let topology = Arc::new(InMemoryTopology::new());
        let record = ResumptionRecord::from_key(ResumptionKey {
            task: PlaceholderTask::new("run-1", "step-1"),
            node: String::new(),
            path: "/var/lib/tether/ws".into(),
            depth: 0,
        });
        let (context, _completion) =
            StepContext::root(registry(topology), ContextValues::new().with(record));
        assert!(context.get::<Node>().unwrap().unwrap().is_controller());
        assert!(context.get::<DirHandle>().unwrap().is_none());
    }

    #[test]
    fn explicit_value_shadows_resolver() {
        let topology = Arc::new(InMemoryTopology::new());
        let worker = topology.add_node(Node::new("worker-1"));
        let lease = WorkspaceList::new()
            .allocate(&worker.dir("/ws/T").unwrap())
            .unwrap();
        let record = ResumptionRecord::new(
            PlaceholderTask::new("run-1", "step-3"),
            lease,
            Arc::new(ExecutorSlot::new(worker.clone(), 0)),
            0,
        );
        let explicit = worker.dir("/elsewhere").unwrap();
        let (context, _completion) = StepContext::root(
            registry(topology),
            ContextValues::new().with(record).with(explicit),
        );
        assert_eq!(context.get::<DirHandle>().unwrap().unwrap().remote(), "/elsewhere");
    }
}
