use std::sync::Arc;

use tether_execution_runtime::{
    register_resumption_resolvers, DirHandle, ExecutorSlot, InMemoryTopology, Lease,
    LeaseRegistry, Node, PlaceholderTask, ResumptionKey, ResumptionRecord, Worker,
};
use tether_kernel::{ContextError, ContextValues, ResolverRegistry, StepContext};

struct Fixture {
    topology: Arc<InMemoryTopology>,
    worker: Arc<Worker>,
    context: Arc<StepContext>,
}

fn resolvers(topology: &Arc<InMemoryTopology>) -> Arc<ResolverRegistry> {
    let mut registry = ResolverRegistry::new();
    register_resumption_resolvers(&mut registry, topology.clone()).unwrap();
    Arc::new(registry)
}

/// A step on worker-1 that has already been resumed onto `/ws/T`.
fn resumed() -> Fixture {
    let topology = Arc::new(InMemoryTopology::new());
    let worker = topology.add_node(Node::new("worker-1"));
    let lease = worker
        .lease_registry()
        .allocate(&worker.dir("/ws/T").unwrap())
        .unwrap();
    let record = ResumptionRecord::new(
        PlaceholderTask::new("run-1", "step-3"),
        lease,
        Arc::new(ExecutorSlot::new(worker.clone(), 0)),
        0,
    );
    let (context, _completion) =
        StepContext::root(resolvers(&topology), ContextValues::new().with(record));
    Fixture {
        topology,
        worker,
        context,
    }
}

#[test]
fn unresumed_record_only_backs_the_node() {
    let topology = Arc::new(InMemoryTopology::new());
    topology.add_node(Node::new("worker-1"));
    let record = ResumptionRecord::from_key(ResumptionKey {
        task: PlaceholderTask::new("run-1", "step-3"),
        node: "worker-1".into(),
        path: "/ws/T".into(),
        depth: 0,
    });
    let (context, _completion) =
        StepContext::root(resolvers(&topology), ContextValues::new().with(record));

    assert!(context.get::<DirHandle>().unwrap().is_none());
    assert!(context.get::<Lease>().unwrap().is_none());
    assert!(context.get::<ExecutorSlot>().unwrap().is_none());
    assert!(context.get::<Worker>().unwrap().is_none());
    assert_eq!(context.get::<Node>().unwrap().unwrap().name, "worker-1");
}

#[test]
fn no_record_resolves_nothing() {
    let topology = Arc::new(InMemoryTopology::new());
    let (context, _completion) = StepContext::root(resolvers(&topology), ContextValues::new());
    assert!(context.get::<DirHandle>().unwrap().is_none());
    assert!(context.get::<Node>().unwrap().is_none());
}

#[test]
fn reconnect_yields_handle_on_new_channel() {
    let f = resumed();
    let before = f.context.require::<DirHandle>().unwrap();
    assert!(before.is_live());

    f.worker.disconnect("Connection was broken");
    f.worker.connect();

    let after = f.context.require::<DirHandle>().unwrap();
    assert!(after.is_live());
    assert_eq!(after.remote(), "/ws/T");
    assert_ne!(after.channel().id(), before.channel().id());

    // The lease keeps its original, now stale, handle.
    let lease = f.context.require::<Lease>().unwrap();
    assert!(!lease.path().is_live());
    assert_eq!(lease.path().channel().id(), before.channel().id());
}

#[test]
fn offline_node_reports_cause_and_termination_reasons() {
    let f = resumed();
    f.worker.request_termination("spot instance reclaimed");
    f.worker.disconnect("Connection was broken");

    let err = f.context.get::<DirHandle>().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unable to create live directory handle for worker-1; worker-1 was marked offline: Connection was broken"
    );
    match err {
        ContextError::AgentOffline(offline) => {
            assert_eq!(offline.termination_reasons.len(), 1);
            assert!(offline.termination_reasons[0].starts_with("spot instance reclaimed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Slot and worker are still served as recovered.
    assert_eq!(f.context.require::<ExecutorSlot>().unwrap().to_string(), "worker-1#0");
    assert!(!f.context.require::<Worker>().unwrap().is_online());
}

#[test]
fn removed_node_resolves_to_none_and_offline_handle() {
    let f = resumed();
    f.topology.remove_node("worker-1");

    assert!(f.context.get::<Node>().unwrap().is_none());
    let err = f.context.get::<DirHandle>().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unable to create live directory handle for worker-1"
    );
}
