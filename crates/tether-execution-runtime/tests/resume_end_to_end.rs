use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_execution_runtime::{
    register_resumption_resolvers, DirHandle, ExecutorSlot, InMemoryTopology, InMemoryWorkQueue,
    Lease, LeaseRegistry, Node, PlaceholderTask, PushdStep, QueueTask, ResumeConfig, ResumeError,
    ResumptionRecord, WorkQueue, Worker, WorkspaceList, REMOVED_NODE,
};
use tether_kernel::{ContextValues, MemoryLog, ResolverRegistry, StepContext, TaskListener};

struct Controller {
    topology: Arc<InMemoryTopology>,
    queue: Arc<InMemoryWorkQueue>,
    worker: Arc<Worker>,
    workspaces: Arc<WorkspaceList>,
}

impl Controller {
    fn boot() -> Self {
        let topology = Arc::new(InMemoryTopology::new());
        let workspaces = Arc::new(WorkspaceList::new());
        let worker = Worker::with_lease_registry("worker-1", workspaces.clone());
        worker.connect();
        topology.add_node_with_worker(Node::new("worker-1"), worker.clone());
        Self {
            topology,
            queue: Arc::new(InMemoryWorkQueue::new()),
            worker,
            workspaces,
        }
    }

    fn resolvers(&self) -> Arc<ResolverRegistry> {
        let mut registry = ResolverRegistry::new();
        register_resumption_resolvers(&mut registry, self.topology.clone()).unwrap();
        Arc::new(registry)
    }

    fn listener_context(&self) -> (Arc<StepContext>, MemoryLog) {
        let (listener, log) = TaskListener::in_memory();
        let (context, _completion) =
            StepContext::root(self.resolvers(), ContextValues::new().with(listener));
        (context, log)
    }

    /// Starts the first pending item on slot 0 of worker-1 once it appears.
    fn dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let slot = Arc::new(ExecutorSlot::new(self.worker.clone(), 0));
        tokio::spawn(async move {
            loop {
                if let Some(item) = queue.pending_items().into_iter().next() {
                    queue.start(item.id, slot).unwrap();
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
    }
}

fn config() -> ResumeConfig {
    ResumeConfig::default().with_node_wait_timeout(Duration::from_secs(5))
}

/// Record as it was written before the controller restarted.
fn persisted_record() -> String {
    let before = Controller::boot();
    let lease = before
        .workspaces
        .allocate(&before.worker.dir("/ws/T").unwrap())
        .unwrap();
    let slot = Arc::new(ExecutorSlot::new(before.worker.clone(), 0));
    let record = ResumptionRecord::new(PlaceholderTask::new("run-1", "step-3"), lease, slot, 1);
    serde_json::to_string(&record).unwrap()
}

#[tokio::test]
async fn step_survives_controller_restart() {
    let stored = persisted_record();

    let after = Controller::boot();
    let mut record: ResumptionRecord = serde_json::from_str(&stored).unwrap();
    assert!(!record.is_resumed());
    assert_eq!(record.depth(), 1);

    let (context, log) = after.listener_context();
    let dispatcher = after.dispatcher();
    record
        .resume(&context, after.queue.as_ref(), &config())
        .await
        .unwrap();
    dispatcher.await.unwrap();

    assert_eq!(
        log.lines(),
        vec!["Waiting for reconnection of worker-1 before proceeding with build"]
    );
    assert_eq!(after.queue.submitted_count(), 1);
    assert!(after.workspaces.is_held("/ws/T"));

    // The resumed step runs a `dir` body against the recovered handles.
    let (listener, step_log) = TaskListener::in_memory();
    let (step, completion) = StepContext::root(
        after.resolvers(),
        ContextValues::new().with(listener).with(record),
    );
    assert_eq!(step.require::<Lease>().unwrap().path().remote(), "/ws/T");
    assert_eq!(step.require::<Worker>().unwrap().name(), "worker-1");

    PushdStep::new("sub")
        .start(&step, |scope| async move {
            let dir = scope
                .require::<DirHandle>()
                .map_err(|e| tether_kernel::StepFailure::Error(e.to_string()))?;
            let slot = scope
                .require::<ExecutorSlot>()
                .map_err(|e| tether_kernel::StepFailure::Error(e.to_string()))?;
            Ok(json!({ "dir": dir.remote(), "slot": slot.to_string() }))
        })
        .unwrap()
        .await
        .unwrap();

    assert_eq!(
        completion.wait().await,
        Ok(json!({ "dir": "/ws/T/sub", "slot": "worker-1#0" }))
    );
    assert_eq!(step_log.lines(), vec!["Running in /ws/T/sub"]);
}

#[tokio::test]
async fn item_queued_before_restart_is_reused() {
    let after = Controller::boot();
    let mut record: ResumptionRecord = serde_json::from_str(&persisted_record()).unwrap();
    // The queue kept the item the step was waiting for when the controller went down.
    let surviving = after
        .queue
        .lock()
        .submit(QueueTask::Placeholder(PlaceholderTask::new("run-1", "step-3")), 0)
        .unwrap();

    let (context, _log) = after.listener_context();
    let dispatcher = after.dispatcher();
    record
        .resume(&context, after.queue.as_ref(), &config())
        .await
        .unwrap();
    dispatcher.await.unwrap();

    assert_eq!(after.queue.submitted_count(), 1);
    assert_eq!(after.queue.running_items(), vec![surviving]);
}

#[tokio::test]
async fn resuming_twice_does_not_schedule_again() {
    let after = Controller::boot();
    let mut record: ResumptionRecord = serde_json::from_str(&persisted_record()).unwrap();
    let (context, _log) = after.listener_context();
    let dispatcher = after.dispatcher();
    record
        .resume(&context, after.queue.as_ref(), &config())
        .await
        .unwrap();
    dispatcher.await.unwrap();

    let err = record
        .resume(&context, after.queue.as_ref(), &config())
        .await
        .unwrap_err();
    assert!(matches!(err, ResumeError::AlreadyResumed));
    assert_eq!(after.queue.submitted_count(), 1);
    assert_eq!(after.workspaces.held_count(), 1);
}

#[tokio::test]
async fn directory_taken_by_another_build_fails_resume() {
    let after = Controller::boot();
    let other_build = after
        .workspaces
        .allocate(&after.worker.dir("/ws/T").unwrap())
        .unwrap();

    let mut record: ResumptionRecord = serde_json::from_str(&persisted_record()).unwrap();
    let (context, _log) = after.listener_context();
    let dispatcher = after.dispatcher();
    let err = record
        .resume(&context, after.queue.as_ref(), &config())
        .await
        .unwrap_err();
    dispatcher.await.unwrap();

    assert!(matches!(err, ResumeError::PathLocked { .. }));
    assert_eq!(after.workspaces.held_count(), 1);
    assert!(!other_build.is_released());
}

#[tokio::test(start_paused = true)]
async fn node_that_never_returns_aborts_the_step() {
    let after = Controller::boot();
    let mut record: ResumptionRecord = serde_json::from_str(&persisted_record()).unwrap();
    let (context, log) = after.listener_context();

    let err = record
        .resume(&context, after.queue.as_ref(), &config())
        .await
        .unwrap_err();

    let interrupted = match err {
        ResumeError::Interrupted(interrupted) => interrupted,
        other => panic!("expected an interruption, got {other:?}"),
    };
    assert!(interrupted.has_cause(REMOVED_NODE));
    assert_eq!(interrupted.result.as_str(), "ABORTED");
    assert_eq!(
        log.lines(),
        vec![
            "Waiting for reconnection of worker-1 before proceeding with build",
            "worker-1 has been removed for 5 sec, assuming it is not coming back",
        ]
    );
    assert_eq!(after.workspaces.held_count(), 0);
    // The item stays queued; the caller decides whether to cancel it.
    assert_eq!(after.queue.pending_items().len(), 1);
}

#[tokio::test]
async fn concurrent_resumes_of_one_step_submit_once() {
    let after = Controller::boot();
    let stored = persisted_record();
    let mut first: ResumptionRecord = serde_json::from_str(&stored).unwrap();
    let mut second: ResumptionRecord = serde_json::from_str(&stored).unwrap();
    let (context, _log) = after.listener_context();
    let dispatcher = after.dispatcher();
    let config = config();

    let (a, b) = tokio::join!(
        first.resume(&context, after.queue.as_ref(), &config),
        second.resume(&context, after.queue.as_ref(), &config),
    );
    dispatcher.await.unwrap();

    assert_eq!(after.queue.submitted_count(), 1);
    // Both see the same start; only one of them can hold the exact directory.
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let failure = a.err().or(b.err()).unwrap();
    assert!(matches!(failure, ResumeError::PathLocked { .. }));
    assert_eq!(after.workspaces.held_count(), 1);
}
