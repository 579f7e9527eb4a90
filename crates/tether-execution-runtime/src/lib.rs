//! Execution runtime: resumption of suspended steps, node topology, directory leases,
//! the work queue façade and the resolvers that serve recovered handles to steps.

pub mod config;
pub mod lease;
pub mod models;
pub mod pushd;
pub mod resolvers;
pub mod resumption;
pub mod scheduler;
pub mod topology;
pub mod util;

pub use config::{ResumeConfig, DEFAULT_NODE_WAIT_TIMEOUT, DEFAULT_QUEUE_PRIORITY};
pub use lease::{Lease, LeaseError, LeaseRegistry, WorkspaceList, VARIANT_COMBINATOR};
pub use models::{Executable, ExecutableId, ItemId, PlaceholderTask, QueueItem, QueueTask};
pub use pushd::{PushdDescriptor, PushdStep};
pub use resolvers::{
    register_resumption_resolvers, DirHandleResolver, ExecutorSlotResolver, LeaseGated,
    LeaseResolver, NodeResolver, RecordResolver, WorkerResolver,
};
pub use resumption::{
    queue_task_cancelled_cause, removed_node_cause, RecoveredHandles, ResumeError, ResumptionKey,
    ResumptionRecord, QUEUE_TASK_CANCELLED, REMOVED_NODE,
};
pub use scheduler::{InMemoryWorkQueue, QueueError, QueueGuard, StartError, WorkQueue};
pub use topology::{
    Channel, DirHandle, ExecutorSlot, InMemoryTopology, Node, NodeTopology, OfflineCause,
    TerminationRequest, Worker,
};
pub use util::time_span_string;
