//! Resumption of a step after a controller restart.
//!
//! [ResumptionRecord] is what survives the restart: the task, the node, the directory and
//! the nesting depth ([ResumptionKey]). The executor slot and the directory lease it held
//! ([RecoveredHandles]) do not survive; [ResumptionRecord::resume] re-establishes them:
//!
//! 1. reuse the queue item already carrying the task's idempotency token, or submit one;
//! 2. wait, bounded by [ResumeConfig::node_wait_timeout], for the item to start;
//! 3. take the slot that claimed it and check its worker is connected;
//! 4. re-lease the exact directory on that worker.
//!
//! Nothing here retries. Timeouts and cancellations become [StepInterrupted] signals; the
//! rest are fatal errors for the caller to act on.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tether_kernel::body::StepFailure;
use tether_kernel::context::ContextError;
use tether_kernel::interrupt::{InterruptionCause, StepInterrupted};
use tether_kernel::listener::TaskListener;
use tether_kernel::step_context::StepContext;

use crate::config::ResumeConfig;
use crate::lease::{Lease, LeaseError};
use crate::models::{PlaceholderTask, QueueItem, QueueTask};
use crate::scheduler::{StartError, WorkQueue};
use crate::topology::{DirHandle, ExecutorSlot};
use crate::util::time_span_string;

/// Cause code: the node did not come back within the wait timeout.
pub const REMOVED_NODE: &str = "removed-node";
/// Cause code: the queue item the step was waiting on was cancelled.
pub const QUEUE_TASK_CANCELLED: &str = "queue-task-cancelled";

pub fn removed_node_cause(node: &str) -> InterruptionCause {
    InterruptionCause::new(
        REMOVED_NODE,
        format!("Agent {} was removed", node),
    )
}

pub fn queue_task_cancelled_cause() -> InterruptionCause {
    InterruptionCause::new(QUEUE_TASK_CANCELLED, "Queue task was cancelled")
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("Already resumed")]
    AlreadyResumed,
    #[error("queue refused {task}")]
    QueueRefused { task: String },
    #[error(transparent)]
    Interrupted(#[from] StepInterrupted),
    #[error("{executable} was scheduled but no executor claimed it")]
    SlotNotClaimed { executable: String },
    #[error("{worker} is offline")]
    WorkerOffline { worker: String },
    #[error("something already locked {path}")]
    PathLocked { path: String },
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl ResumeError {
    /// The environment stopped the step (node gone, item cancelled).
    pub fn is_interruption(&self) -> bool {
        matches!(self, ResumeError::Interrupted(_))
    }

    /// Resource failures: no slot, offline worker, contended or broken lease.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            ResumeError::SlotNotClaimed { .. }
                | ResumeError::WorkerOffline { .. }
                | ResumeError::PathLocked { .. }
                | ResumeError::Lease(_)
        )
    }
}

impl From<ResumeError> for StepFailure {
    fn from(err: ResumeError) -> Self {
        match err {
            ResumeError::Interrupted(interrupted) => StepFailure::Interrupted(interrupted),
            other => StepFailure::Error(other.to_string()),
        }
    }
}

/// Persisted identity of a suspended step. Never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumptionKey {
    pub task: PlaceholderTask,
    /// Node name; empty for the controller.
    pub node: String,
    pub path: String,
    pub depth: u32,
}

/// Live handles recovered by [ResumptionRecord::resume]; never persisted.
#[derive(Clone, Debug)]
pub struct RecoveredHandles {
    pub slot: Arc<ExecutorSlot>,
    pub lease: Arc<Lease>,
}

/// Durable context of a step holding an executor slot and a directory lease.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumptionRecord {
    #[serde(flatten)]
    key: ResumptionKey,
    #[serde(skip)]
    handles: Option<RecoveredHandles>,
}

impl ResumptionRecord {
    /// Record for a step that has just been given `slot` and `lease`.
    pub fn new(task: PlaceholderTask, lease: Arc<Lease>, slot: Arc<ExecutorSlot>, depth: u32) -> Self {
        let key = ResumptionKey {
            task,
            node: lease.path().node().to_string(),
            path: lease.path().remote().to_string(),
            depth,
        };
        Self {
            key,
            handles: Some(RecoveredHandles { slot, lease }),
        }
    }

    /// Record loaded from storage, not yet resumed.
    pub fn from_key(key: ResumptionKey) -> Self {
        Self { key, handles: None }
    }

    pub fn key(&self) -> &ResumptionKey {
        &self.key
    }

    pub fn task(&self) -> &PlaceholderTask {
        &self.key.task
    }

    pub fn node(&self) -> &str {
        &self.key.node
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn depth(&self) -> u32 {
        self.key.depth
    }

    pub fn handles(&self) -> Option<&RecoveredHandles> {
        self.handles.as_ref()
    }

    pub fn slot(&self) -> Option<&Arc<ExecutorSlot>> {
        self.handles.as_ref().map(|h| &h.slot)
    }

    pub fn lease(&self) -> Option<&Arc<Lease>> {
        self.handles.as_ref().map(|h| &h.lease)
    }

    pub fn is_resumed(&self) -> bool {
        self.handles.is_some()
    }

    /// Re-acquires the slot and the exact directory lease this step held before a restart.
    ///
    /// `context` must supply a [TaskListener]. Must be called at most once per record.
    pub async fn resume(
        &mut self,
        context: &StepContext,
        queue: &dyn WorkQueue,
        config: &ResumeConfig,
    ) -> Result<(), ResumeError> {
        if self.handles.is_some() {
            return Err(ResumeError::AlreadyResumed);
        }
        let listener = context.require::<TaskListener>()?;
        let node = self.key.node.as_str();
        let path = self.key.path.as_str();

        let item = self.find_or_schedule(queue, config.queue_priority)?;

        // Unlikely to be any delay for the controller.
        if !node.is_empty() {
            listener.println(format!(
                "Waiting for reconnection of {} before proceeding with build",
                node
            ));
        }
        let executable =
            match tokio::time::timeout(config.node_wait_timeout, queue.wait_for_start(&item)).await {
                Ok(Ok(executable)) => executable,
                Ok(Err(StartError::Cancelled(id))) => {
                    log::debug!("ceased to wait for {}: queue item {} cancelled", node, id);
                    return Err(StepInterrupted::aborted(queue_task_cancelled_cause()).into());
                }
                Err(_elapsed) => {
                    listener.println(format!(
                        "{} has been removed for {}, assuming it is not coming back",
                        node,
                        time_span_string(config.node_wait_timeout)
                    ));
                    return Err(StepInterrupted::aborted(removed_node_cause(node)).into());
                }
            };

        let slot = queue
            .claimed_slot(&executable)
            .ok_or_else(|| ResumeError::SlotNotClaimed {
                executable: executable.to_string(),
            })?;
        let worker = slot.owner();
        let channel = worker.channel().ok_or_else(|| ResumeError::WorkerOffline {
            worker: worker.display_name().to_string(),
        })?;

        let requested = DirHandle::new(worker.name(), path, channel);
        // The registry has no try-lock: a contended path comes back as a variant.
        let lease = worker.lease_registry().allocate(&requested)?;
        if lease.path() != &requested {
            lease.release();
            return Err(ResumeError::PathLocked {
                path: requested.to_string(),
            });
        }

        self.handles = Some(RecoveredHandles { slot, lease });
        log::debug!("fully restored for {} on {}", path, node);
        Ok(())
    }

    /// Scan and submit happen under one hold of the queue lock.
    fn find_or_schedule(&self, queue: &dyn WorkQueue, priority: u32) -> Result<QueueItem, ResumeError> {
        let task = &self.key.task;
        let mut guard = queue.lock();
        let existing = match task.cookie() {
            Some(token) => guard.find_by_token(token),
            None => {
                log::debug!("{} has no idempotency token; not looking for a queued duplicate", task);
                None
            }
        };
        if let Some(item) = existing {
            log::debug!(
                "reusing {}, which was already in the queue for {} on {}",
                item,
                self.key.path,
                self.key.node
            );
            return Ok(item);
        }
        let item = guard
            .submit(QueueTask::Placeholder(task.clone()), priority)
            .ok_or_else(|| ResumeError::QueueRefused {
                task: task.to_string(),
            })?;
        log::debug!("scheduled {} for {} on {}", item, self.key.path, self.key.node);
        Ok(item)
    }
}

impl fmt::Display for ResumptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumptionRecord[{}@{}]", self.key.path, self.key.node)
    }
}
