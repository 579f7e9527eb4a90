//! Work-item domain models: task descriptors, queue items and started executables.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tether_kernel::identity::{RunId, StepId};

/// Descriptor of a step that needs an executor slot on a node.
///
/// The `cookie` is the idempotency token: two descriptors with the same cookie are the
/// same logical unit of work, across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderTask {
    pub run_id: RunId,
    pub step_id: StepId,
    #[serde(default)]
    cookie: Option<String>,
}

impl PlaceholderTask {
    /// Creates a descriptor with a token derived from the run and step identity.
    pub fn new(run_id: impl Into<RunId>, step_id: impl Into<StepId>) -> Self {
        let run_id = run_id.into();
        let step_id = step_id.into();
        let cookie = Some(derive_cookie(&run_id, &step_id));
        Self {
            run_id,
            step_id,
            cookie,
        }
    }

    /// Overrides the idempotency token; `None` disables deduplication for this task.
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }
}

impl fmt::Display for PlaceholderTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part of {} #{}", self.run_id, self.step_id)
    }
}

fn derive_cookie(run_id: &str, step_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(step_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Anything the queue can hold. Only placeholder tasks take part in resumption dedup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueTask {
    Placeholder(PlaceholderTask),
    Job { name: String },
}

impl QueueTask {
    pub fn as_placeholder(&self) -> Option<&PlaceholderTask> {
        match self {
            QueueTask::Placeholder(task) => Some(task),
            QueueTask::Job { .. } => None,
        }
    }
}

impl fmt::Display for QueueTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueTask::Placeholder(task) => task.fmt(f),
            QueueTask::Job { name } => f.write_str(name),
        }
    }
}

/// Queue-assigned identity of a work item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A work item sitting in (or started from) the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    pub id: ItemId,
    pub task: QueueTask,
    pub priority: u32,
}

impl QueueItem {
    /// True when this item is a placeholder task carrying `token`.
    pub fn matches_token(&self, token: &str) -> bool {
        self.task
            .as_placeholder()
            .and_then(PlaceholderTask::cookie)
            .is_some_and(|cookie| cookie == token)
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueItem{}[{}]", self.id, self.task)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutableId(pub u64);

/// Running identity of a started work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executable {
    pub id: ExecutableId,
    pub item: ItemId,
    pub task_name: String,
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (executable {})", self.task_name, self.id.0)
    }
}
