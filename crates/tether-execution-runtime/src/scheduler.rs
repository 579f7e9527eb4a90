//! Work-item queue façade used by resumption.
//!
//! The queue has one global lock. [WorkQueue::lock] hands out a [QueueGuard] so a caller can
//! scan for an existing item and submit a new one in the same critical section; nothing
//! else may happen under that guard, and it must be dropped before waiting on an item.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use super::models::{Executable, ExecutableId, ItemId, QueueItem, QueueTask};
use super::topology::ExecutorSlot;

/// Why waiting for an item to start ended without a start.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("queue item {0} was cancelled")]
    Cancelled(ItemId),
}

/// Operator-side queue errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue item {0} not found")]
    NotFound(ItemId),
    #[error("queue item {0} is not pending")]
    NotPending(ItemId),
}

/// Operations available while holding the queue's global lock.
pub trait QueueGuard {
    /// Items waiting for a slot, in dispatch order.
    fn pending_items(&self) -> Vec<QueueItem>;

    /// Items that have started and not yet finished.
    fn running_items(&self) -> Vec<QueueItem>;

    /// First pending or running placeholder item carrying `token`.
    fn find_by_token(&self, token: &str) -> Option<QueueItem> {
        self.pending_items()
            .into_iter()
            .chain(self.running_items())
            .find(|item| item.matches_token(token))
    }

    /// Submits `task`; `None` when the queue refuses it.
    fn submit(&mut self, task: QueueTask, priority: u32) -> Option<QueueItem>;
}

/// Global work-item queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn lock(&self) -> Box<dyn QueueGuard + '_>;

    /// Resolves once `item` has been handed to an executor slot.
    ///
    /// Has no timeout of its own; callers bound it.
    async fn wait_for_start(&self, item: &QueueItem) -> Result<Executable, StartError>;

    /// Slot that claimed `executable`, while it is still running.
    fn claimed_slot(&self, executable: &Executable) -> Option<Arc<ExecutorSlot>>;
}

#[derive(Clone, Debug)]
enum ItemPhase {
    Pending,
    Started(Executable),
    Finished(Executable),
    Cancelled,
}

struct QueueEntry {
    item: QueueItem,
    phase: watch::Sender<ItemPhase>,
}

impl QueueEntry {
    fn is_pending(&self) -> bool {
        matches!(*self.phase.borrow(), ItemPhase::Pending)
    }

    fn is_running(&self) -> bool {
        matches!(*self.phase.borrow(), ItemPhase::Started(_))
    }
}

#[derive(Default)]
struct QueueState {
    next_item: u64,
    next_executable: u64,
    entries: BTreeMap<ItemId, QueueEntry>,
    by_token: HashMap<String, ItemId>,
    claims: HashMap<ExecutableId, Arc<ExecutorSlot>>,
    quieting_down: bool,
    submitted: u64,
}

impl QueueState {
    fn remove(&mut self, id: ItemId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        self.forget_token(id);
        Some(entry)
    }

    fn forget_token(&mut self, id: ItemId) {
        self.by_token.retain(|_, item| *item != id);
    }
}

/// In-process queue with a token index, for embedding and tests.
///
/// Dispatch is driven from outside through [InMemoryWorkQueue::start]; the queue records
/// which slot claimed each executable until [InMemoryWorkQueue::finish].
#[derive(Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While quieting down, every submission is refused.
    pub fn quiet_down(&self, quieting_down: bool) {
        self.state().quieting_down = quieting_down;
    }

    pub fn pending_items(&self) -> Vec<QueueItem> {
        self.lock().pending_items()
    }

    pub fn running_items(&self) -> Vec<QueueItem> {
        self.lock().running_items()
    }

    /// Number of items accepted since creation.
    pub fn submitted_count(&self) -> u64 {
        self.state().submitted
    }

    /// Hands a pending item to `slot`.
    pub fn start(&self, id: ItemId, slot: Arc<ExecutorSlot>) -> Result<Executable, QueueError> {
        let mut state = self.state();
        let entry = state.entries.get(&id).ok_or(QueueError::NotFound(id))?;
        if !entry.is_pending() {
            return Err(QueueError::NotPending(id));
        }
        let task_name = entry.item.task.to_string();
        state.next_executable += 1;
        let executable = Executable {
            id: ExecutableId(state.next_executable),
            item: id,
            task_name,
        };
        log::debug!("{} started on {}", executable, slot);
        state.claims.insert(executable.id, slot);
        if let Some(entry) = state.entries.get(&id) {
            entry
                .phase
                .send_replace(ItemPhase::Started(executable.clone()));
        }
        Ok(executable)
    }

    /// Cancels a pending item. Returns false if it is unknown or already started.
    pub fn cancel(&self, id: ItemId) -> bool {
        let mut state = self.state();
        match state.entries.get(&id) {
            Some(entry) if entry.is_pending() => {}
            _ => return false,
        }
        if let Some(entry) = state.remove(id) {
            entry.phase.send_replace(ItemPhase::Cancelled);
            log::debug!("cancelled {}", entry.item);
        }
        true
    }

    /// Marks `executable` finished and drops its slot claim.
    ///
    /// The item stays behind as a tombstone so late waiters still see that it started;
    /// it no longer counts as running and its token can be submitted again.
    pub fn finish(&self, executable: &Executable) {
        let mut state = self.state();
        state.claims.remove(&executable.id);
        state.forget_token(executable.item);
        if let Some(entry) = state.entries.get(&executable.item) {
            entry
                .phase
                .send_replace(ItemPhase::Finished(executable.clone()));
            log::debug!("{} finished", executable);
        }
    }
}

struct InMemoryQueueGuard<'a> {
    state: MutexGuard<'a, QueueState>,
}

impl QueueGuard for InMemoryQueueGuard<'_> {
    fn pending_items(&self) -> Vec<QueueItem> {
        self.state
            .entries
            .values()
            .filter(|entry| entry.is_pending())
            .map(|entry| entry.item.clone())
            .collect()
    }

    fn running_items(&self) -> Vec<QueueItem> {
        self.state
            .entries
            .values()
            .filter(|entry| entry.is_running())
            .map(|entry| entry.item.clone())
            .collect()
    }

    fn find_by_token(&self, token: &str) -> Option<QueueItem> {
        self.state
            .by_token
            .get(token)
            .and_then(|id| self.state.entries.get(id))
            .map(|entry| entry.item.clone())
    }

    fn submit(&mut self, task: QueueTask, priority: u32) -> Option<QueueItem> {
        if self.state.quieting_down {
            log::debug!("refusing {} while quieting down", task);
            return None;
        }
        self.state.next_item += 1;
        let item = QueueItem {
            id: ItemId(self.state.next_item),
            task,
            priority,
        };
        if let Some(token) = item.task.as_placeholder().and_then(|t| t.cookie()) {
            self.state.by_token.insert(token.to_string(), item.id);
        }
        let (phase, _) = watch::channel(ItemPhase::Pending);
        self.state.entries.insert(
            item.id,
            QueueEntry {
                item: item.clone(),
                phase,
            },
        );
        self.state.submitted += 1;
        Some(item)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    fn lock(&self) -> Box<dyn QueueGuard + '_> {
        Box::new(InMemoryQueueGuard {
            state: self.state(),
        })
    }

    async fn wait_for_start(&self, item: &QueueItem) -> Result<Executable, StartError> {
        let mut phase = {
            let state = self.state();
            match state.entries.get(&item.id) {
                Some(entry) => entry.phase.subscribe(),
                None => return Err(StartError::Cancelled(item.id)),
            }
        };
        let phase = phase
            .wait_for(|phase| !matches!(phase, ItemPhase::Pending))
            .await
            .map_err(|_| StartError::Cancelled(item.id))?;
        match &*phase {
            ItemPhase::Started(executable) | ItemPhase::Finished(executable) => {
                Ok(executable.clone())
            }
            ItemPhase::Pending | ItemPhase::Cancelled => Err(StartError::Cancelled(item.id)),
        }
    }

    fn claimed_slot(&self, executable: &Executable) -> Option<Arc<ExecutorSlot>> {
        self.state().claims.get(&executable.id).cloned()
    }
}
