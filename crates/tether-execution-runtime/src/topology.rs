//! Node topology: nodes, their live workers, communication channels and directory handles.
//!
//! A [Node] is configuration and survives disconnects. A [Worker] is the live side of a
//! node: it owns the current [Channel], the executor slots and the node's lease registry.
//! Every reconnect opens a new channel, so a [DirHandle] bound to an old channel goes stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::{LeaseRegistry, WorkspaceList};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Communication channel between the controller and one worker connection.
#[derive(Debug)]
pub struct Channel {
    id: u64,
    open: AtomicBool,
}

impl Channel {
    fn open() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Directory on a node, reachable through one specific channel.
///
/// Two handles are equal when they name the same path over the same channel.
#[derive(Clone, Debug)]
pub struct DirHandle {
    node: String,
    remote: String,
    channel: Arc<Channel>,
}

impl DirHandle {
    pub fn new(node: impl Into<String>, remote: impl Into<String>, channel: Arc<Channel>) -> Self {
        Self {
            node: node.into(),
            remote: remote.into(),
            channel,
        }
    }

    /// Node name; empty for the controller.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Path on the node.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// True while the channel this handle was created from is still connected.
    pub fn is_live(&self) -> bool {
        self.channel.is_open()
    }

    /// Same node and channel, different path.
    pub fn with_remote(&self, remote: impl Into<String>) -> Self {
        Self {
            node: self.node.clone(),
            remote: remote.into(),
            channel: Arc::clone(&self.channel),
        }
    }

    /// Resolves `relative` against this directory; absolute paths replace it.
    pub fn child(&self, relative: &str) -> Self {
        if relative.starts_with('/') {
            return self.with_remote(relative);
        }
        let relative = relative.trim_start_matches("./").trim_end_matches('/');
        if relative.is_empty() || relative == "." {
            return self.clone();
        }
        let base = self.remote.trim_end_matches('/');
        self.with_remote(format!("{}/{}", base, relative))
    }
}

impl PartialEq for DirHandle {
    fn eq(&self, other: &Self) -> bool {
        self.remote == other.remote && self.channel.id == other.channel.id
    }
}

impl Eq for DirHandle {}

impl fmt::Display for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.remote)
    }
}

/// Configured node. The controller is the node with an empty name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn controller() -> Self {
        Self::new("")
    }

    pub fn is_controller(&self) -> bool {
        self.name.is_empty()
    }

    pub fn display_name(&self) -> &str {
        display_name(&self.name)
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "built-in"
    } else {
        name
    }
}

/// Why a worker went offline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineCause {
    pub description: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for OfflineCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// A recorded request to terminate a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRequest {
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for TerminationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (requested at {})", self.reason, self.at.to_rfc3339())
    }
}

/// Live side of a node.
pub struct Worker {
    name: String,
    channel: RwLock<Option<Arc<Channel>>>,
    offline_cause: RwLock<Option<OfflineCause>>,
    terminated_by: Mutex<Vec<TerminationRequest>>,
    workspace_list: Arc<dyn LeaseRegistry>,
}

impl Worker {
    /// Offline worker with its own in-memory [WorkspaceList].
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_lease_registry(name, Arc::new(WorkspaceList::new()))
    }

    pub fn with_lease_registry(
        name: impl Into<String>,
        workspace_list: Arc<dyn LeaseRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            channel: RwLock::new(None),
            offline_cause: RwLock::new(None),
            terminated_by: Mutex::new(Vec::new()),
            workspace_list,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        display_name(&self.name)
    }

    /// Opens a fresh channel, closing any previous one, and clears the offline cause.
    pub fn connect(&self) -> Arc<Channel> {
        let channel = Channel::open();
        if let Some(previous) = write(&self.channel).replace(Arc::clone(&channel)) {
            previous.close();
        }
        *write(&self.offline_cause) = None;
        log::debug!("{} connected on channel {}", self.display_name(), channel.id());
        channel
    }

    pub fn disconnect(&self, cause: impl Into<String>) {
        let cause = OfflineCause {
            description: cause.into(),
            at: Utc::now(),
        };
        if let Some(previous) = write(&self.channel).take() {
            previous.close();
        }
        log::debug!("{} disconnected: {}", self.display_name(), cause);
        *write(&self.offline_cause) = Some(cause);
    }

    /// Current channel, if connected.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        read(&self.channel)
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    pub fn is_online(&self) -> bool {
        self.channel().is_some()
    }

    pub fn offline_cause(&self) -> Option<OfflineCause> {
        read(&self.offline_cause).clone()
    }

    pub fn request_termination(&self, reason: impl Into<String>) {
        let mut terminated_by = self
            .terminated_by
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        terminated_by.push(TerminationRequest {
            reason: reason.into(),
            at: Utc::now(),
        });
    }

    pub fn terminated_by(&self) -> Vec<TerminationRequest> {
        self.terminated_by
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Handle on `path` over the current channel; `None` while offline.
    pub fn dir(&self, path: &str) -> Option<DirHandle> {
        self.channel()
            .map(|channel| DirHandle::new(self.name.clone(), path, channel))
    }

    pub fn lease_registry(&self) -> &Arc<dyn LeaseRegistry> {
        &self.workspace_list
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One execution slot of a worker.
#[derive(Clone, Debug)]
pub struct ExecutorSlot {
    owner: Arc<Worker>,
    number: usize,
}

impl ExecutorSlot {
    pub fn new(owner: Arc<Worker>, number: usize) -> Self {
        Self { owner, number }
    }

    pub fn owner(&self) -> &Arc<Worker> {
        &self.owner
    }

    pub fn number(&self) -> usize {
        self.number
    }
}

impl fmt::Display for ExecutorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner.display_name(), self.number)
    }
}

/// Read access to the current node topology.
pub trait NodeTopology: Send + Sync {
    fn controller(&self) -> Arc<Node>;

    /// Node by name; the empty name is the controller.
    fn node(&self, name: &str) -> Option<Arc<Node>>;

    fn worker(&self, name: &str) -> Option<Arc<Worker>>;

    fn offline_cause(&self, name: &str) -> Option<OfflineCause> {
        self.worker(name).and_then(|worker| worker.offline_cause())
    }

    fn termination_reasons(&self, name: &str) -> Vec<TerminationRequest> {
        self.worker(name)
            .map(|worker| worker.terminated_by())
            .unwrap_or_default()
    }

    /// Fresh handle on `path` over the node's current channel, if it is connected.
    fn find_dir(&self, node: &str, path: &str) -> Option<DirHandle> {
        self.worker(node).and_then(|worker| worker.dir(path))
    }
}

/// In-process topology for embedding and tests.
pub struct InMemoryTopology {
    controller: Arc<Node>,
    controller_worker: Arc<Worker>,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    workers: RwLock<HashMap<String, Arc<Worker>>>,
}

impl InMemoryTopology {
    /// Topology with a connected controller and no other nodes.
    pub fn new() -> Self {
        let controller_worker = Worker::new("");
        controller_worker.connect();
        Self {
            controller: Arc::new(Node::controller()),
            controller_worker,
            nodes: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Adds `node` with a connected worker and returns the worker.
    pub fn add_node(&self, node: Node) -> Arc<Worker> {
        let worker = Worker::new(node.name.clone());
        worker.connect();
        self.add_node_with_worker(node, Arc::clone(&worker));
        worker
    }

    pub fn add_node_with_worker(&self, node: Node, worker: Arc<Worker>) {
        write(&self.workers).insert(node.name.clone(), worker);
        write(&self.nodes).insert(node.name.clone(), Arc::new(node));
    }

    /// Deletes the node; its worker is disconnected and forgotten.
    pub fn remove_node(&self, name: &str) -> Option<Arc<Node>> {
        if let Some(worker) = write(&self.workers).remove(name) {
            worker.disconnect(format!("{} was removed", display_name(name)));
        }
        write(&self.nodes).remove(name)
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names = read(&self.nodes).keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl Default for InMemoryTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTopology for InMemoryTopology {
    fn controller(&self) -> Arc<Node> {
        Arc::clone(&self.controller)
    }

    fn node(&self, name: &str) -> Option<Arc<Node>> {
        if name.is_empty() {
            return Some(self.controller());
        }
        read(&self.nodes).get(name).cloned()
    }

    fn worker(&self, name: &str) -> Option<Arc<Worker>> {
        if name.is_empty() {
            return Some(Arc::clone(&self.controller_worker));
        }
        read(&self.workers).get(name).cloned()
    }
}
