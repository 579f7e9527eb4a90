//! Directory leases: exclusive holds on directories of one worker.
//!
//! A [LeaseRegistry] never blocks. When the requested path is already held it grants a
//! variant (`/ws/T@2`, `/ws/T@3`, ...) instead; callers that need the exact path must compare
//! [Lease::path] with what they asked for and release a variant they cannot use.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::topology::DirHandle;

/// Separator between a directory and its variant number.
pub const VARIANT_COMBINATOR: &str = "@";

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease registry error: {0}")]
    Registry(String),
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Exclusive hold on one directory. Dropping a lease does not release it.
pub struct Lease {
    path: DirHandle,
    acquired_at: DateTime<Utc>,
    on_release: Mutex<Option<ReleaseFn>>,
}

impl Lease {
    pub fn new(path: DirHandle, on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path,
            acquired_at: Utc::now(),
            on_release: Mutex::new(Some(Box::new(on_release))),
        }
    }

    /// The path actually granted, which may differ from the one requested.
    pub fn path(&self) -> &DirHandle {
        &self.path
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Returns the lease to its registry. Releasing twice is a no-op.
    pub fn release(&self) {
        let on_release = self
            .on_release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match on_release {
            Some(on_release) => {
                on_release();
                log::debug!("released lease on {}", self.path);
            }
            None => log::debug!("lease on {} was already released", self.path),
        }
    }

    pub fn is_released(&self) -> bool {
        self.on_release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("path", &self.path)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Per-worker exclusive lock manager over directories.
pub trait LeaseRegistry: Send + Sync {
    /// Grants an exclusive lease on `path`, or on a variant of it when `path` is taken.
    fn allocate(&self, path: &DirHandle) -> Result<Arc<Lease>, LeaseError>;
}

/// In-memory [LeaseRegistry] keyed by path.
#[derive(Debug, Default)]
pub struct WorkspaceList {
    held: Arc<Mutex<HashSet<String>>>,
}

impl WorkspaceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .map(|held| held.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_held(&self, remote: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(remote))
            .unwrap_or_else(|poisoned| poisoned.into_inner().contains(remote))
    }
}

impl LeaseRegistry for WorkspaceList {
    fn allocate(&self, path: &DirHandle) -> Result<Arc<Lease>, LeaseError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LeaseError::Registry("workspace list lock poisoned".to_string()))?;

        let mut granted = path.clone();
        let mut variant = 2u32;
        while held.contains(granted.remote()) {
            granted = path.with_remote(format!(
                "{}{}{}",
                path.remote(),
                VARIANT_COMBINATOR,
                variant
            ));
            variant += 1;
        }
        let key = granted.remote().to_string();
        held.insert(key.clone());
        log::trace!("allocated {} for requested {}", granted, path);

        let table = Arc::clone(&self.held);
        Ok(Arc::new(Lease::new(granted, move || {
            table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&key);
        })))
    }
}
