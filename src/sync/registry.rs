//! Process-wide bookkeeping of attached sessions.
//!
//! The same (local root, target, remote path) triple may only be synced by
//! one session at a time; two sessions on one pair would echo each other's
//! writes back and forth.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    local_root: PathBuf,
    target: String,
    remote_path: String,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}:{}", self.local_root.display(), self.target, self.remote_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    attached: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; the returned guard detaches it on drop.
    pub fn attach(&self, local_root: &Path, target: &str, remote_path: &str) -> Result<SessionGuard> {
        // Resolve symlinks so two spellings of one directory collide.
        let local_root = local_root.canonicalize().unwrap_or_else(|_| local_root.to_path_buf());
        let key = SessionKey {
            local_root,
            target: target.to_string(),
            remote_path: remote_path.trim_end_matches('/').to_string(),
        };

        let mut attached = self.lock();
        if !attached.insert(key.clone()) {
            return Err(SyncError::SessionAlreadyAttached(key.to_string()));
        }
        tracing::debug!("Attached session {}", key);

        Ok(SessionGuard {
            registry: self.clone(),
            key,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SessionKey>> {
        self.attached.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    key: SessionKey,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
        tracing::debug!("Detached session {}", self.key);
    }
}
