//! File system watcher for real-time sync.
//!
//! Wraps a `notify` watcher on the sync root. Raw notifications are handed to
//! a debounce task which collapses bursts per path and, once a path has been
//! quiet for the debounce window, stats it and emits a single
//! [`ChangeEvent`] describing its final state.

use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::sync::exclude::{is_temp_file, ExclusionFilter};
use crate::sync::index::{join_relative, relative_path, FileEntry};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

const EVENT_QUEUE: usize = 1024;

/// Type of change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Modified => 1,
            Self::Deleted => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Created),
            1 => Some(Self::Modified),
            2 => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Which side of the session observed a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// One collapsed change of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    pub origin: Origin,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind, origin: Origin) -> Self {
        Self {
            path: path.into(),
            kind,
            origin,
            observed_at: Utc::now(),
        }
    }
}

/// What the watcher delivers to its consumer.
#[derive(Debug)]
pub enum WatchMessage {
    Change(ChangeEvent),
    /// The root can no longer be watched; no further messages follow.
    Fatal(SyncError),
}

/// Recursive watcher on one sync root.
///
/// Only paths visible in the upload direction of `filter` are reported; the
/// remote agent runs with a general-only filter, for which that is the
/// general set. Dropping the watcher stops the debounce task.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    root: PathBuf,
}

impl LocalWatcher {
    /// Start watching `root`. Events arrive on the returned receiver.
    pub fn start(
        root: &Path,
        filter: Arc<ExclusionFilter>,
        debounce: Duration,
        origin: Origin,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<WatchMessage>)> {
        let root = root.canonicalize().map_err(|e| SyncError::LocalRootUnavailable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let _ = raw_tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| unwatchable(&root, e))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| unwatchable(&root, e))?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let debouncer = Debouncer {
            root: root.clone(),
            filter,
            window: debounce,
            origin,
            pending: BTreeMap::new(),
        };
        let task = tokio::spawn(debouncer.run(raw_rx, tx, cancel));

        tracing::debug!("Watching {} (debounce {:?})", root.display(), debounce);

        Ok((
            Self {
                _watcher: watcher,
                task,
                root,
            },
            rx,
        ))
    }

    /// Canonical root being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn unwatchable(root: &Path, err: notify::Error) -> SyncError {
    SyncError::LocalRootUnavailable {
        path: root.to_path_buf(),
        reason: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    last_seen: Instant,
    created: bool,
}

struct Debouncer {
    root: PathBuf,
    filter: Arc<ExclusionFilter>,
    window: Duration,
    origin: Origin,
    /// Sorted so parents flush before their children.
    pending: BTreeMap<String, Pending>,
}

impl Debouncer {
    async fn run(
        mut self,
        mut raw_rx: mpsc::UnboundedReceiver<std::result::Result<Event, notify::Error>>,
        tx: mpsc::Sender<WatchMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self
                .pending
                .values()
                .map(|p| p.last_seen + self.window)
                .min();

            tokio::select! {
                _ = cancel.cancelled() => break,
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => self.record(event),
                    Some(Err(e)) => {
                        if !self.root.is_dir() {
                            let _ = tx.send(WatchMessage::Fatal(unwatchable(&self.root, e))).await;
                            return;
                        }
                        tracing::warn!("Watch error under {}: {}", self.root.display(), e);
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if !self.root.is_dir() {
                        let err = SyncError::LocalRootUnavailable {
                            path: self.root.clone(),
                            reason: "root was removed".to_string(),
                        };
                        let _ = tx.send(WatchMessage::Fatal(err)).await;
                        return;
                    }
                    if self.flush(&tx).await.is_err() {
                        // Consumer went away.
                        return;
                    }
                }
            }
        }
    }

    fn record(&mut self, event: Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let created = matches!(event.kind, EventKind::Create(_));
        let now = Instant::now();

        for path in &event.paths {
            let Some(rel) = relative_path(&self.root, path) else {
                continue;
            };
            if is_temp_file(&rel) {
                continue;
            }
            let slot = self.pending.entry(rel).or_insert(Pending {
                last_seen: now,
                created: false,
            });
            slot.last_seen = now;
            slot.created |= created;
        }
    }

    /// Emit every path that has been quiet for a full window.
    async fn flush(&mut self, tx: &mpsc::Sender<WatchMessage>) -> std::result::Result<(), ()> {
        let now = Instant::now();
        let ready: Vec<(String, Pending)> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.last_seen + self.window)
            .map(|(path, p)| (path.clone(), *p))
            .collect();

        for (path, pending) in ready {
            self.pending.remove(&path);
            for event in self.settle(path, pending).await {
                tracing::debug!("{:?} {:?} {}", event.origin, event.kind, event.path);
                tx.send(WatchMessage::Change(event)).await.map_err(|_| ())?;
            }
        }
        Ok(())
    }

    /// Stat a quiet path and turn it into zero or more events.
    async fn settle(&self, path: String, pending: Pending) -> Vec<ChangeEvent> {
        let entry = match FileEntry::stat(&self.root, &path) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping change on {}: {}", path, e);
                return Vec::new();
            }
        };

        let Some(entry) = entry else {
            // Kind is unknown once gone; only drop paths hidden either way.
            if !self.filter.is_upload_visible(&path, false) && !self.filter.is_upload_visible(&path, true) {
                return Vec::new();
            }
            return vec![ChangeEvent::new(path, ChangeKind::Deleted, self.origin)];
        };

        if !self.filter.is_upload_visible(&path, entry.is_dir) {
            return Vec::new();
        }

        if !entry.is_dir {
            let kind = if pending.created {
                ChangeKind::Created
            } else {
                ChangeKind::Modified
            };
            return vec![ChangeEvent::new(path, kind, self.origin)];
        }

        // Directory metadata is not synced, only its existence.
        if !pending.created {
            return Vec::new();
        }

        let mut events = vec![ChangeEvent::new(path.clone(), ChangeKind::Created, self.origin)];
        let root = self.root.clone();
        let filter = self.filter.clone();
        let origin = self.origin;
        match tokio::task::spawn_blocking(move || expand_dir(&root, &path, &filter)).await {
            Ok(children) => events.extend(
                children
                    .into_iter()
                    .map(|child| ChangeEvent::new(child, ChangeKind::Created, origin)),
            ),
            Err(e) => tracing::warn!("Directory expansion failed: {}", e),
        }
        events
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Every visible path below a freshly created directory, parents first.
fn expand_dir(root: &Path, rel: &str, filter: &ExclusionFilter) -> Vec<String> {
    let dir = join_relative(root, rel);
    let mut found = Vec::new();

    for entry in jwalk::WalkDir::new(&dir)
        .skip_hidden(false)
        .follow_links(false)
        .sort(true)
        .into_iter()
        .flatten()
    {
        let path = entry.path();
        if path == dir {
            continue;
        }
        let Some(child) = relative_path(root, &path) else {
            continue;
        };
        if filter.is_upload_visible(&child, entry.file_type().is_dir()) {
            found.push(child);
        }
    }

    found
}
