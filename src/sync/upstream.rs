//! Upstream pipeline: local changes to the remote side.
//!
//! Local change events are collapsed per path in a pending queue, then sent
//! while fewer than `inflight_window` transfers await their `Ack`. A transfer
//! that was not acknowledged when the link dropped is sent again, from the
//! first byte and under the same sequence number, once the link is back.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sync::exclude::ExclusionFilter;
use crate::sync::index::{lock, FileEntry, FileIndex};
use crate::sync::stats::SessionStats;
use crate::sync::transfer::send_file;
use crate::sync::watcher::{ChangeEvent, ChangeKind};
use crate::transport::bridge::{LinkState, RemoteBridge, ResumePoint, Routed};
use crate::transport::frame::TransportFrame;

pub enum UpstreamCommand {
    Change(ChangeEvent),
    /// Answered once every change queued before it has been acknowledged.
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingChange {
    kind: ChangeKind,
    /// Set when this is a retransmission.
    seq: Option<u64>,
}

/// FIFO of paths where a newer change for a queued path replaces the older one
/// in place.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    order: VecDeque<String>,
    changes: HashMap<String, PendingChange>,
}

impl PendingQueue {
    fn push(&mut self, path: String, kind: ChangeKind) {
        match self.changes.get_mut(&path) {
            Some(existing) => existing.kind = kind,
            None => {
                self.order.push_back(path.clone());
                self.changes.insert(path, PendingChange { kind, seq: None });
            }
        }
    }

    /// Put an unacknowledged transfer back at the head of the queue.
    fn requeue(&mut self, path: String, kind: ChangeKind, seq: u64) {
        match self.changes.get_mut(&path) {
            // A newer change already waits; it inherits the sequence number.
            Some(existing) => existing.seq = Some(seq),
            None => {
                self.order.push_front(path.clone());
                self.changes.insert(path, PendingChange { kind, seq: Some(seq) });
            }
        }
    }

    fn pop(&mut self) -> Option<(String, PendingChange)> {
        while let Some(path) = self.order.pop_front() {
            if let Some(change) = self.changes.remove(&path) {
                return Some((path, change));
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.changes.len()
    }

    fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    path: String,
    entry: FileEntry,
}

/// Outcome of handing one pending change to the bridge.
enum Dispatch {
    Done,
    /// The link failed; the change must wait for the next connection.
    LinkLost,
}

pub struct UpstreamPipeline {
    config: Arc<SyncConfig>,
    root: PathBuf,
    filter: Arc<ExclusionFilter>,
    bridge: Arc<RemoteBridge>,
    local_index: Arc<Mutex<FileIndex>>,
    remote_index: Arc<Mutex<FileIndex>>,
    stats: Arc<SessionStats>,
    resume: Arc<ResumePoint>,
    pending: PendingQueue,
    in_flight: BTreeMap<u64, InFlight>,
    next_seq: u64,
    generation: Option<u64>,
    barriers: Vec<oneshot::Sender<()>>,
}

impl UpstreamPipeline {
    pub fn new(
        config: Arc<SyncConfig>,
        filter: Arc<ExclusionFilter>,
        bridge: Arc<RemoteBridge>,
        local_index: Arc<Mutex<FileIndex>>,
        remote_index: Arc<Mutex<FileIndex>>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let resume = bridge.resume();
        Self {
            root: config.local_root.clone(),
            config,
            filter,
            bridge,
            local_index,
            remote_index,
            stats,
            resume,
            pending: PendingQueue::default(),
            in_flight: BTreeMap::new(),
            next_seq: 1,
            generation: None,
            barriers: Vec::new(),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<UpstreamCommand>,
        mut acks: mpsc::Receiver<Routed>,
        mut link: watch::Receiver<LinkState>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.on_link(*link.borrow_and_update());

        loop {
            self.pump(&cancel).await;
            self.release_barriers();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *link.borrow_and_update();
                    self.on_link(state);
                }
                Some(routed) = acks.recv() => self.on_ack(routed.frame),
                command = commands.recv() => match command {
                    Some(UpstreamCommand::Change(event)) => self.pending.push(event.path, event.kind),
                    Some(UpstreamCommand::Barrier(tx)) => self.barriers.push(tx),
                    None => break,
                },
            }
        }

        tracing::debug!(
            "Upstream stopped with {} pending and {} unacknowledged",
            self.pending.len(),
            self.in_flight.len()
        );
        Ok(())
    }

    fn on_link(&mut self, state: LinkState) {
        match state {
            LinkState::Connected(generation) if self.generation != Some(generation) => {
                self.generation = Some(generation);
                let unacked = std::mem::take(&mut self.in_flight);
                if !unacked.is_empty() {
                    tracing::info!("Retransmitting {} unacknowledged uploads", unacked.len());
                }
                // Highest first so the lowest sequence ends up at the head.
                for (seq, item) in unacked.into_iter().rev() {
                    self.pending.requeue(item.path, ChangeKind::Modified, seq);
                }
            }
            LinkState::Connected(_) => {}
            LinkState::Down => self.generation = None,
        }
    }

    /// Send pending changes while the window has room and the link is up.
    async fn pump(&mut self, cancel: &CancellationToken) {
        while self.generation.is_some()
            && self.in_flight.len() < self.config.inflight_window
            && !cancel.is_cancelled()
        {
            let Some((path, change)) = self.pending.pop() else {
                break;
            };
            match self.dispatch(&path, &change, cancel).await {
                Dispatch::Done => {}
                Dispatch::LinkLost => {
                    self.generation = None;
                    break;
                }
            }
        }
    }

    async fn dispatch(&mut self, path: &str, change: &PendingChange, cancel: &CancellationToken) -> Dispatch {
        let current = match FileEntry::stat(&self.root, path) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!("Skipping upload of {}: {}", path, e);
                return Dispatch::Done;
            }
        };

        // The path's state now decides, whatever the event said.
        tracing::trace!("Dispatching {:?} {} (exists: {})", change.kind, path, current.is_some());
        match current {
            None => self.send_delete(path).await,
            Some(entry) => self.send_change(path, entry, change.seq, cancel).await,
        }
    }

    async fn send_delete(&mut self, path: &str) -> Dispatch {
        let was_dir = lock(&self.local_index).get(path).map_or(false, |e| e.is_dir);
        if !self.filter.is_upload_visible(path, was_dir) {
            return Dispatch::Done;
        }

        // Anything this side has indexed may exist remotely, including an
        // upload whose echo has not come back yet.
        let synced = lock(&self.local_index).remove_tree(path) > 0;
        if !synced && !lock(&self.remote_index).contains(path) {
            tracing::debug!("{} is already absent remotely", path);
            return Dispatch::Done;
        }

        let frame = TransportFrame::ChangeNotify {
            path: path.to_string(),
            kind: ChangeKind::Deleted,
            entry: None,
        };
        match self.bridge.send(frame).await {
            Ok(()) => {
                SessionStats::incr(&self.stats.deletes_sent);
                tracing::debug!("Sent delete of {}", path);
                Dispatch::Done
            }
            Err(e) => {
                tracing::debug!("Delete of {} waits for the link: {}", path, e);
                self.pending.push(path.to_string(), ChangeKind::Deleted);
                Dispatch::LinkLost
            }
        }
    }

    async fn send_change(
        &mut self,
        path: &str,
        entry: FileEntry,
        retransmit: Option<u64>,
        cancel: &CancellationToken,
    ) -> Dispatch {
        if !self.filter.is_upload_visible(path, entry.is_dir) {
            return Dispatch::Done;
        }
        if entry.is_symlink {
            tracing::debug!("Not uploading symlink {}", path);
            return Dispatch::Done;
        }

        let echo = lock(&self.remote_index)
            .get(path)
            .map_or(false, |remote| remote.same_content(&entry));
        if echo {
            lock(&self.local_index).insert(entry);
            return Dispatch::Done;
        }

        if entry.is_dir {
            let frame = TransportFrame::ChangeNotify {
                path: path.to_string(),
                kind: ChangeKind::Created,
                entry: Some(entry.clone()),
            };
            return match self.bridge.send(frame).await {
                Ok(()) => {
                    lock(&self.remote_index).insert(entry.clone());
                    lock(&self.local_index).insert(entry);
                    Dispatch::Done
                }
                Err(_) => {
                    self.pending.push(path.to_string(), ChangeKind::Created);
                    Dispatch::LinkLost
                }
            };
        }

        let seq = retransmit.unwrap_or_else(|| {
            let seq = self.next_seq;
            self.next_seq += 1;
            seq
        });
        self.in_flight.insert(
            seq,
            InFlight {
                path: path.to_string(),
                entry: entry.clone(),
            },
        );
        lock(&self.local_index).insert(entry);

        match send_file(
            self.bridge.as_ref(),
            &self.root,
            path,
            seq,
            self.config.chunk_size,
            cancel,
        )
        .await
        {
            Ok(sent) => {
                if let Some(item) = self.in_flight.get_mut(&seq) {
                    item.entry = sent.entry.clone();
                }
                lock(&self.local_index).insert(sent.entry);
                Dispatch::Done
            }
            // Stays in flight; retransmitted after reconnect.
            Err(e) if e.is_transport() => Dispatch::LinkLost,
            Err(SyncError::Vanished { .. }) => {
                self.in_flight.remove(&seq);
                lock(&self.local_index).remove_tree(path);
                tracing::debug!("{} vanished before upload; its delete follows", path);
                Dispatch::Done
            }
            Err(e) => {
                self.in_flight.remove(&seq);
                lock(&self.local_index).remove_tree(path);
                tracing::warn!("Skipping upload of {}: {}", path, e);
                Dispatch::Done
            }
        }
    }

    fn on_ack(&mut self, frame: TransportFrame) {
        match frame {
            TransportFrame::Ack { seq } => match self.in_flight.remove(&seq) {
                Some(item) => {
                    SessionStats::incr(&self.stats.uploads_committed);
                    self.resume.record_upload_ack(seq);
                    // The agent holds this content now, ahead of its own notification.
                    lock(&self.remote_index).insert(item.entry);
                    tracing::debug!("Upload of {} committed (seq {})", item.path, seq);
                }
                None => tracing::debug!("Ignoring ack for unknown seq {}", seq),
            },
            TransportFrame::Error {
                code,
                seq: Some(seq),
                message,
                ..
            } => match self.in_flight.remove(&seq) {
                Some(item) => {
                    SessionStats::incr(&self.stats.transfers_rejected);
                    // Forget what was sent so the next change of this path goes out again.
                    lock(&self.local_index).remove_tree(&item.path);
                    tracing::warn!("Agent rejected upload of {} ({:?}): {}", item.path, code, message);
                }
                None => tracing::debug!("Ignoring error for unknown seq {}: {}", seq, message),
            },
            other => tracing::debug!("Unexpected {:?} on the ack queue", other.frame_type()),
        }
    }

    fn release_barriers(&mut self) {
        if self.pending.is_empty() && self.in_flight.is_empty() {
            for barrier in self.barriers.drain(..) {
                let _ = barrier.send(());
            }
        }
    }
}
