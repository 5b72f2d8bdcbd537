//! Downstream pipeline: remote changes into the local tree.
//!
//! Consumes what the bridge routes downstream: change notifications from the
//! agent's watcher and the data frames of transfers this pipeline requested.
//! A notification whose entry already matches the local copy is only recorded;
//! anything else is fetched with a `Request` and staged through a
//! [`TransferReceiver`]. Partial transfers die with the connection that carried
//! them; outstanding requests are issued again on the next one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::sync::exclude::ExclusionFilter;
use crate::sync::index::{is_safe_relative, lock, FileEntry, FileIndex};
use crate::sync::stats::SessionStats;
use crate::sync::transfer::{create_dir, remove_path, ReceiveOutcome, TransferReceiver};
use crate::sync::watcher::ChangeKind;
use crate::transport::bridge::{LinkState, RemoteBridge, ResumePoint, Routed};
use crate::transport::frame::TransportFrame;

pub enum DownstreamCommand {
    /// Bring this remote entry into the local tree.
    Fetch(FileEntry),
    /// The agent's full index after a reconnect.
    Resync(FileIndex),
    /// Answered once every requested download has been applied or dropped.
    Barrier(oneshot::Sender<()>),
}

pub struct DownstreamPipeline {
    root: PathBuf,
    filter: Arc<ExclusionFilter>,
    bridge: Arc<RemoteBridge>,
    local_index: Arc<Mutex<FileIndex>>,
    remote_index: Arc<Mutex<FileIndex>>,
    stats: Arc<SessionStats>,
    resume: Arc<ResumePoint>,
    receiver: TransferReceiver,
    /// Requests without a completed transfer yet.
    requested: BTreeMap<String, FileEntry>,
    generation: Option<u64>,
    last_generation: u64,
    barriers: Vec<oneshot::Sender<()>>,
}

impl DownstreamPipeline {
    pub fn new(
        root: PathBuf,
        filter: Arc<ExclusionFilter>,
        bridge: Arc<RemoteBridge>,
        local_index: Arc<Mutex<FileIndex>>,
        remote_index: Arc<Mutex<FileIndex>>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let resume = bridge.resume();
        Self {
            receiver: TransferReceiver::new(root.clone()),
            root,
            filter,
            bridge,
            local_index,
            remote_index,
            stats,
            resume,
            requested: BTreeMap::new(),
            generation: None,
            last_generation: 0,
            barriers: Vec::new(),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<DownstreamCommand>,
        mut inbound: mpsc::Receiver<Routed>,
        mut link: watch::Receiver<LinkState>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let initial = *link.borrow_and_update();
        self.on_link(initial).await;

        loop {
            self.release_barriers();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *link.borrow_and_update();
                    self.on_link(state).await;
                }
                Some(routed) = inbound.recv() => self.on_inbound(routed).await,
                command = commands.recv() => match command {
                    Some(DownstreamCommand::Fetch(entry)) => self.fetch(entry).await,
                    Some(DownstreamCommand::Resync(index)) => self.resync(index).await,
                    Some(DownstreamCommand::Barrier(tx)) => self.barriers.push(tx),
                    None => break,
                },
            }
        }

        let discarded = self.receiver.abort_all();
        tracing::debug!("Downstream stopped, discarded {} partial downloads", discarded);
        Ok(())
    }

    async fn on_link(&mut self, state: LinkState) {
        match state {
            LinkState::Down => {
                self.generation = None;
                let discarded = self.receiver.abort_all();
                if discarded > 0 {
                    tracing::info!("Discarded {} partial downloads", discarded);
                }
            }
            LinkState::Connected(generation) if generation > self.last_generation => {
                self.adopt(generation).await;
            }
            LinkState::Connected(_) => {}
        }
    }

    /// Switch to a new connection and re-issue every outstanding request.
    async fn adopt(&mut self, generation: u64) {
        self.last_generation = generation;
        self.generation = Some(generation);
        self.receiver.abort_all();

        let paths: Vec<String> = self.requested.keys().cloned().collect();
        if !paths.is_empty() {
            tracing::info!("Re-issuing {} download requests", paths.len());
        }
        for path in paths {
            if self.bridge.send(TransportFrame::Request { path }).await.is_err() {
                break;
            }
        }
    }

    async fn on_inbound(&mut self, routed: Routed) {
        if routed.generation > self.last_generation {
            // Frames can overtake the link-state change that announces them.
            self.adopt(routed.generation).await;
        }
        if self.generation != Some(routed.generation) {
            tracing::trace!("Dropping {:?} from a dead connection", routed.frame.frame_type());
            return;
        }
        self.handle(routed.frame).await;
    }

    async fn handle(&mut self, frame: TransportFrame) {
        match frame {
            TransportFrame::ChangeNotify {
                path,
                kind: ChangeKind::Deleted,
                ..
            } => self.on_remote_delete(&path).await,
            TransportFrame::ChangeNotify {
                path,
                entry: Some(mut entry),
                ..
            } => {
                entry.path = path;
                self.on_remote_change(entry).await;
            }
            TransportFrame::ChangeNotify { path, kind, entry: None } => {
                tracing::warn!("Ignoring {:?} notification for {} without an entry", kind, path);
            }
            frame @ (TransportFrame::DataBegin { .. }
            | TransportFrame::DataChunk { .. }
            | TransportFrame::DataEnd { .. }) => {
                let outcome = self.receiver.receive(frame).await;
                self.on_outcome(outcome).await;
            }
            TransportFrame::Error {
                code,
                seq,
                path,
                message,
            } => {
                let aborted = seq.and_then(|seq| self.receiver.abort(seq));
                if let Some(path) = path.or(aborted) {
                    self.requested.remove(&path);
                    tracing::debug!("Download of {} failed remotely ({:?}): {}", path, code, message);
                } else {
                    tracing::warn!("Agent reported {:?}: {}", code, message);
                }
            }
            other => tracing::debug!("Unexpected {:?} on the downstream queue", other.frame_type()),
        }
    }

    async fn on_remote_delete(&mut self, path: &str) {
        if !is_safe_relative(path) {
            tracing::warn!("Ignoring delete of unsafe path {:?}", path);
            return;
        }

        let was_dir = {
            let mut remote = lock(&self.remote_index);
            let was_dir = remote.get(path).map_or(false, |e| e.is_dir);
            remote.remove_tree(path);
            was_dir
        };
        let prefix = format!("{}/", path);
        self.requested.retain(|p, _| p != path && !p.starts_with(&prefix));

        if !self.filter.is_download_visible(path, was_dir) {
            return;
        }
        // Only remove what has been synced; a local file the remote never
        // knew about is kept. Dropping it from the index first keeps the
        // watcher's report of this removal from going back upstream.
        if lock(&self.local_index).remove_tree(path) == 0 {
            tracing::debug!("Remote delete of {} has nothing synced locally", path);
            return;
        }

        match remove_path(&self.root, path).await {
            Ok(true) => {
                SessionStats::incr(&self.stats.deletes_applied);
                tracing::debug!("Deleted {} (remote delete)", path);
            }
            Ok(false) => tracing::debug!("{} was already absent", path),
            Err(e) => tracing::warn!("Could not delete {}: {}", path, e),
        }
    }

    async fn on_remote_change(&mut self, entry: FileEntry) {
        if !is_safe_relative(&entry.path) {
            tracing::warn!("Ignoring change of unsafe path {:?}", entry.path);
            return;
        }

        lock(&self.remote_index).insert(entry.clone());
        if !self.filter.is_download_visible(&entry.path, entry.is_dir) {
            return;
        }

        let synced = lock(&self.local_index)
            .get(&entry.path)
            .map_or(false, |local| local.same_content(&entry));
        if synced {
            return;
        }
        if let Ok(Some(on_disk)) = FileEntry::stat(&self.root, &entry.path) {
            if on_disk.same_content(&entry) {
                lock(&self.local_index).insert(on_disk);
                return;
            }
        }

        self.fetch(entry).await;
    }

    async fn fetch(&mut self, entry: FileEntry) {
        if entry.is_dir {
            match create_dir(&self.root, &entry.path).await {
                Ok(()) => {
                    lock(&self.local_index).insert(entry);
                }
                Err(e) => tracing::warn!("Could not create {}: {}", entry.path, e),
            }
            return;
        }
        if entry.is_symlink {
            tracing::debug!("Not downloading symlink {}", entry.path);
            return;
        }

        let path = entry.path.clone();
        self.requested.insert(path.clone(), entry);
        if self.generation.is_some() {
            if let Err(e) = self.bridge.send(TransportFrame::Request { path: path.clone() }).await {
                tracing::debug!("Request for {} waits for the link: {}", path, e);
            }
        }
    }

    /// Apply the agent's index after a reconnect: anything that changed or
    /// disappeared while the link was down is handled like a notification.
    async fn resync(&mut self, index: FileIndex) {
        let previous = lock(&self.remote_index).clone();

        let removed: Vec<String> = previous.paths().filter(|p| !index.contains(p)).cloned().collect();
        for path in &removed {
            self.on_remote_delete(path).await;
        }

        let changed: Vec<FileEntry> = index
            .iter()
            .filter(|entry| {
                previous
                    .get(&entry.path)
                    .map_or(true, |old| !old.same_content(entry))
            })
            .cloned()
            .collect();
        tracing::info!(
            "Resync: {} remote entries, {} changed, {} removed",
            index.len(),
            changed.len(),
            removed.len()
        );
        for entry in changed {
            self.on_remote_change(entry).await;
        }
    }

    async fn on_outcome(&mut self, outcome: ReceiveOutcome) {
        let reply = outcome.reply();
        match outcome {
            ReceiveOutcome::Progress => return,
            ReceiveOutcome::Applied { seq, entry } => {
                self.requested.remove(&entry.path);
                // Both sides hold this content now. The local watcher's echo of
                // the write compares against the remote entry, and a remote
                // delete arriving before that echo finds the path synced.
                lock(&self.remote_index).insert(entry.clone());
                lock(&self.local_index).insert(entry.clone());
                SessionStats::incr(&self.stats.downloads_applied);
                self.resume.record_download_applied(seq);
                tracing::debug!("Downloaded {} (seq {}, {} bytes)", entry.path, seq, entry.size);
            }
            ReceiveOutcome::Failed {
                seq,
                path,
                code,
                error,
            } => {
                SessionStats::incr(&self.stats.transfers_rejected);
                if let Some(path) = &path {
                    self.requested.remove(path);
                }
                tracing::warn!("Rejected download seq {} ({:?}): {}", seq, code, error);
            }
        }

        if let Some(reply) = reply {
            let _ = self.bridge.send(reply).await;
        }
    }

    fn release_barriers(&mut self) {
        if self.requested.is_empty() && self.receiver.in_progress() == 0 {
            for barrier in self.barriers.drain(..) {
                let _ = barrier.send(());
            }
        }
    }
}
