//! Sync session controller.
//!
//! A [`SyncSession`] owns everything that makes up one synced path pair: the
//! local watcher, the remote bridge, both pipelines and both indices. It moves
//! through [`SessionState`]s, which callers can observe via [`SyncSession::state`].
//!
//! ```text
//! Initializing -> InitialSync -> Streaming <-> Reconnecting
//!        \              \            \             \
//!         +--------------+------------+-------------+--> Terminated
//! ```

use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sync::conflict::{reconcile, Resolution};
use crate::sync::downstream::{DownstreamCommand, DownstreamPipeline};
use crate::sync::exclude::ExclusionFilter;
use crate::sync::index::{is_safe_relative, lock, scan_tree, FileIndex};
use crate::sync::registry::{SessionGuard, SessionRegistry};
use crate::sync::stats::SessionStats;
use crate::sync::throttle::BandwidthLimiter;
use crate::sync::upstream::{UpstreamCommand, UpstreamPipeline};
use crate::sync::watcher::{ChangeEvent, ChangeKind, LocalWatcher, Origin, WatchMessage};
use crate::transport::bridge::{BridgeChannels, BridgeEvent, BridgeOptions, RemoteBridge, Routed};
use crate::transport::endpoint::ExecEndpoint;
use crate::transport::frame::TransportFrame;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const COMMAND_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Initializing,
    InitialSync,
    Streaming,
    Reconnecting,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::InitialSync => "initial-sync",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Bounded connection attempts with exponential backoff.
#[derive(Debug)]
pub(crate) struct ReconnectBudget {
    max_attempts: usize,
    window: Duration,
    attempts: VecDeque<Instant>,
    delay: Duration,
}

impl ReconnectBudget {
    pub(crate) fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: VecDeque::new(),
            delay: INITIAL_BACKOFF,
        }
    }

    /// Record an attempt at `now`; false once the window is used up.
    pub(crate) fn try_attempt(&mut self, now: Instant) -> bool {
        while let Some(first) = self.attempts.front() {
            if now.duration_since(*first) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= self.max_attempts {
            return false;
        }
        self.attempts.push_back(now);
        true
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
        delay
    }

    pub(crate) fn reset_backoff(&mut self) {
        self.delay = INITIAL_BACKOFF;
    }
}

/// One synchronized (local root, remote target, remote path) triple.
pub struct SyncSession {
    config: Arc<SyncConfig>,
    endpoint: Arc<dyn ExecEndpoint>,
    state: watch::Sender<SessionState>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    _guard: Option<SessionGuard>,
}

impl SyncSession {
    pub fn new(config: Arc<SyncConfig>, endpoint: Arc<dyn ExecEndpoint>) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            config,
            endpoint,
            state,
            stats: Arc::new(SessionStats::new()),
            cancel: CancellationToken::new(),
            _guard: None,
        }
    }

    /// Create a session registered in `registry`; fails if the same triple is
    /// already being synced.
    pub fn attach(
        registry: &SessionRegistry,
        config: Arc<SyncConfig>,
        endpoint: Arc<dyn ExecEndpoint>,
    ) -> Result<Self> {
        let guard = registry.attach(&config.local_root, &endpoint.target(), &config.remote_path)?;
        let mut session = Self::new(config, endpoint);
        session._guard = Some(guard);
        Ok(session)
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Cancelling this token stops the session from any state.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled or a fatal error occurs.
    pub async fn run(self) -> Result<()> {
        let result = self.drive().await;
        self.set_state(SessionState::Terminated);
        match &result {
            Ok(()) => tracing::info!("Sync of {} stopped", self.config.local_root.display()),
            Err(e) => tracing::error!("Sync of {} failed: {}", self.config.local_root.display(), e),
        }
        result
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Session state {} -> {}", previous, state);
        }
    }

    async fn drive(&self) -> Result<()> {
        self.config.validate()?;
        let filter = Arc::new(self.config.exclusion_filter()?);
        let workers = self.cancel.child_token();

        self.set_state(SessionState::Initializing);
        let (watcher, watch_rx) = LocalWatcher::start(
            &self.config.local_root,
            filter.clone(),
            self.config.debounce(),
            Origin::Local,
            workers.clone(),
        )?;

        let options = BridgeOptions {
            excludes: self.config.exclude.clone(),
            upload_limiter: BandwidthLimiter::with_burst(self.config.upload_limit(), self.config.chunk_size as u64),
            download_limiter: BandwidthLimiter::with_burst(self.config.download_limit(), self.config.chunk_size as u64),
            handshake_timeout: self.config.handshake_timeout(),
        };
        let (bridge, channels) = RemoteBridge::new(self.endpoint.clone(), options, self.stats.clone());
        let BridgeChannels {
            acks,
            downstream,
            index,
            events,
        } = channels;

        let local_index = Arc::new(Mutex::new(FileIndex::new()));
        let remote_index = Arc::new(Mutex::new(FileIndex::new()));
        let (up_tx, up_rx) = mpsc::channel(COMMAND_QUEUE);
        let (down_tx, down_rx) = mpsc::channel(COMMAND_QUEUE);

        let mut tasks = JoinSet::new();
        let upstream = UpstreamPipeline::new(
            self.config.clone(),
            filter.clone(),
            bridge.clone(),
            local_index.clone(),
            remote_index.clone(),
            self.stats.clone(),
        );
        tasks.spawn(upstream.run(up_rx, acks, bridge.subscribe(), workers.clone()));
        let downstream_pipeline = DownstreamPipeline::new(
            self.config.local_root.clone(),
            filter.clone(),
            bridge.clone(),
            local_index.clone(),
            remote_index.clone(),
            self.stats.clone(),
        );
        tasks.spawn(downstream_pipeline.run(down_rx, downstream, bridge.subscribe(), workers.clone()));

        let mut controller = Controller {
            session: self,
            filter,
            bridge: bridge.clone(),
            local_index,
            remote_index,
            up_tx,
            down_tx,
            budget: ReconnectBudget::new(self.config.max_reconnect_attempts, self.config.reconnect_window()),
            generation: None,
            collecting: None,
            connected_once: false,
            planned: false,
            streaming: false,
            barrier: None,
            reconnect_at: Some(Instant::now()),
            last_error: String::new(),
        };
        let result = controller.supervise(watch_rx, index, events, &mut tasks).await;

        // Workers clean up their temp files before the transport goes away.
        workers.cancel();
        while tasks.join_next().await.is_some() {}
        bridge.disconnect().await;
        drop(watcher);

        result
    }
}

struct Controller<'a> {
    session: &'a SyncSession,
    filter: Arc<ExclusionFilter>,
    bridge: Arc<RemoteBridge>,
    local_index: Arc<Mutex<FileIndex>>,
    remote_index: Arc<Mutex<FileIndex>>,
    up_tx: mpsc::Sender<UpstreamCommand>,
    down_tx: mpsc::Sender<DownstreamCommand>,
    budget: ReconnectBudget,
    /// Generation of the live connection.
    generation: Option<u64>,
    /// Remote index being received on the live connection.
    collecting: Option<FileIndex>,
    connected_once: bool,
    /// Initial reconciliation has been queued.
    planned: bool,
    streaming: bool,
    barrier: Option<BoxFuture<'static, ()>>,
    reconnect_at: Option<Instant>,
    last_error: String,
}

impl Controller<'_> {
    async fn supervise(
        &mut self,
        mut watch_rx: mpsc::Receiver<WatchMessage>,
        mut index: mpsc::Receiver<Routed>,
        mut events: mpsc::UnboundedReceiver<BridgeEvent>,
        tasks: &mut JoinSet<Result<()>>,
    ) -> Result<()> {
        let cancel = self.session.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = tasks.join_next() => {
                    let reason = match joined {
                        Ok(Ok(())) => "stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(SyncError::Transport(format!("pipeline worker ended: {}", reason)));
                }
                message = watch_rx.recv() => match message {
                    Some(WatchMessage::Change(event)) => {
                        let _ = self.up_tx.send(UpstreamCommand::Change(event)).await;
                    }
                    Some(WatchMessage::Fatal(e)) => return Err(e),
                    None => {
                        return Err(SyncError::LocalRootUnavailable {
                            path: self.session.config.local_root.clone(),
                            reason: "watcher stopped".to_string(),
                        })
                    }
                },
                Some(BridgeEvent::Lost { generation, reason }) = events.recv() => {
                    if self.generation == Some(generation) {
                        self.on_lost(reason);
                    }
                }
                Some(routed) = index.recv() => {
                    if self.generation == Some(routed.generation) {
                        self.on_index_frame(routed.frame).await?;
                    }
                }
                _ = wait_for(&mut self.barrier) => {
                    self.barrier = None;
                    self.streaming = true;
                    self.session.set_state(SessionState::Streaming);
                    tracing::info!(
                        "Sync started on {} <-> {} ({})",
                        self.session.config.local_root.display(),
                        self.session.config.remote_path,
                        self.bridge.target()
                    );
                }
                _ = sleep_until(self.reconnect_at), if self.reconnect_at.is_some() => {
                    self.try_connect().await?;
                }
            }
        }
    }

    fn on_lost(&mut self, reason: String) {
        tracing::warn!("Connection lost ({}), reconnecting", reason);
        self.generation = None;
        self.collecting = None;
        self.last_error = reason;
        self.session.set_state(SessionState::Reconnecting);
        self.reconnect_at = Some(Instant::now() + self.budget.next_delay());
    }

    async fn try_connect(&mut self) -> Result<()> {
        if !self.budget.try_attempt(Instant::now()) {
            return Err(SyncError::ReconnectExhausted {
                attempts: self.budget.attempts(),
                last_error: self.last_error.clone(),
            });
        }

        // Finding a pod and the handshake can take long; a stop request must
        // not wait for them.
        let cancel = self.session.cancel.clone();
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            connected = self.bridge.connect() => connected,
        };

        match connected {
            Ok(generation) => {
                if self.connected_once {
                    SessionStats::incr(&self.session.stats.reconnects);
                    tracing::info!("Reconnected to {}", self.bridge.target());
                } else {
                    tracing::info!("Connected to {}", self.bridge.target());
                }
                self.connected_once = true;
                self.generation = Some(generation);
                self.collecting = Some(FileIndex::new());
                self.reconnect_at = None;
                self.budget.reset_backoff();
                self.session.set_state(if self.streaming {
                    SessionState::Streaming
                } else {
                    SessionState::InitialSync
                });
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Connecting to {} failed: {}", self.bridge.target(), e);
                self.last_error = e.to_string();
                self.reconnect_at = Some(Instant::now() + self.budget.next_delay());
                Ok(())
            }
        }
    }

    async fn on_index_frame(&mut self, frame: TransportFrame) -> Result<()> {
        let Some(collecting) = self.collecting.as_mut() else {
            return Ok(());
        };

        match frame {
            TransportFrame::IndexEntry { entry } => {
                if is_safe_relative(&entry.path) {
                    collecting.insert(entry);
                } else {
                    tracing::warn!("Ignoring remote index entry {:?}", entry.path);
                }
                Ok(())
            }
            TransportFrame::IndexEnd { count } => {
                let remote = self.collecting.take().unwrap_or_default();
                if count != remote.len() as u64 {
                    tracing::warn!("Agent announced {} index entries, received {}", count, remote.len());
                }
                if self.planned {
                    let _ = self.down_tx.send(DownstreamCommand::Resync(remote)).await;
                    Ok(())
                } else {
                    self.plan_initial_sync(remote).await
                }
            }
            _ => Ok(()),
        }
    }

    async fn plan_initial_sync(&mut self, remote: FileIndex) -> Result<()> {
        let root = self.session.config.local_root.clone();
        let filter = self.filter.clone();
        let local = tokio::task::spawn_blocking(move || scan_tree(&root, &filter))
            .await
            .map_err(|e| SyncError::LocalRootUnavailable {
                path: self.session.config.local_root.clone(),
                reason: e.to_string(),
            })??;

        let plan = reconcile(&local, &remote, &self.filter, self.session.config.authority());
        tracing::info!(
            "Initial sync: {} local, {} remote, {} to upload, {} to download, {} conflicts, {} unchanged",
            local.len(),
            remote.len(),
            plan.uploads().count(),
            plan.downloads().count(),
            plan.conflicts.len(),
            plan.unchanged
        );
        for conflict in &plan.conflicts {
            let winner = match conflict.resolution {
                Resolution::UseLocal => "local",
                Resolution::UseRemote => "remote",
            };
            tracing::debug!("Conflict on {}: keeping {} version", conflict.path, winner);
        }

        *lock(&self.local_index) = local;
        *lock(&self.remote_index) = remote;

        for entry in plan.uploads() {
            let event = ChangeEvent::new(entry.path.clone(), ChangeKind::Created, Origin::Local);
            let _ = self.up_tx.send(UpstreamCommand::Change(event)).await;
        }
        for entry in plan.downloads() {
            let _ = self.down_tx.send(DownstreamCommand::Fetch(entry.clone())).await;
        }

        let (up_done, up_wait) = oneshot::channel();
        let (down_done, down_wait) = oneshot::channel();
        let _ = self.up_tx.send(UpstreamCommand::Barrier(up_done)).await;
        let _ = self.down_tx.send(DownstreamCommand::Barrier(down_done)).await;
        self.barrier = Some(Box::pin(async move {
            let _ = up_wait.await;
            let _ = down_wait.await;
        }));
        self.planned = true;
        Ok(())
    }
}

async fn wait_for(barrier: &mut Option<BoxFuture<'static, ()>>) {
    match barrier {
        Some(barrier) => barrier.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut budget = ReconnectBudget::new(5, Duration::from_secs(60));
        let delays: Vec<u64> = (0..7).map(|_| budget.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 5000, 5000]);

        budget.reset_backoff();
        assert_eq!(budget.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_budget_is_per_window() {
        let mut budget = ReconnectBudget::new(3, Duration::from_secs(60));
        let start = Instant::now();

        assert!(budget.try_attempt(start));
        assert!(budget.try_attempt(start + Duration::from_secs(1)));
        assert!(budget.try_attempt(start + Duration::from_secs(2)));
        assert!(!budget.try_attempt(start + Duration::from_secs(3)));

        // The first attempt falls out of the window.
        assert!(budget.try_attempt(start + Duration::from_secs(61)));
        assert_eq!(budget.attempts(), 3);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::InitialSync.to_string(), "initial-sync");
        assert_eq!(SessionState::Terminated.to_string(), "terminated");
    }
}
