//! Remote bridge: the session's one connection to the agent.
//!
//! The bridge owns the framed stream. Outbound frames go through
//! [`RemoteBridge::send`], which holds the writer lock for exactly one frame.
//! A single reader task per connection decodes inbound frames and routes them
//! to the pipeline that owns them. Stream failures never propagate as panics
//! or errors out of the reader: the link is marked down and a
//! [`BridgeEvent::Lost`] tells the controller to reconnect.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{Result, SyncError};
use crate::sync::stats::SessionStats;
use crate::sync::throttle::BandwidthLimiter;
use crate::sync::transfer::FrameSink;
use crate::transport::endpoint::ExecEndpoint;
use crate::transport::frame::{ErrorCode, FrameCodec, TransportFrame, PROTOCOL_VERSION};

type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

const ROUTE_QUEUE: usize = 256;

/// Connection state as seen by the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    /// Up; the number increases with every successful connect.
    Connected(u64),
}

impl LinkState {
    pub fn generation(&self) -> Option<u64> {
        match self {
            LinkState::Connected(generation) => Some(*generation),
            LinkState::Down => None,
        }
    }
}

/// An inbound frame tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Routed {
    pub generation: u64,
    pub frame: TransportFrame,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Lost { generation: u64, reason: String },
}

/// Sequence numbers exchanged in `Init` so a new agent can pick up where the
/// previous connection stopped.
#[derive(Debug, Default)]
pub struct ResumePoint {
    upload_acked: AtomicU64,
    download_applied: AtomicU64,
}

impl ResumePoint {
    pub fn record_upload_ack(&self, seq: u64) {
        self.upload_acked.fetch_max(seq, Ordering::Relaxed);
    }

    pub fn record_download_applied(&self, seq: u64) {
        self.download_applied.fetch_max(seq, Ordering::Relaxed);
    }

    pub fn get(&self) -> [u64; 2] {
        [
            self.upload_acked.load(Ordering::Relaxed),
            self.download_applied.load(Ordering::Relaxed),
        ]
    }
}

/// Receiving ends of the bridge's routing queues.
pub struct BridgeChannels {
    /// `Ack` and upload-scoped `Error` frames.
    pub acks: mpsc::Receiver<Routed>,
    /// `ChangeNotify`, `Data*` and download-scoped `Error` frames.
    pub downstream: mpsc::Receiver<Routed>,
    /// `IndexEntry` and `IndexEnd` frames.
    pub index: mpsc::Receiver<Routed>,
    pub events: mpsc::UnboundedReceiver<BridgeEvent>,
}

/// Settings the bridge needs from the session.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// General exclude patterns forwarded to the agent in `Init`.
    pub excludes: Vec<String>,
    pub upload_limiter: BandwidthLimiter,
    pub download_limiter: BandwidthLimiter,
    pub handshake_timeout: Duration,
}

pub struct RemoteBridge {
    endpoint: Arc<dyn ExecEndpoint>,
    options: BridgeOptions,
    stats: Arc<SessionStats>,
    resume: Arc<ResumePoint>,
    writer: Mutex<Option<(u64, FrameWriter)>>,
    link: watch::Sender<LinkState>,
    generation: AtomicU64,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    acks_tx: mpsc::Sender<Routed>,
    downstream_tx: mpsc::Sender<Routed>,
    index_tx: mpsc::Sender<Routed>,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl RemoteBridge {
    pub fn new(
        endpoint: Arc<dyn ExecEndpoint>,
        options: BridgeOptions,
        stats: Arc<SessionStats>,
    ) -> (Arc<Self>, BridgeChannels) {
        let (acks_tx, acks) = mpsc::channel(ROUTE_QUEUE);
        let (downstream_tx, downstream) = mpsc::channel(ROUTE_QUEUE);
        let (index_tx, index) = mpsc::channel(ROUTE_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(LinkState::Down);

        let bridge = Arc::new(Self {
            endpoint,
            options,
            stats,
            resume: Arc::new(ResumePoint::default()),
            writer: Mutex::new(None),
            link,
            generation: AtomicU64::new(0),
            reader_task: std::sync::Mutex::new(None),
            acks_tx,
            downstream_tx,
            index_tx,
            events_tx,
        });

        let channels = BridgeChannels {
            acks,
            downstream,
            index,
            events,
        };
        (bridge, channels)
    }

    pub fn target(&self) -> String {
        self.endpoint.target()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn resume(&self) -> Arc<ResumePoint> {
        self.resume.clone()
    }

    /// Start a fresh agent, exchange `Init` and spawn the reader task.
    pub async fn connect(self: &Arc<Self>) -> Result<u64> {
        self.disconnect().await;

        let stream = self.endpoint.connect().await?;
        let mut reader: FrameReader = FramedRead::new(stream.reader, FrameCodec);
        let mut writer: FrameWriter = FramedWrite::new(stream.writer, FrameCodec);

        let resume_seq = self.resume.get();
        writer
            .send(TransportFrame::Init {
                protocol_version: PROTOCOL_VERSION,
                resume_seq,
                excludes: self.options.excludes.clone(),
            })
            .await?;

        let reply = tokio::time::timeout(self.options.handshake_timeout, reader.next())
            .await
            .map_err(|_| SyncError::Transport("timed out waiting for the agent handshake".to_string()))?;

        match reply {
            Some(Ok(Ok(TransportFrame::Init { protocol_version, .. }))) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(SyncError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
            }
            Some(Ok(Ok(TransportFrame::Error { code, message, .. }))) => {
                return Err(match code {
                    ErrorCode::VersionMismatch | ErrorCode::Malformed => SyncError::HandshakeRejected(message),
                    _ => SyncError::Protocol(format!("agent refused to start: {}", message)),
                });
            }
            Some(Ok(Ok(other))) => {
                return Err(SyncError::Protocol(format!(
                    "expected Init from agent, got {:?}",
                    other.frame_type()
                )));
            }
            Some(Ok(Err(rejection))) => {
                return Err(SyncError::Protocol(format!(
                    "unreadable handshake frame: {}",
                    rejection.reason
                )));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(SyncError::Transport(
                    "agent closed the stream during the handshake".to_string(),
                ))
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some((generation, writer));

        let task = tokio::spawn(self.clone().read_loop(generation, reader));
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }

        self.link.send_replace(LinkState::Connected(generation));
        tracing::debug!(
            "Connected to {} (generation {}, resume {:?})",
            self.endpoint.target(),
            generation,
            resume_seq
        );
        Ok(generation)
    }

    /// Drop the current connection, if any. Closing the writer ends the agent.
    pub async fn disconnect(&self) {
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let writer = self.writer.lock().await.take();
        if let Some((_, mut writer)) = writer {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer.close()).await;
        }
        self.link.send_replace(LinkState::Down);
    }

    /// Write one frame, waiting for upload tokens first.
    pub async fn send(&self, frame: TransportFrame) -> Result<()> {
        let len = frame.wire_len();
        self.options.upload_limiter.acquire(len).await;

        let mut guard = self.writer.lock().await;
        let Some((generation, writer)) = guard.as_mut() else {
            return Err(SyncError::LinkDown);
        };
        let generation = *generation;

        match writer.send(frame).await {
            Ok(()) => {
                SessionStats::add(&self.stats.bytes_up, len as u64);
                Ok(())
            }
            Err(e) => {
                *guard = None;
                drop(guard);
                self.mark_down(generation, e.to_string());
                Err(e)
            }
        }
    }

    fn mark_down(&self, generation: u64, reason: String) {
        let changed = self.link.send_if_modified(|state| {
            if *state == LinkState::Connected(generation) {
                *state = LinkState::Down;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::warn!("Link to {} lost: {}", self.endpoint.target(), reason);
            let _ = self.events_tx.send(BridgeEvent::Lost { generation, reason });
        }
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut reader: FrameReader) {
        let reason = loop {
            let decoded = match reader.next().await {
                None => break "stream closed by peer".to_string(),
                Some(Err(e)) => break e.to_string(),
                Some(Ok(decoded)) => decoded,
            };

            let frame = match decoded {
                Ok(frame) => frame,
                Err(rejection) => {
                    tracing::warn!("Rejecting frame tag {}: {}", rejection.tag, rejection.reason);
                    self.reply_later(rejection.reply());
                    continue;
                }
            };

            let len = frame.wire_len();
            SessionStats::add(&self.stats.bytes_down, len as u64);
            self.route(generation, frame).await;
            self.options.download_limiter.acquire(len).await;
        };

        {
            let mut guard = self.writer.lock().await;
            if matches!(guard.as_ref(), Some((current, _)) if *current == generation) {
                *guard = None;
            }
        }
        self.mark_down(generation, reason);
    }

    async fn route(self: &Arc<Self>, generation: u64, frame: TransportFrame) {
        let queue = match &frame {
            TransportFrame::Ack { .. } => &self.acks_tx,
            TransportFrame::Error { code, seq, .. } if seq.is_some() && !code.is_sender_side() => &self.acks_tx,
            TransportFrame::Error { code, path, .. } if code.is_sender_side() || path.is_some() => {
                &self.downstream_tx
            }
            TransportFrame::Error { code, message, .. } => {
                tracing::warn!("Agent reported {:?}: {}", code, message);
                return;
            }
            TransportFrame::ChangeNotify { .. }
            | TransportFrame::DataBegin { .. }
            | TransportFrame::DataChunk { .. }
            | TransportFrame::DataEnd { .. } => &self.downstream_tx,
            TransportFrame::IndexEntry { .. } | TransportFrame::IndexEnd { .. } => &self.index_tx,
            TransportFrame::Init { .. } | TransportFrame::Request { .. } => {
                tracing::warn!("Unexpected {:?} frame from agent", frame.frame_type());
                self.reply_later(TransportFrame::error(
                    ErrorCode::Unexpected,
                    format!("{:?} is not valid here", frame.frame_type()),
                ));
                return;
            }
        };

        // A closed queue means the owning worker has stopped.
        let _ = queue.send(Routed { generation, frame }).await;
    }

    /// Send a reply without making the reader wait for the writer.
    fn reply_later(self: &Arc<Self>, frame: TransportFrame) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let _ = bridge.send(frame).await;
        });
    }
}

#[async_trait]
impl FrameSink for RemoteBridge {
    async fn send_frame(&self, frame: TransportFrame) -> Result<()> {
        self.send(frame).await
    }
}
