//! Remote agent.
//!
//! `podsync agent --root <path>` runs inside the container and speaks the
//! framed protocol on stdin/stdout. It answers the handshake, streams its
//! index, applies what the client uploads and deletes, reports its own
//! filesystem changes and serves files the client requests.
//!
//! Replies generated by the reader (acks, rejections) travel on an unbounded
//! control queue that the writer drains first, so the reader never waits on
//! the writer. Bulk output (index, notifications, served files) shares one
//! bounded queue and keeps its order.

use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{Result, SyncError};
use crate::sync::exclude::{ExcludePatterns, ExclusionFilter};
use crate::sync::index::{is_safe_relative, scan_tree, FileEntry};
use crate::sync::transfer::{create_dir, remove_path, send_file, ReceiveOutcome, TransferReceiver};
use crate::sync::watcher::{ChangeKind, LocalWatcher, Origin, WatchMessage, DEFAULT_DEBOUNCE};
use crate::transport::frame::{ErrorCode, FrameCodec, TransportFrame, PROTOCOL_VERSION};

const DATA_QUEUE: usize = 64;

/// Serve one client over stdin/stdout until it closes the stream.
pub async fn run_stdio(root: PathBuf) -> Result<()> {
    serve(tokio::io::stdin(), tokio::io::stdout(), root, CancellationToken::new()).await
}

/// Serve one client on `reader`/`writer` with `root` as the sync root.
pub async fn serve<R, W>(reader: R, writer: W, root: PathBuf, cancel: CancellationToken) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = FramedRead::new(reader, FrameCodec);
    let mut writer = FramedWrite::new(writer, FrameCodec);

    let first = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        first = reader.next() => first,
    };
    let (resume_seq, excludes) = match first {
        None => return Ok(()),
        Some(Err(e)) => return Err(e),
        Some(Ok(Ok(TransportFrame::Init {
            protocol_version,
            resume_seq,
            excludes,
        }))) => {
            if protocol_version != PROTOCOL_VERSION {
                let err = SyncError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: protocol_version,
                };
                writer
                    .send(TransportFrame::error(ErrorCode::VersionMismatch, err.to_string()))
                    .await?;
                return Err(err);
            }
            (resume_seq, excludes)
        }
        Some(Ok(Ok(other))) => {
            let message = format!("expected Init, got {:?}", other.frame_type());
            writer.send(TransportFrame::error(ErrorCode::Unexpected, message.clone())).await?;
            return Err(SyncError::Protocol(message));
        }
        Some(Ok(Err(rejection))) => {
            writer.send(rejection.reply()).await?;
            return Err(SyncError::Protocol(rejection.reason));
        }
    };

    let patterns = match ExcludePatterns::from_patterns(&excludes) {
        Ok(patterns) => patterns,
        Err(e) => {
            writer.send(TransportFrame::error(ErrorCode::Malformed, e.to_string())).await?;
            return Err(e);
        }
    };
    let root = match prepare_root(&root).await {
        Ok(root) => root,
        Err(e) => {
            writer.send(TransportFrame::error(ErrorCode::Other(0), e.to_string())).await?;
            return Err(e);
        }
    };

    writer
        .send(TransportFrame::Init {
            protocol_version: PROTOCOL_VERSION,
            resume_seq,
            excludes: Vec::new(),
        })
        .await?;
    tracing::info!("Agent serving {} (resume {:?})", root.display(), resume_seq);

    let workers = cancel.child_token();
    let filter = Arc::new(ExclusionFilter::general_only(patterns));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    let writer_task = tokio::spawn(write_loop(writer, control_rx, data_rx));

    let (watcher, changes) = LocalWatcher::start(&root, filter.clone(), DEFAULT_DEBOUNCE, Origin::Remote, workers.clone())?;
    let notifier = tokio::spawn(announce(
        root.clone(),
        filter,
        changes,
        data_tx.clone(),
        workers.clone(),
    ));
    let server = tokio::spawn(serve_requests(
        root.clone(),
        request_rx,
        data_tx,
        control_tx.clone(),
        resume_seq[1] + 1,
        workers.clone(),
    ));

    let mut receiver = TransferReceiver::new(root.clone());
    let result = loop {
        let next = tokio::select! {
            _ = workers.cancelled() => break Ok(()),
            next = reader.next() => next,
        };
        let frame = match next {
            None => break Ok(()),
            Some(Err(e)) => break Err(e),
            Some(Ok(Err(rejection))) => {
                tracing::warn!("Rejecting frame tag {}: {}", rejection.tag, rejection.reason);
                let _ = control_tx.send(rejection.reply());
                continue;
            }
            Some(Ok(Ok(frame))) => frame,
        };

        match frame {
            frame @ (TransportFrame::DataBegin { .. }
            | TransportFrame::DataChunk { .. }
            | TransportFrame::DataEnd { .. }) => {
                let outcome = receiver.receive(frame).await;
                if let Some(reply) = outcome.reply() {
                    let _ = control_tx.send(reply);
                }
                match outcome {
                    ReceiveOutcome::Applied { seq, entry } => {
                        tracing::debug!("Applied {} (seq {}, {} bytes)", entry.path, seq, entry.size)
                    }
                    ReceiveOutcome::Failed { seq, error, .. } => {
                        tracing::warn!("Rejected upload seq {}: {}", seq, error)
                    }
                    ReceiveOutcome::Progress => {}
                }
            }
            TransportFrame::ChangeNotify {
                path,
                kind: ChangeKind::Deleted,
                ..
            } => match remove_path(&root, &path).await {
                Ok(removed) => tracing::debug!("Delete of {} (present: {})", path, removed),
                Err(e) => tracing::warn!("Could not delete {}: {}", path, e),
            },
            TransportFrame::ChangeNotify {
                path,
                entry: Some(FileEntry { is_dir: true, .. }),
                ..
            } => {
                if let Err(e) = create_dir(&root, &path).await {
                    tracing::warn!("Could not create {}: {}", path, e);
                }
            }
            TransportFrame::ChangeNotify { path, kind, .. } => {
                tracing::trace!("Ignoring {:?} notification for {}", kind, path);
            }
            TransportFrame::Request { path } => {
                if is_safe_relative(&path) {
                    let _ = request_tx.send(path);
                } else {
                    let _ = control_tx.send(TransportFrame::Error {
                        code: ErrorCode::InvalidPath,
                        seq: None,
                        path: Some(path),
                        message: "path escapes the sync root".to_string(),
                    });
                }
            }
            TransportFrame::Error {
                code: ErrorCode::ReadFailed,
                seq: Some(seq),
                ..
            } => {
                if let Some(path) = receiver.abort(seq) {
                    tracing::debug!("Client abandoned upload of {}", path);
                }
            }
            TransportFrame::Error { code, seq, message, .. } => {
                tracing::debug!("Client reported {:?} (seq {:?}): {}", code, seq, message);
            }
            TransportFrame::Ack { seq } => tracing::trace!("Client applied seq {}", seq),
            other => {
                let _ = control_tx.send(TransportFrame::error(
                    ErrorCode::Unexpected,
                    format!("{:?} is not valid here", other.frame_type()),
                ));
            }
        }
    };

    let discarded = receiver.abort_all();
    workers.cancel();
    drop(watcher);
    drop(control_tx);
    let _ = notifier.await;
    let _ = server.await;
    match writer_task.await {
        Ok(Err(e)) => tracing::debug!("Agent writer stopped: {}", e),
        Err(e) => tracing::warn!("Agent writer failed: {}", e),
        Ok(Ok(())) => {}
    }
    tracing::info!("Agent stopped ({} partial uploads discarded)", discarded);
    result
}

async fn prepare_root(root: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| SyncError::file(root, e))?;
    tokio::fs::canonicalize(root)
        .await
        .map_err(|e| SyncError::file(root, e))
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec>,
    mut control: mpsc::UnboundedReceiver<TransportFrame>,
    mut data: mpsc::Receiver<TransportFrame>,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control.recv() => frame,
            Some(frame) = data.recv() => frame,
            else => break,
        };
        writer.send(frame).await?;
    }
    writer.close().await
}

/// Stream the index, then report every change the watcher sees.
async fn announce(
    root: PathBuf,
    filter: Arc<ExclusionFilter>,
    mut changes: mpsc::Receiver<WatchMessage>,
    data: mpsc::Sender<TransportFrame>,
    cancel: CancellationToken,
) {
    let scan_root = root.clone();
    let index = match tokio::task::spawn_blocking(move || scan_tree(&scan_root, &filter)).await {
        Ok(Ok(index)) => index,
        Ok(Err(e)) => {
            tracing::error!("Could not scan {}: {}", root.display(), e);
            cancel.cancel();
            return;
        }
        Err(e) => {
            tracing::error!("Index scan failed: {}", e);
            cancel.cancel();
            return;
        }
    };

    let count = index.len() as u64;
    for entry in index.iter() {
        let frame = TransportFrame::IndexEntry { entry: entry.clone() };
        if data.send(frame).await.is_err() {
            return;
        }
    }
    if data.send(TransportFrame::IndexEnd { count }).await.is_err() {
        return;
    }
    tracing::debug!("Sent index of {} entries", count);

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = changes.recv() => message,
        };
        let event = match message {
            Some(WatchMessage::Change(event)) => event,
            Some(WatchMessage::Fatal(e)) => {
                tracing::error!("{}", e);
                cancel.cancel();
                return;
            }
            None => return,
        };

        let entry = match event.kind {
            ChangeKind::Deleted => None,
            _ => match FileEntry::stat(&root, &event.path) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Could not stat {}: {}", event.path, e);
                    continue;
                }
            },
        };
        let kind = if entry.is_none() { ChangeKind::Deleted } else { event.kind };
        let frame = TransportFrame::ChangeNotify {
            path: event.path,
            kind,
            entry,
        };
        if data.send(frame).await.is_err() {
            return;
        }
    }
}

/// Serve requested files one at a time.
async fn serve_requests(
    root: PathBuf,
    mut requests: mpsc::UnboundedReceiver<String>,
    data: mpsc::Sender<TransportFrame>,
    control: mpsc::UnboundedSender<TransportFrame>,
    first_seq: u64,
    cancel: CancellationToken,
) {
    let mut seq = first_seq;
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => return,
            path = requests.recv() => match path {
                Some(path) => path,
                None => return,
            },
        };

        match send_file(&data, &root, &path, seq, DEFAULT_CHUNK_SIZE, &cancel).await {
            Ok(sent) => tracing::debug!("Served {} (seq {}, {} chunks)", path, seq, sent.chunks),
            Err(SyncError::Vanished { .. }) => {
                let _ = control.send(TransportFrame::Error {
                    code: ErrorCode::NotFound,
                    seq: None,
                    path: Some(path),
                    message: "no such file".to_string(),
                });
            }
            Err(SyncError::LinkDown) | Err(SyncError::Cancelled) => return,
            Err(e) => {
                tracing::warn!("Could not serve {}: {}", path, e);
                let _ = control.send(TransportFrame::transfer_error(
                    ErrorCode::ReadFailed,
                    seq,
                    Some(path),
                    e.to_string(),
                ));
            }
        }
        seq += 1;
    }
}
