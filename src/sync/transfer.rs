//! Chunked file transfers.
//!
//! Both directions move file content the same way: `DataBegin`, a run of
//! `DataChunk` frames and a closing `DataEnd` carrying the chunk count and a
//! BLAKE3 digest. [`send_file`] produces that sequence from a file on disk;
//! [`TransferReceiver`] consumes it, staging the bytes in a temporary file next
//! to the destination and renaming it into place only after verification.

use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::sync::exclude::{is_temp_file, TEMP_PREFIX};
use crate::sync::hash::{to_hex, Checksum, TransferHasher};
use crate::sync::index::{is_safe_relative, join_relative, FileEntry};
use crate::transport::frame::{ErrorCode, TransportFrame};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Anything outbound frames can be written to.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: TransportFrame) -> Result<()>;
}

#[async_trait]
impl FrameSink for mpsc::Sender<TransportFrame> {
    async fn send_frame(&self, frame: TransportFrame) -> Result<()> {
        self.send(frame).await.map_err(|_| SyncError::LinkDown)
    }
}

/// What went out for one completed [`send_file`].
#[derive(Debug, Clone)]
pub struct SentFile {
    /// Entry describing exactly the bytes that were sent.
    pub entry: FileEntry,
    pub checksum: Checksum,
    pub chunks: u32,
}

/// Stream `rel` below `root` as transfer `seq`.
///
/// Never holds more than one chunk in memory. If reading fails after
/// `DataBegin` went out, an `Error{ReadFailed}` is sent so the receiver drops
/// its staging file.
pub async fn send_file(
    sink: &dyn FrameSink,
    root: &Path,
    rel: &str,
    seq: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<SentFile> {
    let full = join_relative(root, rel);
    let mut file = match File::open(&full).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SyncError::Vanished { path: rel.to_string() })
        }
        Err(e) => return Err(SyncError::file(full, e)),
    };
    let metadata = file.metadata().await.map_err(|e| SyncError::file(&full, e))?;
    if metadata.is_dir() {
        return Err(SyncError::file(
            full,
            io::Error::new(io::ErrorKind::Other, "is a directory"),
        ));
    }
    let mut entry = FileEntry::from_metadata(rel, &metadata);

    sink.send_frame(TransportFrame::DataBegin {
        seq,
        path: rel.to_string(),
        total_size: entry.size,
        mod_time: entry.mod_time,
    })
    .await?;

    let mut hasher = TransferHasher::new();
    let mut index = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut buf = BytesMut::with_capacity(chunk_size);
        let read = match read_chunk(&mut file, &mut buf, chunk_size).await {
            Ok(read) => read,
            Err(e) => {
                let _ = sink
                    .send_frame(TransportFrame::transfer_error(
                        ErrorCode::ReadFailed,
                        seq,
                        Some(rel.to_string()),
                        e.to_string(),
                    ))
                    .await;
                return Err(SyncError::file(full, e));
            }
        };
        if read == 0 {
            break;
        }

        hasher.update(&buf);
        sink.send_frame(TransportFrame::DataChunk {
            seq,
            index,
            data: buf.freeze(),
        })
        .await?;
        index += 1;
    }

    // The file may have changed size while it was read.
    entry.size = hasher.bytes();
    let checksum = hasher.finalize();
    sink.send_frame(TransportFrame::DataEnd {
        seq,
        chunk_count: index,
        checksum,
    })
    .await?;

    tracing::debug!(
        "Sent {} as seq {} ({} bytes, {} chunks, {})",
        rel,
        seq,
        entry.size,
        index,
        to_hex(&checksum)
    );

    Ok(SentFile {
        entry,
        checksum,
        chunks: index,
    })
}

/// Fill `buf` with up to `limit` bytes; returns how many were read.
async fn read_chunk(file: &mut File, buf: &mut BytesMut, limit: usize) -> io::Result<usize> {
    while buf.len() < limit {
        let want = (limit - buf.len()) as u64;
        let n = (&mut *file).take(want).read_buf(buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.len())
}

/// One transfer being staged into a temporary file.
///
/// Dropping an unfinished transfer removes its temporary file.
#[derive(Debug)]
pub struct IncomingTransfer {
    seq: u64,
    path: String,
    dest: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    total_size: u64,
    mod_time: i64,
    next_index: u32,
    hasher: TransferHasher,
    done: bool,
}

impl IncomingTransfer {
    pub async fn begin(root: &Path, seq: u64, path: &str, total_size: u64, mod_time: i64) -> Result<Self> {
        if !is_safe_relative(path) || is_temp_file(path) {
            return Err(SyncError::Protocol(format!("refusing transfer to {:?}", path)));
        }

        let dest = join_relative(root, path);
        let parent = dest.parent().unwrap_or(root).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| SyncError::file(&parent, e))?;

        let temp_path = parent.join(format!(
            "{}{}-{}-{}.tmp",
            TEMP_PREFIX,
            std::process::id(),
            seq,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = File::create(&temp_path)
            .await
            .map_err(|e| SyncError::file(&temp_path, e))?;

        Ok(Self {
            seq,
            path: path.to_string(),
            dest,
            temp_path,
            file: Some(file),
            total_size,
            mod_time,
            next_index: 0,
            hasher: TransferHasher::new(),
            done: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    fn incomplete(&self, reason: String) -> SyncError {
        SyncError::IncompleteTransfer {
            path: self.path.clone(),
            seq: self.seq,
            reason,
        }
    }

    pub async fn write_chunk(&mut self, index: u32, data: &[u8]) -> std::result::Result<(), (ErrorCode, SyncError)> {
        if index != self.next_index {
            let reason = format!("chunk {} arrived, expected {}", index, self.next_index);
            return Err((ErrorCode::OutOfOrder, self.incomplete(reason)));
        }
        if self.hasher.bytes() + data.len() as u64 > self.total_size {
            let reason = format!("more than the announced {} bytes", self.total_size);
            return Err((ErrorCode::SizeMismatch, self.incomplete(reason)));
        }

        let Some(file) = self.file.as_mut() else {
            return Err((ErrorCode::Unexpected, self.incomplete("already closed".to_string())));
        };
        if let Err(e) = file.write_all(data).await {
            return Err((ErrorCode::WriteFailed, SyncError::file(&self.temp_path, e)));
        }

        self.hasher.update(data);
        self.next_index += 1;
        Ok(())
    }

    /// Verify and move the staged file into place.
    pub async fn finish(
        mut self,
        chunk_count: u32,
        checksum: Checksum,
    ) -> std::result::Result<FileEntry, (ErrorCode, SyncError)> {
        if chunk_count != self.next_index {
            let reason = format!("announced {} chunks, received {}", chunk_count, self.next_index);
            return Err((ErrorCode::OutOfOrder, self.incomplete(reason)));
        }
        if self.hasher.bytes() != self.total_size {
            let reason = format!("received {} of {} bytes", self.hasher.bytes(), self.total_size);
            return Err((ErrorCode::SizeMismatch, self.incomplete(reason)));
        }
        if self.hasher.finalize() != checksum {
            return Err((
                ErrorCode::ChecksumMismatch,
                SyncError::ChecksumMismatch {
                    path: self.path.clone(),
                    seq: self.seq,
                },
            ));
        }

        let write_failed = |path: &Path, e: io::Error| (ErrorCode::WriteFailed, SyncError::file(path, e));

        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| write_failed(&self.temp_path, e))?;
            let file = file.into_std().await;
            if self.mod_time >= 0 {
                let mtime = UNIX_EPOCH + Duration::from_secs(self.mod_time as u64);
                file.set_modified(mtime)
                    .map_err(|e| write_failed(&self.temp_path, e))?;
            }
        }

        if let Ok(existing) = tokio::fs::symlink_metadata(&self.dest).await {
            if existing.is_dir() {
                tokio::fs::remove_dir_all(&self.dest)
                    .await
                    .map_err(|e| write_failed(&self.dest, e))?;
            }
        }

        tokio::fs::rename(&self.temp_path, &self.dest)
            .await
            .map_err(|e| write_failed(&self.dest, e))?;
        self.done = true;

        let metadata = tokio::fs::symlink_metadata(&self.dest)
            .await
            .map_err(|e| write_failed(&self.dest, e))?;
        Ok(FileEntry::from_metadata(self.path.clone(), &metadata))
    }
}

impl Drop for IncomingTransfer {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Result of feeding one data frame to a [`TransferReceiver`].
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Nothing to report yet.
    Progress,
    Applied {
        seq: u64,
        entry: FileEntry,
    },
    Failed {
        seq: u64,
        path: Option<String>,
        code: ErrorCode,
        error: SyncError,
    },
}

impl ReceiveOutcome {
    /// The frame to send back to the peer, if any.
    pub fn reply(&self) -> Option<TransportFrame> {
        match self {
            Self::Progress => None,
            Self::Applied { seq, .. } => Some(TransportFrame::Ack { seq: *seq }),
            Self::Failed {
                seq,
                path,
                code,
                error,
            } => Some(TransportFrame::transfer_error(*code, *seq, path.clone(), error.to_string())),
        }
    }
}

/// Staging table for every transfer in progress on one connection.
#[derive(Debug)]
pub struct TransferReceiver {
    root: PathBuf,
    active: HashMap<u64, IncomingTransfer>,
    /// Transfers already rejected whose remaining frames are ignored.
    failed: HashSet<u64>,
}

impl TransferReceiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            active: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    pub fn in_progress(&self) -> usize {
        self.active.len()
    }

    /// Feed one `DataBegin`, `DataChunk` or `DataEnd` frame.
    pub async fn receive(&mut self, frame: TransportFrame) -> ReceiveOutcome {
        match frame {
            TransportFrame::DataBegin {
                seq,
                path,
                total_size,
                mod_time,
            } => {
                self.failed.remove(&seq);
                if self.active.remove(&seq).is_some() {
                    tracing::debug!("Transfer {} restarted from the beginning", seq);
                }
                match IncomingTransfer::begin(&self.root, seq, &path, total_size, mod_time).await {
                    Ok(transfer) => {
                        self.active.insert(seq, transfer);
                        ReceiveOutcome::Progress
                    }
                    Err(error) => {
                        let code = match error {
                            SyncError::Protocol(_) => ErrorCode::InvalidPath,
                            _ => ErrorCode::WriteFailed,
                        };
                        self.fail(seq, Some(path), code, error)
                    }
                }
            }
            TransportFrame::DataChunk { seq, index, data } => {
                let Some(transfer) = self.active.get_mut(&seq) else {
                    if self.failed.contains(&seq) {
                        return ReceiveOutcome::Progress;
                    }
                    let error = SyncError::Protocol(format!("chunk for unknown transfer {}", seq));
                    return self.fail(seq, None, ErrorCode::OutOfOrder, error);
                };
                match transfer.write_chunk(index, &data).await {
                    Ok(()) => ReceiveOutcome::Progress,
                    Err((code, error)) => {
                        let path = self.active.remove(&seq).map(|t| t.path.clone());
                        self.fail(seq, path, code, error)
                    }
                }
            }
            TransportFrame::DataEnd {
                seq,
                chunk_count,
                checksum,
            } => {
                let Some(transfer) = self.active.remove(&seq) else {
                    if self.failed.remove(&seq) {
                        return ReceiveOutcome::Progress;
                    }
                    return ReceiveOutcome::Failed {
                        seq,
                        path: None,
                        code: ErrorCode::OutOfOrder,
                        error: SyncError::Protocol(format!("end of unknown transfer {}", seq)),
                    };
                };
                let path = transfer.path.clone();
                match transfer.finish(chunk_count, checksum).await {
                    Ok(entry) => ReceiveOutcome::Applied { seq, entry },
                    Err((code, error)) => ReceiveOutcome::Failed {
                        seq,
                        path: Some(path),
                        code,
                        error,
                    },
                }
            }
            other => ReceiveOutcome::Failed {
                seq: 0,
                path: None,
                code: ErrorCode::Unexpected,
                error: SyncError::Protocol(format!("{:?} is not a data frame", other.frame_type())),
            },
        }
    }

    fn fail(&mut self, seq: u64, path: Option<String>, code: ErrorCode, error: SyncError) -> ReceiveOutcome {
        self.failed.insert(seq);
        ReceiveOutcome::Failed {
            seq,
            path,
            code,
            error,
        }
    }

    /// Drop one transfer, removing its staging file.
    pub fn abort(&mut self, seq: u64) -> Option<String> {
        self.active.remove(&seq).map(|t| t.path.clone())
    }

    /// Drop every transfer in progress; returns how many were discarded.
    pub fn abort_all(&mut self) -> usize {
        let count = self.active.len();
        self.active.clear();
        self.failed.clear();
        count
    }
}

/// Remove `rel` (and its subtree) below `root`. Returns whether anything was
/// there; a path that is already gone is not an error.
pub async fn remove_path(root: &Path, rel: &str) -> Result<bool> {
    if !is_safe_relative(rel) {
        return Err(SyncError::Protocol(format!("refusing to delete {:?}", rel)));
    }
    let full = join_relative(root, rel);
    let metadata = match tokio::fs::symlink_metadata(&full).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(SyncError::file(full, e)),
    };

    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(&full).await
    } else {
        tokio::fs::remove_file(&full).await
    };
    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::file(full, e)),
    }
}

/// Create directory `rel` below `root`, replacing a file in the way.
pub async fn create_dir(root: &Path, rel: &str) -> Result<()> {
    if !is_safe_relative(rel) {
        return Err(SyncError::Protocol(format!("refusing to create {:?}", rel)));
    }
    let full = join_relative(root, rel);
    if let Ok(metadata) = tokio::fs::symlink_metadata(&full).await {
        if metadata.is_dir() {
            return Ok(());
        }
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| SyncError::file(&full, e))?;
    }
    tokio::fs::create_dir_all(&full)
        .await
        .map_err(|e| SyncError::file(full, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::hash::hash_bytes;
    use bytes::Bytes;
    use tempfile::tempdir;

    async fn send_to_vec(root: &Path, rel: &str, seq: u64, chunk: usize) -> (Result<SentFile>, Vec<TransportFrame>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let result = send_file(&tx, root, rel, seq, chunk, &CancellationToken::new()).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        (result, frames)
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(TEMP_PREFIX))
            .collect()
    }

    #[tokio::test]
    async fn test_transfer_applies_content_and_mtime() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/data.bin"), &content).unwrap();
        let file = std::fs::File::options()
            .write(true)
            .open(src.path().join("sub/data.bin"))
            .unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(1_600_000_000)).unwrap();
        drop(file);

        let (sent, frames) = send_to_vec(src.path(), "sub/data.bin", 3, 4096).await;
        let sent = sent.unwrap();
        assert_eq!(sent.chunks, 3);
        assert_eq!(sent.checksum, hash_bytes(&content));
        assert_eq!(frames.len(), 5);

        let mut receiver = TransferReceiver::new(dst.path());
        let mut applied = None;
        for frame in frames {
            if let ReceiveOutcome::Applied { seq, entry } = receiver.receive(frame).await {
                applied = Some((seq, entry));
            }
        }

        let (seq, entry) = applied.expect("transfer should apply");
        assert_eq!(seq, 3);
        assert_eq!(entry.size, 10_000);
        assert_eq!(entry.mod_time, 1_600_000_000);
        assert_eq!(std::fs::read(dst.path().join("sub/data.bin")).unwrap(), content);
        assert!(temp_files(&dst.path().join("sub")).is_empty());
    }

    #[tokio::test]
    async fn test_empty_file() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        std::fs::write(src.path().join("empty"), b"").unwrap();

        let (sent, frames) = send_to_vec(src.path(), "empty", 1, 1024).await;
        assert_eq!(sent.unwrap().chunks, 0);

        let mut receiver = TransferReceiver::new(dst.path());
        let mut last = ReceiveOutcome::Progress;
        for frame in frames {
            last = receiver.receive(frame).await;
        }
        assert!(matches!(last, ReceiveOutcome::Applied { seq: 1, .. }));
        assert_eq!(std::fs::read(dst.path().join("empty")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_is_rejected() {
        let dst = tempdir().unwrap();
        std::fs::write(dst.path().join("f.txt"), b"original").unwrap();
        let mut receiver = TransferReceiver::new(dst.path());

        receiver
            .receive(TransportFrame::DataBegin {
                seq: 9,
                path: "f.txt".to_string(),
                total_size: 6,
                mod_time: 0,
            })
            .await;
        let outcome = receiver
            .receive(TransportFrame::DataChunk {
                seq: 9,
                index: 1,
                data: Bytes::from_static(b"abc"),
            })
            .await;

        assert!(matches!(
            outcome,
            ReceiveOutcome::Failed {
                code: ErrorCode::OutOfOrder,
                ..
            }
        ));
        assert!(matches!(outcome.reply(), Some(TransportFrame::Error { seq: Some(9), .. })));

        // Remaining frames of the rejected transfer are swallowed.
        let end = receiver
            .receive(TransportFrame::DataEnd {
                seq: 9,
                chunk_count: 2,
                checksum: hash_bytes(b"abcdef"),
            })
            .await;
        assert!(matches!(end, ReceiveOutcome::Progress));

        assert_eq!(std::fs::read(dst.path().join("f.txt")).unwrap(), b"original");
        assert!(temp_files(dst.path()).is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_destination() {
        let dst = tempdir().unwrap();
        std::fs::write(dst.path().join("f.txt"), b"original").unwrap();
        let mut receiver = TransferReceiver::new(dst.path());

        receiver
            .receive(TransportFrame::DataBegin {
                seq: 1,
                path: "f.txt".to_string(),
                total_size: 3,
                mod_time: 0,
            })
            .await;
        receiver
            .receive(TransportFrame::DataChunk {
                seq: 1,
                index: 0,
                data: Bytes::from_static(b"new"),
            })
            .await;
        let outcome = receiver
            .receive(TransportFrame::DataEnd {
                seq: 1,
                chunk_count: 1,
                checksum: hash_bytes(b"old"),
            })
            .await;

        assert!(matches!(
            outcome,
            ReceiveOutcome::Failed {
                code: ErrorCode::ChecksumMismatch,
                ..
            }
        ));
        assert_eq!(std::fs::read(dst.path().join("f.txt")).unwrap(), b"original");
        assert!(temp_files(dst.path()).is_empty());
    }

    #[tokio::test]
    async fn test_abort_all_removes_staging_files() {
        let dst = tempdir().unwrap();
        let mut receiver = TransferReceiver::new(dst.path());

        for seq in 1..=3 {
            receiver
                .receive(TransportFrame::DataBegin {
                    seq,
                    path: format!("f{}.txt", seq),
                    total_size: 10,
                    mod_time: 0,
                })
                .await;
        }
        assert_eq!(temp_files(dst.path()).len(), 3);

        assert_eq!(receiver.abort_all(), 3);
        assert!(temp_files(dst.path()).is_empty());
        assert!(!dst.path().join("f1.txt").exists());
    }

    #[tokio::test]
    async fn test_file_replaces_directory() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        std::fs::write(src.path().join("x"), b"file now").unwrap();
        std::fs::create_dir_all(dst.path().join("x/inner")).unwrap();

        let (_, frames) = send_to_vec(src.path(), "x", 1, 1024).await;
        let mut receiver = TransferReceiver::new(dst.path());
        for frame in frames {
            receiver.receive(frame).await;
        }

        assert_eq!(std::fs::read(dst.path().join("x")).unwrap(), b"file now");
    }

    #[tokio::test]
    async fn test_unsafe_path_is_refused() {
        let dst = tempdir().unwrap();
        let mut receiver = TransferReceiver::new(dst.path());
        let outcome = receiver
            .receive(TransportFrame::DataBegin {
                seq: 1,
                path: "../escape".to_string(),
                total_size: 1,
                mod_time: 0,
            })
            .await;
        assert!(matches!(
            outcome,
            ReceiveOutcome::Failed {
                code: ErrorCode::InvalidPath,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_source_has_vanished() {
        let src = tempdir().unwrap();
        let (result, frames) = send_to_vec(src.path(), "nope.txt", 1, 1024).await;
        assert!(matches!(result, Err(SyncError::Vanished { .. })));
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_remove_path_is_idempotent() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), b"c").unwrap();

        assert!(remove_path(dir.path(), "a").await.unwrap());
        assert!(!dir.path().join("a").exists());
        assert!(!remove_path(dir.path(), "a").await.unwrap());
        assert!(remove_path(dir.path(), "..").await.is_err());
    }

    #[tokio::test]
    async fn test_create_dir_replaces_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("d"), b"was a file").unwrap();

        create_dir(dir.path(), "d").await.unwrap();
        create_dir(dir.path(), "d").await.unwrap();
        assert!(dir.path().join("d").is_dir());
    }
}
