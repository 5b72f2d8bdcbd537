// Shared fixtures: an in-process agent behind a duplex pipe, and helpers to
// run a session against it.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{duplex, AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use podsync::sync::{SessionState, SessionStats, SyncSession};
use podsync::transport::{ExecEndpoint, ExecStream};
use podsync::{Result, SyncConfig, SyncError};

const PIPE_CAPACITY: usize = 256 * 1024;
const WAIT_LIMIT: Duration = Duration::from_secs(15);

/// Endpoint that starts `podsync::agent::serve` on a fresh pipe per connect.
pub struct AgentEndpoint {
    root: PathBuf,
    connects: AtomicUsize,
    /// (connection number, bytes): that connection's upload stream breaks
    /// after the given number of bytes.
    break_upload: Option<(usize, usize)>,
    /// Same for the stream coming back from the agent.
    break_download: Option<(usize, usize)>,
}

impl AgentEndpoint {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            connects: AtomicUsize::new(0),
            break_upload: None,
            break_download: None,
        })
    }

    pub fn breaking(root: &Path, connection: usize, bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            connects: AtomicUsize::new(0),
            break_upload: Some((connection, bytes)),
            break_download: None,
        })
    }

    pub fn breaking_download(root: &Path, connection: usize, bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            connects: AtomicUsize::new(0),
            break_upload: None,
            break_download: Some((connection, bytes)),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecEndpoint for AgentEndpoint {
    async fn connect(&self) -> Result<ExecStream> {
        let number = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (client, agent) = duplex(PIPE_CAPACITY);

        let (agent_read, agent_write) = tokio::io::split(agent);
        let root = self.root.clone();
        tokio::spawn(async move {
            let _ = podsync::agent::serve(agent_read, agent_write, root, CancellationToken::new()).await;
        });

        let allowance = |fault: Option<(usize, usize)>| {
            fault
                .filter(|(connection, _)| *connection == number)
                .map(|(_, bytes)| bytes)
        };
        let (read, write) = tokio::io::split(client);
        Ok(ExecStream::new(
            BreakingReader {
                inner: read,
                remaining: allowance(self.break_download),
            },
            BreakingWriter {
                inner: write,
                remaining: allowance(self.break_upload),
            },
        ))
    }

    fn target(&self) -> String {
        format!("in-process/{}", self.root.display())
    }
}

/// Endpoint that can never be reached.
pub struct DeadEndpoint;

#[async_trait]
impl ExecEndpoint for DeadEndpoint {
    async fn connect(&self) -> Result<ExecStream> {
        Err(SyncError::Transport("connection refused".to_string()))
    }

    fn target(&self) -> String {
        "nowhere".to_string()
    }
}

/// Endpoint whose connect never finishes, like a pod that never starts.
pub struct HangingEndpoint;

#[async_trait]
impl ExecEndpoint for HangingEndpoint {
    async fn connect(&self) -> Result<ExecStream> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(SyncError::EndpointUnavailable("no running pod".to_string()))
    }

    fn target(&self) -> String {
        "pending".to_string()
    }
}

/// Reader that fails with a reset once its byte allowance is used up.
struct BreakingReader<R> {
    inner: R,
    remaining: Option<usize>,
}

impl<R: AsyncRead + Unpin> AsyncRead for BreakingReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let Some(remaining) = self.remaining else {
            return Pin::new(&mut self.inner).poll_read(cx, buf);
        };
        if remaining == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected failure")));
        }

        let mut scratch = vec![0u8; buf.remaining().min(remaining)];
        let mut limited = ReadBuf::new(&mut scratch);
        let result = Pin::new(&mut self.inner).poll_read(cx, &mut limited);
        if let Poll::Ready(Ok(())) = &result {
            let read = limited.filled().len();
            buf.put_slice(limited.filled());
            self.remaining = Some(remaining - read);
        }
        result
    }
}

/// Writer that fails with a broken pipe once its byte allowance is used up.
struct BreakingWriter<W> {
    inner: W,
    remaining: Option<usize>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BreakingWriter<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let allowed = match self.remaining {
            Some(0) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected failure"))),
            Some(remaining) => buf.len().min(remaining),
            None => buf.len(),
        };
        let result = Pin::new(&mut self.inner).poll_write(cx, &buf[..allowed]);
        if let Poll::Ready(Ok(written)) = &result {
            let written = *written;
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= written;
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct Roots {
    pub local: TempDir,
    pub remote: TempDir,
}

impl Roots {
    pub fn new() -> Self {
        Self {
            local: TempDir::new().unwrap(),
            remote: TempDir::new().unwrap(),
        }
    }

    pub fn config(&self) -> SyncConfig {
        SyncConfig::new(self.local.path(), "/data")
    }
}

pub struct Running {
    pub state: watch::Receiver<SessionState>,
    pub stats: Arc<SessionStats>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<()>>,
}

impl Running {
    pub fn start(config: SyncConfig, endpoint: Arc<dyn ExecEndpoint>) -> Self {
        let session = SyncSession::new(Arc::new(config), endpoint);
        Self {
            state: session.state(),
            stats: session.stats(),
            cancel: session.cancel_token(),
            handle: tokio::spawn(session.run()),
        }
    }

    pub async fn wait_streaming(&mut self) {
        tokio::time::timeout(WAIT_LIMIT, self.state.wait_for(|s| *s == SessionState::Streaming))
            .await
            .expect("session did not reach Streaming in time")
            .expect("session ended before Streaming");
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(WAIT_LIMIT, self.handle)
            .await
            .expect("session did not stop in time")
            .unwrap();
        result.unwrap();
        assert_eq!(*self.state.borrow(), SessionState::Terminated);
    }
}

/// Poll `check` until it holds; panics after the wait limit.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn read(root: &Path, rel: &str) -> Option<Vec<u8>> {
    std::fs::read(root.join(rel)).ok()
}

pub fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

/// Every staging file left below `root`.
pub fn temp_files(root: &Path) -> Vec<PathBuf> {
    jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".podsync-"))
        .map(|entry| entry.path())
        .collect()
}

pub fn patterned(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}
