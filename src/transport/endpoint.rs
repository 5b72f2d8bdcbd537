//! Execution endpoint contract.
//!
//! An endpoint knows how to start the remote agent inside the target and hand
//! back its stdin/stdout as a duplex byte stream. Each [`ExecEndpoint::connect`]
//! starts a fresh agent process; the bridge calls it again on reconnect.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// The two halves of a connection to a remote agent.
pub struct ExecStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ExecStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ExecEndpoint: Send + Sync {
    /// Start the agent and return its stream.
    ///
    /// Errors classified as fatal (e.g. [`SyncError::EndpointUnavailable`])
    /// end the session; anything else is retried within the reconnect budget.
    ///
    /// [`SyncError::EndpointUnavailable`]: crate::error::SyncError::EndpointUnavailable
    async fn connect(&self) -> Result<ExecStream>;

    /// Human-readable target, e.g. `pod dev/web-6f7c9 (container app)`.
    fn target(&self) -> String;
}
