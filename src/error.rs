//! Error types for the sync engine.
//!
//! Every failure inside the engine is a [`SyncError`]. The controller uses
//! [`SyncError::class`] to decide whether to skip a path, reconnect, reply with
//! an `Error` frame, or tear the session down.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// How the session reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log it, skip the offending path, keep going.
    PerFile,
    /// Stream is gone: enter `Reconnecting`, keep queues.
    Transport,
    /// Peer sent something malformed: reply with `Error`, drop that transfer.
    Protocol,
    /// Session cannot continue.
    Fatal,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error on {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} vanished before it could be read")]
    Vanished { path: String },

    #[error("checksum mismatch for {path} (seq {seq})")]
    ChecksumMismatch { path: String, seq: u64 },

    #[error("transfer {seq} for {path} is incomplete: {reason}")]
    IncompleteTransfer { path: String, seq: u64, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport I/O error: {0}")]
    TransportIo(#[from] io::Error),

    #[error("link is down")]
    LinkDown,

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("agent rejected the handshake: {0}")]
    HandshakeRejected(String),

    #[error("execution endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("local root {path} is no longer watchable: {reason}")]
    LocalRootUnavailable { path: PathBuf, reason: String },

    #[error("reconnect budget exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: usize, last_error: String },

    #[error("invalid exclude pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a session is already attached for {0}")]
    SessionAlreadyAttached(String),
}

impl SyncError {
    /// Wrap an `io::Error` raised while touching `path`.
    pub fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::File {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::File { .. }
            | SyncError::Vanished { .. }
            | SyncError::ChecksumMismatch { .. }
            | SyncError::IncompleteTransfer { .. } => ErrorClass::PerFile,
            SyncError::Transport(_)
            | SyncError::TransportIo(_)
            | SyncError::LinkDown
            | SyncError::Cancelled => ErrorClass::Transport,
            SyncError::Protocol(_) | SyncError::UnknownFrame(_) => ErrorClass::Protocol,
            SyncError::VersionMismatch { .. }
            | SyncError::HandshakeRejected(_)
            | SyncError::EndpointUnavailable(_)
            | SyncError::LocalRootUnavailable { .. }
            | SyncError::ReconnectExhausted { .. }
            | SyncError::InvalidPattern { .. }
            | SyncError::Config(_)
            | SyncError::SessionAlreadyAttached(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = SyncError::file("a.txt", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.class(), ErrorClass::PerFile);

        assert!(SyncError::LinkDown.is_transport());
        assert!(SyncError::TransportIo(io::Error::from(io::ErrorKind::BrokenPipe)).is_transport());
        assert_eq!(SyncError::UnknownFrame(0x42).class(), ErrorClass::Protocol);
        assert!(SyncError::ReconnectExhausted {
            attempts: 5,
            last_error: "refused".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = SyncError::ChecksumMismatch {
            path: "src/main.rs".to_string(),
            seq: 7,
        };
        assert_eq!(err.to_string(), "checksum mismatch for src/main.rs (seq 7)");
        assert_eq!(SyncError::UnknownFrame(0x2a).to_string(), "unknown frame type 0x2a");
    }
}
