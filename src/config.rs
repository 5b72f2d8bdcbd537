//! Session configuration.
//!
//! A [`SyncConfig`] describes one synced path pair. It is built once (from a
//! TOML file, CLI flags or code), validated with [`SyncConfig::validate`] and
//! then shared read-only as `Arc<SyncConfig>`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::conflict::ConflictAuthority;
use crate::sync::exclude::{ExcludePatterns, ExclusionFilter};
use crate::sync::throttle::BandwidthLimit;
use crate::transport::frame::MAX_PAYLOAD;

pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_INFLIGHT_WINDOW: usize = 8;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: usize = 5;
pub const DEFAULT_RECONNECT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Room left in a frame for the chunk header.
const CHUNK_HEADER_ROOM: usize = 64;

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_inflight_window() -> usize {
    DEFAULT_INFLIGHT_WINDOW
}

fn default_max_reconnect_attempts() -> usize {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_window_secs() -> u64 {
    DEFAULT_RECONNECT_WINDOW_SECS
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_agent_command() -> Vec<String> {
    vec!["podsync".to_string(), "agent".to_string(), "--root".to_string()]
}

/// Configuration of one sync session.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Local directory to sync.
    pub local_root: PathBuf,
    /// Absolute destination directory inside the container.
    pub remote_path: String,

    /// Hidden from both directions.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Never uploaded.
    #[serde(default)]
    pub upload_exclude: Vec<String>,
    /// Never downloaded.
    #[serde(default)]
    pub download_exclude: Vec<String>,

    /// Upload rate in bytes per second.
    #[serde(default)]
    pub upload_limit: Option<u64>,
    /// Download rate in bytes per second.
    #[serde(default)]
    pub download_limit: Option<u64>,
    /// Upload rate in KiB per second; alternative to `upload_limit`.
    #[serde(default)]
    pub upload_limit_kib: Option<u64>,
    /// Download rate in KiB per second; alternative to `download_limit`.
    #[serde(default)]
    pub download_limit_kib: Option<u64>,

    /// Conflict authority for the initial sync; newest-wins when absent.
    #[serde(default)]
    pub conflict: Option<ConflictAuthority>,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Unacknowledged uploads allowed at once.
    #[serde(default = "default_inflight_window")]
    pub inflight_window: usize,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: usize,
    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Command that starts the agent in the container; the remote path is
    /// appended as the last argument.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
}

impl SyncConfig {
    /// Configuration with every optional setting at its default.
    pub fn new(local_root: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_path: remote_path.into(),
            exclude: Vec::new(),
            upload_exclude: Vec::new(),
            download_exclude: Vec::new(),
            upload_limit: None,
            download_limit: None,
            upload_limit_kib: None,
            download_limit_kib: None,
            conflict: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            inflight_window: DEFAULT_INFLIGHT_WINDOW,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_window_secs: DEFAULT_RECONNECT_WINDOW_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            agent_command: default_agent_command(),
        }
    }

    /// Check every setting once; the session assumes a validated config.
    pub fn validate(&self) -> Result<()> {
        if self.local_root.as_os_str().is_empty() {
            return Err(SyncError::Config("local root is empty".to_string()));
        }
        if !self.local_root.is_dir() {
            return Err(SyncError::LocalRootUnavailable {
                path: self.local_root.clone(),
                reason: "not an existing directory".to_string(),
            });
        }
        if !self.remote_path.starts_with('/') {
            return Err(SyncError::Config(format!(
                "remote path {:?} must be absolute",
                self.remote_path
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD - CHUNK_HEADER_ROOM {
            return Err(SyncError::Config(format!(
                "chunk size {} out of range (1..={})",
                self.chunk_size,
                MAX_PAYLOAD - CHUNK_HEADER_ROOM
            )));
        }
        if self.inflight_window == 0 {
            return Err(SyncError::Config("in-flight window must be at least 1".to_string()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(SyncError::Config("max reconnect attempts must be at least 1".to_string()));
        }
        if self.agent_command.is_empty() {
            return Err(SyncError::Config("agent command is empty".to_string()));
        }
        if self.upload_limit.is_some() && self.upload_limit_kib.is_some() {
            return Err(SyncError::Config(
                "set either upload_limit or upload_limit_kib, not both".to_string(),
            ));
        }
        if self.download_limit.is_some() && self.download_limit_kib.is_some() {
            return Err(SyncError::Config(
                "set either download_limit or download_limit_kib, not both".to_string(),
            ));
        }

        self.exclusion_filter().map(|_| ())
    }

    /// Compile the three exclude sets.
    pub fn exclusion_filter(&self) -> Result<ExclusionFilter> {
        Ok(ExclusionFilter::new(
            ExcludePatterns::from_patterns(&self.exclude)?,
            ExcludePatterns::from_patterns(&self.upload_exclude)?,
            ExcludePatterns::from_patterns(&self.download_exclude)?,
        ))
    }

    pub fn upload_limit(&self) -> BandwidthLimit {
        limit(self.upload_limit, self.upload_limit_kib)
    }

    pub fn download_limit(&self) -> BandwidthLimit {
        limit(self.download_limit, self.download_limit_kib)
    }

    pub fn authority(&self) -> ConflictAuthority {
        self.conflict.unwrap_or_default()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Full agent argv for this session's remote path.
    pub fn agent_argv(&self) -> Vec<String> {
        let mut argv = self.agent_command.clone();
        argv.push(self.remote_path.clone());
        argv
    }
}

fn limit(bytes: Option<u64>, kib: Option<u64>) -> BandwidthLimit {
    match (bytes, kib) {
        (Some(bytes), _) => BandwidthLimit::new(bytes),
        (None, Some(kib)) => BandwidthLimit::from_kib(kib),
        (None, None) => BandwidthLimit::unlimited(),
    }
}

/// Which workload the sessions attach to.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub namespace: String,
    /// Label selector, e.g. `app=web`.
    pub selector: String,
    /// Container name; the pod's first container when absent.
    #[serde(default)]
    pub container: Option<String>,
    /// Seconds to wait for a running pod.
    #[serde(default = "default_pod_wait_secs")]
    pub pod_wait_secs: u64,
    /// Copy the local binary into this container directory before starting.
    #[serde(default)]
    pub install_agent_dir: Option<String>,
}

fn default_pod_wait_secs() -> u64 {
    120
}

/// Contents of a `podsync.toml` file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub sync: Vec<SyncConfig>,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::file(path, e))?;
        Self::parse(&content)
    }
}
