// Library module for podsync
// Re-exports modules for use in integration tests and the binary

pub mod agent;
pub mod config;
pub mod error;
pub mod k8s;
pub mod sync;
pub mod transport;

pub use config::{ConfigFile, SyncConfig, TargetConfig};
pub use error::{Result, SyncError};
