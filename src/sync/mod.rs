//! Bidirectional sync engine.
//!
//! Local changes flow through the [`upstream`] pipeline to the remote agent,
//! remote changes come back through [`downstream`]. A [`session::SyncSession`]
//! owns both and drives the connection.

pub mod conflict;
pub mod downstream;
pub mod exclude;
pub mod hash;
pub mod index;
pub mod registry;
pub mod session;
pub mod stats;
pub mod throttle;
pub mod transfer;
pub mod upstream;
pub mod watcher;

pub use conflict::{reconcile, Conflict, ConflictAuthority, ReconcilePlan, Resolution};
pub use exclude::{ExcludePatterns, ExclusionFilter};
pub use index::{FileEntry, FileIndex};
pub use registry::{SessionGuard, SessionRegistry};
pub use session::{SessionState, SyncSession};
pub use stats::{SessionStats, StatsSnapshot};
pub use throttle::{BandwidthLimit, BandwidthLimiter};
pub use watcher::{ChangeEvent, ChangeKind, LocalWatcher, Origin};
