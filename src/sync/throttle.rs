//! Bandwidth throttling for sync transfers.
//!
//! Provides rate limiting using a token bucket algorithm. One limiter guards
//! one direction of the bridge; a limiter with no rate is a no-op.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Size of one token. Rates are rounded up to whole cells.
const CELL_BYTES: u64 = 1024;

/// Default burst cap: one default transfer chunk.
pub const DEFAULT_BURST_BYTES: u64 = 64 * 1024;

/// Bandwidth limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    /// Bytes per second limit.
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    /// Create a new bandwidth limit.
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    /// No limit.
    pub fn unlimited() -> Self {
        Self { bytes_per_second: 0 }
    }

    /// Limit expressed in KiB/s, the unit sync path configs use.
    pub fn from_kib(kib_per_second: u64) -> Self {
        Self::new(kib_per_second.saturating_mul(1024))
    }

    /// Check if there's a limit.
    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }

    /// Format as human-readable string.
    pub fn display(&self) -> String {
        if !self.is_limited() {
            return "unlimited".to_string();
        }

        let bps = self.bytes_per_second;
        if bps >= 1_000_000_000 {
            format!("{:.1} GB/s", bps as f64 / 1_000_000_000.0)
        } else if bps >= 1_000_000 {
            format!("{:.1} MB/s", bps as f64 / 1_000_000.0)
        } else if bps >= 1_000 {
            format!("{:.1} KB/s", bps as f64 / 1_000.0)
        } else {
            format!("{} B/s", bps)
        }
    }
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl From<Option<u64>> for BandwidthLimit {
    fn from(rate: Option<u64>) -> Self {
        rate.map(Self::new).unwrap_or_default()
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Bandwidth limiter using token bucket algorithm.
///
/// Cloning shares the bucket, which is how one limit is applied across
/// several sessions.
#[derive(Clone)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    limit: BandwidthLimit,
    burst_cells: u32,
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("limit", &self.limit.display())
            .field("burst_cells", &self.burst_cells)
            .finish()
    }
}

impl BandwidthLimiter {
    /// Create a new bandwidth limiter with the default burst.
    pub fn new(limit: BandwidthLimit) -> Self {
        Self::with_burst(limit, DEFAULT_BURST_BYTES)
    }

    /// Create a limiter whose bucket holds at most `burst_bytes` (and never
    /// more than one second of rate).
    pub fn with_burst(limit: BandwidthLimit, burst_bytes: u64) -> Self {
        if !limit.is_limited() {
            return Self::unlimited();
        }

        let cells_per_second = cells_for(limit.bytes_per_second);
        let burst = cells_for(burst_bytes.max(1)).min(cells_per_second);

        let rate = NonZeroU32::new(cells_per_second).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            limiter: Some(Arc::new(RateLimiter::direct(quota))),
            limit,
            burst_cells: burst.get(),
        }
    }

    /// Create an unlimited limiter.
    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            limit: BandwidthLimit::unlimited(),
            burst_cells: 0,
        }
    }

    /// Get the current limit.
    pub fn limit(&self) -> BandwidthLimit {
        self.limit
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Wait for permission to transfer `bytes` bytes.
    /// This is a no-op if no limit is set.
    pub async fn acquire(&self, bytes: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let mut remaining = cells_for(bytes as u64).max(1);
        while remaining > 0 {
            let step = remaining.min(self.burst_cells);
            if let Some(n) = NonZeroU32::new(step) {
                // `step` never exceeds the burst, so capacity errors cannot occur.
                if limiter.until_n_ready(n).await.is_err() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
            }
            remaining -= step;
        }
    }

    /// Check if we can transfer `bytes` bytes without waiting.
    pub fn try_acquire(&self, bytes: usize) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };

        let cells = cells_for(bytes as u64).max(1);
        match NonZeroU32::new(cells.min(self.burst_cells)) {
            Some(n) => matches!(limiter.check_n(n), Ok(Ok(()))),
            None => true,
        }
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

fn cells_for(bytes: u64) -> u32 {
    bytes.div_ceil(CELL_BYTES).min(u32::MAX as u64) as u32
}
