//! Default tuning values.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// First retry waits this long after a failed send.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 5_000;

/// Each further retry multiplies the wait by this factor.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Transient failures tolerated before a change is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Periodic drain interval while online with pending changes.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;

/// Sync events retained in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Largest accepted `history_capacity`.
pub const MAX_HISTORY_CAPACITY: usize = 10_000;

/// Connectivity must stay restored this long before a drain is triggered.
pub const DEFAULT_CONNECTIVITY_DEBOUNCE_MS: u64 = 1_500;

/// Storage key for the persisted change log.
pub const DEFAULT_STORAGE_KEY: &str = "pending_changes";

/// Buffered history events per lagging subscriber.
pub const HISTORY_BROADCAST_CAPACITY: usize = 256;

/// Upper bound on a single backoff wait, whatever the attempt count.
pub const MAX_BACKOFF_MS: u64 = 60 * 60 * 1_000;

/// Cancelled creates remembered in case their send was already in flight.
pub const CANCELLED_CREATE_MEMORY: usize = 256;
