//! Client timing constants.

use std::time::Duration;

/// Upper bound on a connectivity check. A ping that has not answered by
/// then counts as offline.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `dispose` waits for the worker to acknowledge shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Buffered drain reports for `sync_now` waiters.
pub const REPORT_BROADCAST_CAPACITY: usize = 16;
