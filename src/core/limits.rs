/*!
 * System Limits and Constants
 *
 * Centralized location for engine-wide limits and thresholds.
 */

use std::time::Duration;

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Grace window before an idle wait queue is destroyed (10s)
/// A re-contention inside the window reuses the object
pub const CLEANUP_GRACE: Duration = Duration::from_secs(10);

/// Pre-zeroed wait queue states kept for reuse
pub const DEFAULT_SPARE_POOL: usize = 64;

// =============================================================================
// THREADS
// =============================================================================

/// Maximum threads per task, bounds broadcast generation differences
pub const DEFAULT_MAX_THREADS: u32 = 8192;

// =============================================================================
// TRACING
// =============================================================================

/// Entry points slower than this are logged as slow (10ms)
/// Parked time counts, so contended waits routinely exceed it
pub const SLOW_ENTRY_THRESHOLD: Duration = Duration::from_millis(10);
