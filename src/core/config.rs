/*!
 * Engine Configuration
 *
 * Runtime configuration for reclamation and resource bounds
 */

use super::limits::{CLEANUP_GRACE, DEFAULT_MAX_THREADS, DEFAULT_SPARE_POOL};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the deferred free list gets swept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaperMode {
    /// Background thread re-armed whenever idle queues are parked on the free list
    Background,
    /// Caller drives sweeps via `Registry::sweep_now`
    Manual,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsynchConfig {
    /// Age an idle queue must reach on the free list before destruction
    pub cleanup_grace: Duration,
    /// Sweep driver
    pub reaper: ReaperMode,
    /// Free idle mutex and condvar queues immediately instead of deferring
    pub eager_reclaim: bool,
    /// Upper bound on waiters a single broadcast may claim
    pub max_threads: u32,
    /// Capacity of the spare wait-queue pool
    pub spare_pool: usize,
}

impl Default for PsynchConfig {
    fn default() -> Self {
        Self {
            cleanup_grace: CLEANUP_GRACE,
            reaper: ReaperMode::Background,
            eager_reclaim: false,
            max_threads: DEFAULT_MAX_THREADS,
            spare_pool: DEFAULT_SPARE_POOL,
        }
    }
}

impl PsynchConfig {
    /// Deterministic configuration: no background thread, sweeps are explicit
    pub fn manual() -> Self {
        Self {
            reaper: ReaperMode::Manual,
            ..Self::default()
        }
    }

    /// Reclaim mutex and condvar queues as soon as they idle
    pub fn eager() -> Self {
        Self {
            eager_reclaim: true,
            ..Self::default()
        }
    }

    /// Load overrides from the environment
    ///
    /// - PSYNCH_CLEANUP_GRACE_SECS: grace window in seconds
    /// - PSYNCH_MAX_THREADS: broadcast bound
    /// - PSYNCH_EAGER_RECLAIM: "1" or "true" to free immediately
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("PSYNCH_CLEANUP_GRACE_SECS") {
            config.cleanup_grace = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<u32>("PSYNCH_MAX_THREADS") {
            config.max_threads = max;
        }
        if let Ok(v) = std::env::var("PSYNCH_EAGER_RECLAIM") {
            config.eager_reclaim = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    pub fn with_max_threads(mut self, max_threads: u32) -> Self {
        self.max_threads = max_threads;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PsynchConfig::default();
        assert_eq!(config.cleanup_grace, Duration::from_secs(10));
        assert_eq!(config.reaper, ReaperMode::Background);
        assert!(!config.eager_reclaim);
    }

    #[test]
    fn test_manual_keeps_other_defaults() {
        let config = PsynchConfig::manual().with_max_threads(4);
        assert_eq!(config.reaper, ReaperMode::Manual);
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.spare_pool, DEFAULT_SPARE_POOL);
    }
}
