/*!
 * Sync Flags
 * Decoding of the flag word passed with every psynch entry
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Clear-prepost call targets a mutex rather than a condvar
pub const FLAG_CLEAR_MUTEX: u32 = 0x08;

pub const PSHARED_SHARED: u32 = 0x10;
pub const PSHARED_PRIVATE: u32 = 0x20;
pub const PSHARED_MASK: u32 = 0x30;

pub const POLICY_FAIRSHARE: u32 = 0x40;
pub const POLICY_FIRSTFIT: u32 = 0x80;
pub const POLICY_MASK: u32 = 0x1c0;

/// Mutex contention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexPolicy {
    /// Grants follow sequence order; unlocks preposted to the next sequence
    FairShare,
    /// The head waiter is poked and re-contends in userspace
    FirstFit,
}

/// Flag word as passed by the userspace library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncFlags(pub u32);

impl SyncFlags {
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Process-shared object; keyed by memory object instead of address
    pub const fn is_shared(self) -> bool {
        self.0 & PSHARED_MASK == PSHARED_SHARED
    }

    /// Anything but an explicit first-fit policy is fair-share
    pub const fn policy(self) -> MutexPolicy {
        if self.0 & POLICY_MASK == POLICY_FIRSTFIT {
            MutexPolicy::FirstFit
        } else {
            MutexPolicy::FairShare
        }
    }

    pub const fn is_first_fit(self) -> bool {
        matches!(self.policy(), MutexPolicy::FirstFit)
    }

    pub const fn clears_mutex(self) -> bool {
        self.0 & FLAG_CLEAR_MUTEX != 0
    }

    pub const fn shared(self) -> Self {
        Self((self.0 & !PSHARED_MASK) | PSHARED_SHARED)
    }

    pub const fn first_fit(self) -> Self {
        Self((self.0 & !POLICY_MASK) | POLICY_FIRSTFIT)
    }

    pub const fn fair_share(self) -> Self {
        Self((self.0 & !POLICY_MASK) | POLICY_FAIRSHARE)
    }

    pub const fn with_clear_mutex(self) -> Self {
        Self(self.0 | FLAG_CLEAR_MUTEX)
    }
}

impl From<u32> for SyncFlags {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

impl fmt::Display for SyncFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} ({}, {:?})",
            self.0,
            if self.is_shared() { "shared" } else { "private" },
            self.policy()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_decoding() {
        assert_eq!(SyncFlags(0).policy(), MutexPolicy::FairShare);
        assert_eq!(SyncFlags(POLICY_FAIRSHARE).policy(), MutexPolicy::FairShare);
        assert_eq!(SyncFlags(POLICY_FIRSTFIT).policy(), MutexPolicy::FirstFit);
        // both bits set is not first-fit
        assert_eq!(
            SyncFlags(POLICY_FIRSTFIT | POLICY_FAIRSHARE).policy(),
            MutexPolicy::FairShare
        );
    }

    #[test]
    fn test_pshared_decoding() {
        assert!(!SyncFlags(PSHARED_PRIVATE).is_shared());
        assert!(SyncFlags::default().shared().is_shared());
        assert!(SyncFlags(0).first_fit().shared().is_first_fit());
        assert!(SyncFlags(0).with_clear_mutex().clears_mutex());
    }
}
