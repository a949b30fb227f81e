/*!
 * Protocol Diagnostics
 *
 * Caller sequencing bugs are never fatal, but they are never silent either:
 * each one is logged and counted by kind.
 */

use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Protocol violation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    /// A second prepost was requested while one was pending
    MultiplePreposts,
    /// A grant carried no sequence and no exclusive bit
    ZeroGrant,
    /// Generation words inconsistent with each other
    InvalidSequence,
    /// A waiter already sits at the requested sequence
    DuplicateWaiter,
    /// Identity still busy for a different object kind
    ObjectBusy,
    /// Broadcast span larger than the thread limit
    ThreadLimit,
    /// A fair-share unlock found waiters queued below its target but not the target
    UnlockSequenceMissing,
}

impl Violation {
    pub const ALL: [Violation; 7] = [
        Violation::MultiplePreposts,
        Violation::ZeroGrant,
        Violation::InvalidSequence,
        Violation::DuplicateWaiter,
        Violation::ObjectBusy,
        Violation::ThreadLimit,
        Violation::UnlockSequenceMissing,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Violation::MultiplePreposts => "multiple preposts",
            Violation::ZeroGrant => "zero grant",
            Violation::InvalidSequence => "invalid sequence",
            Violation::DuplicateWaiter => "duplicate waiter",
            Violation::ObjectBusy => "object busy",
            Violation::ThreadLimit => "thread limit",
            Violation::UnlockSequenceMissing => "unlock sequence missing",
        };
        f.write_str(s)
    }
}

/// Per-kind violation counters
#[derive(Debug, Default)]
pub struct Diagnostics {
    counters: [AtomicU64; Violation::ALL.len()],
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, violation: Violation, detail: impl fmt::Display) {
        self.counters[violation.index()].fetch_add(1, Ordering::Relaxed);
        warn!("PSYNCH: {}: {}", violation, detail);
    }

    pub fn count(&self, violation: Violation) -> u64 {
        self.counters[violation.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> Vec<(Violation, u64)> {
        Violation::ALL
            .iter()
            .map(|&v| (v, self.count(v)))
            .collect()
    }
}
