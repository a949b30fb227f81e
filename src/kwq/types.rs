/*!
 * Wait Queue Types
 * Type tags, bookkeeping records and flags carried by every wait queue
 */

use crate::seq::bits::RWS_INIT;
use crate::seq::SeqWord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of synchronization object a wait queue currently backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KwqType {
    Mutex,
    CondVar,
    RwLock,
}

impl fmt::Display for KwqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KwqType::Mutex => "mutex",
            KwqType::CondVar => "condvar",
            KwqType::RwLock => "rwlock",
        };
        f.write_str(name)
    }
}

/// Which of the two ordered queues; mutexes and condvars only use `Write`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRole {
    Read = 0,
    Write = 1,
}

impl QueueRole {
    pub const ALL: [QueueRole; 2] = [QueueRole::Read, QueueRole::Write];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Grant flavour an interrupted wakeup was meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Read,
    Write,
}

impl From<QueueRole> for InterruptKind {
    fn from(role: QueueRole) -> Self {
        match role {
            QueueRole::Read => InterruptKind::Read,
            QueueRole::Write => InterruptKind::Write,
        }
    }
}

/// Why a caller holds a reference on a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// About to block
    Wait,
    /// Unlock path
    Drop,
}

/// Generation words supplied by the caller that claims a free queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Baseline {
    pub lgen: SeqWord,
    pub ugen: SeqWord,
    pub sgen: SeqWord,
}

impl Baseline {
    pub fn new(lgen: SeqWord, ugen: SeqWord, sgen: SeqWord) -> Self {
        Self { lgen, ugen, sgen }
    }
}

/// Single-slot record of a grant issued before its recipient arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepostRecord {
    pub count: u32,
    pub lseq: SeqWord,
    pub sseq: SeqWord,
}

impl Default for PrepostRecord {
    fn default() -> Self {
        Self {
            count: 0,
            lseq: 0,
            sseq: RWS_INIT,
        }
    }
}

/// Single-slot record of grants whose recipients had already left
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub kind: Option<InterruptKind>,
    pub count: u32,
    /// Highest sequence allowed to reclaim (0 matches any)
    pub seq: SeqWord,
    pub return_bits: u32,
}

/// Kernel-private status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelFlags {
    /// Reinit was noticed and preposts cleared for this generation
    pub init_cleared: bool,
    /// Condvar L/U/S were zeroed after draining; next update adopts the caller's words
    pub zeroed_out: bool,
    pub qos_applied: bool,
    /// Uncontended multi-reader round in effect
    pub overlap_guard: bool,
}
