/*!
 * Core Types
 * Common types used across the wait-queue engine
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID type
pub type Pid = u32;

/// Thread ID type (0 means "unknown")
pub type Tid = u64;

/// User virtual address of a synchronization object
pub type Address = u64;

/// Memory object identifier backing a shared mapping
pub type ObjectId = u64;

/// Common result type for psynch operations
pub type PsynchResult<T> = Result<T, super::errors::PsynchError>;

/// Unique id of an allocated wait queue (never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KwqId(pub u64);

impl fmt::Display for KwqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kwq#{}", self.0)
    }
}

/// Stable identity of a synchronization object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Identity {
    /// Process-private object keyed by its user address
    Private { pid: Pid, addr: Address },
    /// Process-shared object keyed by its backing memory object
    Shared { object: ObjectId, offset: u64 },
}

impl Identity {
    pub fn is_shared(&self) -> bool {
        matches!(self, Identity::Shared { .. })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Private { pid, addr } => write!(f, "pid {} @ {:#x}", pid, addr),
            Identity::Shared { object, offset } => {
                write!(f, "object {:#x} + {:#x}", object, offset)
            }
        }
    }
}
