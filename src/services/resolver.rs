/*!
 * Identity Resolution
 *
 * Maps a user address in a process to the memory object backing it, so a
 * process-shared lock mapped at different addresses in different processes
 * resolves to one wait queue.
 */

use crate::core::errors::PsynchError;
use crate::core::types::{Address, ObjectId, Pid, PsynchResult};
use ahash::RandomState;
use dashmap::DashMap;
use log::info;

/// Address to (object, offset) service
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, pid: Pid, addr: Address) -> PsynchResult<(ObjectId, u64)>;
}

/// One shared mapping of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMapping {
    pub base: Address,
    pub len: u64,
    pub object: ObjectId,
    /// Offset of `base` inside the object
    pub object_offset: u64,
}

impl SharedMapping {
    fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr - self.base < self.len
    }
}

/// In-memory table of shared mappings per process
pub struct SharedMappingTable {
    mappings: DashMap<Pid, Vec<SharedMapping>, RandomState>,
}

impl SharedMappingTable {
    pub fn new() -> Self {
        Self {
            mappings: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Map `[base, base + len)` of `pid` onto `object` starting at `object_offset`
    pub fn map(&self, pid: Pid, base: Address, len: u64, object: ObjectId, object_offset: u64) {
        self.mappings.entry(pid).or_default().push(SharedMapping {
            base,
            len,
            object,
            object_offset,
        });
        info!(
            "PID {} mapped object {:#x} at {:#x} ({} bytes)",
            pid, object, base, len
        );
    }

    pub fn unmap(&self, pid: Pid, base: Address) -> bool {
        match self.mappings.get_mut(&pid) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|m| m.base != base);
                before != list.len()
            }
            None => false,
        }
    }

    pub fn unmap_process(&self, pid: Pid) {
        self.mappings.remove(&pid);
    }
}

impl Default for SharedMappingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver for SharedMappingTable {
    fn resolve(&self, pid: Pid, addr: Address) -> PsynchResult<(ObjectId, u64)> {
        self.mappings
            .get(&pid)
            .and_then(|list| {
                list.iter()
                    .find(|m| m.contains(addr))
                    .map(|m| (m.object, m.object_offset + (addr - m.base)))
            })
            .ok_or(PsynchError::Unmapped { pid, addr })
    }
}
