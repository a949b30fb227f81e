/*!
 * Registry Directory
 *
 * Identity to wait queue tables plus the deferred free list, all guarded by
 * the registry lock. Private objects are keyed by `(pid, address)`, shared
 * ones by `(object, offset)`.
 */

use crate::core::types::{Address, Identity, ObjectId, Pid};
use crate::kwq::WaitQueue;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry-side bookkeeping for one wait queue
#[derive(Debug)]
pub(super) struct Entry {
    pub kwq: Arc<WaitQueue>,
    /// Entry points currently holding a reference
    pub io_count: u32,
    /// Of those, mutex unlockers
    pub drop_count: u32,
    /// Someone sleeps on the registry waiting for this object to idle
    pub waiting: bool,
    pub on_free_list: bool,
    pub idle_since: Option<Instant>,
}

impl Entry {
    pub fn new(kwq: Arc<WaitQueue>) -> Self {
        Self {
            kwq,
            io_count: 0,
            drop_count: 0,
            waiting: false,
            on_free_list: false,
            idle_since: None,
        }
    }

    pub fn status(&self, now: Instant) -> EntryStatus {
        EntryStatus {
            io_count: self.io_count,
            drop_count: self.drop_count,
            on_free_list: self.on_free_list,
            idle_for: self.idle_since.map(|t| now.saturating_duration_since(t)),
        }
    }
}

/// Serializable view of an entry's registry bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub io_count: u32,
    pub drop_count: u32,
    pub on_free_list: bool,
    pub idle_for: Option<Duration>,
}

#[derive(Debug)]
pub(super) struct Directory {
    private: HashMap<(Pid, Address), Entry, RandomState>,
    shared: HashMap<(ObjectId, u64), Entry, RandomState>,
    free_list: Vec<Identity>,
    /// Cleanup timer armed
    pub armed: bool,
    pub deadline: Option<Instant>,
    pub shutdown: bool,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            private: HashMap::with_hasher(RandomState::new()),
            shared: HashMap::with_hasher(RandomState::new()),
            free_list: Vec::new(),
            armed: false,
            deadline: None,
            shutdown: false,
        }
    }

    pub fn len(&self) -> usize {
        self.private.len() + self.shared.len()
    }

    pub fn free_list(&self) -> &[Identity] {
        &self.free_list
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    pub fn get(&self, identity: &Identity) -> Option<&Entry> {
        match *identity {
            Identity::Private { pid, addr } => self.private.get(&(pid, addr)),
            Identity::Shared { object, offset } => self.shared.get(&(object, offset)),
        }
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut Entry> {
        match *identity {
            Identity::Private { pid, addr } => self.private.get_mut(&(pid, addr)),
            Identity::Shared { object, offset } => self.shared.get_mut(&(object, offset)),
        }
    }

    pub fn insert(&mut self, identity: Identity, entry: Entry) {
        match identity {
            Identity::Private { pid, addr } => {
                self.private.insert((pid, addr), entry);
            }
            Identity::Shared { object, offset } => {
                self.shared.insert((object, offset), entry);
            }
        }
    }

    /// Look up an entry for use, pulling it off the free list
    pub fn claim(&mut self, identity: &Identity) -> Option<&mut Entry> {
        if self.get(identity)?.on_free_list {
            self.free_list.retain(|i| i != identity);
        }
        let entry = self.get_mut(identity)?;
        entry.on_free_list = false;
        entry.idle_since = None;
        Some(entry)
    }

    /// Unhash an entry (and unlink it from the free list)
    pub fn remove(&mut self, identity: &Identity) -> Option<Entry> {
        let entry = match *identity {
            Identity::Private { pid, addr } => self.private.remove(&(pid, addr)),
            Identity::Shared { object, offset } => self.shared.remove(&(object, offset)),
        }?;
        if entry.on_free_list {
            self.free_list.retain(|i| i != identity);
        }
        Some(entry)
    }

    /// Park an idle entry on the free list
    pub fn push_free(&mut self, identity: Identity, now: Instant) {
        if let Some(entry) = self.get_mut(&identity) {
            if !entry.on_free_list {
                entry.on_free_list = true;
                entry.idle_since = Some(now);
                self.free_list.push(identity);
            }
        }
    }

    /// Private identities belonging to `pid`
    pub fn private_of(&self, pid: Pid) -> Vec<Identity> {
        self.private
            .keys()
            .filter(|(p, _)| *p == pid)
            .map(|&(pid, addr)| Identity::Private { pid, addr })
            .collect()
    }
}
