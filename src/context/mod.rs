/*!
 * Execution Contexts
 *
 * Userspace threads as seen by the engine. A context carries its identity,
 * cancellation and interrupt flags, the wait slot a grant lands in, and the
 * priority-inheritance bookkeeping maintained while it is parked.
 */

mod slot;
mod table;

pub use slot::{SlotState, WaitSlot};
pub use table::ContextTable;

use crate::core::types::{Identity, KwqId, Pid, Tid};
use parking_lot::Mutex;
use parking_lot_core::{unpark_all, DEFAULT_UNPARK_TOKEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Shared handle to a context
pub type ContextRef = Arc<ThreadContext>;

/// Why a context is parked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    Mutex,
    CondVar,
    RwLockRead,
    RwLockWrite,
}

/// Where a parked context is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedOn {
    pub reason: WaitReason,
    pub kwq: KwqId,
    pub identity: Identity,
}

/// A userspace thread known to the engine
pub struct ThreadContext {
    pid: Pid,
    tid: Tid,
    cancelled: AtomicBool,
    interrupt_pending: AtomicBool,
    slot: WaitSlot,
    blocked: Mutex<Option<BlockedOn>>,
    /// Context this one currently lends its priority to
    push: Mutex<Option<ContextRef>>,
    /// Number of parked contexts pushing onto this one
    inherited_pushes: AtomicU32,
}

impl ThreadContext {
    pub fn new(pid: Pid, tid: Tid) -> Self {
        Self {
            pid,
            tid,
            cancelled: AtomicBool::new(false),
            interrupt_pending: AtomicBool::new(false),
            slot: WaitSlot::new(),
            blocked: Mutex::new(None),
            push: Mutex::new(None),
            inherited_pushes: AtomicU32::new(0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn slot(&self) -> &WaitSlot {
        &self.slot
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the thread cancelled and kick it out of any wait
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.interrupt();
    }

    /// Deliver a signal-equivalent interruption
    ///
    /// A parked context returns with `Interrupted` unless a grant beat it.
    /// When not parked, the next park returns immediately.
    pub fn interrupt(&self) {
        self.interrupt_pending.store(true, Ordering::Release);
        // SAFETY: the key is the address of our own slot, which lives as long as self
        unsafe {
            unpark_all(self.slot.park_key(), DEFAULT_UNPARK_TOKEN);
        }
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt_pending.load(Ordering::Acquire)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupt_pending.store(false, Ordering::Release);
    }

    /// Where this context is parked, if anywhere
    pub fn blocked_on(&self) -> Option<BlockedOn> {
        *self.blocked.lock()
    }

    pub(crate) fn set_blocked(&self, blocked: Option<BlockedOn>) {
        *self.blocked.lock() = blocked;
    }

    /// Thread this context lends its priority to while parked
    pub fn pushing_on(&self) -> Option<Tid> {
        self.push.lock().as_ref().map(|target| target.tid())
    }

    /// Parked contexts currently lending priority to this one
    pub fn inherited_pushes(&self) -> u32 {
        self.inherited_pushes.load(Ordering::Acquire)
    }

    /// Move this context's push onto `inheritor`, or drop it with `None`
    ///
    /// A context never pushes onto itself.
    pub(crate) fn push_onto(&self, inheritor: Option<&ContextRef>) {
        let inheritor = inheritor.filter(|target| !std::ptr::eq(Arc::as_ptr(target), self));
        let mut push = self.push.lock();
        let unchanged = match (push.as_ref(), inheritor) {
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(old) = push.take() {
            old.inherited_pushes.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(new) = inheritor {
            new.inherited_pushes.fetch_add(1, Ordering::AcqRel);
            *push = Some(Arc::clone(new));
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("cancelled", &self.is_cancelled())
            .field("slot", &self.slot.state())
            .finish()
    }
}
