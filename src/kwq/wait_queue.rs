/*!
 * Wait Queue
 *
 * One contended synchronization object: its identity plus the lock-guarded
 * state. Blocking goes through `block`, which consumes the guard so the
 * per-object lock can never be held across a park.
 */

use super::state::KwqState;
use super::types::{InterruptRecord, KernelFlags, KwqType, PrepostRecord, QueueRole};
use crate::context::{BlockedOn, ContextRef, WaitReason};
use crate::core::types::{Identity, KwqId, PsynchResult, Tid};
use crate::queue::Fit;
use crate::seq::SeqWord;
use crate::services::{ParkRequest, WaitOutcome, WaitService};
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// How a caller is about to block
#[derive(Debug, Clone)]
pub struct BlockOn {
    pub role: QueueRole,
    pub seq: SeqWord,
    pub fit: Fit,
    pub reason: WaitReason,
    pub deadline: Option<Instant>,
    /// Current owner, lent the waiter's priority while parked (mutex only)
    pub inheritor: Option<ContextRef>,
}

#[derive(Debug)]
pub struct WaitQueue {
    id: KwqId,
    identity: Identity,
    state: Mutex<KwqState>,
}

impl WaitQueue {
    pub(crate) fn new(id: KwqId, identity: Identity, state: KwqState) -> Self {
        Self {
            id,
            identity,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> KwqId {
        self.id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, KwqState> {
        self.state.lock()
    }

    pub(crate) fn into_state(self) -> KwqState {
        self.state.into_inner()
    }

    /// Enqueue `cx`, release the object lock and park
    ///
    /// Insertion failures come back before anything is parked. Once parked,
    /// the caller re-locks and inspects the slot to finish the wait.
    pub(crate) fn block(
        &self,
        mut guard: MutexGuard<'_, KwqState>,
        cx: &ContextRef,
        on: BlockOn,
        waiter: &dyn WaitService,
    ) -> PsynchResult<WaitOutcome> {
        guard.enqueue_waiter(self.id, on.role, cx, on.seq, on.fit)?;
        // only mutex waiters lend priority; rwlock owners are not tracked
        if on.reason == WaitReason::Mutex {
            waiter.prepare(self.id, cx, on.inheritor.as_ref());
            guard.flags.qos_applied = on.inheritor.is_some();
        }

        cx.set_blocked(Some(BlockedOn {
            reason: on.reason,
            kwq: self.id,
            identity: self.identity,
        }));
        debug!(
            "{} parking tid {} at {:#x} ({} queued)",
            self.id,
            cx.tid(),
            on.seq,
            guard.inqueue
        );
        drop(guard);

        let outcome = waiter.park(
            cx,
            ParkRequest {
                key: self.id,
                reason: on.reason,
                deadline: on.deadline,
            },
        );
        cx.set_blocked(None);
        Ok(outcome)
    }

    /// Consistent copy of the object's state for diagnostics
    pub fn snapshot(&self) -> KwqSnapshot {
        let state = self.lock();
        KwqSnapshot {
            id: self.id,
            identity: self.identity,
            kind: state.kind,
            owner: state.owner.as_ref().map(|o| o.tid()),
            readers_queued: state.queue(QueueRole::Read).len(),
            writers_queued: state.queue(QueueRole::Write).len(),
            fake_entries: state.fakecount,
            lowseq: state.lowseq,
            highseq: state.highseq,
            lword: state.lword,
            uword: state.uword,
            sword: state.sword,
            prepost: state.prepost,
            interrupted: state.intr,
            flags: state.flags,
        }
    }
}

/// Serializable view of a wait queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KwqSnapshot {
    pub id: KwqId,
    pub identity: Identity,
    pub kind: Option<KwqType>,
    pub owner: Option<Tid>,
    pub readers_queued: usize,
    pub writers_queued: usize,
    pub fake_entries: u32,
    pub lowseq: SeqWord,
    pub highseq: SeqWord,
    pub lword: SeqWord,
    pub uword: SeqWord,
    pub sword: SeqWord,
    pub prepost: PrepostRecord,
    pub interrupted: InterruptRecord,
    pub flags: KernelFlags,
}

impl KwqSnapshot {
    pub fn waiters(&self) -> usize {
        self.readers_queued + self.writers_queued - self.fake_entries as usize
    }
}
