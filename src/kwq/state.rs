/*!
 * Wait Queue State
 *
 * Everything guarded by a wait queue's own lock: the two ordered queues,
 * low/high trackers across both, the owner handle, the prepost and
 * interrupted-wakeup records and the L/U/S words.
 *
 * Inconsistencies here are fatal: signaling an empty queue or a placeholder
 * panics instead of returning, since the queue links are shared with
 * unrelated waiters.
 */

use super::types::{
    Baseline, InterruptKind, InterruptRecord, KernelFlags, KwqType, PrepostRecord, QueueRole,
};
use crate::context::ContextRef;
use crate::core::types::KwqId;
use crate::queue::{Fit, InsertError, OrderedQueue, WaitElement};
use crate::seq::bits::{CV_CBIT, L_IBIT, RWL_INIT, RWS_INIT};
use crate::seq::{count, find_diff, is_higher, is_lower, SeqWord, COUNT_MASK};
use crate::services::{WaitService, WakeStatus};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct KwqState {
    pub(crate) kind: Option<KwqType>,
    pub(crate) owner: Option<ContextRef>,
    pub(crate) queues: [OrderedQueue; 2],
    /// Elements linked across both queues
    pub(crate) inqueue: u32,
    /// Prepost and broadcast placeholders among them
    pub(crate) fakecount: u32,
    pub(crate) lowseq: SeqWord,
    pub(crate) highseq: SeqWord,
    pub(crate) lword: SeqWord,
    pub(crate) uword: SeqWord,
    pub(crate) sword: SeqWord,
    /// Last unlock generation; doubles as the condvar kernel sequence
    pub(crate) last_unlock_seq: SeqWord,
    pub(crate) last_seq_word: SeqWord,
    pub(crate) next_seq_word: SeqWord,
    pub(crate) prepost: PrepostRecord,
    pub(crate) intr: InterruptRecord,
    pub(crate) flags: KernelFlags,
}

impl KwqState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> Option<KwqType> {
        self.kind
    }

    pub fn queue(&self, role: QueueRole) -> &OrderedQueue {
        &self.queues[role.index()]
    }

    pub(crate) fn queue_mut(&mut self, role: QueueRole) -> &mut OrderedQueue {
        &mut self.queues[role.index()]
    }

    pub fn owner(&self) -> Option<&ContextRef> {
        self.owner.as_ref()
    }

    /// Anything that must survive until someone consumes it
    pub fn is_used(&self) -> bool {
        self.inqueue != 0 || self.prepost.count != 0 || self.intr.count != 0
    }

    // =========================================================================
    // QUEUE MAINTENANCE
    // =========================================================================

    /// Link `cx` at `seq` and arm its wait slot
    pub(crate) fn enqueue_waiter(
        &mut self,
        id: KwqId,
        role: QueueRole,
        cx: &ContextRef,
        seq: SeqWord,
        fit: Fit,
    ) -> Result<(), InsertError> {
        let seq = count(seq);
        self.queue_mut(role)
            .insert(WaitElement::waiting(Arc::clone(cx), seq), fit)?;
        cx.slot().prepare(id, seq);
        self.inqueue += 1;
        self.update_low_high(seq);
        Ok(())
    }

    /// Link a prepost or broadcast placeholder on the write queue
    pub(crate) fn insert_fake(&mut self, element: WaitElement) -> Result<(), InsertError> {
        let seq = element.seq();
        self.queue_mut(QueueRole::Write)
            .insert(element, Fit::SequenceOrdered)?;
        self.inqueue += 1;
        self.fakecount += 1;
        self.update_low_high(seq);
        Ok(())
    }

    fn update_low_high(&mut self, seq: SeqWord) {
        if self.inqueue == 1 {
            self.lowseq = seq;
            self.highseq = seq;
        } else {
            if is_lower(seq, self.lowseq) {
                self.lowseq = seq;
            }
            if is_higher(seq, self.highseq) {
                self.highseq = seq;
            }
        }
    }

    /// Unlink the element at `index`, keeping counters and trackers in step
    pub(crate) fn remove_at(&mut self, role: QueueRole, index: usize) -> WaitElement {
        let element = self.queue_mut(role).remove(index);
        match element.context() {
            Some(cx) => cx.slot().unlink(),
            None => self.fakecount -= 1,
        }

        self.inqueue -= 1;
        if self.inqueue == 0 {
            self.lowseq = 0;
            self.highseq = 0;
        } else {
            let seq = element.seq();
            if self.lowseq == seq {
                self.lowseq = self.next_low();
            }
            if self.highseq == seq {
                self.highseq = self.next_high();
            }
        }
        element
    }

    /// Unlink `cx` if it is still queued in `role`
    pub(crate) fn remove_waiter(&mut self, role: QueueRole, cx: &ContextRef) -> bool {
        match self.queue(role).position_of(cx) {
            Some(index) => {
                self.remove_at(role, index);
                true
            }
            None => false,
        }
    }

    fn next_low(&self) -> SeqWord {
        let mut lowest = None;
        for q in self.queues.iter().filter(|q| !q.is_empty()) {
            match lowest {
                Some(low) if !is_lower(q.first(), low) => {}
                _ => lowest = Some(q.first()),
            }
        }
        lowest.unwrap_or(0)
    }

    fn next_high(&self) -> SeqWord {
        let mut highest = None;
        for q in self.queues.iter().filter(|q| !q.is_empty()) {
            match highest {
                Some(high) if !is_higher(q.last(), high) => {}
                _ => highest = Some(q.last()),
            }
        }
        highest.unwrap_or(0)
    }

    /// Dequeue a waiting element and hand it `update`
    ///
    /// `index` defaults to the head of the queue. A woken mutex waiter
    /// becomes the target of the remaining waiters' priority push.
    ///
    /// # Panics
    ///
    /// If the queue is empty or the element is a placeholder.
    pub(crate) fn signal(
        &mut self,
        role: QueueRole,
        index: Option<usize>,
        update: u32,
        waiter: &dyn WaitService,
    ) -> (WakeStatus, ContextRef) {
        let index = index.unwrap_or(0);
        let target = match self.queue(role).get(index) {
            None => panic!("signaling empty {:?} queue", role),
            Some(element) => match element.context() {
                Some(cx) => Arc::clone(cx),
                None => panic!("signaling non-waiting element {:?}", element),
            },
        };
        let Some(key) = target.slot().queued_on() else {
            panic!("signaling tid {} with an unlinked slot", target.tid());
        };

        self.remove_at(role, index);
        let inheritor = (self.kind == Some(KwqType::Mutex)).then_some(&target);
        let status = waiter.wake(key, &target, update, inheritor);
        (status, target)
    }

    /// Elements across both queues at or below `upto`, stopping at `nwaiters`
    ///
    /// Returns whether all `nwaiters` were found, with the count seen.
    pub(crate) fn find_seq_till(&self, upto: SeqWord, nwaiters: u32) -> (bool, u32) {
        let mut n = 0;
        for q in &self.queues {
            n += q.count_up_to(upto);
            if n >= nwaiters {
                break;
            }
        }
        (n != 0 && n >= nwaiters, n)
    }

    // =========================================================================
    // OWNER
    // =========================================================================

    /// Take a fresh reference on `cx` as owner, returning the displaced one
    pub(crate) fn set_owner(&mut self, cx: &ContextRef) -> Option<ContextRef> {
        if self.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, cx)) {
            return None;
        }
        self.owner.replace(Arc::clone(cx))
    }

    /// Install an already-held reference as owner
    ///
    /// Whatever comes back (the displaced owner, or `cx` itself when it was
    /// already installed) is dropped by the caller after unlocking.
    pub(crate) fn transfer_owner(&mut self, cx: ContextRef) -> Option<ContextRef> {
        if self.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &cx)) {
            return Some(cx);
        }
        self.owner.replace(cx)
    }

    pub(crate) fn clear_owner(&mut self) -> Option<ContextRef> {
        self.flags.qos_applied = false;
        self.owner.take()
    }

    // =========================================================================
    // PREPOST & INTERRUPTED WAKEUP RECORDS
    // =========================================================================

    pub(crate) fn clear_preposted_wakeup(&mut self) {
        self.prepost = PrepostRecord::default();
    }

    pub(crate) fn mark_preposted_wakeup(&mut self, count: u32, lseq: SeqWord, sseq: SeqWord) {
        self.prepost = PrepostRecord { count, lseq, sseq };
    }

    pub(crate) fn clear_interrupted_wakeup(&mut self) {
        self.intr = InterruptRecord::default();
    }

    pub(crate) fn mark_interrupted_wakeup(
        &mut self,
        kind: InterruptKind,
        count: u32,
        seq: SeqWord,
        return_bits: u32,
    ) {
        self.intr = InterruptRecord {
            kind: Some(kind),
            count,
            seq,
            return_bits,
        };
    }

    /// Reclaim a grant stashed for a waiter that had already left
    pub(crate) fn take_interrupted_wakeup(
        &mut self,
        kind: InterruptKind,
        lseq: SeqWord,
    ) -> Option<u32> {
        let intr = &self.intr;
        let matches = intr.count != 0
            && intr.kind == Some(kind)
            && (intr.seq == 0 || !is_higher(lseq, intr.seq));
        if !matches {
            return None;
        }

        self.intr.count -= 1;
        let bits = self.intr.return_bits;
        if bits == 0 {
            self.clear_interrupted_wakeup();
        }
        Some(bits)
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Claim a free queue for `kind` from the caller's words
    pub(crate) fn init(&mut self, kind: KwqType, baseline: Baseline) {
        self.kind = Some(kind);
        self.clear_reinit_bits();
        self.lword = baseline.lgen;
        self.uword = baseline.ugen;
        self.sword = baseline.sgen;
        self.owner = None;
        self.flags = KernelFlags::default();
    }

    /// Drop prepost and interrupt bookkeeping after a userspace reinit
    pub(crate) fn clear_reinit_bits(&mut self) {
        match self.kind {
            Some(KwqType::CondVar) => {
                if self.inqueue != 0 && self.inqueue != self.fakecount {
                    panic!(
                        "condvar reinit with {} entries queued, {} fake",
                        self.inqueue, self.fakecount
                    );
                }
            }
            Some(KwqType::RwLock) => {
                self.next_seq_word = RWS_INIT;
                self.flags.overlap_guard = false;
            }
            _ => {}
        }
        self.clear_preposted_wakeup();
        self.last_unlock_seq = RWL_INIT;
        self.last_seq_word = RWS_INIT;
        self.clear_interrupted_wakeup();
        self.lword = 0;
        self.uword = 0;
        self.sword = RWS_INIT;
    }

    /// First caller to see the init bit in `lgen` clears stale bookkeeping
    pub(crate) fn check_init(&mut self, lgen: SeqWord) -> bool {
        let reinit = lgen & L_IBIT != 0;
        if reinit && !self.flags.init_cleared {
            self.clear_reinit_bits();
            self.flags.init_cleared = true;
        }
        reinit
    }

    /// Advance the condvar L/U/S view, never backwards
    pub(crate) fn update_cv(&mut self, lgen: SeqWord, ugen: SeqWord, sgen: SeqWord) {
        let sinit = sgen & CV_CBIT != 0;

        if self.flags.zeroed_out {
            self.lword = lgen;
            self.uword = ugen;
            self.sword = sgen;
            self.flags.zeroed_out = false;
        } else {
            if is_higher(lgen, self.lword) {
                self.lword = lgen;
            }
            if is_higher(ugen, self.uword) {
                self.uword = ugen;
            }
            if sinit && is_higher(sgen, self.sword) {
                self.sword = sgen;
            }
        }

        if sinit && is_lower(self.last_unlock_seq, sgen) {
            self.last_unlock_seq = sgen & COUNT_MASK;
        }
    }

    /// Generations still owed between the kernel's L and S
    pub(crate) fn cv_outstanding(&self) -> u32 {
        find_diff(self.lword, self.sword)
    }

    /// Back to the pristine pool state, keeping queue allocations
    ///
    /// Waiting elements are only unlinked; their contexts own them.
    pub(crate) fn reset(&mut self) {
        for q in &mut self.queues {
            for element in q.drain() {
                if let Some(cx) = element.context() {
                    cx.slot().unlink();
                }
            }
        }
        let queues = std::mem::take(&mut self.queues);
        *self = Self {
            queues,
            ..Self::default()
        };
    }
}
