/*!
 * Mutex Protocol
 *
 * Contended lock and unlock for psynch mutexes.
 *
 * # Policies
 *
 * - Fair-share: an unlock grants exactly the next sequence (`U + 1`). A
 *   waiter that has not reached the kernel yet gets a one-count prepost keyed
 *   to that sequence.
 * - First-fit: an unlock pokes the head waiter, which re-contends in
 *   userspace. With nobody queued the unlock is preposted and the next
 *   arrival takes it regardless of sequence.
 *
 * The owner handle is kept current on every grant so parked waiters can push
 * their priority onto it.
 */

use super::{traced, wait_error, PsynchKernel, SyncFlags};
use crate::context::{ContextRef, WaitReason};
use crate::core::errors::PsynchError;
use crate::core::types::{Address, PsynchResult, Tid};
use crate::kwq::{AcquireMode, Baseline, BlockOn, InterruptKind, KwqState, KwqType, QueueRole, WaitQueue};
use crate::monitoring::{span_entry, Violation};
use crate::queue::Fit;
use crate::seq::bits::{L_EBIT, L_KBIT, L_MTX_WAIT, RWL_INIT, TID_SWITCHING};
use crate::seq::{count, is_higher, is_lower, SeqWord, INC};
use crate::services::{WaitOutcome, WakeStatus};
use log::debug;
use std::time::Instant;

impl PsynchKernel {
    /// Block until the mutex at `addr` is handed to `cx`
    ///
    /// `owner_hint` is the owner tid userspace saw when its CAS failed (0 when
    /// unknown, `TID_SWITCHING` while an unlock was in flight).
    #[allow(clippy::too_many_arguments)]
    pub fn mutex_wait(
        &self,
        cx: &ContextRef,
        addr: Address,
        mgen: SeqWord,
        ugen: SeqWord,
        owner_hint: Tid,
        flags: SyncFlags,
        deadline: Option<Instant>,
    ) -> PsynchResult<u32> {
        let span = span_entry("mutex_wait", cx.tid(), addr);
        traced(
            span,
            self.mutex_wait_inner(cx, addr, mgen, ugen, owner_hint, flags, deadline),
        )
    }

    /// Post an unlock of the mutex at `addr`
    ///
    /// Returns the bits granted to a waiter, or 0 when the unlock was preposted.
    pub fn mutex_drop(
        &self,
        cx: &ContextRef,
        addr: Address,
        mgen: SeqWord,
        ugen: SeqWord,
        flags: SyncFlags,
    ) -> PsynchResult<u32> {
        let span = span_entry("mutex_drop", cx.tid(), addr);
        let result = self
            .acquire(
                cx,
                addr,
                flags,
                KwqType::Mutex,
                AcquireMode::Drop,
                Baseline::new(mgen, ugen, 0),
            )
            .map(|kwq| self.mutex_unlock(&kwq, mgen, ugen, flags));
        traced(span, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn mutex_wait_inner(
        &self,
        cx: &ContextRef,
        addr: Address,
        mgen: SeqWord,
        ugen: SeqWord,
        owner_hint: Tid,
        flags: SyncFlags,
        deadline: Option<Instant>,
    ) -> PsynchResult<u32> {
        let kwq = self.acquire(
            cx,
            addr,
            flags,
            KwqType::Mutex,
            AcquireMode::Wait,
            Baseline::new(mgen, ugen, 0),
        )?;
        let first_fit = flags.is_first_fit();
        let lseq = count(mgen);
        let mut hint = owner_hint;
        let mut resolved: Option<ContextRef> = None;

        loop {
            let mut state = kwq.lock();

            if let Some(bits) = state.take_interrupted_wakeup(InterruptKind::Write, lseq) {
                let displaced = self.own(&kwq, &mut state, cx);
                drop(state);
                drop(displaced);
                return Ok(bits);
            }

            if state.prepost.count != 0 && (first_fit || lseq == state.prepost.lseq) {
                state.prepost.count -= 1;
                if !first_fit {
                    if state.prepost.count > 0 {
                        let left = state.prepost.count;
                        state.prepost.lseq = state.prepost.lseq.wrapping_add(INC);
                        drop(state);
                        self.diagnostics.report(
                            Violation::MultiplePreposts,
                            format_args!("{} mutex wait at {:#x} found {} more", kwq.id(), lseq, left),
                        );
                        return Err(PsynchError::invalid("more than one prepost"));
                    }
                    state.clear_preposted_wakeup();
                }

                let base = if state.inqueue == 0 {
                    lseq
                } else {
                    count(state.highseq)
                };
                let bits = (base | L_KBIT | L_EBIT) & !L_MTX_WAIT;
                let displaced = self.own(&kwq, &mut state, cx);
                drop(state);
                drop(displaced);
                debug!("{} tid {} took preposted unlock", kwq.id(), cx.tid());
                return Ok(bits);
            }

            // The hint is only worth acting on when it names a live thread the
            // kernel does not already consider the owner.
            let owner_tid = state.owner().map(|o| o.tid()).unwrap_or(0);
            let stale = state.last_unlock_seq != RWL_INIT && is_lower(ugen, state.last_unlock_seq);
            let mut displaced = None;
            if hint != owner_tid && hint != 0 && !stale && hint != TID_SWITCHING {
                match resolved.take() {
                    None => {
                        drop(state);
                        resolved = self.contexts.lookup(hint);
                        if resolved.is_none() {
                            hint = 0;
                        }
                        continue;
                    }
                    Some(owner) => {
                        displaced = state.transfer_owner(owner);
                        self.waiter().update_inheritor(kwq.id(), state.owner());
                    }
                }
            }
            drop(displaced);
            drop(resolved.take());

            let inheritor = state.owner().cloned();
            let on = BlockOn {
                role: QueueRole::Write,
                seq: mgen,
                fit: if first_fit {
                    Fit::InsertionOrdered
                } else {
                    Fit::SequenceOrdered
                },
                reason: WaitReason::Mutex,
                deadline,
                inheritor,
            };
            let outcome = self.park(&kwq, state, cx, on)?;
            return self.mutex_wait_complete(&kwq, cx, outcome);
        }
    }

    fn mutex_wait_complete(
        &self,
        kwq: &WaitQueue,
        cx: &ContextRef,
        outcome: WaitOutcome,
    ) -> PsynchResult<u32> {
        let mut state = kwq.lock();
        if outcome != WaitOutcome::Woken {
            state.remove_waiter(QueueRole::Write, cx);
            self.waiter().cleanup(kwq.id(), cx);
            return Err(wait_error(outcome, 0));
        }
        drop(state);

        let bits = cx.slot().retval() & !L_MTX_WAIT;
        if bits == 0 {
            self.diagnostics.report(
                Violation::ZeroGrant,
                format_args!("{} mutex wait woke tid {} with no bits", kwq.id(), cx.tid()),
            );
        }
        Ok(bits)
    }

    /// Unlock with a reference already held; shared with condvar wait
    pub(super) fn mutex_unlock(
        &self,
        kwq: &WaitQueue,
        mgen: SeqWord,
        ugen: SeqWord,
        flags: SyncFlags,
    ) -> u32 {
        let first_fit = flags.is_first_fit();
        let nextgen = count(ugen.wrapping_add(INC));
        let mut state = kwq.lock();
        state.last_unlock_seq = count(ugen);

        loop {
            let update = count(state.highseq) | L_EBIT | L_KBIT;

            if first_fit {
                if state.inqueue == 0 {
                    let n = state.prepost.count + 1;
                    state.mark_preposted_wakeup(n, count(mgen), 0);
                    let old = self.disown(kwq, &mut state);
                    drop(state);
                    drop(old);
                    return 0;
                }

                let (status, old) = self.mutex_signal(kwq, &mut state, None, update);
                if status == WakeStatus::NotWaiting {
                    drop(state);
                    drop(old);
                    state = kwq.lock();
                    continue;
                }
                drop(state);
                drop(old);
                return update;
            }

            let low_writer = count(state.queue(QueueRole::Write).first());
            // waiters below the target mean it should already be queued
            let behind = state.inqueue != 0 && !is_higher(low_writer, nextgen);
            let target = if !behind {
                None
            } else if low_writer == nextgen {
                Some(0)
            } else {
                state.queue(QueueRole::Write).position_of_seq(nextgen)
            };

            let Some(index) = target else {
                let duplicate = state.prepost.count != 0;
                if !duplicate {
                    state.mark_preposted_wakeup(1, nextgen, 0);
                }
                let old = self.disown(kwq, &mut state);
                drop(state);
                drop(old);
                if behind {
                    self.diagnostics.report(
                        Violation::UnlockSequenceMissing,
                        format_args!(
                            "{} mutex unlock to {:#x} with {:#x} lowest queued",
                            kwq.id(),
                            nextgen,
                            low_writer
                        ),
                    );
                }
                if duplicate {
                    self.diagnostics.report(
                        Violation::MultiplePreposts,
                        format_args!("{} mutex unlock to {:#x} with one pending", kwq.id(), nextgen),
                    );
                }
                return 0;
            };

            let (status, old) =
                self.mutex_signal(kwq, &mut state, Some(index), update | L_MTX_WAIT);
            drop(old);
            if status == WakeStatus::NotWaiting {
                if index == 0 {
                    // grant belongs to that sequence; park it for the retry
                    state.mark_interrupted_wakeup(InterruptKind::Write, 1, nextgen, update);
                } else {
                    continue;
                }
            }
            return update;
        }
    }

    /// Hand the mutex to a queued waiter, keeping the owner handle in step
    fn mutex_signal(
        &self,
        kwq: &WaitQueue,
        state: &mut KwqState,
        index: Option<usize>,
        update: u32,
    ) -> (WakeStatus, Option<ContextRef>) {
        let (status, target) = state.signal(QueueRole::Write, index, update, self.waiter());
        let displaced = match status {
            WakeStatus::Delivered => self.own(kwq, state, &target),
            WakeStatus::NotWaiting => self.disown(kwq, state),
        };
        (status, displaced)
    }

    /// Make `cx` the owner and the target of every waiter's priority push
    fn own(&self, kwq: &WaitQueue, state: &mut KwqState, cx: &ContextRef) -> Option<ContextRef> {
        let displaced = state.set_owner(cx);
        self.waiter().update_inheritor(kwq.id(), Some(cx));
        displaced
    }

    /// Forget the owner; parked waiters stop pushing until the next grant
    fn disown(&self, kwq: &WaitQueue, state: &mut KwqState) -> Option<ContextRef> {
        let displaced = state.clear_owner();
        self.waiter().update_inheritor(kwq.id(), None);
        displaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PsynchConfig;
    use crate::core::types::Identity;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn kernel() -> PsynchKernel {
        PsynchKernel::new(PsynchConfig::manual())
    }

    const ADDR: Address = 0x7000;

    #[test]
    fn test_fair_share_unlock_before_wait_is_preposted() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        let b = kernel.register_thread(1, 11);

        // unlock of generation 1 arrives first: prepost for sequence 2
        let bits = kernel.mutex_drop(&a, ADDR, 2 * INC, INC, SyncFlags(0)).unwrap();
        assert_eq!(bits, 0);

        let bits = kernel
            .mutex_wait(&b, ADDR, 2 * INC, INC, 0, SyncFlags(0), None)
            .unwrap();
        assert_eq!(bits, 2 * INC | L_KBIT | L_EBIT);

        let report = kernel
            .registry()
            .inspect(&Identity::Private { pid: 1, addr: ADDR })
            .unwrap();
        assert_eq!(report.kwq.owner, Some(11));
        assert_eq!(report.kwq.prepost.count, 0);
    }

    #[test]
    fn test_first_fit_prepost_taken_by_any_sequence() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        let flags = SyncFlags(0).first_fit();

        kernel.mutex_drop(&a, ADDR, 3 * INC, INC, flags).unwrap();
        let bits = kernel
            .mutex_wait(&a, ADDR, 7 * INC, INC, 0, flags, None)
            .unwrap();
        assert_eq!(bits & (L_KBIT | L_EBIT), L_KBIT | L_EBIT);
    }

    #[test]
    fn test_owner_hint_resolved_for_inheritance() {
        let kernel = Arc::new(kernel());
        let owner = kernel.register_thread(1, 50);
        let waiter = kernel.register_thread(1, 51);

        let (k, w) = (Arc::clone(&kernel), Arc::clone(&waiter));
        let handle = thread::spawn(move || {
            k.mutex_wait(&w, ADDR, 2 * INC, 0, 50, SyncFlags(0), None)
        });

        thread::sleep(Duration::from_millis(30));
        assert_eq!(owner.inherited_pushes(), 1);
        assert_eq!(kernel.find_owner(&waiter).and_then(|w| w.owner), Some(50));

        kernel.mutex_drop(&owner, ADDR, 2 * INC, INC, SyncFlags(0)).unwrap();
        let bits = handle.join().unwrap().unwrap();
        assert_eq!(bits & L_EBIT, L_EBIT);
        assert_eq!(owner.inherited_pushes(), 0);
    }

    #[test]
    fn test_timed_out_waiter_is_unlinked() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        let b = kernel.register_thread(1, 11);

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = kernel
            .mutex_wait(&b, ADDR, 2 * INC, 0, 0, SyncFlags(0), Some(deadline))
            .unwrap_err();
        assert!(matches!(err, PsynchError::TimedOut { .. }));
        assert_eq!(b.slot().queued_on(), None);

        // the unlock finds an empty queue and preposts instead of signaling
        assert_eq!(kernel.mutex_drop(&a, ADDR, 2 * INC, INC, SyncFlags(0)).unwrap(), 0);
    }
}
