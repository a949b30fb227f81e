/*!
 * Read-Write Lock Protocol
 *
 * Readers and writers queue separately; every unlock grants to whichever
 * side holds the lowest sequence. A read grant takes every reader below the
 * lowest writer (or all of them when no writer waits) in one go, a write
 * grant takes exactly one writer.
 *
 * When no writer is pending after a read grant the lock enters an overlap
 * round: late readers whose `rw_wc` falls inside the granted range are let in
 * without queueing.
 *
 * Unlocks that arrive before the waiters they are meant for are preposted
 * with the number of missing waiters; the last of them to arrive performs the
 * grant on the unlocker's behalf.
 */

use super::{traced, wait_error, PsynchKernel, SyncFlags};
use crate::context::{ContextRef, WaitReason};
use crate::core::errors::PsynchError;
use crate::core::types::{Address, PsynchResult};
use crate::kwq::{AcquireMode, Baseline, BlockOn, InterruptKind, KwqState, KwqType, QueueRole, WaitQueue};
use crate::monitoring::span_entry;
use crate::queue::Fit;
use crate::seq::bits::{
    is_rwl_wbit_set, is_rws_savemask_set, is_rws_sbit_set, L_EBIT, L_KBIT, L_MBIT, L_WBIT,
    RWL_INIT,
};
use crate::seq::{
    count, find_diff, is_higher_eq, is_lower, is_lower_eq, SeqWord, BIT_MASK, COUNT_SHIFT, INC,
};
use crate::services::{WaitOutcome, WakeStatus};
use log::debug;
use std::time::Instant;

/// Outcome of an unlock hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Grant {
    bits: u32,
    /// The preposted caller driving the hand-off still has to wait
    block: bool,
}

/// Lowest of a queue head and an optional preposted caller
fn lowest(head: Option<SeqWord>, preposted: Option<SeqWord>) -> Option<SeqWord> {
    match (head, preposted) {
        (Some(h), Some(p)) if is_lower(p, h) => Some(p),
        (Some(h), _) => Some(h),
        (None, p) => p,
    }
}

impl PsynchKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn rw_rdlock(
        &self,
        cx: &ContextRef,
        addr: Address,
        lgen: SeqWord,
        ugen: SeqWord,
        rw_wc: SeqWord,
        flags: SyncFlags,
        deadline: Option<Instant>,
    ) -> PsynchResult<u32> {
        let span = span_entry("rw_rdlock", cx.tid(), addr);
        traced(
            span,
            self.rw_lock(cx, addr, lgen, ugen, rw_wc, flags, deadline, QueueRole::Read),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rw_wrlock(
        &self,
        cx: &ContextRef,
        addr: Address,
        lgen: SeqWord,
        ugen: SeqWord,
        rw_wc: SeqWord,
        flags: SyncFlags,
        deadline: Option<Instant>,
    ) -> PsynchResult<u32> {
        let span = span_entry("rw_wrlock", cx.tid(), addr);
        traced(
            span,
            self.rw_lock(cx, addr, lgen, ugen, rw_wc, flags, deadline, QueueRole::Write),
        )
    }

    pub fn rw_longrdlock(&self, cx: &ContextRef, addr: Address) -> PsynchResult<u32> {
        let span = span_entry("rw_longrdlock", cx.tid(), addr);
        traced(span, Err(PsynchError::NotSupported("long read locks".into())))
    }

    pub fn rw_yieldwrlock(&self, cx: &ContextRef, addr: Address) -> PsynchResult<u32> {
        let span = span_entry("rw_yieldwrlock", cx.tid(), addr);
        traced(span, Err(PsynchError::NotSupported("yielding write locks".into())))
    }

    /// Post an unlock covering every generation up to `lgen`
    ///
    /// Returns the bits granted, `lgen` when the unlock was preposted, or 0
    /// for a stale unlock.
    pub fn rw_unlock(
        &self,
        cx: &ContextRef,
        addr: Address,
        lgen: SeqWord,
        ugen: SeqWord,
        rw_wc: SeqWord,
        flags: SyncFlags,
    ) -> PsynchResult<u32> {
        let span = span_entry("rw_unlock", cx.tid(), addr);
        let result = self
            .acquire(
                cx,
                addr,
                flags,
                KwqType::RwLock,
                AcquireMode::Drop,
                Baseline::new(lgen, ugen, rw_wc),
            )
            .map(|kwq| self.rw_unlock_locked(&kwq, lgen, ugen, rw_wc));
        traced(span, result)
    }

    fn rw_unlock_locked(&self, kwq: &WaitQueue, lgen: SeqWord, ugen: SeqWord, rw_wc: SeqWord) -> u32 {
        let curgen = count(lgen);
        let mut state = kwq.lock();
        let isinit = state.check_init(lgen);

        if state.last_unlock_seq != RWL_INIT && is_lower(ugen, state.last_unlock_seq) {
            debug!("{} stale unlock at {:#x}", kwq.id(), ugen);
            return 0;
        }

        let owed = find_diff(lgen, ugen);
        let (found, seen) = state.find_seq_till(curgen, owed);

        let mut reinit_consumed = false;
        let bits = if !found {
            // not everyone covered by this unlock has arrived yet
            if is_rws_sbit_set(state.prepost.sseq) || is_higher_eq(rw_wc, state.prepost.sseq) {
                state.mark_preposted_wakeup(owed - seen, curgen, rw_wc);
                debug!(
                    "{} unlock preposted for {} at {:#x}",
                    kwq.id(),
                    owed - seen,
                    curgen
                );
                lgen
            } else {
                0
            }
        } else {
            if isinit && state.flags.init_cleared {
                state.flags.init_cleared = false;
                reinit_consumed = true;
            }
            state.clear_preposted_wakeup();
            self.rw_handle_unlock(&mut state, rw_wc, None).bits
        };

        if reinit_consumed && state.intr.count > 0 {
            state.flags.init_cleared = true;
        }
        bits
    }

    #[allow(clippy::too_many_arguments)]
    fn rw_lock(
        &self,
        cx: &ContextRef,
        addr: Address,
        lgen: SeqWord,
        ugen: SeqWord,
        rw_wc: SeqWord,
        flags: SyncFlags,
        deadline: Option<Instant>,
        role: QueueRole,
    ) -> PsynchResult<u32> {
        let kwq = self.acquire(
            cx,
            addr,
            flags,
            KwqType::RwLock,
            AcquireMode::Wait,
            Baseline::new(lgen, ugen, rw_wc),
        )?;
        let lockseq = count(lgen);
        let mut state = kwq.lock();
        state.check_init(lgen);

        if let Some(bits) = state.take_interrupted_wakeup(InterruptKind::from(role), lockseq) {
            return Ok(bits);
        }

        if role == QueueRole::Read
            && state.flags.overlap_guard
            && !is_rws_savemask_set(rw_wc)
            && !is_rwl_wbit_set(lgen)
            && (is_lower_eq(rw_wc, state.next_seq_word) || is_higher_eq(state.last_seq_word, rw_wc))
        {
            state.next_seq_word = state.next_seq_word.wrapping_add(INC);
            debug!("{} overlap grant at {:#x}", kwq.id(), lockseq);
            return Ok(INC | (state.next_seq_word & BIT_MASK) | L_MBIT);
        }

        if state.prepost.count != 0 && is_lower_eq(lockseq, state.prepost.lseq) {
            state.prepost.count -= 1;
            if state.prepost.count == 0 {
                // last expected arrival performs the preposted unlock
                let pp_sseq = state.prepost.sseq;
                state.clear_preposted_wakeup();
                state.flags.init_cleared = false;
                let grant = self.rw_handle_unlock(&mut state, pp_sseq, Some((role, lockseq)));
                if !grant.block {
                    return Ok(grant.bits);
                }
            }
        }

        let on = BlockOn {
            role,
            seq: lgen,
            fit: Fit::SequenceOrdered,
            reason: match role {
                QueueRole::Read => WaitReason::RwLockRead,
                QueueRole::Write => WaitReason::RwLockWrite,
            },
            deadline,
            inheritor: None,
        };
        let outcome = self.park(&kwq, state, cx, on)?;

        if outcome != WaitOutcome::Woken {
            kwq.lock().remove_waiter(role, cx);
            return Err(wait_error(outcome, 0));
        }
        Ok(cx.slot().retval())
    }

    /// Grant the lock to the lowest pending sequence
    ///
    /// `prepost` names the caller performing a preposted unlock; it is
    /// counted as a waiter but never queued.
    ///
    /// # Panics
    ///
    /// If nobody, queued or preposted, is there to grant to, or a grant
    /// leaves a queued writer without the W bit.
    fn rw_handle_unlock(
        &self,
        state: &mut KwqState,
        rw_wc: SeqWord,
        prepost: Option<(QueueRole, SeqWord)>,
    ) -> Grant {
        state.last_seq_word = rw_wc;
        state.last_unlock_seq = count(rw_wc);
        state.flags.overlap_guard = false;

        let pre = |role: QueueRole| {
            prepost
                .filter(|(r, _)| *r == role)
                .map(|(_, seq)| count(seq))
        };
        let head = |state: &KwqState, role: QueueRole| {
            let q = state.queue(role);
            (!q.is_empty()).then(|| q.first())
        };
        let pre_reader = pre(QueueRole::Read);
        let pre_writer = pre(QueueRole::Write);
        let low_reader = lowest(head(&*state, QueueRole::Read), pre_reader);
        let low_writer = lowest(head(&*state, QueueRole::Write), pre_writer);

        let read_wins = match (low_reader, low_writer) {
            (Some(r), Some(w)) => is_lower_eq(r, w),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => panic!("rwlock unlock with no reader or writer pending"),
        };

        let mut bits = 0;
        let mut block = true;

        if read_wins {
            let limit = match low_writer {
                Some(writer) => {
                    bits |= L_WBIT | L_KBIT;
                    let mut needed = state.queue(QueueRole::Read).count_up_to(writer);
                    if pre_reader.is_some_and(|p| is_lower(p, writer)) {
                        needed += 1;
                        block = false;
                    }
                    bits = bits.wrapping_add(needed << COUNT_SHIFT);
                    Some(writer)
                }
                None => {
                    state.flags.overlap_guard = true;
                    let mut needed = state.queue(QueueRole::Read).len() as u32;
                    if pre_reader.is_some() {
                        needed += 1;
                        block = false;
                    }
                    bits = bits.wrapping_add(needed << COUNT_SHIFT);
                    None
                }
            };
            state.next_seq_word = count(rw_wc).wrapping_add(bits);

            let mut failed = 0;
            while let Some(first) = head(&*state, QueueRole::Read) {
                if limit.is_some_and(|writer| !is_lower(first, writer)) {
                    break;
                }
                let (status, _) = state.signal(QueueRole::Read, None, bits, self.waiter());
                if status == WakeStatus::NotWaiting {
                    failed += 1;
                }
            }
            if failed > 0 {
                state.mark_interrupted_wakeup(InterruptKind::Read, failed, limit.unwrap_or(0), bits);
            }

            if !state.queue(QueueRole::Write).is_empty() && !is_rwl_wbit_set(bits) {
                panic!("read grant {:#x} leaves writers queued without the W bit", bits);
            }
        } else {
            let writer = low_writer.unwrap_or_default();
            bits = INC | L_KBIT | L_EBIT;

            if pre_writer == Some(writer) {
                block = false;
                if !state.queue(QueueRole::Write).is_empty() {
                    bits |= L_WBIT;
                }
            } else {
                if state.queue(QueueRole::Write).len() > 1 || pre_writer.is_some() {
                    bits |= L_WBIT;
                }
                let index = state.queue(QueueRole::Write).position_of_seq(writer);
                let (status, _) = state.signal(QueueRole::Write, index, bits, self.waiter());
                if status == WakeStatus::NotWaiting {
                    state.mark_interrupted_wakeup(InterruptKind::Write, 1, writer, bits);
                }
            }
            state.next_seq_word = count(rw_wc).wrapping_add(bits);

            if bits & (L_KBIT | L_EBIT) != L_KBIT | L_EBIT {
                panic!("write grant {:#x} without K and E", bits);
            }
        }

        Grant { bits, block }
    }
}
