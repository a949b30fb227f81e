/*!
 * Condition Variable Protocol
 *
 * Three generation words drive a condvar: L counts waits issued, U counts
 * wakeups userspace has acknowledged and S counts signals the kernel has
 * credited. `L == S` means nothing is owed; the kernel then drops its
 * view of the words and adopts the caller's on next use.
 *
 * Signals that find no waiter are recorded as prepost elements, broadcasts
 * as broadcast elements, both on the write queue beside real waiters.
 */

use super::{traced, wait_error, PsynchKernel, SyncFlags};
use crate::context::{ContextRef, WaitReason};
use crate::core::errors::PsynchError;
use crate::core::types::{Address, PsynchResult, Tid};
use crate::kwq::{AcquireMode, Baseline, BlockOn, KwqState, KwqType, QueueRole, WaitQueue};
use crate::monitoring::{span_entry, Violation};
use crate::queue::{ElementKind, Fit, OrderedQueue, WaitElement};
use crate::seq::bits::{CV_CBIT, CV_CLEARED, CV_MBIT, CV_PBIT, CV_PREPOST, L_MTX_WAIT};
use crate::seq::{count, is_higher, is_higher_eq, is_lower, is_lower_eq, SeqWord, COUNT_SHIFT, INC};
use crate::services::WaitOutcome;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Mutex released on the caller's behalf before a condvar wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexDrop {
    pub addr: Address,
    pub mgen: SeqWord,
    pub ugen: SeqWord,
}

/// How a condvar wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondWakeKind {
    /// Woken by a signal or broadcast; the mutex must be re-contended
    Signaled,
    /// A pending signal was consumed without blocking
    Preposted,
    /// Released because userspace reinitialized the condvar
    Spurious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondWaitReturn {
    pub bits: u32,
    pub kind: CondWakeKind,
}

impl CondWaitReturn {
    fn from_grant(retval: u32) -> Self {
        if retval & CV_MBIT != 0 {
            Self {
                bits: INC | CV_CBIT,
                kind: CondWakeKind::Spurious,
            }
        } else {
            Self {
                bits: 0,
                kind: CondWakeKind::Signaled,
            }
        }
    }

    pub fn relock_pending(&self) -> bool {
        self.kind == CondWakeKind::Signaled
    }
}

impl From<CondWaitReturn> for u32 {
    fn from(ret: CondWaitReturn) -> u32 {
        ret.bits
    }
}

/// Element a signal up to `upto` should land on
///
/// Placeholders at or above `upto` absorb the signal. Among waiters at or
/// below `upto` the first one at or above `signalseq` wins, else the lowest.
fn find_signal_seq(queue: &OrderedQueue, upto: SeqWord, signalseq: SeqWord) -> Option<usize> {
    let mut eligible = None;
    for (index, element) in queue.iter().enumerate() {
        let seq = element.seq();
        match element.kind() {
            ElementKind::Prepost | ElementKind::Broadcast => {
                if element.is_prepost() && is_higher(seq, upto) {
                    return eligible;
                }
                if is_lower(seq, upto) {
                    continue;
                }
                return Some(index);
            }
            ElementKind::Waiting(cx) => {
                if is_higher(seq, upto) {
                    return eligible;
                }
                if !cx.is_cancelled() {
                    if is_higher_eq(seq, signalseq) {
                        return Some(index);
                    }
                    eligible.get_or_insert(index);
                }
            }
        }
    }
    eligible
}

/// First element at or above `cgen`; a waiter only counts on an exact match
fn find_prepost_seq(queue: &OrderedQueue, cgen: SeqWord) -> Option<usize> {
    let index = queue.iter().position(|e| is_higher_eq(e.seq(), cgen))?;
    match queue.get(index) {
        Some(e) if e.is_waiting() && e.seq() != count(cgen) => None,
        _ => Some(index),
    }
}

impl PsynchKernel {
    /// Signal one waiter, or a specific thread when `target_tid` is non-zero
    #[allow(clippy::too_many_arguments)]
    pub fn cond_signal(
        &self,
        cx: &ContextRef,
        cv: Address,
        cgen: SeqWord,
        cugen: SeqWord,
        csgen: SeqWord,
        target_tid: Tid,
        flags: SyncFlags,
    ) -> PsynchResult<u32> {
        let span = span_entry("cond_signal", cx.tid(), cv);
        traced(
            span,
            self.cv_post(cx, cv, cgen, cugen, csgen, target_tid, false, flags),
        )
    }

    /// Wake every waiter up to `cgen`
    ///
    /// `diffgen` is userspace's count of outstanding waiters, shifted.
    #[allow(clippy::too_many_arguments)]
    pub fn cond_broadcast(
        &self,
        cx: &ContextRef,
        cv: Address,
        cgen: SeqWord,
        cugen: SeqWord,
        csgen: SeqWord,
        diffgen: u32,
        flags: SyncFlags,
    ) -> PsynchResult<u32> {
        let span = span_entry("cond_broadcast", cx.tid(), cv);
        let outstanding = diffgen >> COUNT_SHIFT;
        if outstanding > self.config().max_threads {
            self.diagnostics.report(
                Violation::ThreadLimit,
                format_args!("broadcast of {} waiters at {:#x}", outstanding, cv),
            );
            return traced(
                span,
                Err(PsynchError::Busy(format!(
                    "{} waiters exceeds thread limit",
                    outstanding
                ))),
            );
        }
        traced(span, self.cv_post(cx, cv, cgen, cugen, csgen, 0, true, flags))
    }

    /// Wait on the condvar at `cv`, first releasing `mutex` if given
    #[allow(clippy::too_many_arguments)]
    pub fn cond_wait(
        &self,
        cx: &ContextRef,
        cv: Address,
        cgen: SeqWord,
        cugen: SeqWord,
        csgen: SeqWord,
        mutex: Option<MutexDrop>,
        flags: SyncFlags,
        deadline: Option<Instant>,
    ) -> PsynchResult<CondWaitReturn> {
        let span = span_entry("cond_wait", cx.tid(), cv);
        let result = self.cv_wait_inner(cx, cv, cgen, cugen, csgen, mutex, flags, deadline);
        match &result {
            Ok(ret) => span.record_bits(ret.bits),
            Err(e) => span.record_error(e.errno()),
        }
        result
    }

    /// Drop stale preposts
    ///
    /// With the mutex flag this clears a first-fit mutex prepost at or below
    /// `cvgen`; otherwise it evicts condvar placeholders up to `preposeq`.
    #[allow(clippy::too_many_arguments)]
    pub fn cond_clear_prepost(
        &self,
        cx: &ContextRef,
        addr: Address,
        cvgen: SeqWord,
        cvugen: SeqWord,
        cvsgen: SeqWord,
        preposeq: SeqWord,
        flags: SyncFlags,
    ) -> PsynchResult<u32> {
        let span = span_entry("cond_clear_prepost", cx.tid(), addr);

        let result = if flags.clears_mutex() {
            self.acquire(
                cx,
                addr,
                flags,
                KwqType::Mutex,
                AcquireMode::Drop,
                Baseline::new(cvgen, cvugen, 0),
            )
            .map(|kwq| {
                let mut state = kwq.lock();
                if flags.is_first_fit()
                    && state.prepost.count != 0
                    && is_lower_eq(state.prepost.lseq, cvgen)
                {
                    debug!("{} cleared mutex prepost at {:#x}", kwq.id(), state.prepost.lseq);
                    state.clear_preposted_wakeup();
                }
                0
            })
        } else {
            self.acquire(
                cx,
                addr,
                flags,
                KwqType::CondVar,
                AcquireMode::Drop,
                Baseline::new(cvgen, cvugen, cvsgen),
            )
            .map(|kwq| {
                let mut state = kwq.lock();
                self.cv_free_items(&mut state, preposeq, false);
                0
            })
        };
        traced(span, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn cv_post(
        &self,
        cx: &ContextRef,
        cv: Address,
        cgen: SeqWord,
        cugen: SeqWord,
        csgen: SeqWord,
        target_tid: Tid,
        broadcast: bool,
        flags: SyncFlags,
    ) -> PsynchResult<u32> {
        let upto = count(cgen);
        let fromseq = count(cugen).wrapping_add(INC);

        if (target_tid == 0 && is_higher(fromseq, upto)) || is_higher(csgen, upto) {
            self.diagnostics.report(
                Violation::InvalidSequence,
                format_args!("cv post L {:#x} U {:#x} S {:#x}", cgen, cugen, csgen),
            );
            return Err(PsynchError::invalid("inconsistent L, U and S"));
        }

        let target = match target_tid {
            0 => None,
            tid => Some(
                self.contexts
                    .lookup(tid)
                    .ok_or(PsynchError::ContextNotFound(tid))?,
            ),
        };

        let kwq = self.acquire(
            cx,
            cv,
            flags,
            KwqType::CondVar,
            AcquireMode::Drop,
            Baseline::new(cgen, cugen, csgen),
        )?;
        let mut state = kwq.lock();
        state.update_cv(cgen, cugen, csgen);

        let mut bits = 0;
        let mut broadcast = broadcast;
        if !broadcast && count(state.lword) != count(state.sword) {
            broadcast = self.cv_signal_one(&kwq, &mut state, target.as_ref(), upto, fromseq, &mut bits)?;
        }
        if broadcast {
            self.cv_broadcast_upto(&mut state, upto, &mut bits)?;
        }

        state.sword = state.sword.wrapping_add(count(bits));
        self.cv_fixup(&mut state, &mut bits);
        Ok(bits)
    }

    /// Deliver one signal; returns true when it must become a broadcast
    fn cv_signal_one(
        &self,
        kwq: &WaitQueue,
        state: &mut KwqState,
        target: Option<&ContextRef>,
        upto: SeqWord,
        signalseq: SeqWord,
        bits: &mut u32,
    ) -> PsynchResult<bool> {
        let found = match target {
            Some(t) => {
                let slot = t.slot();
                if slot.queued_on() != Some(kwq.id()) || is_higher(slot.lockseq(), upto) {
                    return Ok(true);
                }
                match state.queue(QueueRole::Write).position_of(t) {
                    Some(index) => Some(index),
                    None => return Ok(true),
                }
            }
            None => find_signal_seq(state.queue(QueueRole::Write), upto, signalseq),
        };

        let Some(index) = found else {
            state.insert_fake(WaitElement::prepost(upto))?;
            return Ok(false);
        };

        let (seq, waiting, prepost) = match state.queue(QueueRole::Write).get(index) {
            Some(e) => (e.seq(), e.is_waiting(), e.is_prepost()),
            None => return Ok(false),
        };

        if waiting {
            if is_lower(seq, signalseq) {
                // a plain signal could strand the sequence it was meant for
                return Ok(true);
            }
            state.signal(QueueRole::Write, Some(index), L_MTX_WAIT, self.waiter());
            *bits = bits.wrapping_add(INC);
        } else if prepost {
            if let Some(e) = state.queue_mut(QueueRole::Write).get_mut(index) {
                e.count += 1;
            }
        }
        Ok(false)
    }

    /// Wake every live waiter up to `upto` and fold placeholders into one broadcast
    fn cv_broadcast_upto(
        &self,
        state: &mut KwqState,
        upto: SeqWord,
        bits: &mut u32,
    ) -> PsynchResult<()> {
        let mut woken = 0u32;
        let mut index = 0;
        loop {
            let Some((seq, waiting, cancelled)) = state
                .queue(QueueRole::Write)
                .get(index)
                .map(|e| (e.seq(), e.is_waiting(), e.is_cancelled_waiter()))
            else {
                break;
            };
            if is_higher(seq, upto) {
                break;
            }
            if !waiting {
                state.remove_at(QueueRole::Write, index);
            } else if cancelled {
                index += 1;
            } else {
                state.signal(QueueRole::Write, Some(index), L_MTX_WAIT, self.waiter());
                woken = woken.wrapping_add(INC);
            }
        }

        if count(state.lword) != count(state.sword) {
            state.insert_fake(WaitElement::broadcast(upto))?;
        }
        *bits |= woken;
        Ok(())
    }

    /// Reset once L == S, or flag a queue holding only placeholders
    fn cv_fixup(&self, state: &mut KwqState, bits: &mut u32) {
        if count(state.lword) == count(state.sword) {
            if state.inqueue != 0 {
                let upto = state.lword;
                self.cv_free_items(state, upto, false);
            }
            state.lword = 0;
            state.uword = 0;
            state.sword = 0;
            state.flags.zeroed_out = true;
            *bits |= CV_CBIT;
        } else if state.inqueue != 0 && state.fakecount == state.inqueue {
            *bits |= CV_PBIT;
        }
    }

    /// Evict placeholders and release waiters as spurious, up to `upto` or all
    fn cv_free_items(&self, state: &mut KwqState, upto: SeqWord, all: bool) {
        while let Some((seq, waiting)) = state
            .queue(QueueRole::Write)
            .front()
            .map(|e| (e.seq(), e.is_waiting()))
        {
            if !all && is_higher(seq, upto) {
                break;
            }
            if waiting {
                state.signal(
                    QueueRole::Write,
                    Some(0),
                    INC | CV_MBIT | L_MTX_WAIT,
                    self.waiter(),
                );
            } else {
                state.remove_at(QueueRole::Write, 0);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cv_wait_inner(
        &self,
        cx: &ContextRef,
        cv: Address,
        cgen: SeqWord,
        cugen: SeqWord,
        csgen: SeqWord,
        mutex: Option<MutexDrop>,
        flags: SyncFlags,
        deadline: Option<Instant>,
    ) -> PsynchResult<CondWaitReturn> {
        let lockseq = count(cgen);
        if is_higher_eq(csgen, lockseq) {
            self.diagnostics.report(
                Violation::InvalidSequence,
                format_args!("cv wait at {:#x} with S {:#x}", cgen, csgen),
            );
            return Err(PsynchError::invalid("S at or above the wait sequence"));
        }

        let kwq = self.acquire(
            cx,
            cv,
            flags,
            KwqType::CondVar,
            AcquireMode::Wait,
            Baseline::new(cgen, cugen, csgen),
        )?;

        // the mutex must be released in the kernel before the wait is visible
        if let Some(m) = mutex {
            let mkwq = self.acquire(
                cx,
                m.addr,
                flags,
                KwqType::Mutex,
                AcquireMode::Drop,
                Baseline::new(m.mgen, m.ugen, 0),
            )?;
            self.mutex_unlock(&mkwq, m.mgen, m.ugen, flags);
        }

        let mut state = kwq.lock();
        state.update_cv(cgen, cugen, csgen);

        let Some(index) = find_prepost_seq(state.queue(QueueRole::Write), lockseq) else {
            let on = BlockOn {
                role: QueueRole::Write,
                seq: cgen,
                fit: Fit::SequenceOrdered,
                reason: WaitReason::CondVar,
                deadline,
                inheritor: None,
            };
            let outcome = self.park(&kwq, state, cx, on)?;
            return self.cv_wait_complete(&kwq, cx, outcome);
        };

        let (seq, kind) = match state.queue(QueueRole::Write).get(index) {
            Some(e) => (e.seq(), e.kind().clone()),
            None => return Err(PsynchError::invalid("prepost vanished")),
        };

        let mut bits = 0;
        match kind {
            ElementKind::Prepost if seq == lockseq => {
                let remaining = match state.queue_mut(QueueRole::Write).get_mut(index) {
                    Some(e) => {
                        e.count -= 1;
                        e.count
                    }
                    None => 0,
                };
                if remaining == 0 {
                    state.remove_at(QueueRole::Write, index);
                }
            }
            ElementKind::Prepost => {
                // a higher prepost belongs to someone else; cover it with a broadcast
                self.cv_broadcast_upto(&mut state, seq, &mut bits)?;
            }
            ElementKind::Broadcast => {}
            ElementKind::Waiting(_) => {
                drop(state);
                self.diagnostics.report(
                    Violation::DuplicateWaiter,
                    format_args!("{} cv wait at {:#x} already queued", kwq.id(), lockseq),
                );
                return Err(PsynchError::Busy(format!(
                    "waiter already queued at {:#x}",
                    lockseq
                )));
            }
        }

        bits |= INC;
        state.sword = state.sword.wrapping_add(INC);
        self.cv_fixup(&mut state, &mut bits);
        Ok(CondWaitReturn {
            bits,
            kind: CondWakeKind::Preposted,
        })
    }

    fn cv_wait_complete(
        &self,
        kwq: &WaitQueue,
        cx: &ContextRef,
        outcome: WaitOutcome,
    ) -> PsynchResult<CondWaitReturn> {
        if outcome == WaitOutcome::Woken {
            return Ok(CondWaitReturn::from_grant(cx.slot().retval()));
        }

        let mut state = kwq.lock();
        // a grant may have landed while we were timing out
        let retval = cx.slot().retval();
        state.remove_waiter(QueueRole::Write, cx);
        if retval & L_MTX_WAIT != 0 {
            return Ok(CondWaitReturn::from_grant(retval));
        }

        state.sword = state.sword.wrapping_add(INC);
        let mut cv_bits = 0;
        if count(state.lword) == count(state.sword) {
            cv_bits |= CV_CLEARED;
            if state.inqueue != 0 {
                let upto = state.lword;
                self.cv_free_items(&mut state, upto, true);
            }
            state.lword = 0;
            state.uword = 0;
            state.sword = 0;
            state.flags.zeroed_out = true;
        } else if state.inqueue != 0 && state.fakecount == state.inqueue {
            cv_bits |= CV_PREPOST;
        }
        Err(wait_error(outcome, cv_bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PsynchConfig;
    use std::sync::Arc;
    use std::time::Duration;

    const CV: Address = 0x9000;

    fn kernel() -> PsynchKernel {
        PsynchKernel::new(PsynchConfig::manual())
    }

    #[test]
    fn test_signal_before_wait_is_consumed() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);

        let bits = kernel
            .cond_signal(&a, CV, INC, 0, 0, 0, SyncFlags(0))
            .unwrap();
        assert_eq!(bits, CV_PBIT);

        let ret = kernel
            .cond_wait(&a, CV, INC, 0, 0, None, SyncFlags(0), None)
            .unwrap();
        assert_eq!(ret.kind, CondWakeKind::Preposted);
        assert_eq!(ret.bits, INC | CV_CBIT);
    }

    #[test]
    fn test_signal_when_balanced_is_noop() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        // L == S == 2
        let bits = kernel
            .cond_signal(&a, CV, 2 * INC, INC, 2 * INC, 0, SyncFlags(0))
            .unwrap();
        assert_eq!(bits, CV_CBIT);
        assert_eq!(kernel.diagnostics().total(), 0);
    }

    #[test]
    fn test_invalid_words_rejected() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        // U + 1 beyond L
        let err = kernel
            .cond_signal(&a, CV, INC, INC, 0, 0, SyncFlags(0))
            .unwrap_err();
        assert_eq!(err.errno(), crate::core::errors::errno::EINVAL);
        // S at L on wait
        let err = kernel
            .cond_wait(&a, CV, INC, 0, INC, None, SyncFlags(0), None)
            .unwrap_err();
        assert_eq!(err.errno(), crate::core::errors::errno::EINVAL);
        assert!(kernel.registry().is_empty());
    }

    #[test]
    fn test_unknown_target_thread() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        let err = kernel
            .cond_signal(&a, CV, INC, 0, 0, 99, SyncFlags(0))
            .unwrap_err();
        assert_eq!(err, PsynchError::ContextNotFound(99));
    }

    #[test]
    fn test_find_signal_seq_prefers_signal_sequence() {
        let mut queue = OrderedQueue::new();
        for (tid, seq) in [(1, 3), (2, 5), (3, 9)] {
            let cx = Arc::new(crate::context::ThreadContext::new(1, tid));
            queue
                .insert(WaitElement::waiting(cx, seq * INC), Fit::SequenceOrdered)
                .unwrap();
        }
        assert_eq!(find_signal_seq(&queue, 6 * INC, 4 * INC), Some(1));
        assert_eq!(find_signal_seq(&queue, 6 * INC, 7 * INC), Some(0));
        assert_eq!(find_signal_seq(&queue, 2 * INC, INC), None);
    }

    #[test]
    fn test_timed_out_wait_drains_condvar() {
        let kernel = kernel();
        let a = kernel.register_thread(1, 10);
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = kernel
            .cond_wait(&a, CV, INC, 0, 0, None, SyncFlags(0), Some(deadline))
            .unwrap_err();
        assert!(matches!(err, PsynchError::TimedOut { .. }));
        assert!(err.cv_cleared());
    }
}
