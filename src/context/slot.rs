/*!
 * Wait Slot
 *
 * Per-context landing area for a grant. A context owns exactly one slot; a
 * Waiting element on a queue refers to it, and the waker stores the update
 * bits here before trying to resume the context.
 *
 * # State machine
 *
 * `Idle -> Waiting -> {Granted | Abandoned}`. The waker moves
 * `Waiting -> Granted`, the waiter moves `Waiting -> Abandoned` on timeout or
 * interrupt. Exactly one of them wins the compare-exchange.
 */

use crate::core::types::KwqId;
use crate::seq::SeqWord;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

const IDLE: u8 = 0;
const WAITING: u8 = 1;
const GRANTED: u8 = 2;
const ABANDONED: u8 = 3;

/// Observable slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Waiting,
    Granted,
    Abandoned,
}

/// Cache-line aligned so parked contexts don't false-share
#[repr(C, align(64))]
#[derive(Debug)]
pub struct WaitSlot {
    state: AtomicU8,
    retval: AtomicU32,
    lockseq: AtomicU32,
    /// Queue the element is linked on, 0 when unlinked
    queued_on: AtomicU64,
}

impl WaitSlot {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            retval: AtomicU32::new(0),
            lockseq: AtomicU32::new(0),
            queued_on: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            IDLE => SlotState::Idle,
            WAITING => SlotState::Waiting,
            GRANTED => SlotState::Granted,
            _ => SlotState::Abandoned,
        }
    }

    /// Update bits stored by the last waker
    pub fn retval(&self) -> u32 {
        self.retval.load(Ordering::Acquire)
    }

    pub fn lockseq(&self) -> SeqWord {
        self.lockseq.load(Ordering::Relaxed)
    }

    /// Queue this slot's element is linked on
    pub fn queued_on(&self) -> Option<KwqId> {
        match self.queued_on.load(Ordering::Acquire) {
            0 => None,
            id => Some(KwqId(id)),
        }
    }

    /// Stable address used as the parking key
    pub(crate) fn park_key(&self) -> usize {
        &self.state as *const AtomicU8 as usize
    }

    /// Arm for a new wait; called under the queue lock while linking
    pub(crate) fn prepare(&self, kwq: KwqId, lockseq: SeqWord) {
        self.retval.store(0, Ordering::Relaxed);
        self.lockseq.store(lockseq, Ordering::Relaxed);
        self.queued_on.store(kwq.0, Ordering::Release);
        self.state.store(WAITING, Ordering::Release);
    }

    /// Element was unlinked from its queue
    pub(crate) fn unlink(&self) {
        self.queued_on.store(0, Ordering::Release);
    }

    pub(crate) fn store_retval(&self, bits: u32) {
        self.retval.store(bits, Ordering::Release);
    }

    /// Waker side of the race
    pub(crate) fn grant(&self) -> bool {
        self.transition(GRANTED)
    }

    /// Waiter side of the race
    pub(crate) fn abandon(&self) -> bool {
        self.transition(ABANDONED)
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for WaitSlot {
    fn default() -> Self {
        Self::new()
    }
}
