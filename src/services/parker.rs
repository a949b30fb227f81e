/*!
 * Thread Parker
 *
 * Default `WaitService` built on parking_lot_core. Each context parks on the
 * address of its own wait slot, so wakeups are always targeted and no key
 * sharing can cause cross-talk.
 *
 * Priority chains are kept per queue: the waiters lending their priority and
 * the context they lend it to. A chain exists only while it has members.
 */

use super::{ParkRequest, WaitOutcome, WaitService, WakeStatus};
use crate::context::{ContextRef, SlotState};
use crate::core::types::KwqId;
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot_core::{park, unpark_all, ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::sync::Arc;
use std::time::Instant;

/// Waiters of one queue and the context they push onto
#[derive(Debug, Default)]
struct Chain {
    inheritor: Option<ContextRef>,
    members: Vec<ContextRef>,
}

impl Chain {
    fn retarget(&mut self, inheritor: Option<&ContextRef>) {
        for member in &self.members {
            member.push_onto(inheritor);
        }
        self.inheritor = inheritor.cloned();
    }

    fn leave(&mut self, cx: &ContextRef) -> bool {
        match self.members.iter().position(|m| Arc::ptr_eq(m, cx)) {
            Some(index) => {
                self.members.swap_remove(index).push_onto(None);
                true
            }
            None => false,
        }
    }
}

/// Parks OS threads directly
#[derive(Debug, Default)]
pub struct ThreadParker {
    chains: DashMap<KwqId, Chain, RandomState>,
}

impl ThreadParker {
    pub fn new() -> Self {
        Self {
            chains: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Waiters currently lending priority through `key`
    pub fn chain_len(&self, key: KwqId) -> usize {
        self.chains.get(&key).map_or(0, |chain| chain.members.len())
    }

    fn leave(&self, key: KwqId, cx: &ContextRef) {
        let emptied = match self.chains.get_mut(&key) {
            Some(mut chain) => chain.leave(cx) && chain.members.is_empty(),
            None => false,
        };
        if emptied {
            self.chains.remove_if(&key, |_, chain| chain.members.is_empty());
        }
    }
}

impl WaitService for ThreadParker {
    fn prepare(&self, key: KwqId, cx: &ContextRef, inheritor: Option<&ContextRef>) {
        let mut chain = self.chains.entry(key).or_default();
        chain.retarget(inheritor);
        if !chain.members.iter().any(|m| Arc::ptr_eq(m, cx)) {
            cx.push_onto(inheritor);
            chain.members.push(Arc::clone(cx));
        }
    }

    fn park(&self, cx: &ContextRef, request: ParkRequest) -> WaitOutcome {
        let slot = cx.slot();
        let key = slot.park_key();

        loop {
            if slot.state() != SlotState::Waiting {
                // the grant won; an interrupt aimed at this wait is spent
                cx.clear_interrupt();
                return WaitOutcome::Woken;
            }

            if cx.interrupt_pending() {
                if slot.abandon() {
                    cx.clear_interrupt();
                    return WaitOutcome::Interrupted;
                }
                continue;
            }

            if request.deadline.is_some_and(|d| Instant::now() >= d) {
                if slot.abandon() {
                    return WaitOutcome::TimedOut;
                }
                continue;
            }

            // SAFETY: key is the address of the context's own slot; the
            // context outlives the park since we hold a reference to it
            let result = unsafe {
                park(
                    key,
                    || slot.state() == SlotState::Waiting && !cx.interrupt_pending(),
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    request.deadline,
                )
            };

            if let ParkResult::TimedOut = result {
                if slot.abandon() {
                    return WaitOutcome::TimedOut;
                }
            }
            // Unparked or Invalid: loop re-examines the slot
        }
    }

    fn wake(
        &self,
        key: KwqId,
        target: &ContextRef,
        update: u32,
        inheritor: Option<&ContextRef>,
    ) -> WakeStatus {
        self.leave(key, target);
        if inheritor.is_some() {
            self.update_inheritor(key, inheritor);
        }

        let slot = target.slot();
        slot.store_retval(update);
        if !slot.grant() {
            return WakeStatus::NotWaiting;
        }
        // SAFETY: key is the slot address of a live context
        unsafe {
            unpark_all(slot.park_key(), DEFAULT_UNPARK_TOKEN);
        }
        WakeStatus::Delivered
    }

    fn update_inheritor(&self, key: KwqId, inheritor: Option<&ContextRef>) {
        if let Some(mut chain) = self.chains.get_mut(&key) {
            chain.retarget(inheritor);
        }
    }

    fn cleanup(&self, key: KwqId, cx: &ContextRef) {
        self.leave(key, cx);
    }

    fn name(&self) -> &'static str {
        "thread-parker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ThreadContext, WaitReason};
    use std::thread;
    use std::time::Duration;

    const KEY: KwqId = KwqId(1);

    fn request(deadline: Option<Instant>) -> ParkRequest {
        ParkRequest {
            key: KEY,
            reason: WaitReason::Mutex,
            deadline,
        }
    }

    fn cx(tid: u64) -> ContextRef {
        Arc::new(ThreadContext::new(1, tid))
    }

    #[test]
    fn test_wake_delivers_update() {
        let parker = Arc::new(ThreadParker::new());
        let cx = cx(1);
        cx.slot().prepare(KEY, 0x100);

        let (p, c) = (parker.clone(), cx.clone());
        let handle = thread::spawn(move || p.park(&c, request(None)));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(parker.wake(KEY, &cx, 0x103, None), WakeStatus::Delivered);
        assert_eq!(handle.join().unwrap(), WaitOutcome::Woken);
        assert_eq!(cx.slot().retval(), 0x103);
    }

    #[test]
    fn test_timeout_then_wake_is_not_waiting() {
        let parker = ThreadParker::new();
        let cx = cx(2);
        cx.slot().prepare(KEY, 0x100);

        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(parker.park(&cx, request(Some(deadline))), WaitOutcome::TimedOut);
        assert_eq!(parker.wake(KEY, &cx, 0x20, None), WakeStatus::NotWaiting);
        assert_eq!(cx.slot().retval(), 0x20);
    }

    #[test]
    fn test_interrupt_before_park() {
        let parker = ThreadParker::new();
        let cx = cx(3);
        cx.slot().prepare(KEY, 0x100);
        cx.interrupt();
        assert_eq!(parker.park(&cx, request(None)), WaitOutcome::Interrupted);
        assert!(!cx.interrupt_pending());
    }

    #[test]
    fn test_grant_beating_interrupt_consumes_it() {
        let parker = ThreadParker::new();
        let cx = cx(4);
        cx.slot().prepare(KEY, 0x100);
        assert_eq!(parker.wake(KEY, &cx, 0x3, None), WakeStatus::Delivered);
        cx.interrupt();

        assert_eq!(parker.park(&cx, request(None)), WaitOutcome::Woken);
        assert!(!cx.interrupt_pending());

        // the next wait is not cut short by the spent interrupt
        cx.slot().prepare(KEY, 0x200);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(parker.park(&cx, request(Some(deadline))), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_chain_follows_inheritor() {
        let parker = ThreadParker::new();
        let (owner, next) = (cx(40), cx(41));
        let (a, b) = (cx(42), cx(43));

        parker.prepare(KEY, &a, Some(&owner));
        parker.prepare(KEY, &b, Some(&owner));
        assert_eq!(owner.inherited_pushes(), 2);
        assert_eq!(a.pushing_on(), Some(40));

        parker.update_inheritor(KEY, Some(&next));
        assert_eq!(owner.inherited_pushes(), 0);
        assert_eq!(next.inherited_pushes(), 2);

        // the woken waiter leaves and the rest push onto it
        a.slot().prepare(KEY, 0x100);
        parker.wake(KEY, &a, 0x3, Some(&a));
        assert_eq!(a.pushing_on(), None);
        assert_eq!(next.inherited_pushes(), 0);
        assert_eq!(a.inherited_pushes(), 1);
        assert_eq!(b.pushing_on(), Some(42));

        parker.cleanup(KEY, &b);
        assert_eq!(a.inherited_pushes(), 0);
        assert_eq!(parker.chain_len(KEY), 0);
    }

    #[test]
    fn test_clearing_inheritor_drops_pushes() {
        let parker = ThreadParker::new();
        let (owner, a) = (cx(50), cx(51));
        parker.prepare(KEY, &a, Some(&owner));
        parker.update_inheritor(KEY, None);
        assert_eq!(owner.inherited_pushes(), 0);
        assert_eq!(a.pushing_on(), None);
        assert_eq!(parker.chain_len(KEY), 1);
    }
}
