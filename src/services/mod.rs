/*!
 * External Services
 *
 * Collaborators the engine consumes by contract only:
 * - blocking and wakeup of execution contexts (`WaitService`)
 * - address to cross-process identity resolution (`IdentityResolver`)
 */

mod parker;
mod resolver;

pub use parker::ThreadParker;
pub use resolver::{IdentityResolver, SharedMapping, SharedMappingTable};

use crate::context::{ContextRef, WaitReason};
use crate::core::types::KwqId;
use std::time::Instant;

/// Parameters of a single park
#[derive(Debug, Clone)]
pub struct ParkRequest {
    /// Queue the context is blocked on
    pub key: KwqId,
    pub reason: WaitReason,
    pub deadline: Option<Instant>,
}

/// How a park ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A waker delivered a grant into the slot
    Woken,
    TimedOut,
    Interrupted,
}

/// Result of a wake attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeStatus {
    Delivered,
    /// Target already left via timeout or interrupt
    NotWaiting,
}

/// Blocking and wakeup primitive
///
/// The slot of a context handed to `park` has already been armed under the
/// queue lock. `wake` stores `update` into the target's slot before trying to
/// resume it, so a target that lost the race can still read what was granted.
///
/// # Priority inheritance
///
/// Waiters on a key may lend their priority to one inheritor, the object's
/// owner. Every call that touches that chain (`prepare`, `wake`,
/// `update_inheritor`, `cleanup`) is made under the queue lock, so the chain
/// always agrees with the owner the queue records. `park` only blocks.
pub trait WaitService: Send + Sync {
    /// Join `key`'s chain and lend `cx`'s priority to `inheritor`
    fn prepare(&self, key: KwqId, cx: &ContextRef, inheritor: Option<&ContextRef>);

    fn park(&self, cx: &ContextRef, request: ParkRequest) -> WaitOutcome;

    /// Resume `target`, already unlinked from `key`
    ///
    /// `target` leaves the chain. With `inheritor` set, the remaining waiters
    /// move their push onto it; `None` leaves the chain as it is.
    fn wake(
        &self,
        key: KwqId,
        target: &ContextRef,
        update: u32,
        inheritor: Option<&ContextRef>,
    ) -> WakeStatus;

    /// The owner of `key` changed; `None` drops every push
    fn update_inheritor(&self, key: KwqId, inheritor: Option<&ContextRef>);

    /// `cx` left `key` without a wake (timeout, interrupt)
    fn cleanup(&self, key: KwqId, cx: &ContextRef);

    fn name(&self) -> &'static str;
}
