/*!
 * Wait Elements
 *
 * A queued record: either a parked context, or a grant stashed for a waiter
 * that has not arrived yet. Waiting elements only reference the context's own
 * slot and are unlinked, never consumed for their payload; prepost and
 * broadcast elements belong to the queue and are dropped by whoever consumes
 * them.
 */

use crate::context::ContextRef;
use crate::seq::{count, SeqWord};
use std::fmt;
use std::sync::Arc;

/// What an element stands for
#[derive(Clone)]
pub enum ElementKind {
    /// A parked context
    Waiting(ContextRef),
    /// A signal for a waiter yet to arrive; `count` merges repeats
    Prepost,
    /// A broadcast covering everything up to the element's sequence
    Broadcast,
}

#[derive(Clone)]
pub struct WaitElement {
    seq: SeqWord,
    kind: ElementKind,
    pub(crate) count: u32,
}

impl WaitElement {
    pub fn waiting(cx: ContextRef, seq: SeqWord) -> Self {
        Self {
            seq: count(seq),
            kind: ElementKind::Waiting(cx),
            count: 1,
        }
    }

    pub fn prepost(seq: SeqWord) -> Self {
        Self {
            seq: count(seq),
            kind: ElementKind::Prepost,
            count: 1,
        }
    }

    pub fn broadcast(seq: SeqWord) -> Self {
        Self {
            seq: count(seq),
            kind: ElementKind::Broadcast,
            count: 1,
        }
    }

    /// Sequence tag, status bits stripped
    pub fn seq(&self) -> SeqWord {
        self.seq
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn context(&self) -> Option<&ContextRef> {
        match &self.kind {
            ElementKind::Waiting(cx) => Some(cx),
            _ => None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.kind, ElementKind::Waiting(_))
    }

    /// Prepost or broadcast placeholder
    pub fn is_fake(&self) -> bool {
        !self.is_waiting()
    }

    pub fn is_prepost(&self) -> bool {
        matches!(self.kind, ElementKind::Prepost)
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.kind, ElementKind::Broadcast)
    }

    /// Waiting element whose context is being cancelled
    pub fn is_cancelled_waiter(&self) -> bool {
        self.context().is_some_and(|cx| cx.is_cancelled())
    }

    pub fn belongs_to(&self, cx: &ContextRef) -> bool {
        self.context().is_some_and(|own| Arc::ptr_eq(own, cx))
    }
}

impl fmt::Debug for WaitElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ElementKind::Waiting(cx) => format!("waiting(tid {})", cx.tid()),
            ElementKind::Prepost => "prepost".to_string(),
            ElementKind::Broadcast => "broadcast".to_string(),
        };
        f.debug_struct("WaitElement")
            .field("seq", &format_args!("{:#x}", self.seq))
            .field("kind", &kind)
            .field("count", &self.count)
            .finish()
    }
}
