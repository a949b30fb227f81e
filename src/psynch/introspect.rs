/*!
 * Blocked Context Introspection
 */

use super::PsynchKernel;
use crate::context::{ContextRef, WaitReason};
use crate::core::types::{Identity, KwqId, Tid};
use serde::{Deserialize, Serialize};

/// What a parked context is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitInfo {
    pub reason: WaitReason,
    pub kwq: KwqId,
    pub identity: Identity,
    /// Current mutex owner; rwlock owners are not tracked and condvars have none
    pub owner: Option<Tid>,
}

impl PsynchKernel {
    /// Wait details for `cx`, or `None` when it is not parked
    pub fn find_owner(&self, cx: &ContextRef) -> Option<WaitInfo> {
        let blocked = cx.blocked_on()?;
        let owner = match blocked.reason {
            WaitReason::Mutex => self
                .registry
                .inspect(&blocked.identity)
                .filter(|report| report.kwq.id == blocked.kwq)
                .and_then(|report| report.kwq.owner),
            _ => None,
        };
        Some(WaitInfo {
            reason: blocked.reason,
            kwq: blocked.kwq,
            identity: blocked.identity,
            owner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PsynchConfig;

    #[test]
    fn test_idle_context_has_no_wait_info() {
        let kernel = PsynchKernel::new(PsynchConfig::manual());
        let a = kernel.register_thread(1, 10);
        assert_eq!(kernel.find_owner(&a), None);
    }
}
