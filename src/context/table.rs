/*!
 * Context Table
 * Thread id to context resolution
 */

use super::{ContextRef, ThreadContext};
use crate::core::types::{Pid, Tid};
use ahash::RandomState;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

/// Registered userspace threads
pub struct ContextTable {
    contexts: DashMap<Tid, ContextRef, RandomState>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Register a thread; returns the existing context if the tid is known
    pub fn register(&self, pid: Pid, tid: Tid) -> ContextRef {
        self.contexts
            .entry(tid)
            .or_insert_with(|| {
                debug!("Registered thread {} of PID {}", tid, pid);
                Arc::new(ThreadContext::new(pid, tid))
            })
            .clone()
    }

    pub fn lookup(&self, tid: Tid) -> Option<ContextRef> {
        self.contexts.get(&tid).map(|cx| cx.clone())
    }

    pub fn unregister(&self, tid: Tid) -> Option<ContextRef> {
        self.contexts.remove(&tid).map(|(_, cx)| cx)
    }

    /// Drop every thread of a process
    pub fn unregister_process(&self, pid: Pid) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, cx| cx.pid() != pid);
        before - self.contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}
