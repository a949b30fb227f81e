/*!
 * Psynch Entry Points
 *
 * The contended half of userspace mutexes, condition variables and
 * read-write locks. Each entry point takes the caller's generation words,
 * finds (or creates) the wait queue for the object, reconciles the words
 * against what the kernel knows, and either grants immediately or parks the
 * caller. The returned update bits are folded back into the userspace words.
 */

mod condvar;
mod flags;
mod introspect;
mod mutex;
mod rwlock;

pub use condvar::{CondWaitReturn, CondWakeKind, MutexDrop};
pub use flags::{
    MutexPolicy, SyncFlags, FLAG_CLEAR_MUTEX, POLICY_FAIRSHARE, POLICY_FIRSTFIT, POLICY_MASK,
    PSHARED_MASK, PSHARED_PRIVATE, PSHARED_SHARED,
};
pub use introspect::WaitInfo;

use crate::context::{ContextRef, ContextTable};
use crate::core::config::PsynchConfig;
use crate::core::errors::PsynchError;
use crate::core::types::{Address, Pid, PsynchResult, Tid};
use crate::kwq::{AcquireMode, Baseline, BlockOn, KwqState, KwqType, WaitQueue};
use crate::monitoring::{Diagnostics, EntrySpan, Violation};
use crate::registry::{AcquireRequest, KwqRef, Registry};
use crate::services::{IdentityResolver, SharedMappingTable, ThreadParker, WaitOutcome, WaitService};
use log::info;
use parking_lot::MutexGuard;
use std::sync::Arc;

/// The psynch engine: registry, services and entry points
pub struct PsynchKernel {
    registry: Registry,
    waiter: Arc<dyn WaitService>,
    contexts: Arc<ContextTable>,
    diagnostics: Arc<Diagnostics>,
}

/// Builder for PsynchKernel
pub struct PsynchKernelBuilder {
    config: PsynchConfig,
    waiter: Option<Arc<dyn WaitService>>,
    contexts: Option<Arc<ContextTable>>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl PsynchKernelBuilder {
    pub fn new() -> Self {
        Self {
            config: PsynchConfig::default(),
            waiter: None,
            contexts: None,
            resolver: None,
            diagnostics: None,
        }
    }

    pub fn with_config(mut self, config: PsynchConfig) -> Self {
        self.config = config;
        self
    }

    /// Blocking service; defaults to `ThreadParker`
    pub fn with_wait_service(mut self, waiter: Arc<dyn WaitService>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    pub fn with_contexts(mut self, contexts: Arc<ContextTable>) -> Self {
        self.contexts = Some(contexts);
        self
    }

    /// Shared-object identity service; defaults to an empty `SharedMappingTable`
    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> PsynchKernel {
        let waiter = self
            .waiter
            .unwrap_or_else(|| Arc::new(ThreadParker::new()));
        let contexts = self.contexts.unwrap_or_default();
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SharedMappingTable::new()));
        let diagnostics = self.diagnostics.unwrap_or_default();

        info!("psynch engine using {} wait service", waiter.name());
        let registry = Registry::new(self.config, resolver, Arc::clone(&diagnostics));

        PsynchKernel {
            registry,
            waiter,
            contexts,
            diagnostics,
        }
    }
}

impl Default for PsynchKernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PsynchKernel {
    pub fn builder() -> PsynchKernelBuilder {
        PsynchKernelBuilder::new()
    }

    pub fn new(config: PsynchConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn config(&self) -> &PsynchConfig {
        self.registry.config()
    }

    /// Register a userspace thread with the engine
    pub fn register_thread(&self, pid: Pid, tid: Tid) -> ContextRef {
        self.contexts.register(pid, tid)
    }

    /// Process exit: forget its threads and private wait queues
    pub fn purge_process(&self, pid: Pid) -> usize {
        self.contexts.unregister_process(pid);
        self.registry.purge_process(pid)
    }

    fn waiter(&self) -> &dyn WaitService {
        self.waiter.as_ref()
    }

    fn acquire(
        &self,
        cx: &ContextRef,
        addr: Address,
        flags: SyncFlags,
        kind: KwqType,
        mode: AcquireMode,
        baseline: Baseline,
    ) -> PsynchResult<KwqRef> {
        self.registry.acquire(AcquireRequest {
            pid: cx.pid(),
            addr,
            shared: flags.is_shared(),
            kind,
            mode,
            baseline,
        })
    }

    /// Enqueue and park, reporting duplicate sequences
    fn park(
        &self,
        kwq: &WaitQueue,
        guard: MutexGuard<'_, KwqState>,
        cx: &ContextRef,
        on: BlockOn,
    ) -> PsynchResult<WaitOutcome> {
        let seq = on.seq;
        kwq.block(guard, cx, on, self.waiter()).inspect_err(|e| {
            if matches!(e, PsynchError::Busy(_)) {
                self.diagnostics.report(
                    Violation::DuplicateWaiter,
                    format_args!("{} already has a waiter at {:#x}", kwq.id(), seq),
                );
            }
        })
    }
}

/// Error for a park that ended without a grant
fn wait_error(outcome: WaitOutcome, cv_bits: u32) -> PsynchError {
    match outcome {
        WaitOutcome::Interrupted => PsynchError::Interrupted { cv_bits },
        _ => PsynchError::TimedOut { cv_bits },
    }
}

/// Record the entry's result on its span
fn traced(span: EntrySpan, result: PsynchResult<u32>) -> PsynchResult<u32> {
    match &result {
        Ok(bits) => span.record_bits(*bits),
        Err(e) => span.record_error(e.errno()),
    }
    result
}
