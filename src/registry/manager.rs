/*!
 * Wait Queue Registry
 *
 * Reference-counted directory of wait queues keyed by object identity.
 *
 * # Locking
 *
 * The registry lock is always taken before any per-object lock and neither
 * is held across a park. Allocation happens with the registry lock dropped;
 * the lookup is retried afterwards and a losing allocation goes back to the
 * spare pool.
 */

use super::directory::{Directory, Entry, EntryStatus};
use crate::core::config::{PsynchConfig, ReaperMode};
use crate::core::errors::PsynchError;
use crate::core::types::{Address, Identity, KwqId, Pid, PsynchResult};
use crate::kwq::{AcquireMode, Baseline, KwqSnapshot, KwqState, KwqType, WaitQueue};
use crate::monitoring::{Diagnostics, Violation};
use crate::services::IdentityResolver;
use crossbeam_queue::ArrayQueue;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Spare states created up front
const PREFILL_SPARES: usize = 8;

/// What a caller wants from `Registry::acquire`
#[derive(Debug, Clone, Copy)]
pub struct AcquireRequest {
    pub pid: Pid,
    pub addr: Address,
    /// Process-shared object, resolved through the identity service
    pub shared: bool,
    pub kind: KwqType,
    pub mode: AcquireMode,
    /// Words used to initialize a freshly claimed queue
    pub baseline: Baseline,
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub allocated: AtomicU64,
    pub reused: AtomicU64,
    pub destroyed: AtomicU64,
    pub sweeps: AtomicU64,
}

/// State shared with handles and the reaper thread
pub(crate) struct RegistryShared {
    pub(super) directory: Mutex<Directory>,
    /// Signalled when a queue's in-use count drops to zero
    pub(super) idle: Condvar,
    /// Wakes the reaper when the cleanup timer is armed or on shutdown
    pub(super) timer: Condvar,
    pub(super) config: PsynchConfig,
    pub(super) resolver: Arc<dyn IdentityResolver>,
    pub(super) diagnostics: Arc<Diagnostics>,
    pub(super) spares: ArrayQueue<KwqState>,
    pub(super) counters: Counters,
    next_id: AtomicU64,
}

/// Identity to wait queue directory
pub struct Registry {
    shared: Arc<RegistryShared>,
    reaper: Option<JoinHandle<()>>,
}

/// Counted reference on a wait queue, released on drop
pub struct KwqRef {
    kwq: Arc<WaitQueue>,
    registry: Arc<RegistryShared>,
    counted_drop: bool,
}

impl Deref for KwqRef {
    type Target = WaitQueue;

    fn deref(&self) -> &WaitQueue {
        &self.kwq
    }
}

impl Drop for KwqRef {
    fn drop(&mut self) {
        self.registry.release(&self.kwq, self.counted_drop);
    }
}

/// Registry-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub live: usize,
    pub on_free_list: usize,
    pub spares: usize,
    pub allocated: u64,
    pub reused: u64,
    pub destroyed: u64,
    pub sweeps: u64,
    pub armed: bool,
}

impl RegistryStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Registry and object view of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub entry: EntryStatus,
    pub kwq: KwqSnapshot,
}

impl Registry {
    pub fn new(
        config: PsynchConfig,
        resolver: Arc<dyn IdentityResolver>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let spares = ArrayQueue::new(config.spare_pool.max(1));
        for _ in 0..PREFILL_SPARES.min(spares.capacity()) {
            let _ = spares.push(KwqState::new());
        }

        let shared = Arc::new(RegistryShared {
            directory: Mutex::new(Directory::new()),
            idle: Condvar::new(),
            timer: Condvar::new(),
            config,
            resolver,
            diagnostics,
            spares,
            counters: Counters::default(),
            next_id: AtomicU64::new(1),
        });

        let reaper = match shared.config.reaper {
            ReaperMode::Background => {
                let worker = Arc::clone(&shared);
                match thread::Builder::new()
                    .name("psynch-reaper".into())
                    .spawn(move || worker.reaper_loop())
                {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!("Failed to start psynch reaper, sweeps are manual: {}", e);
                        None
                    }
                }
            }
            ReaperMode::Manual => None,
        };

        info!(
            "Wait queue registry initialized (grace {:?}, {} reaper)",
            shared.config.cleanup_grace,
            if reaper.is_some() { "background" } else { "manual" }
        );

        Self { shared, reaper }
    }

    pub fn config(&self) -> &PsynchConfig {
        &self.shared.config
    }

    /// Map a user address to the identity its wait queue is filed under
    pub fn resolve_identity(&self, pid: Pid, addr: Address, shared: bool) -> PsynchResult<Identity> {
        self.shared.resolve(pid, addr, shared)
    }

    /// Find or create the wait queue for `request`, taking a reference
    pub fn acquire(&self, request: AcquireRequest) -> PsynchResult<KwqRef> {
        let identity = self.shared.resolve(request.pid, request.addr, request.shared)?;
        let shared = &self.shared;
        let mut spare: Option<KwqState> = None;
        let mut reused = false;
        let mut dir = shared.directory.lock();

        let result = loop {
            if !dir.contains(&identity) {
                match spare.take() {
                    None => {
                        drop(dir);
                        spare = Some(shared.take_spare());
                        dir = shared.directory.lock();
                        continue;
                    }
                    Some(state) => {
                        let kwq = Arc::new(WaitQueue::new(shared.next_id(), identity, state));
                        debug!("{} allocated for {}", kwq.id(), identity);
                        dir.insert(identity, Entry::new(kwq));
                        shared.counters.allocated.fetch_add(1, Ordering::Relaxed);
                    }
                }
            } else if dir.get(&identity).is_some_and(|e| e.on_free_list) {
                reused = true;
            }

            let Some(entry) = dir.claim(&identity) else {
                continue;
            };
            let kwq = Arc::clone(&entry.kwq);
            let mut state = kwq.lock();

            if let Some(current) = state.kind() {
                if current != request.kind {
                    if !state.is_used() && entry.io_count == 0 {
                        debug!("{} retyped {} -> {}", kwq.id(), current, request.kind);
                        state.kind = None;
                    } else if !state.is_used()
                        && entry.io_count == 1
                        && entry.drop_count == entry.io_count
                    {
                        // sole holder is an unlocker; wait for it to drain
                        entry.waiting = true;
                        drop(state);
                        shared.idle.wait(&mut dir);
                        continue;
                    } else {
                        let detail = format!(
                            "{} busy as {} for {} [pre {}:{:#x}:{:#x}] [intr {}:{:#x}] [ioc {}:{}] [inq {}:{}]",
                            identity,
                            current,
                            request.kind,
                            state.prepost.count,
                            state.prepost.lseq,
                            state.prepost.sseq,
                            state.intr.count,
                            state.intr.seq,
                            entry.io_count,
                            entry.drop_count,
                            state.inqueue,
                            state.fakecount,
                        );
                        shared.diagnostics.report(Violation::ObjectBusy, &detail);
                        break Err(PsynchError::WrongType(detail));
                    }
                }
            }

            if state.kind().is_none() {
                state.init(request.kind, request.baseline);
            }
            drop(state);

            entry.io_count += 1;
            let counted_drop = request.kind == KwqType::Mutex && request.mode == AcquireMode::Drop;
            if counted_drop {
                entry.drop_count += 1;
            }

            break Ok(KwqRef {
                kwq,
                registry: Arc::clone(shared),
                counted_drop,
            });
        };

        drop(dir);
        if reused && result.is_ok() {
            shared.counters.reused.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(state) = spare {
            shared.return_spare(state);
        }
        result
    }

    /// Run one cleanup pass as if the timer fired at `now`
    pub fn sweep_now(&self, now: Instant) -> super::lifecycle::SweepReport {
        self.shared.sweep(now)
    }

    /// Destroy every private wait queue of an exiting process
    pub fn purge_process(&self, pid: Pid) -> usize {
        self.shared.purge_process(pid)
    }

    pub fn len(&self) -> usize {
        self.shared.directory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.shared.directory.lock().contains(identity)
    }

    /// Free-list membership and in-use counts plus a state snapshot
    pub fn inspect(&self, identity: &Identity) -> Option<QueueReport> {
        let (status, kwq) = {
            let dir = self.shared.directory.lock();
            let entry = dir.get(identity)?;
            (entry.status(Instant::now()), Arc::clone(&entry.kwq))
        };
        Some(QueueReport {
            entry: status,
            kwq: kwq.snapshot(),
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let dir = self.shared.directory.lock();
        let c = &self.shared.counters;
        RegistryStats {
            live: dir.len(),
            on_free_list: dir.free_list().len(),
            spares: self.shared.spares.len(),
            allocated: c.allocated.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            sweeps: c.sweeps.load(Ordering::Relaxed),
            armed: dir.armed,
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        {
            let mut dir = self.shared.directory.lock();
            dir.shutdown = true;
        }
        self.shared.timer.notify_all();
        if let Some(handle) = self.reaper.take() {
            if handle.join().is_err() {
                warn!("psynch reaper panicked");
            }
        }
    }
}

impl RegistryShared {
    fn resolve(&self, pid: Pid, addr: Address, shared: bool) -> PsynchResult<Identity> {
        if shared {
            let (object, offset) = self.resolver.resolve(pid, addr)?;
            Ok(Identity::Shared { object, offset })
        } else {
            Ok(Identity::Private { pid, addr })
        }
    }

    fn next_id(&self) -> KwqId {
        KwqId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn take_spare(&self) -> KwqState {
        self.spares.pop().unwrap_or_default()
    }

    pub(super) fn return_spare(&self, state: KwqState) {
        // pool full: let it go
        let _ = self.spares.push(state);
    }

    /// Drop one reference; idle queues are freed now or parked for the sweep
    fn release(&self, kwq: &Arc<WaitQueue>, counted_drop: bool) {
        let identity = kwq.identity();
        let mut dir = self.directory.lock();

        let Some(entry) = dir.get_mut(&identity) else {
            debug!("{} released after its identity was purged", kwq.id());
            return;
        };
        if !Arc::ptr_eq(&entry.kwq, kwq) {
            debug!("{} released after being replaced", kwq.id());
            return;
        }

        if counted_drop {
            entry.drop_count = entry.drop_count.saturating_sub(1);
        }
        entry.io_count = entry.io_count.saturating_sub(1);
        if entry.io_count != 0 {
            return;
        }

        if entry.waiting {
            entry.waiting = false;
            self.idle.notify_all();
        }

        let (used, kind) = {
            let state = kwq.lock();
            (state.is_used(), state.kind())
        };
        if used {
            return;
        }

        let eager = self.config.eager_reclaim && kind != Some(KwqType::RwLock);
        if eager {
            let removed = dir.remove(&identity);
            drop(dir);
            if let Some(entry) = removed {
                self.destroy(entry.kwq);
            }
            return;
        }

        let now = Instant::now();
        dir.push_free(identity, now);
        if !dir.armed {
            dir.armed = true;
            dir.deadline = Some(now + self.config.cleanup_grace);
            self.timer.notify_one();
        }
    }
}
