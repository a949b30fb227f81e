/*!
 * Wait Queue Lifecycle
 * Deferred reclamation of idle wait queues
 *
 * Idle queues sit on the free list for a grace window so a lock that is
 * re-contended shortly after going idle keeps its kernel object. The sweep
 * reaps entries idle for at least the grace window and re-arms itself for the
 * rest; an entry claimed again in the meantime is simply skipped.
 */

use super::manager::RegistryShared;
use crate::core::types::{Identity, Pid};
use crate::kwq::WaitQueue;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SweepReport {
    pub reaped: usize,
    /// Still on the free list, younger than the grace window
    pub remaining: usize,
    /// Timer re-armed for the remaining entries
    pub rearmed: bool,
}

impl SweepReport {
    pub fn reaped_any(&self) -> bool {
        self.reaped > 0
    }
}

impl RegistryShared {
    /// One timer expiry: reap whatever has idled past the grace window
    pub(super) fn sweep(&self, now: Instant) -> SweepReport {
        let grace = self.config.cleanup_grace;
        let mut reaped: Vec<Arc<WaitQueue>> = Vec::new();
        let mut report = SweepReport::default();

        {
            let mut dir = self.directory.lock();
            let candidates: Vec<Identity> = dir.free_list().to_vec();

            for identity in candidates {
                let Some(entry) = dir.get(&identity) else {
                    continue;
                };
                if entry.io_count != 0 || entry.kwq.lock().is_used() {
                    continue;
                }

                let idle_for = entry
                    .idle_since
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if idle_for >= grace {
                    if let Some(entry) = dir.remove(&identity) {
                        reaped.push(entry.kwq);
                    }
                } else {
                    report.remaining += 1;
                }
            }

            report.rearmed = report.remaining > 0;
            dir.armed = report.rearmed;
            dir.deadline = report.rearmed.then(|| now + grace);
        }

        report.reaped = reaped.len();
        for kwq in reaped {
            self.destroy(kwq);
        }

        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        if report.reaped_any() {
            debug!(
                "Sweep reaped {} wait queues, {} still idle",
                report.reaped, report.remaining
            );
        }
        report
    }

    /// Tear down a queue already unhashed from the directory
    pub(super) fn destroy(&self, kwq: Arc<WaitQueue>) {
        let mut state = std::mem::take(&mut *kwq.lock());
        drop(state.clear_owner());
        state.reset();
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!("{} destroyed ({})", kwq.id(), kwq.identity());
        self.return_spare(state);
    }

    /// Unhash every private queue of `pid`
    ///
    /// Idle queues are destroyed; queues still referenced are only unhashed
    /// and die with their last handle.
    pub(super) fn purge_process(&self, pid: Pid) -> usize {
        let mut idle = Vec::new();
        let purged = {
            let mut dir = self.directory.lock();
            let identities = dir.private_of(pid);
            for identity in &identities {
                if let Some(entry) = dir.remove(identity) {
                    if entry.io_count == 0 {
                        idle.push(entry.kwq);
                    }
                }
            }
            identities.len()
        };

        for kwq in idle {
            self.destroy(kwq);
        }
        if purged > 0 {
            info!("Purged {} wait queues of PID {}", purged, pid);
        }
        purged
    }

    /// Background sweep driver; exits on registry shutdown
    pub(super) fn reaper_loop(&self) {
        debug!("psynch reaper started");
        let mut dir = self.directory.lock();
        loop {
            if dir.shutdown {
                break;
            }
            match dir.deadline.filter(|_| dir.armed) {
                None => {
                    self.timer.wait(&mut dir);
                }
                Some(deadline) => {
                    if Instant::now() < deadline {
                        self.timer.wait_until(&mut dir, deadline);
                        continue;
                    }
                    drop(dir);
                    self.sweep(Instant::now());
                    dir = self.directory.lock();
                }
            }
        }
        debug!("psynch reaper stopped");
    }
}
