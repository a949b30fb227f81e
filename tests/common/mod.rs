/*!
 * Shared test services
 */

#![allow(dead_code)]

use parking_lot::Mutex;
use psynch_kernel::services::ParkRequest;
use psynch_kernel::{ContextRef, KwqId, ThreadParker, Tid, WaitOutcome, WaitService, WakeStatus};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

/// Wait service that strands one thread between timing out and relocking
///
/// The chosen thread gives up its slot at once but stays linked on its queue
/// until `release` is called, so a wake aimed at it lands as `NotWaiting`.
pub struct StallingParker {
    inner: ThreadParker,
    tid: Tid,
    stalled_tx: Sender<()>,
    stalled_rx: Mutex<Receiver<()>>,
    release_tx: Sender<()>,
    release_rx: Mutex<Receiver<()>>,
}

impl StallingParker {
    pub fn new(tid: Tid) -> Self {
        let (stalled_tx, stalled_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        Self {
            inner: ThreadParker::new(),
            tid,
            stalled_tx,
            stalled_rx: Mutex::new(stalled_rx),
            release_tx,
            release_rx: Mutex::new(release_rx),
        }
    }

    /// Block until the chosen thread has abandoned its wait
    pub fn wait_stalled(&self) {
        self.stalled_rx
            .lock()
            .recv_timeout(Duration::from_secs(5))
            .expect("thread never stalled");
    }

    pub fn release(&self) {
        self.release_tx.send(()).expect("stalled thread gone");
    }
}

impl WaitService for StallingParker {
    fn prepare(&self, key: KwqId, cx: &ContextRef, inheritor: Option<&ContextRef>) {
        self.inner.prepare(key, cx, inheritor);
    }

    fn park(&self, cx: &ContextRef, request: ParkRequest) -> WaitOutcome {
        if cx.tid() != self.tid {
            return self.inner.park(cx, request);
        }
        let outcome = self.inner.park(
            cx,
            ParkRequest {
                deadline: Some(Instant::now()),
                ..request
            },
        );
        self.stalled_tx.send(()).expect("test gone");
        let _ = self.release_rx.lock().recv_timeout(Duration::from_secs(5));
        outcome
    }

    fn wake(
        &self,
        key: KwqId,
        target: &ContextRef,
        update: u32,
        inheritor: Option<&ContextRef>,
    ) -> WakeStatus {
        self.inner.wake(key, target, update, inheritor)
    }

    fn update_inheritor(&self, key: KwqId, inheritor: Option<&ContextRef>) {
        self.inner.update_inheritor(key, inheritor);
    }

    fn cleanup(&self, key: KwqId, cx: &ContextRef) {
        self.inner.cleanup(key, cx);
    }

    fn name(&self) -> &'static str {
        "stalling-parker"
    }
}
