/*!
 * Mutex Protocol Integration Tests
 */

mod common;

use common::StallingParker;
use pretty_assertions::assert_eq;
use psynch_kernel::seq::bits::{L_EBIT, L_KBIT};
use psynch_kernel::seq::{count, INC};
use psynch_kernel::{
    Identity, KwqSnapshot, PsynchConfig, PsynchError, PsynchKernel, SyncFlags, Violation,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MTX: u64 = 0x1000;

fn kernel() -> Arc<PsynchKernel> {
    Arc::new(PsynchKernel::new(PsynchConfig::manual()))
}

fn snapshot(kernel: &PsynchKernel) -> KwqSnapshot {
    kernel.registry().inspect(&identity()).unwrap().kwq
}

fn identity() -> Identity {
    Identity::Private { pid: 1, addr: MTX }
}

fn writers_queued(kernel: &PsynchKernel) -> usize {
    kernel
        .registry()
        .inspect(&identity())
        .map(|r| r.kwq.writers_queued)
        .unwrap_or(0)
}

fn wait_for_writers(kernel: &PsynchKernel, n: usize) {
    let start = Instant::now();
    while writers_queued(kernel) < n {
        assert!(start.elapsed() < Duration::from_secs(5), "waiters never queued");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
#[serial]
fn test_fair_share_grants_in_sequence_order() {
    let kernel = kernel();
    let unlocker = kernel.register_thread(1, 1);
    let (tx, rx) = mpsc::channel();

    let mut handles = Vec::new();
    for seq in [100u32, 101, 102] {
        let k = Arc::clone(&kernel);
        let tx = tx.clone();
        let cx = k.register_thread(1, seq as u64);
        handles.push(thread::spawn(move || {
            let bits = k
                .mutex_wait(&cx, MTX, seq * INC, 99 * INC, 1, SyncFlags(0), None)
                .unwrap();
            tx.send((seq, bits)).unwrap();
        }));
        // strictly increasing arrival
        wait_for_writers(&kernel, (seq - 99) as usize);
    }

    for (round, expected) in [100u32, 101, 102].into_iter().enumerate() {
        let ugen = (99 + round as u32) * INC;
        let bits = kernel
            .mutex_drop(&unlocker, MTX, 103 * INC, ugen, SyncFlags(0))
            .unwrap();
        assert_ne!(bits, 0);

        let (seq, granted) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seq, expected);
        assert_eq!(granted & (L_KBIT | L_EBIT), L_KBIT | L_EBIT);
    }
    for h in handles {
        h.join().unwrap();
    }

    let report = kernel.registry().inspect(&identity()).unwrap();
    assert_eq!(report.entry.io_count, 0);
    assert!(report.entry.on_free_list);
    assert_eq!(report.kwq.waiters(), 0);
    assert_eq!(kernel.diagnostics().total(), 0);
}

#[test]
#[serial]
fn test_timed_out_waiter_leaves_no_trace() {
    let kernel = kernel();
    let waiter = kernel.register_thread(1, 2);
    let unlocker = kernel.register_thread(1, 1);

    let deadline = Instant::now() + Duration::from_millis(30);
    let err = kernel
        .mutex_wait(&waiter, MTX, 2 * INC, INC, 1, SyncFlags(0), Some(deadline))
        .unwrap_err();
    assert!(matches!(err, PsynchError::TimedOut { cv_bits: 0 }));

    let report = kernel.registry().inspect(&identity()).unwrap();
    assert_eq!(report.kwq.writers_queued, 0);
    assert_eq!(report.entry.io_count, 0);

    // nobody left to wake: the unlock is preposted instead
    let bits = kernel
        .mutex_drop(&unlocker, MTX, 2 * INC, INC, SyncFlags(0))
        .unwrap();
    assert_eq!(bits, 0);
    let report = kernel.registry().inspect(&identity()).unwrap();
    assert_eq!(report.kwq.prepost.count, 1);
    assert_eq!(report.kwq.prepost.lseq, 2 * INC);
}

#[test]
fn test_first_fit_pokes_head_regardless_of_sequence() {
    let kernel = kernel();
    let flags = SyncFlags(0).first_fit();
    let unlocker = kernel.register_thread(1, 1);
    let cx = kernel.register_thread(1, 7);

    let waiter = {
        let kernel = Arc::clone(&kernel);
        thread::spawn(move || kernel.mutex_wait(&cx, MTX, 7 * INC, INC, 1, flags, None))
    };
    wait_for_writers(&kernel, 1);

    // unlocker's generation says nothing about who is queued
    let bits = kernel
        .mutex_drop(&unlocker, MTX, 7 * INC, 2 * INC, flags)
        .unwrap();
    assert_eq!(count(bits), 7 * INC);
    assert_eq!(waiter.join().unwrap().unwrap(), bits);
}

#[test]
#[serial]
fn test_racing_drops_never_double_prepost() {
    let kernel = kernel();
    let unlocker = kernel.register_thread(1, 1);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for seq in 2u32..66 {
        let waiter_delay = Duration::from_micros(rng.gen_range(0..400));
        let drop_delay = Duration::from_micros(rng.gen_range(0..400));
        let cx = kernel.register_thread(1, 1000 + seq as u64);

        let waiter = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                thread::sleep(waiter_delay);
                kernel.mutex_wait(&cx, MTX, seq * INC, (seq - 1) * INC, 1, SyncFlags(0), None)
            })
        };
        thread::sleep(drop_delay);
        kernel
            .mutex_drop(&unlocker, MTX, seq * INC, (seq - 1) * INC, SyncFlags(0))
            .unwrap();

        let bits = waiter.join().unwrap().unwrap();
        assert_eq!(bits & (L_KBIT | L_EBIT), L_KBIT | L_EBIT, "seq {}", seq);
    }

    assert_eq!(kernel.diagnostics().count(Violation::MultiplePreposts), 0);
    assert_eq!(kernel.diagnostics().count(Violation::ZeroGrant), 0);
    let report = kernel.registry().inspect(&identity()).unwrap();
    assert_eq!(report.kwq.prepost.count, 0);
}

#[test]
#[serial]
fn test_waiters_push_onto_each_new_owner() {
    let kernel = kernel();
    let owner = kernel.register_thread(1, 50);
    let (a, b) = (kernel.register_thread(1, 51), kernel.register_thread(1, 52));

    let mut handles = Vec::new();
    for (cx, seq) in [(Arc::clone(&a), 2u32), (Arc::clone(&b), 3)] {
        let k = Arc::clone(&kernel);
        handles.push(thread::spawn(move || {
            k.mutex_wait(&cx, MTX, seq * INC, INC, 50, SyncFlags(0), None)
        }));
        wait_for_writers(&kernel, (seq - 1) as usize);
    }
    assert_eq!(owner.inherited_pushes(), 2);

    let bits = kernel
        .mutex_drop(&owner, MTX, 3 * INC, INC, SyncFlags(0))
        .unwrap();
    assert_eq!(count(bits), 3 * INC);
    assert_eq!(owner.inherited_pushes(), 0);
    assert_eq!(a.inherited_pushes(), 1);
    assert_eq!(b.pushing_on(), Some(51));
    assert_eq!(snapshot(&kernel).owner, Some(51));

    kernel
        .mutex_drop(&a, MTX, 3 * INC, 2 * INC, SyncFlags(0))
        .unwrap();
    assert_eq!(a.inherited_pushes(), 0);
    assert_eq!(b.pushing_on(), None);
    assert_eq!(snapshot(&kernel).owner, Some(52));

    for h in handles {
        assert_ne!(h.join().unwrap().unwrap() & L_EBIT, 0);
    }
}

#[test]
#[serial]
fn test_preposted_unlock_stops_the_push() {
    let kernel = kernel();
    let owner = kernel.register_thread(1, 50);
    let parked = kernel.register_thread(1, 51);
    let (first, second) = (kernel.register_thread(1, 52), kernel.register_thread(1, 53));

    let handle = {
        let (kernel, cx) = (Arc::clone(&kernel), Arc::clone(&parked));
        thread::spawn(move || kernel.mutex_wait(&cx, MTX, 3 * INC, 0, 50, SyncFlags(0), None))
    };
    wait_for_writers(&kernel, 1);
    assert_eq!(parked.pushing_on(), Some(50));

    // sequence 1 has not arrived: nobody owns the mutex until it does
    assert_eq!(kernel.mutex_drop(&owner, MTX, 3 * INC, 0, SyncFlags(0)).unwrap(), 0);
    assert_eq!(owner.inherited_pushes(), 0);
    assert_eq!(parked.pushing_on(), None);
    assert_eq!(snapshot(&kernel).owner, None);

    kernel
        .mutex_wait(&first, MTX, INC, 0, 0, SyncFlags(0), None)
        .unwrap();
    assert_eq!(parked.pushing_on(), Some(52));
    assert_eq!(first.inherited_pushes(), 1);

    assert_eq!(kernel.mutex_drop(&first, MTX, 3 * INC, INC, SyncFlags(0)).unwrap(), 0);
    assert_eq!(first.inherited_pushes(), 0);
    kernel
        .mutex_wait(&second, MTX, 2 * INC, INC, 0, SyncFlags(0), None)
        .unwrap();
    assert_eq!(parked.pushing_on(), Some(53));

    let bits = kernel
        .mutex_drop(&second, MTX, 3 * INC, 2 * INC, SyncFlags(0))
        .unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), bits);
    assert_eq!(second.inherited_pushes(), 0);
    assert_eq!(parked.pushing_on(), None);
    assert_eq!(snapshot(&kernel).owner, Some(51));
    assert_eq!(kernel.diagnostics().total(), 0);
}

#[test]
#[serial]
fn test_unlock_skipping_a_queued_sequence_is_reported() {
    let kernel = kernel();
    let unlocker = kernel.register_thread(1, 1);
    let cx = kernel.register_thread(1, 3);

    let waiter = {
        let kernel = Arc::clone(&kernel);
        let deadline = Instant::now() + Duration::from_millis(300);
        thread::spawn(move || {
            kernel.mutex_wait(&cx, MTX, 3 * INC, 0, 0, SyncFlags(0), Some(deadline))
        })
    };
    wait_for_writers(&kernel, 1);

    // U + 1 is 4 but sequence 3 is still parked below it
    let bits = kernel
        .mutex_drop(&unlocker, MTX, 4 * INC, 3 * INC, SyncFlags(0))
        .unwrap();
    assert_eq!(bits, 0);
    assert_eq!(kernel.diagnostics().count(Violation::UnlockSequenceMissing), 1);
    assert_eq!(kernel.diagnostics().count(Violation::MultiplePreposts), 0);
    assert_eq!(snapshot(&kernel).prepost.lseq, 4 * INC);

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, PsynchError::TimedOut { cv_bits: 0 }));
}

#[test]
#[serial]
fn test_grant_to_departing_waiter_is_kept_for_retry() {
    let parker = Arc::new(StallingParker::new(20));
    let kernel = Arc::new(
        PsynchKernel::builder()
            .with_config(PsynchConfig::manual())
            .with_wait_service(parker.clone())
            .build(),
    );
    let unlocker = kernel.register_thread(1, 1);
    let cx = kernel.register_thread(1, 20);

    let waiter = {
        let (kernel, cx) = (Arc::clone(&kernel), Arc::clone(&cx));
        thread::spawn(move || kernel.mutex_wait(&cx, MTX, 2 * INC, INC, 0, SyncFlags(0), None))
    };
    parker.wait_stalled();

    // the waiter gave up its slot but is still linked: the wake misses
    let granted = kernel
        .mutex_drop(&unlocker, MTX, 2 * INC, INC, SyncFlags(0))
        .unwrap();
    assert_eq!(granted, 2 * INC | L_EBIT | L_KBIT);
    let kwq = snapshot(&kernel);
    assert_eq!(kwq.interrupted.count, 1);
    assert_eq!(kwq.writers_queued, 0);
    assert_eq!(kwq.owner, None);

    parker.release();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, PsynchError::TimedOut { cv_bits: 0 }));

    // the retry at the same sequence collects the stashed grant
    let bits = kernel
        .mutex_wait(&cx, MTX, 2 * INC, INC, 0, SyncFlags(0), None)
        .unwrap();
    assert_eq!(bits, granted);
    let kwq = snapshot(&kernel);
    assert_eq!(kwq.interrupted.count, 0);
    assert_eq!(kwq.owner, Some(20));
    assert_eq!(kernel.diagnostics().total(), 0);
}
