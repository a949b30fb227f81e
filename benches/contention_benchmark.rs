/*!
 * Contention Benchmarks
 *
 * Kernel round trips for preposted and parked mutex hand-offs, plus condvar
 * signal cost on a drained queue
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use psynch_kernel::seq::INC;
use psynch_kernel::{PsynchConfig, PsynchKernel, SyncFlags};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MTX: u64 = 0x1000;
const CV: u64 = 0x2000;

fn bench_preposted_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("preposted_handoff");

    for (name, flags) in [
        ("fair_share", SyncFlags(0).fair_share()),
        ("first_fit", SyncFlags(0).first_fit()),
    ] {
        let kernel = PsynchKernel::new(PsynchConfig::manual());
        let owner = kernel.register_thread(1, 1);
        let next = kernel.register_thread(1, 2);
        let mut seq: u32 = 1;

        group.bench_with_input(BenchmarkId::from_parameter(name), &flags, |b, &flags| {
            b.iter(|| {
                // unlock lands first, the waiter consumes the prepost
                let mgen = seq.wrapping_add(1).wrapping_mul(INC);
                let ugen = seq.wrapping_mul(INC);
                kernel.mutex_drop(&owner, MTX, mgen, ugen, flags).ok();
                black_box(kernel.mutex_wait(&next, MTX, mgen, ugen, 0, flags, None).ok());
                seq = seq.wrapping_add(1);
            });
        });
    }

    group.finish();
}

fn bench_parked_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("parked_handoff");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("mutex", |b| {
        let kernel = Arc::new(PsynchKernel::new(PsynchConfig::manual()));
        let owner = kernel.register_thread(1, 1);
        let mut seq: u32 = 1;

        b.iter(|| {
            let mgen = seq.wrapping_add(1).wrapping_mul(INC);
            let ugen = seq.wrapping_mul(INC);
            let waiter = {
                let kernel = Arc::clone(&kernel);
                let cx = kernel.register_thread(1, 2);
                thread::spawn(move || {
                    kernel.mutex_wait(&cx, MTX, mgen, ugen, 0, SyncFlags(0), None)
                })
            };
            kernel.mutex_drop(&owner, MTX, mgen, ugen, SyncFlags(0)).ok();
            black_box(waiter.join().ok());
            seq = seq.wrapping_add(1);
        });
    });

    group.finish();
}

fn bench_condvar_signal(c: &mut Criterion) {
    let kernel = PsynchKernel::new(PsynchConfig::manual());
    let cx = kernel.register_thread(1, 1);

    c.bench_function("condvar_signal_drained", |b| {
        b.iter(|| {
            black_box(
                kernel
                    .cond_signal(&cx, CV, INC, 0, INC, 0, SyncFlags(0))
                    .ok(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_preposted_handoff,
    bench_parked_handoff,
    bench_condvar_signal
);
criterion_main!(benches);
