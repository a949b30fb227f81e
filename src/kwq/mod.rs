/*!
 * Kernel Wait Queues
 *
 * Per-object state behind every contended mutex, condvar and rwlock
 */

mod state;
mod types;
mod wait_queue;

pub use state::KwqState;
pub use types::{
    AcquireMode, Baseline, InterruptKind, InterruptRecord, KernelFlags, KwqType, PrepostRecord,
    QueueRole,
};
pub use wait_queue::{BlockOn, KwqSnapshot, WaitQueue};
