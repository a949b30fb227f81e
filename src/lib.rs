/*!
 * Psynch Kernel Library
 *
 * Kernel-side wait queues behind userspace mutexes, condition variables and
 * read-write locks. Userspace keeps generation words and only calls in on
 * contention; the engine matches those words against its own queues and
 * grants, preposts or parks accordingly.
 */

pub mod context;
pub mod core;
pub mod kwq;
pub mod monitoring;
pub mod psynch;
pub mod queue;
pub mod registry;
pub mod seq;
pub mod services;

// Re-exports
pub use context::{ContextRef, ContextTable, ThreadContext, WaitReason};
pub use crate::core::{Address, Identity, KwqId, Pid, PsynchConfig, PsynchError, PsynchResult, ReaperMode, Tid};
pub use kwq::{KwqSnapshot, KwqType};
pub use monitoring::{init_tracing, Diagnostics, Violation};
pub use psynch::{
    CondWaitReturn, CondWakeKind, MutexDrop, MutexPolicy, PsynchKernel, PsynchKernelBuilder,
    SyncFlags, WaitInfo,
};
pub use registry::{Registry, RegistryStats, SweepReport};
pub use seq::SeqWord;
pub use services::{
    IdentityResolver, SharedMappingTable, ThreadParker, WaitOutcome, WaitService, WakeStatus,
};
