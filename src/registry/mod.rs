/*!
 * Wait Queue Registry
 *
 * Identity directory, reference counting and deferred reclamation
 */

mod directory;
mod lifecycle;
mod manager;

pub use directory::EntryStatus;
pub use lifecycle::SweepReport;
pub use manager::{AcquireRequest, KwqRef, QueueReport, Registry, RegistryStats};
