/*!
 * Core Module
 * Shared types, errors, limits and configuration
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod types;

pub use config::{PsynchConfig, ReaperMode};
pub use errors::PsynchError;
pub use types::{Address, Identity, KwqId, ObjectId, Pid, PsynchResult, Tid};
