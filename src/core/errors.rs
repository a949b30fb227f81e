/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use super::types::{Address, Pid, Tid};
use crate::seq::bits::{CV_CLEARED, CV_PREPOST};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Darwin errno values reported back to the userspace library
pub mod errno {
    pub const ESRCH: i32 = 3;
    pub const EINTR: i32 = 4;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOTSUP: i32 = 45;
    pub const ETIMEDOUT: i32 = 60;
}

/// Errors surfaced by psynch entry points
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum PsynchError {
    #[error("Invalid argument: {0}")]
    #[diagnostic(
        code(psynch::invalid_argument),
        help("The generation words passed in are inconsistent. Check the userspace fast path.")
    )]
    InvalidArgument(String),

    #[error("Object busy for wrong type: {0}")]
    #[diagnostic(
        code(psynch::wrong_type),
        help("The address is still in use by a different synchronization object kind.")
    )]
    WrongType(String),

    #[error("Busy: {0}")]
    #[diagnostic(
        code(psynch::busy),
        help("A waiter is already registered at this sequence.")
    )]
    Busy(String),

    #[error("Thread {0} not found")]
    #[diagnostic(
        code(psynch::context_not_found),
        help("The target thread may have exited or was never registered.")
    )]
    ContextNotFound(Tid),

    #[error("Address {addr:#x} not mapped in process {pid}")]
    #[diagnostic(
        code(psynch::unmapped),
        help("Process-shared objects must live in a shared mapping.")
    )]
    Unmapped { pid: Pid, addr: Address },

    #[error("Wait timed out (status {cv_bits:#x})")]
    #[diagnostic(code(psynch::timed_out))]
    TimedOut { cv_bits: u32 },

    #[error("Wait interrupted (status {cv_bits:#x})")]
    #[diagnostic(code(psynch::interrupted))]
    Interrupted { cv_bits: u32 },

    #[error("Allocation failed: {0}")]
    #[diagnostic(
        code(psynch::allocation_failed),
        help("System may be low on memory.")
    )]
    AllocationFailed(String),

    #[error("Operation not supported: {0}")]
    #[diagnostic(code(psynch::not_supported))]
    NotSupported(String),
}

impl PsynchError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PsynchError::InvalidArgument(msg.into())
    }

    /// Status code returned to userspace, with condvar status bits folded in
    pub fn errno(&self) -> i32 {
        match self {
            PsynchError::InvalidArgument(_)
            | PsynchError::WrongType(_)
            | PsynchError::Unmapped { .. } => errno::EINVAL,
            PsynchError::Busy(_) => errno::EBUSY,
            PsynchError::ContextNotFound(_) => errno::ESRCH,
            PsynchError::TimedOut { cv_bits } => errno::ETIMEDOUT | *cv_bits as i32,
            PsynchError::Interrupted { cv_bits } => errno::EINTR | *cv_bits as i32,
            PsynchError::AllocationFailed(_) => errno::ENOMEM,
            PsynchError::NotSupported(_) => errno::ENOTSUP,
        }
    }

    /// Condvar drained to L == S during this wait
    pub fn cv_cleared(&self) -> bool {
        self.cv_bits() & CV_CLEARED != 0
    }

    /// Only preposted entries remained after this wait
    pub fn cv_prepost(&self) -> bool {
        self.cv_bits() & CV_PREPOST != 0
    }

    fn cv_bits(&self) -> u32 {
        match self {
            PsynchError::TimedOut { cv_bits } | PsynchError::Interrupted { cv_bits } => *cv_bits,
            _ => 0,
        }
    }
}

impl From<std::collections::TryReserveError> for PsynchError {
    fn from(err: std::collections::TryReserveError) -> Self {
        PsynchError::AllocationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PsynchError::invalid("x").errno(), errno::EINVAL);
        assert_eq!(PsynchError::ContextNotFound(7).errno(), errno::ESRCH);
        assert_eq!(
            PsynchError::NotSupported("longrdlock".into()).errno(),
            errno::ENOTSUP
        );
    }

    #[test]
    fn test_cv_bits_folded_into_errno() {
        let err = PsynchError::TimedOut { cv_bits: CV_CLEARED };
        assert_eq!(err.errno(), errno::ETIMEDOUT | 0x100);
        assert!(err.cv_cleared());
        assert!(!err.cv_prepost());
    }

    #[test]
    fn test_error_serializes_tagged() {
        let json = serde_json::to_string(&PsynchError::ContextNotFound(9)).unwrap();
        assert!(json.contains("context_not_found"));
    }
}
