//! Runtime error catalogue
//!
//! Core errors (`VmError`, `MemoryError`, `CapError`) are deliberately
//! small and backend-free; this module folds them, together with backend
//! failures, into the one error type the nucleus API surfaces.

use nvisor_backend::BackendError;
use nvisor_core::{CapError, MemoryError, VmError};
use thiserror::Error;

/// Errors returned by nucleus operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// Named VM does not exist
    #[error("VM not found")]
    VmNotFound,

    /// Operation is not legal from the VM's current lifecycle state
    #[error("invalid lifecycle state for this operation")]
    InvalidStateTransition,

    /// Calling VM does not hold the required capability
    #[error("required capability not held")]
    CapabilityDenied,

    /// Requested mapping intersects an existing mapping
    #[error("memory mapping overlaps an existing mapping")]
    MemoryOverlap,

    /// No mapping matches the requested range
    #[error("no matching memory mapping")]
    MemoryNotMapped,

    /// Source VM does not hold the capability being transferred
    #[error("capability not held by source VM")]
    CapabilityNotHeld,

    /// The virtualization backend reported a failure
    #[error("backend failure: {0:?}")]
    BackendFailure(BackendError),

    /// Hardware virtualization is not available here
    #[error("hardware virtualization unavailable on platform '{0}'")]
    UnsupportedPlatform(&'static str),
}

impl From<VmError> for Error {
    fn from(err: VmError) -> Self {
        match err {
            VmError::VmNotFound => Error::VmNotFound,
            VmError::InvalidState => Error::InvalidStateTransition,
            VmError::CapabilityDenied => Error::CapabilityDenied,
        }
    }
}

impl From<MemoryError> for Error {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::VmNotFound => Error::VmNotFound,
            MemoryError::Overlap => Error::MemoryOverlap,
            MemoryError::NotMapped => Error::MemoryNotMapped,
        }
    }
}

impl From<CapError> for Error {
    fn from(err: CapError) -> Self {
        match err {
            CapError::VmNotFound => Error::VmNotFound,
            CapError::NotHeld => Error::CapabilityNotHeld,
        }
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::BackendFailure(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_fold_into_runtime_errors() {
        assert_eq!(Error::from(VmError::InvalidState), Error::InvalidStateTransition);
        assert_eq!(Error::from(MemoryError::Overlap), Error::MemoryOverlap);
        assert_eq!(Error::from(CapError::NotHeld), Error::CapabilityNotHeld);
        assert_eq!(
            Error::from(BackendError::VcpuFault),
            Error::BackendFailure(BackendError::VcpuFault)
        );
    }

    #[test]
    fn test_errors_render() {
        let rendered = Error::UnsupportedPlatform("mock").to_string();
        assert!(rendered.contains("mock"));
    }
}
