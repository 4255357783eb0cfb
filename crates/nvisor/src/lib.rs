//! nvisor - VM Isolation Nucleus Runtime
//!
//! This crate wires the pure state machine in `nvisor-core` to a
//! hardware virtualization backend behind the `VmBackend` trait:
//!
//! - `store` - the single-writer state store with all-or-nothing
//!   mutations
//! - `translate` - backend exit vocabulary to core exit vocabulary
//! - `system` - the `Nucleus` API: VM lifecycle, capabilities, guest
//!   memory, the run loop and observation helpers
//! - `error` - the runtime error catalogue
//!
//! All isolation decisions live in the core; this crate only sequences
//! them against backend effects and guarantees that the store never
//! records an effect the backend refused.

pub mod error;
pub mod store;
pub mod system;
pub mod translate;

pub use error::Error;
pub use store::StateStore;
pub use system::{Nucleus, SystemInfo};
pub use translate::translate_exit;

// Re-export the types callers need to drive a nucleus
pub use nvisor_backend::{BackendError, BackendInfo, CancelToken, RawExit, VmBackend};
pub use nvisor_core::{
    CapKind, Capability, CpuState, ExitPolicy, ExitReason, ExitRecord, Gpa, GpaRange, HostRange,
    InvariantViolation, MemPerms, VmConfig, VmId, VmState,
};
