//! Virtualization backend trait for the nvisor nucleus
//!
//! This crate defines the boundary between the pure isolation core and
//! the hardware virtualization backend (KVM, Hypervisor.framework, a
//! test double) by abstracting VM and VCPU operations.
//!
//! The backend is trusted for correctness but not for timing: `run` may
//! block for a guest-controlled duration, so the runtime never calls it
//! while holding the state-store lock.
//!
//! The nucleus itself never branches on platform availability - it asks
//! `info()` and otherwise treats every implementation identically.

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use nvisor_core::{CpuState, GpaRange, HostRange, MemPerms, VmId};

/// Backend errors
///
/// `BackendFailure` at the nucleus API wraps one of these; the nucleus
/// treats them as non-recoverable for the current operation but never
/// fatal to the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendError {
    /// Hardware virtualization is not available on this platform
    Unavailable,
    /// Backend could not allocate or map memory
    OutOfMemory,
    /// Mapping request the backend cannot represent
    InvalidMapping,
    /// VCPU creation or execution failed
    VcpuFault,
    /// Operation not supported by this backend
    NotSupported,
}

/// Static facts about a backend implementation
#[derive(Clone, Copy, Debug)]
pub struct BackendInfo {
    /// Whether the backend can actually run guests here
    pub available: bool,
    /// Platform name for diagnostics
    pub platform: &'static str,
    /// Maximum VCPUs per VM
    pub max_vcpus: u32,
}

/// Raw exit description as reported by the backend.
///
/// Backend-flavored and deliberately separate from the core's
/// `ExitReason`: the translation step in the runtime is the single place
/// where backend vocabulary becomes nucleus vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawExit {
    /// Guest executed a hypervisor call
    Hvc { nr: u64, args: [u64; 6] },
    /// Data access faulted at a guest-physical address
    DataAbort { gpa: u64, write: bool },
    /// Instruction fetch faulted at a guest-physical address
    PrefetchAbort { gpa: u64 },
    /// Trapped system register access
    SysReg { reg: u32, write: bool },
    /// Guest executed a wait-for-interrupt
    Wfi,
    /// Guest raised an exception
    Exception { vector: u32 },
    /// The run was cancelled by the caller
    Cancelled,
}

/// Cooperative cancellation message for an in-flight run.
///
/// Cancellation is a message, not a thread interrupt: the backend polls
/// the token and surfaces `RawExit::Cancelled` through the normal exit
/// path, so a cancelled run goes through the same dispatch rules as any
/// other exit.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the run observing this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Hardware virtualization backend trait
///
/// Implementations provide platform-specific functionality for:
/// - VM container and VCPU management
/// - Guest memory mapping
/// - CPU state access
/// - Blocking guest execution
///
/// # Associated Types
///
/// - `VmHandle`: backend-side handle to a VM container
/// - `VcpuHandle`: backend-side handle to one virtual CPU
pub trait VmBackend: Send + Sync + 'static {
    /// Handle to a backend VM container
    type VmHandle: Clone + Send + Sync;
    /// Handle to a backend virtual CPU
    type VcpuHandle: Clone + Send + Sync;

    /// Static facts about this backend
    fn info(&self) -> BackendInfo;

    // === VM container management ===

    /// Create the backend-side VM container for `vmid`
    fn create_vm(&self, vmid: VmId) -> Result<Self::VmHandle, BackendError>;

    /// Tear down a VM container
    fn destroy_vm(&self, vm: &Self::VmHandle) -> Result<(), BackendError>;

    // === VCPU management ===

    /// Create a virtual CPU inside a VM container
    fn create_vcpu(&self, vm: &Self::VmHandle) -> Result<Self::VcpuHandle, BackendError>;

    /// Tear down a virtual CPU
    fn destroy_vcpu(&self, vcpu: &Self::VcpuHandle) -> Result<(), BackendError>;

    // === Guest memory ===

    /// Map a host range into the guest-physical address space
    fn map_memory(
        &self,
        vm: &Self::VmHandle,
        gpa: GpaRange,
        host: HostRange,
        perms: MemPerms,
    ) -> Result<(), BackendError>;

    /// Remove a guest-physical mapping
    fn unmap_memory(&self, vm: &Self::VmHandle, gpa: GpaRange) -> Result<(), BackendError>;

    // === CPU state ===

    /// Load a register snapshot into a VCPU
    fn set_cpu_state(&self, vcpu: &Self::VcpuHandle, cpu: &CpuState) -> Result<(), BackendError>;

    /// Read the current register snapshot of a VCPU
    fn get_cpu_state(&self, vcpu: &Self::VcpuHandle) -> Result<CpuState, BackendError>;

    // === Execution ===

    /// Run a VCPU until the guest exits or the token is cancelled.
    ///
    /// Blocking, guest-controlled duration. Callers must not hold any
    /// nucleus lock across this call.
    fn run(&self, vcpu: &Self::VcpuHandle, cancel: &CancelToken) -> Result<RawExit, BackendError>;
}

/// A simple VM handle for backends that use numeric IDs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NumericVmHandle(pub u64);

impl NumericVmHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A simple VCPU handle for backends that use numeric IDs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NumericVcpuHandle(pub u64);

impl NumericVcpuHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}
