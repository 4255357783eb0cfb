//! Virtual machine lifecycle state machine
//!
//! Every operation here is a single, all-or-nothing transition on the
//! system state: check the current state, check the required capability,
//! apply the new state. A failed check returns a precise error and leaves
//! the state untouched.
//!
//! Transition table (initial state `Created`, terminal state `Halted`):
//!
//! | From          | Operation       | Capability | To                     |
//! |---------------|-----------------|------------|------------------------|
//! | -             | `create_vm`     | none       | `Created`              |
//! | `Created`     | `initialize_vm` | VcpuCreate | `Runnable`             |
//! | `Runnable`    | `trap_vm`       | none       | `Trapped`              |
//! | `Trapped`     | `resume_vm`     | VcpuRun    | `Runnable`             |
//! | any non-Halted| `halt_vm`       | Halt       | `Halted`               |
//! | `Halted`      | `destroy_vm`    | none       | record removed         |

use crate::capability;
use crate::memory;
use crate::state::SystemState;
use crate::types::{CapKind, Capability, CpuState, ExitReason, VmConfig, VmId, VmState};

/// Errors returned by lifecycle transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// VM does not exist
    VmNotFound,
    /// Operation is not legal from the VM's current state
    InvalidState,
    /// VM lacks the capability the transition requires
    CapabilityDenied,
}

/// Create a new VM in `Created` state.
///
/// The VM starts with an empty capability set; authority is granted
/// separately through the capability manager.
pub fn create_vm(state: &mut SystemState, config: VmConfig) -> VmId {
    state.register_vm(config)
}

/// Initialize a VM, making it runnable at `entry_point`.
///
/// Requires `VcpuCreate`. Transition: `Created` -> `Runnable`.
pub fn initialize_vm(state: &mut SystemState, vmid: VmId, entry_point: u64) -> Result<(), VmError> {
    let record = state.vm(vmid).ok_or(VmError::VmNotFound)?;
    if !matches!(record.state, VmState::Created) {
        return Err(VmError::InvalidState);
    }
    if !capability::check(state, vmid, Capability::new(CapKind::VcpuCreate, vmid)) {
        return Err(VmError::CapabilityDenied);
    }

    if let Some(record) = state.vm_mut(vmid) {
        record.state = VmState::Runnable(CpuState::at_entry(entry_point));
    }
    Ok(())
}

/// Record a VM exit reported by the backend.
///
/// Backend-driven, so no capability is required. Appends the exit record
/// in the same mutation as the transition and returns its sequence
/// number. Transition: `Runnable` -> `Trapped`.
pub fn trap_vm(
    state: &mut SystemState,
    vmid: VmId,
    reason: ExitReason,
    cpu: CpuState,
) -> Result<u64, VmError> {
    let record = state.vm(vmid).ok_or(VmError::VmNotFound)?;
    if !matches!(record.state, VmState::Runnable(_)) {
        return Err(VmError::InvalidState);
    }

    if let Some(record) = state.vm_mut(vmid) {
        record.state = VmState::Trapped(reason.clone(), cpu);
    }
    Ok(state.record_exit(vmid, reason, cpu))
}

/// Resume a trapped VM.
///
/// Requires `VcpuRun`. `cpu` replaces the trapped snapshot when given
/// (the dispatcher advances `pc` on voluntary yields); `None` resumes
/// with the snapshot taken at the trap. Transition: `Trapped` ->
/// `Runnable`.
pub fn resume_vm(state: &mut SystemState, vmid: VmId, cpu: Option<CpuState>) -> Result<(), VmError> {
    let record = state.vm(vmid).ok_or(VmError::VmNotFound)?;
    let trapped_cpu = match &record.state {
        VmState::Trapped(_, cpu) => *cpu,
        _ => return Err(VmError::InvalidState),
    };
    if !capability::check(state, vmid, Capability::new(CapKind::VcpuRun, vmid)) {
        return Err(VmError::CapabilityDenied);
    }

    if let Some(record) = state.vm_mut(vmid) {
        record.state = VmState::Runnable(cpu.unwrap_or(trapped_cpu));
    }
    Ok(())
}

/// Halt a VM permanently.
///
/// Requires `Halt`. Legal from any non-terminal state; `Halted` is
/// terminal, so halting twice is an invalid transition.
pub fn halt_vm(state: &mut SystemState, vmid: VmId) -> Result<(), VmError> {
    let record = state.vm(vmid).ok_or(VmError::VmNotFound)?;
    if record.state.is_halted() {
        return Err(VmError::InvalidState);
    }
    if !capability::check(state, vmid, Capability::new(CapKind::Halt, vmid)) {
        return Err(VmError::CapabilityDenied);
    }

    if let Some(record) = state.vm_mut(vmid) {
        record.state = VmState::Halted;
    }
    Ok(())
}

/// Destroy a halted VM.
///
/// Permitted from `Halted` only. Removes the record and releases the
/// VM's memory mappings and capabilities in the same mutation. The exit
/// log keeps the VM's entries: it is an append-only audit trail.
pub fn destroy_vm(state: &mut SystemState, vmid: VmId) -> Result<(), VmError> {
    let record = state.vm(vmid).ok_or(VmError::VmNotFound)?;
    if !record.state.is_halted() {
        return Err(VmError::InvalidState);
    }

    memory::release_mappings(state, vmid);
    capability::release_all(state, vmid);
    state.remove_vm(vmid);
    Ok(())
}
