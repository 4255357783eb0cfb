//! Formal invariants for nucleus verification
//!
//! This module contains runtime-checkable invariants that should always
//! hold. These are used for:
//! 1. Runtime assertion checking during development
//! 2. Audit checks in tests
//! 3. Formal verification harnesses
//!
//! # Invariants
//!
//! 1. **Memory Isolation**: mappings of distinct VMs are disjoint in both
//!    guest-physical and host address space
//! 2. **VM/Capability Consistency**: every VM has a capability set and
//!    every capability set belongs to a VM
//! 3. **Mapping Ownership**: every mapping's owner is a live VM
//! 4. **ID Monotonicity**: allocated IDs are always below the allocator
//!    cursor, so destroyed IDs can never be reissued
//! 5. **Exit Log Order**: sequence numbers are strictly increasing and
//!    below the sequence cursor

use alloc::string::String;
use alloc::vec::Vec;

use crate::memory;
use crate::state::SystemState;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all nucleus invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &SystemState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_memory_isolation(state));
    violations.extend(check_vm_capability_consistency(state));
    violations.extend(check_mapping_ownership(state));
    violations.extend(check_id_monotonicity(state));
    violations.extend(check_exit_log_order(state));

    violations
}

/// Invariant 1: no cross-VM overlap in guest-physical or host space
fn check_memory_isolation(state: &SystemState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if !memory::verify_isolation(state) {
        violations.push(InvariantViolation {
            invariant: "memory_isolation",
            description: String::from("mappings of distinct VMs overlap"),
        });
    }

    violations
}

/// Invariant 2: VM table and capability table have identical key sets
fn check_vm_capability_consistency(state: &SystemState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for vmid in state.vms.keys() {
        if !state.caps.contains_key(vmid) {
            violations.push(InvariantViolation {
                invariant: "vm_capability_consistency",
                description: alloc::format!("VM {} exists but has no capability set", vmid.0),
            });
        }
    }

    for vmid in state.caps.keys() {
        if !state.vms.contains_key(vmid) {
            violations.push(InvariantViolation {
                invariant: "vm_capability_consistency",
                description: alloc::format!(
                    "capability set exists for non-existent VM {}",
                    vmid.0
                ),
            });
        }
    }

    violations
}

/// Invariant 3: every mapping's owner exists
fn check_mapping_ownership(state: &SystemState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for mapping in &state.memory {
        if !state.vms.contains_key(&mapping.owner) {
            violations.push(InvariantViolation {
                invariant: "mapping_ownership",
                description: alloc::format!(
                    "mapping at gpa {:#x} owned by non-existent VM {}",
                    mapping.gpa.start,
                    mapping.owner.0
                ),
            });
        }
    }

    violations
}

/// Invariant 4: allocator cursors are above every allocated ID
fn check_id_monotonicity(state: &SystemState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for vmid in state.vms.keys() {
        if vmid.0 >= state.next_vmid {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "VM {} exists but next_vmid is {}",
                    vmid.0,
                    state.next_vmid
                ),
            });
        }
    }

    violations
}

/// Invariant 5: exit log sequence numbers are strictly increasing
fn check_exit_log_order(state: &SystemState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for pair in state.exit_log.windows(2) {
        if pair[1].seq <= pair[0].seq {
            violations.push(InvariantViolation {
                invariant: "exit_log_order",
                description: alloc::format!(
                    "exit seq {} follows seq {}",
                    pair[1].seq,
                    pair[0].seq
                ),
            });
        }
    }

    if let Some(last) = state.exit_log.last() {
        if last.seq >= state.next_exit_seq {
            violations.push(InvariantViolation {
                invariant: "exit_log_order",
                description: alloc::format!(
                    "exit seq {} exists but next_exit_seq is {}",
                    last.seq,
                    state.next_exit_seq
                ),
            });
        }
    }

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(state: &SystemState) {
    let violations = check_all_invariants(state);
    if !violations.is_empty() {
        for v in &violations {
            panic!("Invariant violated: {}", v.invariant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability;
    use crate::lifecycle;
    use crate::memory::{GpaRange, HostRange, Mapping};
    use crate::types::{CapKind, Capability, CpuState, ExitReason, MemPerms, VmConfig, VmId};
    use alloc::string::ToString;

    fn config() -> VmConfig {
        VmConfig {
            memory_size: 0x10000,
            vcpu_count: 1,
            name: "guest".to_string(),
        }
    }

    #[test]
    fn test_invariants_hold_for_new_state() {
        let state = SystemState::new();
        assert!(check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_invariants_hold_through_full_lifecycle() {
        let mut state = SystemState::new();
        let vmid = lifecycle::create_vm(&mut state, config());
        assert!(check_all_invariants(&state).is_empty());

        for kind in [CapKind::VcpuCreate, CapKind::VcpuRun, CapKind::Halt] {
            capability::grant(&mut state, vmid, Capability::new(kind, vmid)).unwrap();
        }
        memory::map(
            &mut state,
            vmid,
            GpaRange::new(0, 0x10000),
            HostRange::new(0x100000, 0x10000),
            MemPerms::rw(),
        )
        .unwrap();
        lifecycle::initialize_vm(&mut state, vmid, 0x1000).unwrap();
        assert!(check_all_invariants(&state).is_empty());

        lifecycle::trap_vm(&mut state, vmid, ExitReason::WaitForInterrupt, CpuState::default())
            .unwrap();
        lifecycle::resume_vm(&mut state, vmid, None).unwrap();
        assert!(check_all_invariants(&state).is_empty());

        lifecycle::halt_vm(&mut state, vmid).unwrap();
        lifecycle::destroy_vm(&mut state, vmid).unwrap();
        assert!(check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_detects_orphan_capability_set() {
        let mut state = SystemState::new();
        state.caps.insert(VmId(999), Default::default());

        let violations = check_all_invariants(&state);
        assert!(violations
            .iter()
            .any(|v| v.invariant == "vm_capability_consistency"));
    }

    #[test]
    fn test_detects_injected_memory_overlap() {
        let mut state = SystemState::new();
        let a = lifecycle::create_vm(&mut state, config());
        let b = lifecycle::create_vm(&mut state, config());

        state.memory.push(Mapping {
            owner: a,
            gpa: GpaRange::new(0x1000, 0x1000),
            host: HostRange::new(0x100000, 0x1000),
            perms: MemPerms::rw(),
        });
        state.memory.push(Mapping {
            owner: b,
            gpa: GpaRange::new(0x1800, 0x1000),
            host: HostRange::new(0x200000, 0x1000),
            perms: MemPerms::rw(),
        });

        let violations = check_all_invariants(&state);
        assert!(violations.iter().any(|v| v.invariant == "memory_isolation"));
    }

    #[test]
    fn test_detects_dangling_mapping_owner() {
        let mut state = SystemState::new();
        state.memory.push(Mapping {
            owner: VmId(42),
            gpa: GpaRange::new(0x1000, 0x1000),
            host: HostRange::new(0x100000, 0x1000),
            perms: MemPerms::rw(),
        });

        let violations = check_all_invariants(&state);
        assert!(violations.iter().any(|v| v.invariant == "mapping_ownership"));
    }

    #[test]
    fn test_detects_id_monotonicity_violation() {
        let mut state = SystemState::new();
        lifecycle::create_vm(&mut state, config());
        state.next_vmid = 0;

        let violations = check_all_invariants(&state);
        assert!(violations.iter().any(|v| v.invariant == "id_monotonicity"));
    }

    #[test]
    fn test_detects_exit_log_disorder() {
        let mut state = SystemState::new();
        let vmid = lifecycle::create_vm(&mut state, config());
        state.record_exit(vmid, ExitReason::WaitForInterrupt, CpuState::default());
        state.record_exit(vmid, ExitReason::Cancelled, CpuState::default());

        // Corrupt the ordering
        state.exit_log[1].seq = 0;

        let violations = check_all_invariants(&state);
        assert!(violations.iter().any(|v| v.invariant == "exit_log_order"));
    }

    #[test]
    fn test_assert_invariants_passes_for_valid_state() {
        let mut state = SystemState::new();
        lifecycle::create_vm(&mut state, config());
        assert_invariants(&state);
    }

    #[test]
    #[should_panic(expected = "Invariant violated")]
    fn test_assert_invariants_panics_on_violation() {
        let mut state = SystemState::new();
        state.caps.insert(VmId(999), Default::default());
        assert_invariants(&state);
    }
}
