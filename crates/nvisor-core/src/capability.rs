//! Capability-based access control
//!
//! This module implements the nucleus capability layer:
//! - Capability tokens scoped to one VM and one action kind
//! - Per-VM capability sets with idempotent grant/revoke
//! - The `check` function every gated operation routes through
//!
//! # Security Properties (Verification Targets)
//!
//! 1. **Soundness**: an action executes if and only if `check` returned
//!    true for its required token at the moment it began
//! 2. **Fail Closed**: unknown VMs and missing tokens always deny
//! 3. **Atomic Transfer**: a transferred token is never observably held by
//!    both VMs or by neither

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::state::SystemState;
use crate::types::{Capability, VmId};

/// Errors returned by capability operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapError {
    /// VM does not exist
    VmNotFound,
    /// Source VM does not hold the capability being transferred
    NotHeld,
}

/// Check whether a VM holds a capability.
///
/// This is the single gatekeeper function: every capability-gated
/// operation calls it before executing, and no operation proceeds
/// speculatively with a later rollback.
///
/// Pure lookup - never modifies any state, and an unknown VM simply
/// does not hold anything (fail closed).
pub fn check(state: &SystemState, vmid: VmId, cap: Capability) -> bool {
    state
        .cap_set(vmid)
        .map(|set| set.contains(&cap))
        .unwrap_or(false)
}

/// Grant a capability to a VM. Idempotent: granting a held token is a
/// no-op, not an error.
pub fn grant(state: &mut SystemState, vmid: VmId, cap: Capability) -> Result<(), CapError> {
    let set = state.cap_set_mut(vmid).ok_or(CapError::VmNotFound)?;
    set.insert(cap);
    Ok(())
}

/// Revoke a capability from a VM. Idempotent: revoking an absent token is
/// a no-op, not an error.
pub fn revoke(state: &mut SystemState, vmid: VmId, cap: Capability) -> Result<(), CapError> {
    let set = state.cap_set_mut(vmid).ok_or(CapError::VmNotFound)?;
    set.remove(&cap);
    Ok(())
}

/// Move a capability from one VM to another.
///
/// Revoke-from-source and grant-to-destination happen in the same state
/// mutation: no intermediate state where both or neither VM holds the
/// token is ever observable through the store.
pub fn transfer(
    state: &mut SystemState,
    from: VmId,
    to: VmId,
    cap: Capability,
) -> Result<(), CapError> {
    if !state.vm_exists(from) || !state.vm_exists(to) {
        return Err(CapError::VmNotFound);
    }
    if !check(state, from, cap) {
        return Err(CapError::NotHeld);
    }

    // Both sets exist past this point; the two updates are one mutation
    // from the store's point of view.
    if let Some(set) = state.cap_set_mut(from) {
        set.remove(&cap);
    }
    if let Some(set) = state.cap_set_mut(to) {
        set.insert(cap);
    }
    Ok(())
}

/// List all capabilities held by a VM.
pub fn list(state: &SystemState, vmid: VmId) -> Result<Vec<Capability>, CapError> {
    let set = state.cap_set(vmid).ok_or(CapError::VmNotFound)?;
    Ok(set.iter().copied().collect())
}

/// Drop a VM's entire capability set contents. Used by VM destruction.
pub fn release_all(state: &mut SystemState, vmid: VmId) {
    if let Some(set) = state.cap_set_mut(vmid) {
        *set = BTreeSet::new();
    }
}

// ============================================================================
// Kani proofs for capability checking
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::types::{CapKind, VmConfig};
    use alloc::string::String;

    /// Proof: fail closed - an empty state denies any token for any VM
    #[kani::proof]
    fn fail_closed_unknown_vm() {
        let state = SystemState::new();
        let cap = Capability {
            kind: CapKind::Halt,
            scope: VmId(kani::any()),
        };

        kani::assert(
            !check(&state, VmId(kani::any()), cap),
            "Empty state must deny every check",
        );
    }

    /// Proof: transfer conserves the token - exactly one holder afterwards
    #[kani::proof]
    #[kani::unwind(5)]
    fn transfer_conserves_token() {
        let mut state = SystemState::new();
        let from = state.register_vm(VmConfig {
            memory_size: 0,
            vcpu_count: 1,
            name: String::new(),
        });
        let to = state.register_vm(VmConfig {
            memory_size: 0,
            vcpu_count: 1,
            name: String::new(),
        });
        let cap = Capability {
            kind: CapKind::Halt,
            scope: from,
        };
        grant(&mut state, from, cap).unwrap();

        if transfer(&mut state, from, to, cap).is_ok() {
            kani::assert(
                !check(&state, from, cap) && check(&state, to, cap),
                "After transfer exactly the destination holds the token",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapKind, VmConfig};
    use alloc::string::ToString;

    fn setup() -> (SystemState, VmId, VmId) {
        let mut state = SystemState::new();
        let a = state.register_vm(VmConfig {
            memory_size: 0x10000,
            vcpu_count: 1,
            name: "a".to_string(),
        });
        let b = state.register_vm(VmConfig {
            memory_size: 0x10000,
            vcpu_count: 1,
            name: "b".to_string(),
        });
        (state, a, b)
    }

    #[test]
    fn test_check_denies_by_default() {
        let (state, a, _) = setup();
        assert!(!check(&state, a, Capability::new(CapKind::Halt, a)));
    }

    #[test]
    fn test_check_denies_unknown_vm() {
        let state = SystemState::new();
        assert!(!check(&state, VmId(99), Capability::new(CapKind::Halt, VmId(99))));
    }

    #[test]
    fn test_grant_then_check() {
        let (mut state, a, _) = setup();
        let cap = Capability::new(CapKind::VcpuRun, a);

        grant(&mut state, a, cap).unwrap();
        assert!(check(&state, a, cap));

        // Scope matters: same kind for another VM is a different token
        assert!(!check(&state, a, Capability::new(CapKind::VcpuRun, VmId(99))));
    }

    #[test]
    fn test_grant_idempotent() {
        let (mut state, a, _) = setup();
        let cap = Capability::new(CapKind::Halt, a);

        grant(&mut state, a, cap).unwrap();
        grant(&mut state, a, cap).unwrap();

        assert_eq!(list(&state, a).unwrap().len(), 1);
    }

    #[test]
    fn test_revoke_idempotent() {
        let (mut state, a, _) = setup();
        let cap = Capability::new(CapKind::Halt, a);

        grant(&mut state, a, cap).unwrap();
        revoke(&mut state, a, cap).unwrap();
        assert!(!check(&state, a, cap));

        // Revoking an absent token is a no-op
        revoke(&mut state, a, cap).unwrap();
        assert!(!check(&state, a, cap));
    }

    #[test]
    fn test_grant_unknown_vm() {
        let mut state = SystemState::new();
        let result = grant(
            &mut state,
            VmId(7),
            Capability::new(CapKind::Halt, VmId(7)),
        );
        assert_eq!(result, Err(CapError::VmNotFound));
    }

    #[test]
    fn test_transfer_moves_token() {
        let (mut state, a, b) = setup();
        let cap = Capability::new(CapKind::Halt, a);
        grant(&mut state, a, cap).unwrap();

        transfer(&mut state, a, b, cap).unwrap();

        assert!(!check(&state, a, cap));
        assert!(check(&state, b, cap));
    }

    #[test]
    fn test_transfer_not_held() {
        let (mut state, a, b) = setup();
        let cap = Capability::new(CapKind::Halt, a);

        let result = transfer(&mut state, a, b, cap);
        assert_eq!(result, Err(CapError::NotHeld));

        // Neither side gained anything from the failed transfer
        assert!(!check(&state, a, cap));
        assert!(!check(&state, b, cap));
    }

    #[test]
    fn test_transfer_unknown_destination() {
        let (mut state, a, _) = setup();
        let cap = Capability::new(CapKind::Halt, a);
        grant(&mut state, a, cap).unwrap();

        let result = transfer(&mut state, a, VmId(99), cap);
        assert_eq!(result, Err(CapError::VmNotFound));

        // Source still holds the token
        assert!(check(&state, a, cap));
    }

    #[test]
    fn test_list_capabilities() {
        let (mut state, a, _) = setup();
        grant(&mut state, a, Capability::new(CapKind::VcpuCreate, a)).unwrap();
        grant(&mut state, a, Capability::new(CapKind::VcpuRun, a)).unwrap();

        let caps = list(&state, a).unwrap();
        assert_eq!(caps.len(), 2);
        assert!(caps.contains(&Capability::new(CapKind::VcpuCreate, a)));
        assert!(caps.contains(&Capability::new(CapKind::VcpuRun, a)));
    }

    #[test]
    fn test_release_all() {
        let (mut state, a, _) = setup();
        grant(&mut state, a, Capability::new(CapKind::Halt, a)).unwrap();
        grant(&mut state, a, Capability::new(CapKind::VcpuRun, a)).unwrap();

        release_all(&mut state, a);

        assert!(list(&state, a).unwrap().is_empty());
    }
}
