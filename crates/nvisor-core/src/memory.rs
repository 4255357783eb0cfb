//! Memory mapping and isolation
//!
//! This module enforces the memory non-interference invariant: mappings
//! owned by distinct VMs have disjoint guest-physical ranges and disjoint
//! host ranges, and no VM maps the same guest-physical address twice.
//!
//! `map` is the only way a mapping enters the global memory map and it
//! refuses every overlap, so the invariant holds by construction;
//! `verify_isolation` re-checks it pairwise for audits and tests only.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::state::SystemState;
use crate::types::{MemPerms, VmId};

/// Half-open guest-physical address range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpaRange {
    /// First guest-physical address in the range
    pub start: u64,
    /// One past the last guest-physical address
    pub end: u64,
}

impl GpaRange {
    /// Range covering `[start, start + len)`
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True for a zero-length range
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True if the two ranges share any address
    pub fn overlaps(&self, other: &GpaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Half-open host address range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRange {
    /// First host address in the range
    pub start: u64,
    /// One past the last host address
    pub end: u64,
}

impl HostRange {
    /// Range covering `[start, start + len)`
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    /// True if the two ranges share any address
    pub fn overlaps(&self, other: &HostRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One entry in the global memory map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// VM that owns the mapping
    pub owner: VmId,
    /// Guest-physical range
    pub gpa: GpaRange,
    /// Backing host range
    pub host: HostRange,
    /// Protection flags
    pub perms: MemPerms,
}

/// Errors returned by memory isolation operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// Owning VM does not exist
    VmNotFound,
    /// Requested range intersects an existing mapping
    Overlap,
    /// No matching mapping owned by the VM
    NotMapped,
}

/// Record a guest-physical to host mapping for `vmid`.
///
/// Fails with `Overlap` if:
/// - the guest-physical range intersects any mapping of the same VM
///   (no double-mapping of a guest address), or
/// - the guest-physical range or the host range intersects any mapping
///   owned by a *different* VM.
///
/// On any error the memory map is exactly as it was before the call.
pub fn map(
    state: &mut SystemState,
    vmid: VmId,
    gpa: GpaRange,
    host: HostRange,
    perms: MemPerms,
) -> Result<(), MemoryError> {
    if !state.vm_exists(vmid) {
        return Err(MemoryError::VmNotFound);
    }

    for existing in &state.memory {
        if existing.owner == vmid {
            if existing.gpa.overlaps(&gpa) {
                return Err(MemoryError::Overlap);
            }
        } else if existing.gpa.overlaps(&gpa) || existing.host.overlaps(&host) {
            return Err(MemoryError::Overlap);
        }
    }

    state.memory.push(Mapping {
        owner: vmid,
        gpa,
        host,
        perms,
    });
    Ok(())
}

/// Remove the mapping of `gpa` owned by `vmid`.
///
/// The range must match an existing mapping exactly; partial unmapping is
/// not supported.
pub fn unmap(state: &mut SystemState, vmid: VmId, gpa: GpaRange) -> Result<(), MemoryError> {
    if !state.vm_exists(vmid) {
        return Err(MemoryError::VmNotFound);
    }

    let index = state
        .memory
        .iter()
        .position(|m| m.owner == vmid && m.gpa == gpa)
        .ok_or(MemoryError::NotMapped)?;

    state.memory.remove(index);
    Ok(())
}

/// Drop every mapping owned by `vmid`. Used by VM destruction.
pub fn release_mappings(state: &mut SystemState, vmid: VmId) -> usize {
    let before = state.memory.len();
    state.memory.retain(|m| m.owner != vmid);
    before - state.memory.len()
}

/// Checkable isolation predicate: mappings of distinct VMs are disjoint in
/// both guest-physical and host address space.
///
/// Audit/test use only - never on the hot path, because `map` refuses
/// every overlap and is the only mutator.
pub fn verify_isolation(state: &SystemState) -> bool {
    let mappings: Vec<&Mapping> = state.memory.iter().collect();
    for (i, a) in mappings.iter().enumerate() {
        for b in &mappings[i + 1..] {
            if a.owner != b.owner && (a.gpa.overlaps(&b.gpa) || a.host.overlaps(&b.host)) {
                return false;
            }
        }
    }
    true
}

// ============================================================================
// Kani proofs for the overlap checker
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: overlap is symmetric
    #[kani::proof]
    fn overlap_symmetric() {
        let a = GpaRange {
            start: kani::any(),
            end: kani::any(),
        };
        let b = GpaRange {
            start: kani::any(),
            end: kani::any(),
        };

        kani::assert(
            a.overlaps(&b) == b.overlaps(&a),
            "Range overlap must be symmetric",
        );
    }

    /// Proof: an empty range overlaps nothing
    #[kani::proof]
    fn empty_range_overlaps_nothing() {
        let start: u64 = kani::any();
        let empty = GpaRange { start, end: start };
        let other = GpaRange {
            start: kani::any(),
            end: kani::any(),
        };

        kani::assert(!empty.overlaps(&other), "Empty range must not overlap");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VmConfig;
    use alloc::string::ToString;

    fn setup_two_vms() -> (SystemState, VmId, VmId) {
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
    fn test_gpa_range_overlap() {
        let a = GpaRange::new(0x1000, 0x1000); // [0x1000, 0x2000)
        let b = GpaRange::new(0x1800, 0x1000); // [0x1800, 0x2800)
        let c = GpaRange::new(0x2000, 0x1000); // [0x2000, 0x3000)

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        // Half-open: touching ranges do not overlap
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn test_map_and_unmap() {
        let (mut state, a, _) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x100000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();
        assert_eq!(state.memory.len(), 1);

        unmap(&mut state, a, GpaRange::new(0x1000, 0x1000)).unwrap();
        assert_eq!(state.memory.len(), 0);
    }

    #[test]
    fn test_map_rejects_cross_vm_gpa_overlap() {
        // Two VMs each request overlapping guest-physical 0x1000-0x2000:
        // the second map must fail and leave no trace
        let (mut state, a, b) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x100000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();

        let result = map(
            &mut state,
            b,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x200000, 0x1000),
            MemPerms::rw(),
        );
        assert_eq!(result, Err(MemoryError::Overlap));

        // The failed mapping is absent afterwards
        assert_eq!(state.memory.len(), 1);
        assert_eq!(state.memory[0].owner, a);
        assert!(verify_isolation(&state));
    }

    #[test]
    fn test_map_rejects_cross_vm_host_overlap() {
        let (mut state, a, b) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x100000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();

        // Disjoint guest ranges, overlapping host ranges
        let result = map(
            &mut state,
            b,
            GpaRange::new(0x8000, 0x1000),
            HostRange::new(0x100800, 0x1000),
            MemPerms::rw(),
        );
        assert_eq!(result, Err(MemoryError::Overlap));
        assert_eq!(state.memory.len(), 1);
    }

    #[test]
    fn test_map_rejects_same_vm_double_mapping() {
        let (mut state, a, _) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x100000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();

        let result = map(
            &mut state,
            a,
            GpaRange::new(0x1800, 0x1000),
            HostRange::new(0x200000, 0x1000),
            MemPerms::rw(),
        );
        assert_eq!(result, Err(MemoryError::Overlap));
    }

    #[test]
    fn test_map_unknown_vm() {
        let mut state = SystemState::new();
        let result = map(
            &mut state,
            VmId(42),
            GpaRange::new(0, 0x1000),
            HostRange::new(0, 0x1000),
            MemPerms::rw(),
        );
        assert_eq!(result, Err(MemoryError::VmNotFound));
    }

    #[test]
    fn test_unmap_not_mapped() {
        let (mut state, a, _) = setup_two_vms();

        let result = unmap(&mut state, a, GpaRange::new(0x1000, 0x1000));
        assert_eq!(result, Err(MemoryError::NotMapped));
    }

    #[test]
    fn test_unmap_requires_exact_range() {
        let (mut state, a, _) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x2000),
            HostRange::new(0x100000, 0x2000),
            MemPerms::rw(),
        )
        .unwrap();

        // Sub-range does not match
        let result = unmap(&mut state, a, GpaRange::new(0x1000, 0x1000));
        assert_eq!(result, Err(MemoryError::NotMapped));
        assert_eq!(state.memory.len(), 1);
    }

    #[test]
    fn test_unmap_wrong_owner() {
        let (mut state, a, b) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x100000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();

        let result = unmap(&mut state, b, GpaRange::new(0x1000, 0x1000));
        assert_eq!(result, Err(MemoryError::NotMapped));
        assert_eq!(state.memory.len(), 1);
    }

    #[test]
    fn test_release_mappings() {
        let (mut state, a, b) = setup_two_vms();

        map(
            &mut state,
            a,
            GpaRange::new(0x1000, 0x1000),
            HostRange::new(0x100000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();
        map(
            &mut state,
            a,
            GpaRange::new(0x4000, 0x1000),
            HostRange::new(0x104000, 0x1000),
            MemPerms::ro(),
        )
        .unwrap();
        map(
            &mut state,
            b,
            GpaRange::new(0x8000, 0x1000),
            HostRange::new(0x200000, 0x1000),
            MemPerms::rw(),
        )
        .unwrap();

        assert_eq!(release_mappings(&mut state, a), 2);
        assert_eq!(state.memory.len(), 1);
        assert_eq!(state.memory[0].owner, b);
    }

    #[test]
    fn test_isolation_holds_across_map_unmap_sequences() {
        // Isolation must hold at every point of an arbitrary map/unmap
        // interleaving across several VMs
        let mut state = SystemState::new();
        let vms: Vec<VmId> = (0..4)
            .map(|i| {
                state.register_vm(VmConfig {
                    memory_size: 0x10000,
                    vcpu_count: 1,
                    name: alloc::format!("vm{}", i),
                })
            })
            .collect();

        for round in 0u64..8 {
            for (i, &vmid) in vms.iter().enumerate() {
                let gpa = GpaRange::new(round * 0x10000 + (i as u64) * 0x2000, 0x1000);
                let host = HostRange::new(0x1000000 + round * 0x40000 + (i as u64) * 0x2000, 0x1000);
                let _ = map(&mut state, vmid, gpa, host, MemPerms::rw());
                assert!(verify_isolation(&state));
            }
            // Unmap every other VM's round mapping
            for (i, &vmid) in vms.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
                let gpa = GpaRange::new(round * 0x10000 + (i as u64) * 0x2000, 0x1000);
                let _ = unmap(&mut state, vmid, gpa);
                assert!(verify_isolation(&state));
            }
        }
    }

    #[test]
    fn test_verify_isolation_detects_injected_overlap() {
        let (mut state, a, b) = setup_two_vms();

        // Bypass `map` and inject an overlapping pair directly
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

        assert!(!verify_isolation(&state));
    }
}
