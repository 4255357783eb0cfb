//! System state - pure data structure holding all nucleus state
//!
//! This module contains the SystemState struct which holds all mutable
//! nucleus state. It has NO backend dependency - all platform-specific
//! behavior is in the runtime wrapper (`nvisor`).
//!
//! SystemState is `Clone` so the runtime's state store can apply a
//! mutation to a scratch copy and commit it only on success; no component
//! outside the store ever holds a reference across operations.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use crate::memory::Mapping;
use crate::types::{Capability, CpuState, ExitReason, ExitRecord, VmConfig, VmId, VmRecord, VmState};

/// The pure nucleus state - no backend, no I/O, no side effects.
///
/// Single source of truth for every component. All transformations are
/// done through the lifecycle, memory and capability modules; this struct
/// only provides allocation and lookup.
#[derive(Clone)]
pub struct SystemState {
    /// VM table
    pub vms: BTreeMap<VmId, VmRecord>,
    /// Capability sets (per VM)
    pub caps: BTreeMap<VmId, BTreeSet<Capability>>,
    /// Global memory map, owner-tagged
    pub memory: Vec<Mapping>,
    /// Append-only exit log
    pub exit_log: Vec<ExitRecord>,
    /// Next VM ID to allocate
    pub next_vmid: u64,
    /// Next exit log sequence number
    pub next_exit_seq: u64,
}

impl SystemState {
    /// Create a new empty system state.
    pub fn new() -> Self {
        Self {
            vms: BTreeMap::new(),
            caps: BTreeMap::new(),
            memory: Vec::new(),
            exit_log: Vec::new(),
            next_vmid: 1,
            next_exit_seq: 0,
        }
    }

    /// Allocate the next VM ID. IDs are never reused.
    pub fn alloc_vmid(&mut self) -> VmId {
        let vmid = VmId(self.next_vmid);
        self.next_vmid += 1;
        vmid
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Get a VM record
    pub fn vm(&self, vmid: VmId) -> Option<&VmRecord> {
        self.vms.get(&vmid)
    }

    /// Get a mutable VM record
    pub fn vm_mut(&mut self, vmid: VmId) -> Option<&mut VmRecord> {
        self.vms.get_mut(&vmid)
    }

    /// Check if a VM exists
    pub fn vm_exists(&self, vmid: VmId) -> bool {
        self.vms.contains_key(&vmid)
    }

    /// List all VM ids with their current state
    pub fn list_vms(&self) -> Vec<(VmId, VmState)> {
        self.vms
            .iter()
            .map(|(&vmid, rec)| (vmid, rec.state.clone()))
            .collect()
    }

    /// Get a VM's capability set
    pub fn cap_set(&self, vmid: VmId) -> Option<&BTreeSet<Capability>> {
        self.caps.get(&vmid)
    }

    /// Get a VM's mutable capability set
    pub fn cap_set_mut(&mut self, vmid: VmId) -> Option<&mut BTreeSet<Capability>> {
        self.caps.get_mut(&vmid)
    }

    /// All mappings owned by a VM
    pub fn mappings_of(&self, vmid: VmId) -> Vec<&Mapping> {
        self.memory.iter().filter(|m| m.owner == vmid).collect()
    }

    // ========================================================================
    // State mutation helpers (pure - no side effects)
    // ========================================================================

    /// Register a new VM in `Created` state, returning its id.
    ///
    /// The capability set starts empty; tokens are granted separately.
    pub fn register_vm(&mut self, config: VmConfig) -> VmId {
        let vmid = self.alloc_vmid();
        let record = VmRecord {
            vmid,
            config,
            state: VmState::Created,
        };
        self.vms.insert(vmid, record);
        self.caps.insert(vmid, BTreeSet::new());
        vmid
    }

    /// Remove a VM record and its capability set completely.
    pub fn remove_vm(&mut self, vmid: VmId) -> bool {
        self.vms.remove(&vmid).is_some() && self.caps.remove(&vmid).is_some()
    }

    /// Append an exit record, returning its sequence number.
    ///
    /// The log is append-only; entries are never mutated afterwards.
    pub fn record_exit(&mut self, vmid: VmId, reason: ExitReason, cpu: CpuState) -> u64 {
        let seq = self.next_exit_seq;
        self.next_exit_seq += 1;
        self.exit_log.push(ExitRecord {
            seq,
            vmid,
            reason,
            cpu,
        });
        seq
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CpuState;
    use alloc::string::ToString;

    fn config(name: &str) -> VmConfig {
        VmConfig {
            memory_size: 512 * 1024 * 1024,
            vcpu_count: 1,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_state_creation() {
        let state = SystemState::new();
        assert_eq!(state.vms.len(), 0);
        assert_eq!(state.memory.len(), 0);
        assert_eq!(state.exit_log.len(), 0);
        assert_eq!(state.next_vmid, 1);
        assert_eq!(state.next_exit_seq, 0);
    }

    #[test]
    fn test_register_vm() {
        let mut state = SystemState::new();
        let vmid = state.register_vm(config("guest"));

        assert_eq!(vmid.0, 1);
        assert!(state.vm(vmid).is_some());
        assert_eq!(state.vm(vmid).unwrap().state, VmState::Created);
        assert_eq!(state.next_vmid, 2);

        // Capability set exists but starts empty
        assert!(state.cap_set(vmid).is_some());
        assert!(state.cap_set(vmid).unwrap().is_empty());
    }

    #[test]
    fn test_vmids_never_reused() {
        let mut state = SystemState::new();
        let first = state.register_vm(config("a"));
        state.remove_vm(first);

        let second = state.register_vm(config("b"));
        assert_ne!(first, second);
        assert_eq!(second.0, 2);
    }

    #[test]
    fn test_remove_vm_complete_removal() {
        let mut state = SystemState::new();
        let vmid = state.register_vm(config("guest"));

        assert!(state.remove_vm(vmid));
        assert!(state.vm(vmid).is_none());
        assert!(state.cap_set(vmid).is_none());

        // Removing again returns false
        assert!(!state.remove_vm(vmid));
    }

    #[test]
    fn test_record_exit_sequence() {
        let mut state = SystemState::new();
        let vmid = state.register_vm(config("guest"));

        let s0 = state.record_exit(vmid, ExitReason::WaitForInterrupt, CpuState::default());
        let s1 = state.record_exit(vmid, ExitReason::Cancelled, CpuState::default());

        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
        assert_eq!(state.exit_log.len(), 2);
        assert_eq!(state.exit_log[0].seq, 0);
        assert_eq!(state.exit_log[1].seq, 1);
        assert_eq!(state.exit_log[1].reason, ExitReason::Cancelled);
    }

    #[test]
    fn test_list_vms() {
        let mut state = SystemState::new();
        let a = state.register_vm(config("a"));
        let b = state.register_vm(config("b"));

        let listed = state.list_vms();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|(id, st)| *id == a && *st == VmState::Created));
        assert!(listed.iter().any(|(id, st)| *id == b && *st == VmState::Created));
    }
}
