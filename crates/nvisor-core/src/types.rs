//! Core nucleus types
//!
//! This module contains the fundamental types used throughout the nucleus
//! core. All types here are pure data - no behavior that depends on the
//! virtualization backend.

use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Virtual machine identifier
///
/// Allocated monotonically for the lifetime of a nucleus instance and
/// never reused, even after the VM is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmId(pub u64);

/// Guest-physical address
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gpa(pub u64);

/// CPU register snapshot
///
/// Opaque to the nucleus except for the dispatcher, which advances `pc`
/// past a voluntarily-yielding instruction. Meaningful interpretation of
/// the registers belongs to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    /// General-purpose registers x0-x30
    pub regs: [u64; 31],
    /// Program counter
    pub pc: u64,
    /// Stack pointer
    pub sp: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            regs: [0; 31],
            pc: 0,
            sp: 0,
        }
    }
}

impl CpuState {
    /// Snapshot with the program counter set to an entry point
    pub fn at_entry(entry_point: u64) -> Self {
        Self {
            pc: entry_point,
            ..Self::default()
        }
    }

    /// Copy of this snapshot with `pc` advanced past one instruction
    pub fn advanced(&self) -> Self {
        let mut next = *self;
        next.pc = next.pc.wrapping_add(4);
        next
    }
}

/// Reason control returned from guest execution to the nucleus
///
/// This is a closed union: the dispatcher matches every variant without a
/// wildcard arm, so adding a variant is a build-time error until every
/// resolution is defined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Guest-issued hypercall with number and arguments
    Hypercall { nr: u64, args: [u64; 6] },
    /// Data access to an unmapped or protected guest-physical address
    MemoryFault { gpa: Gpa, write: bool },
    /// Instruction fetch from an unmapped guest-physical address
    InstructionAbort { gpa: Gpa },
    /// Trapped system register access
    SysRegAccess { reg: u32, write: bool },
    /// Guest executed a wait-for-interrupt (voluntary yield)
    WaitForInterrupt,
    /// Guest raised an exception
    Exception { vector: u32 },
    /// Caller cancelled an in-flight run
    Cancelled,
}

/// VM lifecycle state
///
/// `Halted` is terminal: no transition leaves it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// Created but not yet initialized; holds no CPU context
    Created,
    /// Ready to execute with the given CPU context
    Runnable(CpuState),
    /// Returned from guest execution, awaiting resolution
    Trapped(ExitReason, CpuState),
    /// Permanently stopped (terminal)
    Halted,
}

impl VmState {
    /// True for the terminal state
    pub fn is_halted(&self) -> bool {
        matches!(self, VmState::Halted)
    }
}

/// Static VM configuration supplied at creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Guest memory size in bytes
    pub memory_size: u64,
    /// Number of virtual CPUs
    pub vcpu_count: u32,
    /// Human-readable name for diagnostics
    pub name: String,
}

/// One VM's entry in the system state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRecord {
    /// VM identifier
    pub vmid: VmId,
    /// Configuration supplied at creation
    pub config: VmConfig,
    /// Current lifecycle state
    pub state: VmState,
}

/// Action kinds a capability can authorize
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapKind {
    /// Map guest memory
    MemoryMap,
    /// Unmap guest memory
    MemoryUnmap,
    /// Create virtual CPUs (initialize the VM)
    VcpuCreate,
    /// Run or resume virtual CPUs
    VcpuRun,
    /// Have hypercalls interpreted by the nucleus
    Hypercall,
    /// Halt the VM
    Halt,
    /// Transfer capabilities to another VM
    Transfer,
}

/// An unforgeable permission token: one action kind, scoped to one VM
///
/// Possession is binary - a capability set either contains the token or it
/// does not. Nothing is counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    /// What the token authorizes
    pub kind: CapKind,
    /// The VM the action applies to
    pub scope: VmId,
}

impl Capability {
    /// Construct a capability token
    pub fn new(kind: CapKind, scope: VmId) -> Self {
        Self { kind, scope }
    }
}

/// Memory protection flags for a guest mapping
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemPerms {
    /// Guest may read
    pub read: bool,
    /// Guest may write
    pub write: bool,
    /// Guest may execute
    pub exec: bool,
}

impl MemPerms {
    /// Read/write/execute
    pub fn rwx() -> Self {
        Self {
            read: true,
            write: true,
            exec: true,
        }
    }

    /// Read/write, no execute
    pub fn rw() -> Self {
        Self {
            read: true,
            write: true,
            exec: false,
        }
    }

    /// Read-only
    pub fn ro() -> Self {
        Self {
            read: true,
            write: false,
            exec: false,
        }
    }
}

/// One append-only entry in the exit log
///
/// Appended exactly once per exit, never mutated. The sequence number is
/// strictly increasing across all VMs, which makes the log a total order
/// of observed exits for audit and determinism checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    /// Monotonically increasing sequence number
    pub seq: u64,
    /// VM that exited
    pub vmid: VmId,
    /// Why control returned to the nucleus
    pub reason: ExitReason,
    /// CPU snapshot at the moment of exit
    pub cpu: CpuState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_state_at_entry() {
        let cpu = CpuState::at_entry(0x1000);
        assert_eq!(cpu.pc, 0x1000);
        assert_eq!(cpu.sp, 0);
        assert_eq!(cpu.regs, [0; 31]);
    }

    #[test]
    fn test_cpu_state_advanced() {
        let cpu = CpuState::at_entry(0x1000);
        let next = cpu.advanced();
        assert_eq!(next.pc, 0x1004);
        assert_eq!(next.regs, cpu.regs);
        assert_eq!(next.sp, cpu.sp);
    }

    #[test]
    fn test_cpu_state_advanced_wraps() {
        let cpu = CpuState::at_entry(u64::MAX - 1);
        assert_eq!(cpu.advanced().pc, 2);
    }

    #[test]
    fn test_vm_state_is_halted() {
        assert!(VmState::Halted.is_halted());
        assert!(!VmState::Created.is_halted());
        assert!(!VmState::Runnable(CpuState::default()).is_halted());
    }

    #[test]
    fn test_capability_ordering_in_set() {
        use alloc::collections::BTreeSet;

        let mut set = BTreeSet::new();
        set.insert(Capability::new(CapKind::Halt, VmId(1)));
        set.insert(Capability::new(CapKind::Halt, VmId(1)));
        set.insert(Capability::new(CapKind::Halt, VmId(2)));

        // Same (kind, scope) pair is one token; possession is binary
        assert_eq!(set.len(), 2);
    }
}
