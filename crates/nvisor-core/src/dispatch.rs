//! VM exit dispatching
//!
//! This module enforces two invariants:
//! 1. **Totality**: every `ExitReason` variant resolves to a defined
//!    action. The match has no wildcard arm, so an unhandled variant is a
//!    build-time error, never a runtime fallback.
//! 2. **Determinism**: resolution is a pure function of
//!    `(vmid, exit_reason, cpu_state)` and the policy - no clocks, no
//!    randomness, no hidden global state.
//!
//! Capability gating of the resolved action (the `Halt` and `Hypercall`
//! tokens) is applied by the runtime when the resolution is committed;
//! keeping it out of `resolve` is what keeps resolution pure.

use serde::{Deserialize, Serialize};

use crate::types::{CpuState, ExitReason, VmId};

/// Exit resolution policy.
///
/// The hypercall-number-to-action mapping is guest ABI convention, not a
/// property of the nucleus, so it is carried as configuration instead of
/// a hard-coded constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    /// Hypercall number the guest uses to request a halt
    pub halt_hypercall: u64,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self { halt_hypercall: 1 }
    }
}

/// Resolved follow-up for one VM exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Make the VM runnable again with the given CPU state
    Resume(CpuState),
    /// Halt the VM permanently
    Halt,
    /// Leave the VM trapped for the orchestration layer to interpret
    Deliver,
}

/// Lifecycle state the action leads to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextState {
    /// VM becomes runnable
    Runnable,
    /// VM stays trapped
    Trapped,
    /// VM is halted (terminal)
    Halted,
}

impl ExitAction {
    /// The lifecycle state this action transitions the VM into.
    pub fn next_state(&self) -> NextState {
        match self {
            ExitAction::Resume(_) => NextState::Runnable,
            ExitAction::Halt => NextState::Halted,
            ExitAction::Deliver => NextState::Trapped,
        }
    }
}

/// Resolve one VM exit into its follow-up action.
///
/// Pure and total: identical `(vmid, reason, cpu)` inputs produce an
/// identical action, and every variant of the closed `ExitReason` union
/// has exactly one arm.
///
/// Default policy:
/// - `WaitForInterrupt`: the guest yielded voluntarily; resume past the
///   yielding instruction.
/// - halt hypercall (policy-selected number): halt.
/// - any other hypercall: deliver to the orchestration layer.
/// - faults, aborts, register traps, exceptions: deliver - the guest
///   violated a precondition and the orchestration layer decides whether
///   to inspect, resume or kill.
/// - `Cancelled`: halt; a cancelled run is never resumable.
pub fn resolve(policy: &ExitPolicy, _vmid: VmId, reason: &ExitReason, cpu: &CpuState) -> ExitAction {
    match reason {
        ExitReason::Hypercall { nr, args: _ } => {
            if *nr == policy.halt_hypercall {
                ExitAction::Halt
            } else {
                ExitAction::Deliver
            }
        }
        ExitReason::MemoryFault { gpa: _, write: _ } => ExitAction::Deliver,
        ExitReason::InstructionAbort { gpa: _ } => ExitAction::Deliver,
        ExitReason::SysRegAccess { reg: _, write: _ } => ExitAction::Deliver,
        ExitReason::WaitForInterrupt => ExitAction::Resume(cpu.advanced()),
        ExitReason::Exception { vector: _ } => ExitAction::Deliver,
        ExitReason::Cancelled => ExitAction::Halt,
    }
}
