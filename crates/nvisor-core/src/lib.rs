//! nvisor-core - Pure State Machine for the VM Isolation Nucleus
//!
//! This crate contains the **pure, backend-free** state machine that
//! serves as the primary verification target for nvisor.
//!
//! # Design Principles
//!
//! 1. **No backend dependency**: all platform-specific code lives in the
//!    runtime wrapper (`nvisor`)
//! 2. **No I/O or side effects**: pure state transformations only
//! 3. **Deterministic**: same input always produces same output
//! 4. **Verifiable**: small TCB suitable for model checking
//!
//! # Invariants
//!
//! The core enforces four properties at every observable point:
//!
//! 1. **Memory Non-Interference**: distinct VMs have disjoint
//!    guest-physical and host memory regions
//! 2. **Capability Soundness**: an action executes if and only if the VM
//!    held the required capability when it began
//! 3. **Deterministic Exit Handling**: identical exit inputs produce
//!    identical resolutions and identical log entries
//! 4. **Totality**: every VM exit variant is handled by exactly one
//!    defined rule
//!
//! # Module Organization
//!
//! - `types` - Core types (VmId, VmState, ExitReason, Capability, ...)
//! - `state` - SystemState struct with all nucleus data
//! - `memory` - Guest memory mapping and the isolation checker
//! - `capability` - Capability table and the `check` gatekeeper
//! - `lifecycle` - The VM state machine transitions
//! - `dispatch` - Total, deterministic exit resolution
//! - `invariants` - Formal invariant assertions for verification

#![no_std]
extern crate alloc;

pub mod capability;
pub mod dispatch;
pub mod invariants;
pub mod lifecycle;
pub mod memory;
pub mod state;
pub mod types;

// Re-export all public types for convenient access
pub use capability::CapError;
pub use dispatch::{resolve, ExitAction, ExitPolicy, NextState};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use lifecycle::VmError;
pub use memory::{GpaRange, HostRange, Mapping, MemoryError};
pub use state::SystemState;
pub use types::{
    CapKind, Capability, CpuState, ExitReason, ExitRecord, Gpa, MemPerms, VmConfig, VmId,
    VmRecord, VmState,
};
