//! The nucleus - lifecycle, capability, memory and exit orchestration
//!
//! `Nucleus` wires the pure core state machine to a virtualization
//! backend. The split is strict:
//!
//! - every decision (legality of a transition, capability possession,
//!   mapping disjointness, exit resolution) is made by `nvisor-core`
//!   inside an atomic store mutation
//! - every effect (containers, VCPUs, hardware mappings, guest
//!   execution) goes through the `VmBackend` trait, never under the
//!   store lock
//!
//! When core and backend must both act, the core commits first and a
//! backend failure rolls the core mutation back, so the store never
//! claims an effect the backend refused. The one exception is a failure
//! *during* guest execution: the run already happened, so the VM is
//! trapped with a synthetic exception instead of being rolled back.

use std::collections::BTreeMap;

use spin::Mutex;

use nvisor_backend::{CancelToken, VmBackend};
use nvisor_core::{
    capability, dispatch, lifecycle, memory, CapKind, Capability, CpuState, ExitAction, ExitPolicy,
    ExitReason, ExitRecord, GpaRange, HostRange, InvariantViolation, MemPerms, VmConfig, VmId,
    VmState,
};

use crate::error::Error;
use crate::store::StateStore;
use crate::translate::translate_exit;

/// Exception vector reported when the backend itself fails mid-run.
///
/// Real guest exceptions use small architecture-defined vectors, so the
/// all-ones value cannot collide with one.
const BACKEND_FAULT_VECTOR: u32 = u32::MAX;

/// Static facts about a running nucleus.
#[derive(Clone, Copy, Debug)]
pub struct SystemInfo {
    /// Whether the backend can run guests on this host
    pub backend_available: bool,
    /// Backend platform name
    pub platform: &'static str,
    /// Nucleus version
    pub core_version: &'static str,
    /// Maximum VCPUs per VM
    pub max_vcpus: u32,
}

/// Backend handles kept per VM.
struct VmHandles<B: VmBackend> {
    vm: B::VmHandle,
    vcpus: Vec<B::VcpuHandle>,
}

/// The VM isolation nucleus.
pub struct Nucleus<B: VmBackend> {
    store: StateStore,
    backend: B,
    policy: ExitPolicy,
    handles: Mutex<BTreeMap<VmId, VmHandles<B>>>,
}

impl<B: VmBackend> Nucleus<B> {
    /// Create a nucleus over a backend with the default exit policy.
    pub fn new(backend: B) -> Result<Self, Error> {
        Self::with_policy(backend, ExitPolicy::default())
    }

    /// Create a nucleus with an explicit exit policy.
    ///
    /// Refuses to start when the backend reports the platform as unable
    /// to run guests.
    pub fn with_policy(backend: B, policy: ExitPolicy) -> Result<Self, Error> {
        let info = backend.info();
        if !info.available {
            return Err(Error::UnsupportedPlatform(info.platform));
        }
        log::info!("nucleus starting on '{}' backend", info.platform);

        Ok(Self {
            store: StateStore::new(),
            backend,
            policy,
            handles: Mutex::new(BTreeMap::new()),
        })
    }

    /// The backend this nucleus drives.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Static facts about the nucleus and its backend.
    pub fn system_info(&self) -> SystemInfo {
        let info = self.backend.info();
        SystemInfo {
            backend_available: info.available,
            platform: info.platform,
            core_version: env!("CARGO_PKG_VERSION"),
            max_vcpus: info.max_vcpus,
        }
    }

    // ========================================================================
    // VM lifecycle
    // ========================================================================

    /// Create a VM in `Created` state with an empty capability set.
    pub fn create_vm(&self, config: VmConfig) -> Result<VmId, Error> {
        let name = config.name.clone();
        let vmid = self
            .store
            .mutate(|state| Ok::<_, Error>(lifecycle::create_vm(state, config)))?;

        match self.backend.create_vm(vmid) {
            Ok(handle) => {
                self.handles.lock().insert(
                    vmid,
                    VmHandles {
                        vm: handle,
                        vcpus: Vec::new(),
                    },
                );
                log::info!("vm {}: created '{}'", vmid.0, name);
                Ok(vmid)
            }
            Err(err) => {
                // Roll the registration back; the burned ID is never reused
                let _ = self.store.mutate(|state| {
                    state.remove_vm(vmid);
                    Ok::<_, Error>(())
                });
                log::warn!("vm {}: backend container creation failed: {:?}", vmid.0, err);
                Err(Error::BackendFailure(err))
            }
        }
    }

    /// Initialize a VM, creating its VCPUs and making it runnable at
    /// `entry_point`. Requires `VcpuCreate`.
    pub fn initialize_vm(&self, vmid: VmId, entry_point: u64) -> Result<(), Error> {
        // Refuse before touching the backend if the transition is denied
        let vcpu_count = self.store.read(|state| {
            let record = state.vm(vmid).ok_or(Error::VmNotFound)?;
            if !matches!(record.state, VmState::Created) {
                return Err(Error::InvalidStateTransition);
            }
            if !capability::check(state, vmid, Capability::new(CapKind::VcpuCreate, vmid)) {
                return Err(Error::CapabilityDenied);
            }
            Ok(record.config.vcpu_count)
        })?;

        let vm_handle = self
            .handles
            .lock()
            .get(&vmid)
            .map(|h| h.vm.clone())
            .ok_or(Error::VmNotFound)?;

        let mut vcpus = Vec::with_capacity(vcpu_count as usize);
        for _ in 0..vcpu_count {
            match self.backend.create_vcpu(&vm_handle) {
                Ok(vcpu) => vcpus.push(vcpu),
                Err(err) => {
                    self.destroy_vcpus(vmid, &vcpus);
                    return Err(Error::BackendFailure(err));
                }
            }
        }

        if let Err(err) = self
            .store
            .mutate(|state| lifecycle::initialize_vm(state, vmid, entry_point).map_err(Error::from))
        {
            self.destroy_vcpus(vmid, &vcpus);
            return Err(err);
        }

        if let Some(entry) = self.handles.lock().get_mut(&vmid) {
            entry.vcpus = vcpus;
        }
        log::info!("vm {}: initialized at {:#x}", vmid.0, entry_point);
        Ok(())
    }

    /// Resume a trapped VM, optionally with updated CPU state. Requires
    /// `VcpuRun`.
    pub fn resume_vm(&self, vmid: VmId, cpu: Option<CpuState>) -> Result<(), Error> {
        self.store
            .mutate(|state| lifecycle::resume_vm(state, vmid, cpu).map_err(Error::from))
    }

    /// Halt a VM permanently. Requires `Halt`.
    pub fn halt_vm(&self, vmid: VmId) -> Result<(), Error> {
        self.store
            .mutate(|state| lifecycle::halt_vm(state, vmid).map_err(Error::from))?;
        log::info!("vm {}: halted", vmid.0);
        Ok(())
    }

    /// Destroy a halted VM, releasing its mappings, capabilities and
    /// backend resources. The exit log keeps the VM's entries.
    pub fn destroy_vm(&self, vmid: VmId) -> Result<(), Error> {
        self.store
            .mutate(|state| lifecycle::destroy_vm(state, vmid).map_err(Error::from))?;

        // Backend teardown failures are logged, not surfaced: the VM is
        // already gone from the store and the operation must not appear
        // half-done to the caller.
        if let Some(handles) = self.handles.lock().remove(&vmid) {
            self.destroy_vcpus(vmid, &handles.vcpus);
            if let Err(err) = self.backend.destroy_vm(&handles.vm) {
                log::warn!("vm {}: backend container teardown failed: {:?}", vmid.0, err);
            }
        }
        log::info!("vm {}: destroyed", vmid.0);
        Ok(())
    }

    fn destroy_vcpus(&self, vmid: VmId, vcpus: &[B::VcpuHandle]) {
        for vcpu in vcpus {
            if let Err(err) = self.backend.destroy_vcpu(vcpu) {
                log::warn!("vm {}: vcpu teardown failed: {:?}", vmid.0, err);
            }
        }
    }

    // ========================================================================
    // Guest execution
    // ========================================================================

    /// Run a runnable VM until its next exit and resolve it.
    ///
    /// Requires `VcpuRun`. The store lock is released for the duration of
    /// guest execution. On return the VM is:
    ///
    /// - `Runnable` when the exit resolved to a resume (voluntary yield)
    /// - `Halted` when it resolved to a halt the VM was permitted
    /// - `Trapped` otherwise - delivered exits and denied resolutions
    ///   stay trapped for the orchestration layer; the recorded exit is
    ///   never rolled back
    pub fn run_vm(&self, vmid: VmId, cancel: &CancelToken) -> Result<ExitReason, Error> {
        let cpu = self.store.read(|state| {
            let record = state.vm(vmid).ok_or(Error::VmNotFound)?;
            let cpu = match &record.state {
                VmState::Runnable(cpu) => *cpu,
                _ => return Err(Error::InvalidStateTransition),
            };
            if !capability::check(state, vmid, Capability::new(CapKind::VcpuRun, vmid)) {
                return Err(Error::CapabilityDenied);
            }
            Ok(cpu)
        })?;

        let vcpu = self
            .handles
            .lock()
            .get(&vmid)
            .and_then(|h| h.vcpus.first().cloned())
            .ok_or(Error::VmNotFound)?;

        self.backend.set_cpu_state(&vcpu, &cpu)?;
        let raw = match self.backend.run(&vcpu, cancel) {
            Ok(raw) => raw,
            Err(err) => {
                // The run happened; trap with a synthetic exception
                // instead of pretending the VM is still runnable
                let _ = self.store.mutate(|state| {
                    lifecycle::trap_vm(
                        state,
                        vmid,
                        ExitReason::Exception {
                            vector: BACKEND_FAULT_VECTOR,
                        },
                        cpu,
                    )
                    .map_err(Error::from)
                });
                log::warn!("vm {}: backend run failed: {:?}", vmid.0, err);
                return Err(Error::BackendFailure(err));
            }
        };

        let exit_cpu = match self.backend.get_cpu_state(&vcpu) {
            Ok(cpu) => cpu,
            Err(err) => {
                log::warn!("vm {}: cpu state readback failed: {:?}", vmid.0, err);
                cpu
            }
        };

        let reason = translate_exit(raw);
        let seq = self.store.mutate(|state| {
            lifecycle::trap_vm(state, vmid, reason.clone(), exit_cpu).map_err(Error::from)
        })?;
        log::debug!("vm {}: exit #{} {:?}", vmid.0, seq, reason);

        // Resolution is a separate mutation: a denied follow-up leaves
        // the VM trapped with the exit already on the log
        let action = dispatch::resolve(&self.policy, vmid, &reason, &exit_cpu);
        let applied: Result<(), Error> = self.store.mutate(|state| match &action {
            ExitAction::Resume(next) => {
                lifecycle::resume_vm(state, vmid, Some(*next)).map_err(Error::from)
            }
            ExitAction::Halt => {
                // Acting on a hypercall needs the Hypercall token on top
                // of whatever the resulting transition requires
                if matches!(reason, ExitReason::Hypercall { .. })
                    && !capability::check(state, vmid, Capability::new(CapKind::Hypercall, vmid))
                {
                    return Err(Error::CapabilityDenied);
                }
                lifecycle::halt_vm(state, vmid).map_err(Error::from)
            }
            ExitAction::Deliver => Ok(()),
        });

        match applied {
            Ok(()) => {}
            Err(Error::CapabilityDenied) => {
                log::warn!("vm {}: resolution of exit #{} denied, VM left trapped", vmid.0, seq);
            }
            Err(err) => return Err(err),
        }

        Ok(reason)
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Grant a capability token to a VM. Idempotent.
    pub fn grant_capability(&self, vmid: VmId, cap: Capability) -> Result<(), Error> {
        self.store
            .mutate(|state| capability::grant(state, vmid, cap).map_err(Error::from))?;
        log::debug!("vm {}: granted {:?}", vmid.0, cap.kind);
        Ok(())
    }

    /// Revoke a capability token from a VM. Idempotent.
    pub fn revoke_capability(&self, vmid: VmId, cap: Capability) -> Result<(), Error> {
        self.store
            .mutate(|state| capability::revoke(state, vmid, cap).map_err(Error::from))?;
        log::debug!("vm {}: revoked {:?}", vmid.0, cap.kind);
        Ok(())
    }

    /// Move a capability token between VMs.
    ///
    /// The source must hold `Transfer` in addition to the token being
    /// moved. Revocation and grant are one atomic mutation.
    pub fn transfer_capability(&self, from: VmId, to: VmId, cap: Capability) -> Result<(), Error> {
        self.store.mutate(|state| {
            if !state.vm_exists(from) || !state.vm_exists(to) {
                return Err(Error::VmNotFound);
            }
            if !capability::check(state, from, Capability::new(CapKind::Transfer, from)) {
                return Err(Error::CapabilityDenied);
            }
            capability::transfer(state, from, to, cap).map_err(Error::from)
        })?;
        log::debug!("vm {} -> vm {}: transferred {:?}", from.0, to.0, cap.kind);
        Ok(())
    }

    /// Whether a VM currently holds a capability token.
    pub fn has_capability(&self, vmid: VmId, cap: Capability) -> bool {
        self.store.read(|state| capability::check(state, vmid, cap))
    }

    /// All capability tokens a VM currently holds.
    pub fn list_capabilities(&self, vmid: VmId) -> Result<Vec<Capability>, Error> {
        self.store
            .read(|state| capability::list(state, vmid).map_err(Error::from))
    }

    // ========================================================================
    // Guest memory
    // ========================================================================

    /// Map a host range into a VM's guest-physical space. Requires
    /// `MemoryMap`; refuses any overlap with existing mappings.
    pub fn map_memory(
        &self,
        vmid: VmId,
        gpa: GpaRange,
        host: HostRange,
        perms: MemPerms,
    ) -> Result<(), Error> {
        self.store.mutate(|state| {
            if !state.vm_exists(vmid) {
                return Err(Error::VmNotFound);
            }
            if !capability::check(state, vmid, Capability::new(CapKind::MemoryMap, vmid)) {
                return Err(Error::CapabilityDenied);
            }
            memory::map(state, vmid, gpa, host, perms).map_err(Error::from)
        })?;

        let vm_handle = self
            .handles
            .lock()
            .get(&vmid)
            .map(|h| h.vm.clone())
            .ok_or(Error::VmNotFound)?;
        if let Err(err) = self.backend.map_memory(&vm_handle, gpa, host, perms) {
            let _ = self
                .store
                .mutate(|state| memory::unmap(state, vmid, gpa).map_err(Error::from));
            log::warn!("vm {}: backend map failed: {:?}", vmid.0, err);
            return Err(Error::BackendFailure(err));
        }
        log::debug!("vm {}: mapped gpa {:#x}..{:#x}", vmid.0, gpa.start, gpa.end);
        Ok(())
    }

    /// Remove a VM's mapping of exactly `gpa`. Requires `MemoryUnmap`.
    pub fn unmap_memory(&self, vmid: VmId, gpa: GpaRange) -> Result<(), Error> {
        let removed = self.store.mutate(|state| {
            if !state.vm_exists(vmid) {
                return Err(Error::VmNotFound);
            }
            if !capability::check(state, vmid, Capability::new(CapKind::MemoryUnmap, vmid)) {
                return Err(Error::CapabilityDenied);
            }
            let mapping = state
                .mappings_of(vmid)
                .into_iter()
                .find(|m| m.gpa == gpa)
                .cloned()
                .ok_or(Error::MemoryNotMapped)?;
            memory::unmap(state, vmid, gpa).map_err(Error::from)?;
            Ok(mapping)
        })?;

        let vm_handle = self
            .handles
            .lock()
            .get(&vmid)
            .map(|h| h.vm.clone())
            .ok_or(Error::VmNotFound)?;
        if let Err(err) = self.backend.unmap_memory(&vm_handle, gpa) {
            let _ = self.store.mutate(|state| {
                memory::map(state, vmid, removed.gpa, removed.host, removed.perms)
                    .map_err(Error::from)
            });
            log::warn!("vm {}: backend unmap failed: {:?}", vmid.0, err);
            return Err(Error::BackendFailure(err));
        }
        log::debug!("vm {}: unmapped gpa {:#x}..{:#x}", vmid.0, gpa.start, gpa.end);
        Ok(())
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// A VM's current lifecycle state.
    pub fn vm_state(&self, vmid: VmId) -> Result<VmState, Error> {
        self.store
            .read(|state| state.vm(vmid).map(|r| r.state.clone()).ok_or(Error::VmNotFound))
    }

    /// All VMs with their current state.
    pub fn list_vms(&self) -> Vec<(VmId, VmState)> {
        self.store.read(|state| state.list_vms())
    }

    /// Snapshot of the append-only exit log.
    pub fn exit_log(&self) -> Vec<ExitRecord> {
        self.store.read(|state| state.exit_log.clone())
    }

    /// Whether the memory non-interference predicate holds right now.
    pub fn verify_isolation(&self) -> bool {
        self.store.read(memory::verify_isolation)
    }

    /// Run every core invariant check against the current state.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        self.store.read(nvisor_core::check_all_invariants)
    }
}
