//! Mock virtualization backend for testing the nvisor nucleus
//!
//! This provides a mock implementation of the `VmBackend` trait that can
//! be used for unit testing the nucleus without requiring hardware
//! virtualization support.
//!
//! Exits are scripted: tests queue `RawExit` values with `script_exit`
//! and each `run` call pops the next one. An empty script yields `Wfi`,
//! so an unscripted run still produces a well-formed exit.

#![no_std]
extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use nvisor_backend::{
    BackendError, BackendInfo, CancelToken, NumericVcpuHandle, NumericVmHandle, RawExit, VmBackend,
};
use nvisor_core::{CpuState, GpaRange, HostRange, MemPerms, VmId};

/// Simulated backend-side VM container
struct MockVm {
    vmid: VmId,
    alive: bool,
    /// Mapped guest-physical ranges (gpa -> (host, perms))
    mappings: BTreeMap<u64, (GpaRange, HostRange, MemPerms)>,
}

/// Simulated virtual CPU
struct MockVcpu {
    owner: u64,
    cpu: CpuState,
    alive: bool,
}

/// Mock backend for unit testing
///
/// Provides simulated VM containers, VCPUs, memory mappings and scripted
/// guest exits for testing nucleus logic without a real hypervisor.
pub struct MockBackend {
    /// Whether `info()` reports the backend as available
    available: bool,
    /// Next backend-side VM handle to assign
    next_vm: AtomicU64,
    /// Next backend-side VCPU handle to assign
    next_vcpu: AtomicU64,
    /// Simulated VM containers
    vms: RefCell<BTreeMap<u64, MockVm>>,
    /// Simulated VCPUs
    vcpus: RefCell<BTreeMap<u64, MockVcpu>>,
    /// Scripted exits, consumed in order by `run`
    script: RefCell<VecDeque<RawExit>>,
    /// Operation names that should fail on their next invocation
    fail_next: RefCell<Vec<&'static str>>,
    /// Number of completed `run` calls
    run_count: AtomicU64,
}

impl MockBackend {
    /// Create an available mock backend
    pub fn new() -> Self {
        Self {
            available: true,
            next_vm: AtomicU64::new(1),
            next_vcpu: AtomicU64::new(1),
            vms: RefCell::new(BTreeMap::new()),
            vcpus: RefCell::new(BTreeMap::new()),
            script: RefCell::new(VecDeque::new()),
            fail_next: RefCell::new(Vec::new()),
            run_count: AtomicU64::new(0),
        }
    }

    /// Create a mock backend that reports itself as unavailable
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Queue an exit for the next `run` call
    pub fn script_exit(&self, exit: RawExit) {
        self.script.borrow_mut().push_back(exit);
    }

    /// Make the named operation fail with `BackendError::VcpuFault` on
    /// its next invocation (e.g. "create_vcpu", "map_memory", "run")
    pub fn fail_next(&self, op: &'static str) {
        self.fail_next.borrow_mut().push(op);
    }

    fn take_failure(&self, op: &'static str) -> bool {
        let mut pending = self.fail_next.borrow_mut();
        if let Some(pos) = pending.iter().position(|p| *p == op) {
            pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// Number of live VM containers
    pub fn vm_count(&self) -> usize {
        self.vms.borrow().values().filter(|vm| vm.alive).count()
    }

    /// Number of live VCPUs
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.borrow().values().filter(|v| v.alive).count()
    }

    /// Number of mappings held by a backend VM container
    pub fn mapping_count(&self, vm: &NumericVmHandle) -> usize {
        self.vms
            .borrow()
            .get(&vm.id())
            .map(|v| v.mappings.len())
            .unwrap_or(0)
    }

    /// Number of completed `run` calls
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    /// The nucleus-side VmId a container was created for
    pub fn vmid_of(&self, vm: &NumericVmHandle) -> Option<VmId> {
        self.vms.borrow().get(&vm.id()).map(|v| v.vmid)
    }

    /// Render the mapping table of a container, for test diagnostics
    pub fn describe_mappings(&self, vm: &NumericVmHandle) -> Vec<String> {
        self.vms
            .borrow()
            .get(&vm.id())
            .map(|v| {
                v.mappings
                    .values()
                    .map(|(gpa, host, _)| {
                        alloc::format!("gpa {:#x}..{:#x} -> host {:#x}", gpa.start, gpa.end, host.start)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

// MockBackend is Send + Sync because it uses atomic operations and RefCell
// is only accessed in single-threaded test contexts
unsafe impl Send for MockBackend {}
unsafe impl Sync for MockBackend {}

impl VmBackend for MockBackend {
    type VmHandle = NumericVmHandle;
    type VcpuHandle = NumericVcpuHandle;

    fn info(&self) -> BackendInfo {
        BackendInfo {
            available: self.available,
            platform: "mock",
            max_vcpus: 8,
        }
    }

    fn create_vm(&self, vmid: VmId) -> Result<Self::VmHandle, BackendError> {
        if self.take_failure("create_vm") {
            return Err(BackendError::OutOfMemory);
        }
        let id = self.next_vm.fetch_add(1, Ordering::SeqCst);
        self.vms.borrow_mut().insert(
            id,
            MockVm {
                vmid,
                alive: true,
                mappings: BTreeMap::new(),
            },
        );
        Ok(NumericVmHandle::new(id))
    }

    fn destroy_vm(&self, vm: &Self::VmHandle) -> Result<(), BackendError> {
        if self.take_failure("destroy_vm") {
            return Err(BackendError::VcpuFault);
        }
        let mut vms = self.vms.borrow_mut();
        match vms.get_mut(&vm.id()) {
            Some(container) if container.alive => {
                container.alive = false;
                container.mappings.clear();
                Ok(())
            }
            _ => Err(BackendError::NotSupported),
        }
    }

    fn create_vcpu(&self, vm: &Self::VmHandle) -> Result<Self::VcpuHandle, BackendError> {
        if self.take_failure("create_vcpu") {
            return Err(BackendError::VcpuFault);
        }
        if !self.vms.borrow().get(&vm.id()).map(|v| v.alive).unwrap_or(false) {
            return Err(BackendError::NotSupported);
        }
        let id = self.next_vcpu.fetch_add(1, Ordering::SeqCst);
        self.vcpus.borrow_mut().insert(
            id,
            MockVcpu {
                owner: vm.id(),
                cpu: CpuState::default(),
                alive: true,
            },
        );
        Ok(NumericVcpuHandle::new(id))
    }

    fn destroy_vcpu(&self, vcpu: &Self::VcpuHandle) -> Result<(), BackendError> {
        if self.take_failure("destroy_vcpu") {
            return Err(BackendError::VcpuFault);
        }
        let mut vcpus = self.vcpus.borrow_mut();
        match vcpus.get_mut(&vcpu.id()) {
            Some(v) if v.alive => {
                v.alive = false;
                Ok(())
            }
            _ => Err(BackendError::NotSupported),
        }
    }

    fn map_memory(
        &self,
        vm: &Self::VmHandle,
        gpa: GpaRange,
        host: HostRange,
        perms: MemPerms,
    ) -> Result<(), BackendError> {
        if self.take_failure("map_memory") {
            return Err(BackendError::InvalidMapping);
        }
        let mut vms = self.vms.borrow_mut();
        let container = vms
            .get_mut(&vm.id())
            .filter(|v| v.alive)
            .ok_or(BackendError::NotSupported)?;
        container.mappings.insert(gpa.start, (gpa, host, perms));
        Ok(())
    }

    fn unmap_memory(&self, vm: &Self::VmHandle, gpa: GpaRange) -> Result<(), BackendError> {
        if self.take_failure("unmap_memory") {
            return Err(BackendError::InvalidMapping);
        }
        let mut vms = self.vms.borrow_mut();
        let container = vms
            .get_mut(&vm.id())
            .filter(|v| v.alive)
            .ok_or(BackendError::NotSupported)?;
        match container.mappings.remove(&gpa.start) {
            Some(_) => Ok(()),
            None => Err(BackendError::InvalidMapping),
        }
    }

    fn set_cpu_state(&self, vcpu: &Self::VcpuHandle, cpu: &CpuState) -> Result<(), BackendError> {
        if self.take_failure("set_cpu_state") {
            return Err(BackendError::VcpuFault);
        }
        let mut vcpus = self.vcpus.borrow_mut();
        match vcpus.get_mut(&vcpu.id()) {
            Some(v) if v.alive => {
                v.cpu = *cpu;
                Ok(())
            }
            _ => Err(BackendError::VcpuFault),
        }
    }

    fn get_cpu_state(&self, vcpu: &Self::VcpuHandle) -> Result<CpuState, BackendError> {
        if self.take_failure("get_cpu_state") {
            return Err(BackendError::VcpuFault);
        }
        self.vcpus
            .borrow()
            .get(&vcpu.id())
            .filter(|v| v.alive)
            .map(|v| v.cpu)
            .ok_or(BackendError::VcpuFault)
    }

    fn run(&self, vcpu: &Self::VcpuHandle, cancel: &CancelToken) -> Result<RawExit, BackendError> {
        if self.take_failure("run") {
            return Err(BackendError::VcpuFault);
        }
        // Both the VCPU and its owning container must be live
        let runnable = self
            .vcpus
            .borrow()
            .get(&vcpu.id())
            .filter(|v| v.alive)
            .map(|v| {
                self.vms
                    .borrow()
                    .get(&v.owner)
                    .map(|vm| vm.alive)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !runnable {
            return Err(BackendError::VcpuFault);
        }
        self.run_count.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Ok(RawExit::Cancelled);
        }
        Ok(self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(RawExit::Wfi))
    }
}
