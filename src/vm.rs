//! The monitor: one VM, one VCPU, one device bus.

use crate::bios::{InterruptTable, RealModeIntrDesc};
use crate::builder::VmBuilder;
use crate::device::DeviceBus;
use crate::error::{Error, Result};
use crate::kvm::{KvmVm, Vcpu};
use crate::loader::{BootInfo, KernelLoader};
use crate::memory::GuestMemory;

/// A running-or-bootable virtual machine.
///
/// Construction goes through [`Vm::builder`]; after [`Vm::load_kernel`]
/// and [`Vm::reset_vcpu`] the machine is ready for [`Vm::run`].
#[derive(Debug)]
pub struct Vm {
    // Field order doubles as teardown order: the VCPU fd closes before
    // the VM fd, which closes before guest RAM is unmapped.
    pub(crate) vcpu: Vcpu,
    pub(crate) kvm: KvmVm,
    pub(crate) bus: DeviceBus,
    pub(crate) table: InterruptTable,
    pub(crate) boot: Option<BootInfo>,
}

impl Vm {
    /// Create a new VM builder.
    pub fn builder() -> VmBuilder {
        VmBuilder::new()
    }

    pub(crate) fn new(kvm: KvmVm, vcpu: Vcpu, bus: DeviceBus) -> Self {
        Self {
            vcpu,
            kvm,
            bus,
            table: InterruptTable::new(),
            boot: None,
        }
    }

    /// Guest RAM.
    pub fn memory(&self) -> &GuestMemory {
        self.kvm.memory()
    }

    /// Guest RAM, writable.
    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        self.kvm.memory_mut()
    }

    /// Entry point chosen by the loader, if a kernel has been loaded.
    pub fn boot_info(&self) -> Option<BootInfo> {
        self.boot
    }

    /// Place a kernel image in guest RAM.
    pub fn load_kernel(&mut self, loader: &KernelLoader) -> Result<BootInfo> {
        let info = loader.load(self.kvm.memory_mut(), &mut self.table)?;
        self.boot = Some(info);
        Ok(info)
    }

    /// Seed the VCPU with the pre-boot real-mode state.
    pub fn reset_vcpu(&mut self) -> Result<()> {
        let boot = self
            .boot
            .ok_or_else(|| Error::VcpuError("no kernel loaded".to_string()))?;
        self.vcpu.reset(&boot)
    }

    /// Rewrite one IVT vector, both in the staging table and in guest RAM.
    pub fn set_intr_vector(&mut self, vector: u8, desc: RealModeIntrDesc) -> Result<()> {
        self.table.set(vector, desc);
        let bytes = self.table.to_bytes();
        self.kvm.memory_mut().write(0, &bytes)
    }

    /// Request a debug exit after every guest instruction.
    pub fn enable_single_step(&self) -> Result<()> {
        self.vcpu.enable_single_step()
    }

    /// Drive the exit-dispatch loop until shutdown or a fatal exit.
    pub fn run(&mut self) -> Result<()> {
        crate::runner::run(self)
    }
}
