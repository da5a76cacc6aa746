//! Linux KVM plumbing.
//!
//! This module owns the `/dev/kvm` handles and wires the guest together:
//! one VM, one user-memory slot covering `[0, ram_size)`, the in-kernel
//! PIT and IRQCHIP, and a single VCPU. Low-level KVM access goes through
//! the rust-vmm ecosystem (`kvm-ioctls`/`kvm-bindings`).

mod vcpu;

pub use vcpu::Vcpu;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_API_VERSION};
use kvm_ioctls::{Cap, Kvm, VmFd};

use crate::device::IrqLine;
use crate::error::{Error, Result};
use crate::memory::GuestMemory;

/// Address the TSS pages are parked at, just below the BIOS ROM hole.
const TSS_ADDRESS: usize = 0xfffb_d000;

/// Capabilities the monitor refuses to run without.
const REQUIRED_CAPS: &[(Cap, &str)] = &[
    (Cap::CoalescedMmio, "KVM_CAP_COALESCED_MMIO"),
    (Cap::SetTssAddr, "KVM_CAP_SET_TSS_ADDR"),
    (Cap::Pit2, "KVM_CAP_PIT2"),
    (Cap::UserMemory, "KVM_CAP_USER_MEMORY"),
    (Cap::IrqRouting, "KVM_CAP_IRQ_ROUTING"),
    (Cap::Irqchip, "KVM_CAP_IRQCHIP"),
    (Cap::Hlt, "KVM_CAP_HLT"),
    (Cap::IrqInjectStatus, "KVM_CAP_IRQ_INJECT_STATUS"),
    (Cap::ExtCpuid, "KVM_CAP_EXT_CPUID"),
];

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    Path::new("/dev/kvm").exists() && cpu_supports_vm()
}

/// Whether the CPU advertises VT-x or AMD-V.
pub fn cpu_supports_vm() -> bool {
    // CPUID.1:ECX.VMX[bit 5] or CPUID.80000001h:ECX.SVM[bit 2].
    let vmx = unsafe { std::arch::x86_64::__cpuid(1) }.ecx & (1 << 5) != 0;
    let svm = unsafe { std::arch::x86_64::__cpuid(0x8000_0001) }.ecx & (1 << 2) != 0;
    vmx || svm
}

/// A KVM virtual machine with its guest RAM.
#[derive(Debug)]
pub struct KvmVm {
    kvm: Kvm,
    vm: VmFd,
    // Dropped after the fds above: KVM holds a host pointer into the
    // buffer for the lifetime of the VM.
    memory: GuestMemory,
}

impl KvmVm {
    /// Open the hypervisor device and assemble a VM around `ram_size`
    /// bytes of guest RAM.
    pub fn new(kvm_dev: &Path, ram_size: usize) -> Result<Self> {
        if !cpu_supports_vm() {
            return Err(Error::VirtualizationNotSupported);
        }

        let kvm_dev_cstr = CString::new(kvm_dev.as_os_str().as_bytes())
            .map_err(|_| Error::KvmNotAvailable(kvm_dev.to_path_buf()))?;
        let kvm = Kvm::new_with_path(kvm_dev_cstr)
            .map_err(|_| Error::KvmNotAvailable(kvm_dev.to_path_buf()))?;

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION as i32 {
            return Err(Error::ApiVersion(version));
        }

        let vm = kvm
            .create_vm()
            .map_err(|e| Error::KvmIoctl("KVM_CREATE_VM", e))?;

        for (cap, name) in REQUIRED_CAPS {
            if !kvm.check_extension(*cap) {
                return Err(Error::MissingCapability(name));
            }
        }

        vm.set_tss_address(TSS_ADDRESS)
            .map_err(|e| Error::KvmIoctl("KVM_SET_TSS_ADDR", e))?;
        vm.create_pit2(kvm_pit_config::default())
            .map_err(|e| Error::KvmIoctl("KVM_CREATE_PIT2", e))?;

        let memory = GuestMemory::new(ram_size)?;
        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: memory.size() as u64,
            userspace_addr: memory.as_ptr() as u64,
            flags: 0,
        };
        // Safety: the region stays valid for the lifetime of the VM; see
        // the field ordering above.
        unsafe {
            vm.set_user_memory_region(region)
                .map_err(|e| Error::KvmIoctl("KVM_SET_USER_MEMORY_REGION", e))?;
        }

        vm.create_irq_chip()
            .map_err(|e| Error::KvmIoctl("KVM_CREATE_IRQCHIP", e))?;

        Ok(Self { kvm, vm, memory })
    }

    /// Create the VM's sole VCPU.
    pub fn create_vcpu(&self) -> Result<Vcpu> {
        let fd = self
            .vm
            .create_vcpu(0)
            .map_err(|e| Error::KvmIoctl("KVM_CREATE_VCPU", e))?;
        let vcpu = Vcpu::new(fd);
        vcpu.setup_cpuid(&self.kvm)?;
        Ok(vcpu)
    }

    /// Guest RAM.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Guest RAM, writable.
    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }
}

impl IrqLine for KvmVm {
    fn set_irq_line(&self, irq: u32, active: bool) -> Result<()> {
        self.vm
            .set_irq_line(irq, active)
            .map_err(|e| Error::KvmIoctl("KVM_IRQ_LINE", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_assembly() {
        if !is_available() {
            return;
        }

        let vm = KvmVm::new(Path::new("/dev/kvm"), 64 << 20).unwrap();
        assert_eq!(vm.memory().size(), 64 << 20);
        let _vcpu = vm.create_vcpu().unwrap();
    }

    #[test]
    fn test_missing_device_path() {
        let err = KvmVm::new(Path::new("/dev/kvm-does-not-exist"), 64 << 20).unwrap_err();
        if cpu_supports_vm() {
            assert!(matches!(err, Error::KvmNotAvailable(_)));
        } else {
            assert!(matches!(err, Error::VirtualizationNotSupported));
        }
    }
}
