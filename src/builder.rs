//! VM builder for configuring and creating a [`Vm`].

use std::path::PathBuf;

use crate::device::DeviceBus;
use crate::error::{Error, Result};
use crate::kvm::KvmVm;
use crate::vm::Vm;

/// Smallest guest RAM the boot layout fits in comfortably.
pub const MIN_MEMORY_MB: u32 = 64;

/// Builder for creating a [`Vm`].
///
/// # Example
///
/// ```rust,no_run
/// use microkvm::Vm;
///
/// let vm = Vm::builder()
///     .memory_mb(128)
///     .kvm_dev("/dev/kvm")
///     .build()?;
/// # Ok::<(), microkvm::Error>(())
/// ```
pub struct VmBuilder {
    memory_mb: u32,
    kvm_dev: PathBuf,
    single_step: bool,
    ioport_debug: bool,
}

impl VmBuilder {
    /// Create a new VM builder with default settings.
    pub fn new() -> Self {
        Self {
            memory_mb: MIN_MEMORY_MB,
            kvm_dev: PathBuf::from("/dev/kvm"),
            single_step: false,
            ioport_debug: false,
        }
    }

    /// Set the amount of guest RAM in mebibytes.
    ///
    /// Default: 64 MiB, which is also the minimum.
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Set the hypervisor device path.
    ///
    /// Default: `/dev/kvm`
    pub fn kvm_dev(mut self, path: impl Into<PathBuf>) -> Self {
        self.kvm_dev = path.into();
        self
    }

    /// Request a debug exit after every guest instruction.
    pub fn single_step(mut self, enabled: bool) -> Self {
        self.single_step = enabled;
        self
    }

    /// Log every unclaimed I/O port access.
    pub fn ioport_debug(mut self, enabled: bool) -> Self {
        self.ioport_debug = enabled;
        self
    }

    /// Build the VM.
    ///
    /// Configuration is validated before the hypervisor device is opened,
    /// so a bad `--mem` never creates any VM state.
    pub fn build(self) -> Result<Vm> {
        if self.memory_mb < MIN_MEMORY_MB {
            return Err(Error::InvalidMemorySize(self.memory_mb));
        }
        if self.memory_mb as u64 > host_memory_mb() {
            return Err(Error::MemorySizeTooLarge(self.memory_mb));
        }

        let ram_size = (self.memory_mb as usize) << 20;
        let kvm = KvmVm::new(&self.kvm_dev, ram_size)?;
        let vcpu = kvm.create_vcpu()?;
        if self.single_step {
            vcpu.enable_single_step()?;
        }

        let bus = DeviceBus::new(self.ioport_debug);
        Ok(Vm::new(kvm, vcpu, bus))
    }
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical RAM of the host in mebibytes.
fn host_memory_mb() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return u64::MAX;
    }
    (pages as u64 * page_size as u64) >> 20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_floor() {
        // Rejected during validation, before /dev/kvm is touched.
        let err = Vm::builder()
            .memory_mb(32)
            .kvm_dev("/dev/kvm-should-never-be-opened")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMemorySize(32)));
    }

    #[test]
    fn test_memory_ceiling() {
        let err = Vm::builder()
            .memory_mb(u32::MAX)
            .kvm_dev("/dev/kvm-should-never-be-opened")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::MemorySizeTooLarge(_)));
    }

    #[test]
    fn test_host_memory_probe() {
        assert!(host_memory_mb() > 0);
    }
}
