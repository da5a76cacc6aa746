//! Kernel image loading.
//!
//! Two formats are recognized, in order: a Linux bzImage (setup header
//! magic `HdrS`), then a flat real-mode binary. The bzImage path places
//! the image per the Linux boot protocol and installs the BIOS; the flat
//! path just drops the file at the boot segment.

mod bzimage;

pub use bzimage::boot_params;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::bios::InterruptTable;
use crate::error::{Error, Result};
use crate::memory::layout::{BOOT_LOADER_IP, BOOT_LOADER_SELECTOR, BOOT_LOADER_SP};
use crate::memory::GuestMemory;

/// Kernel image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFormat {
    /// Linux bzImage with a boot-protocol setup header.
    BzImage,
    /// Raw real-mode binary.
    Flat,
}

/// Where the VCPU starts after a successful load.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub selector: u16,
    pub ip: u16,
    pub sp: u16,
    pub format: KernelFormat,
}

/// Linux kernel loader.
#[derive(Debug)]
pub struct KernelLoader {
    kernel_data: Vec<u8>,
    initrd_data: Option<Vec<u8>>,
    cmdline: String,
}

impl KernelLoader {
    /// Create a loader from a kernel image path.
    pub fn new<P: AsRef<Path>>(kernel_path: P) -> Result<Self> {
        let kernel_data = read_file(kernel_path.as_ref())
            .map_err(|_| Error::KernelNotFound(kernel_path.as_ref().to_path_buf()))?;

        Ok(Self {
            kernel_data,
            initrd_data: None,
            cmdline: String::new(),
        })
    }

    /// Set the initrd/initramfs image.
    pub fn with_initrd<P: AsRef<Path>>(mut self, initrd_path: P) -> Result<Self> {
        let data = read_file(initrd_path.as_ref())
            .map_err(|_| Error::InitrdNotFound(initrd_path.as_ref().to_path_buf()))?;
        self.initrd_data = Some(data);
        Ok(self)
    }

    /// Set the kernel command line.
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Get the command line.
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// Place the kernel in guest memory and report the entry point.
    ///
    /// The bzImage recognizer is tried first; a missing header magic falls
    /// through to the flat-binary branch, while any other bzImage problem
    /// (truncated image, pre-2.02 boot protocol) is a hard error.
    pub fn load(
        &self,
        memory: &mut GuestMemory,
        table: &mut InterruptTable,
    ) -> Result<BootInfo> {
        if let Some(info) = bzimage::load(
            &self.kernel_data,
            &self.cmdline,
            self.initrd_data.as_deref(),
            memory,
            table,
        )? {
            return Ok(info);
        }

        self.load_flat(memory)
    }

    /// Load the image as a flat binary at the boot segment.
    fn load_flat(&self, memory: &mut GuestMemory) -> Result<BootInfo> {
        memory.write(
            crate::memory::segment_to_flat(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP) as u64,
            &self.kernel_data,
        )?;

        Ok(BootInfo {
            selector: BOOT_LOADER_SELECTOR,
            ip: BOOT_LOADER_IP,
            sp: BOOT_LOADER_SP,
            format: KernelFormat::Flat,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(kernel_data: Vec<u8>) -> Self {
        Self {
            kernel_data,
            initrd_data: None,
            cmdline: String::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_initrd_bytes(&mut self, data: Vec<u8>) {
        self.initrd_data = Some(data);
    }
}

fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}
