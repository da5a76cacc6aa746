//! Guest physical memory management.
//!
//! This module owns the RAM backing buffer and the address translation
//! helpers used by the loader, the BIOS installer and the device models.

mod guest;

pub use guest::{segment_to_flat, GuestMemory};

/// Guest physical memory layout for x86 real-mode boot.
///
/// These offsets follow the Linux boot protocol and must not change.
pub mod layout {
    /// Real-mode interrupt vector table (256 entries x 4 bytes at 0).
    pub const REAL_MODE_IVT_BEGIN: u64 = 0x0000;
    pub const REAL_MODE_IVT_END: u64 = 0x0400;

    /// BIOS Data Area; this monitor parks its interrupt stubs here.
    pub const BDA_START: u64 = 0x0400;

    /// Real-mode segment the kernel setup code is loaded at.
    pub const BOOT_LOADER_SELECTOR: u16 = 0x1000;
    pub const BOOT_LOADER_IP: u16 = 0x0000;
    pub const BOOT_LOADER_SP: u16 = 0x8000;

    /// Kernel command line (linear).
    pub const BOOT_CMDLINE_OFFSET: u64 = 0x0002_0000;

    /// Top of conventional memory reported as usable.
    pub const EBDA_START: u64 = 0x0009_fc00;

    /// VGA text page the int 10h teletype stub streams into.
    pub const VGA_RAM_BEGIN: u64 = 0x000b_8000;

    /// Protected-mode part of a modern bzImage is loaded at 1 MiB.
    pub const BZ_KERNEL_START: u64 = 0x0010_0000;

    /// Lowest address an initrd is staged at.
    pub const INITRD_START: u64 = 0x0080_0000;
}
