//! # microkvm
//!
//! A minimal user-space KVM monitor that boots Linux bzImages.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use microkvm::{KernelLoader, Vm, Result};
//!
//! fn main() -> Result<()> {
//!     let mut vm = Vm::builder().memory_mb(64).build()?;
//!
//!     let loader = KernelLoader::new("/boot/vmlinuz")?
//!         .with_cmdline("console=ttyS0");
//!     vm.load_kernel(&loader)?;
//!     vm.reset_vcpu()?;
//!
//!     vm.run()
//! }
//! ```
//!
//! ## What you get
//!
//! - One VCPU started in 16-bit real mode per the Linux boot protocol
//! - A miniature BIOS in guest RAM: IVT, teletype `int 10h`, E820 `int 15h`
//! - An 8250 serial console on ttyS0, driven by a 1 ms interrupt tick
//!
//! Requires `/dev/kvm` and an x86_64 host.

mod builder;
pub mod debug;
mod error;
pub mod runner;
pub mod timer;
mod vm;

pub mod bios;
pub mod device;
pub mod kvm;
pub mod loader;
pub mod memory;

// Re-exports
pub use builder::{VmBuilder, MIN_MEMORY_MB};
pub use error::{Error, Result};
pub use loader::{BootInfo, KernelFormat, KernelLoader};
pub use vm::Vm;

/// Check if this host can run hardware-virtualized guests.
///
/// Returns `true` when `/dev/kvm` exists and the CPU advertises VT-x or
/// AMD-V.
pub fn is_supported() -> bool {
    kvm::is_available()
}
