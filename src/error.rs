//! Error types for microkvm.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using microkvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a VM.
#[derive(Error, Debug)]
pub enum Error {
    // Platform/hypervisor errors
    #[error("KVM not available at {0}")]
    KvmNotAvailable(PathBuf),

    #[error("virtualization not supported by CPU")]
    VirtualizationNotSupported,

    #[error("unsupported KVM API version: {0}")]
    ApiVersion(i32),

    #[error("required KVM extension not supported by host: {0}")]
    MissingCapability(&'static str),

    #[error("{0} ioctl failed: {1}")]
    KvmIoctl(&'static str, vmm_sys_util::errno::Error),

    // Configuration errors
    #[error("invalid memory size: {0} MiB (minimum is 64 MiB)")]
    InvalidMemorySize(u32),

    #[error("memory size {0} MiB exceeds host physical RAM")]
    MemorySizeTooLarge(u32),

    #[error("kernel not found: {0}")]
    KernelNotFound(PathBuf),

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("too old kernel: boot protocol {0:#06x} (need >= 0x0202)")]
    TooOldKernel(u16),

    #[error("initrd not found: {0}")]
    InitrdNotFound(PathBuf),

    // Runtime errors
    #[error("vCPU error: {0}")]
    VcpuError(String),

    #[error("unhandled VM exit: {0}")]
    UnhandledExit(String),

    #[error("diagnostic dump requested, aborting")]
    DumpRequested,

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("invalid guest address: {0:#x}")]
    InvalidGuestAddress(u64),

    // Host plumbing errors
    #[error("timer setup failed: {0}")]
    Timer(std::io::Error),

    #[error("signal setup failed: {0}")]
    Signal(std::io::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
