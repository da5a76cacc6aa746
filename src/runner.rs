//! The exit-dispatch loop.
//!
//! One thread drives the VCPU: `KVM_RUN`, decode the exit, hand it to the
//! device bus, repeat. Signals only set flags here; the loop consumes them
//! between runs.

use std::sync::atomic::{AtomicBool, Ordering};

use kvm_ioctls::VcpuExit;
use libc::c_int;

use crate::debug_runtime;
use crate::device::Direction;
use crate::error::{Error, Result};
use crate::vm::Vm;

/// Set by SIGINT: leave the loop cleanly.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Set by SIGQUIT: dump machine state and bail out.
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigquit(_: c_int) {
    DUMP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT/SIGQUIT flag handlers.
///
/// Handlers are installed without SA_RESTART so an in-flight `KVM_RUN`
/// returns EINTR and the loop gets to look at the flags.
pub fn install_signal_handlers() -> Result<()> {
    install_signal_handler(libc::SIGINT, handle_sigint)?;
    install_signal_handler(libc::SIGQUIT, handle_sigquit)
}

pub(crate) fn install_signal_handler(
    signum: c_int,
    handler: extern "C" fn(c_int),
) -> Result<()> {
    // Safety: sigaction with a zeroed struct, a full mask and a plain
    // function pointer handler.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigfillset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        if libc::sigaction(signum, &sa, std::ptr::null_mut()) < 0 {
            return Err(Error::Signal(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// What the loop does after decoding one exit.
enum Action {
    Continue,
    Tick,
    Dump,
    Fatal(String),
}

/// Drive the VCPU until shutdown, a fatal exit or an unhandled access.
///
/// Returns `Ok(())` only for an operator-requested shutdown; every other
/// way out is an error, preceded by a register/code/page-table dump.
pub fn run(vm: &mut Vm) -> Result<()> {
    let Vm { vcpu, kvm, bus, .. } = vm;

    loop {
        if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
            debug_runtime!("runner: shutdown requested");
            return Ok(());
        }
        if DUMP_REQUESTED.swap(false, Ordering::SeqCst) {
            let _ = vcpu.show_registers();
            let _ = vcpu.show_code(kvm.memory());
            let _ = vcpu.show_page_tables(kvm.memory());
            return Err(Error::DumpRequested);
        }

        let action = match vcpu.run() {
            Ok(VcpuExit::IoIn(port, data)) => {
                let count = data.len() as u32;
                if bus.emulate_io(port, data, Direction::In, 1, count) {
                    Action::Continue
                } else {
                    Action::Fatal(format!("unhandled I/O in, port {port:#06x}"))
                }
            }
            Ok(VcpuExit::IoOut(port, data)) => {
                let mut buf = data.to_vec();
                let count = buf.len() as u32;
                if bus.emulate_io(port, &mut buf, Direction::Out, 1, count) {
                    Action::Continue
                } else {
                    Action::Fatal(format!("unhandled I/O out, port {port:#06x}"))
                }
            }
            Ok(VcpuExit::MmioRead(addr, data)) => {
                if bus.emulate_mmio(addr, data, false) {
                    Action::Continue
                } else {
                    Action::Fatal(format!("unhandled MMIO read at {addr:#x}"))
                }
            }
            Ok(VcpuExit::MmioWrite(addr, data)) => {
                let mut buf = data.to_vec();
                if bus.emulate_mmio(addr, &mut buf, true) {
                    Action::Continue
                } else {
                    Action::Fatal(format!("unhandled MMIO write at {addr:#x}"))
                }
            }
            Ok(VcpuExit::Debug(_)) => Action::Dump,
            // The guest idled; the next timer tick re-enters it.
            Ok(VcpuExit::Hlt) => Action::Continue,
            Ok(VcpuExit::Intr) => Action::Tick,
            Ok(exit) => Action::Fatal(format!("{exit:?}")),
            // A signal interrupted KVM_RUN before the guest entered.
            Err(e) if e.errno() == libc::EINTR => Action::Tick,
            Err(e) => return Err(Error::KvmIoctl("KVM_RUN", e)),
        };

        match action {
            Action::Continue => {}
            Action::Tick => bus.tick(&*kvm)?,
            Action::Dump => {
                vcpu.show_registers()?;
                vcpu.show_code(kvm.memory())?;
            }
            Action::Fatal(reason) => {
                eprintln!("KVM exit reason: {reason}");
                let _ = vcpu.show_registers();
                let _ = vcpu.show_code(kvm.memory());
                let _ = vcpu.show_page_tables(kvm.memory());
                return Err(Error::UnhandledExit(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handlers_set_flags() {
        install_signal_handlers().unwrap();

        unsafe { libc::raise(libc::SIGINT) };
        assert!(SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst));

        unsafe { libc::raise(libc::SIGQUIT) };
        assert!(DUMP_REQUESTED.swap(false, Ordering::SeqCst));
    }
}
