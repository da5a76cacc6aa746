//! Device emulation behind the exit dispatcher.
//!
//! The run loop hands every port I/O and MMIO exit to the [`DeviceBus`].
//! A `true` return means the access was absorbed; `false` stops the VM.

pub mod serial;

pub use serial::Serial;

use crate::debug_ioport;
use crate::error::Result;

/// Direction of a port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Interrupt injection seam between device models and the hypervisor.
pub trait IrqLine {
    /// Drive the level of a GSI on the in-kernel interrupt controller.
    fn set_irq_line(&self, irq: u32, active: bool) -> Result<()>;
}

/// The I/O and MMIO dispatch surface the run loop talks to.
#[derive(Debug)]
pub struct DeviceBus {
    serial: Serial,
    ioport_debug: bool,
}

impl DeviceBus {
    pub fn new(ioport_debug: bool) -> Self {
        Self {
            serial: Serial::new(),
            ioport_debug,
        }
    }

    #[cfg(test)]
    fn with_serial(serial: Serial) -> Self {
        Self {
            serial,
            ioport_debug: false,
        }
    }

    /// Emulate a port I/O access.
    ///
    /// `data` covers the whole transfer (`size * count` bytes); string I/O
    /// is replayed element by element in increasing buffer order.
    /// Unclaimed ports zero-fill reads and swallow writes.
    pub fn emulate_io(
        &mut self,
        port: u16,
        data: &mut [u8],
        direction: Direction,
        size: u8,
        count: u32,
    ) -> bool {
        for i in 0..count as usize {
            let chunk = &mut data[i * size as usize..(i + 1) * size as usize];
            match direction {
                Direction::In => self.io_in(port, chunk),
                Direction::Out => self.io_out(port, chunk),
            }
        }
        true
    }

    fn io_in(&mut self, port: u16, data: &mut [u8]) {
        match port {
            p if serial_port(p) => {
                data.fill(0);
                data[0] = self.serial.read(port - serial::SERIAL_BASE);
            }
            _ => {
                debug_ioport!(self.ioport_debug, "ioport: unclaimed read from {port:#06x}");
                data.fill(0);
            }
        }
    }

    fn io_out(&mut self, port: u16, data: &[u8]) {
        match port {
            p if serial_port(p) => {
                self.serial.write(port - serial::SERIAL_BASE, data[0]);
            }
            _ => {
                debug_ioport!(
                    self.ioport_debug,
                    "ioport: unclaimed write of {:#04x} to {port:#06x}",
                    data[0]
                );
            }
        }
    }

    /// Emulate an MMIO access. No MMIO devices are wired up; accesses are
    /// logged, reads zero-filled, and execution continues.
    pub fn emulate_mmio(&mut self, addr: u64, data: &mut [u8], is_write: bool) -> bool {
        crate::debug_mmio!(
            "mmio: ignoring {} of {} bytes at {addr:#x}",
            if is_write { "write" } else { "read" },
            data.len()
        );
        if !is_write {
            data.fill(0);
        }
        true
    }

    /// Periodic tick from the interrupt injector: pull pending host input
    /// into the UART and refresh its interrupt line.
    pub fn tick(&mut self, irq: &dyn IrqLine) -> Result<()> {
        let mut buf = [0u8; 64];
        let n = poll_stdin(&mut buf);
        if n > 0 {
            self.serial.receive(&buf[..n]);
        }
        irq.set_irq_line(serial::SERIAL_IRQ, self.serial.interrupt_pending())
    }
}

fn serial_port(port: u16) -> bool {
    (serial::SERIAL_BASE..serial::SERIAL_BASE + serial::SERIAL_PORTS).contains(&port)
}

/// Non-blocking read of whatever is waiting on host stdin.
fn poll_stdin(buf: &mut [u8]) -> usize {
    let mut fds = libc::pollfd {
        fd: libc::STDIN_FILENO,
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut fds, 1, 0) };
    if ready <= 0 || fds.revents & libc::POLLIN == 0 {
        return 0;
    }
    let n = unsafe {
        libc::read(
            libc::STDIN_FILENO,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n > 0 {
        n as usize
    } else {
        0
    }
}
