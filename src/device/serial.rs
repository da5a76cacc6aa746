//! 8250 UART serial console.
//!
//! The guest's ttyS0. Transmit bytes leave through a host-side sink
//! immediately, so the transmitter always reads empty; receive bytes are
//! fed in by the device bus from host stdin. Line status is derived from
//! the FIFO state rather than tracked, and the divisor latch is a shadow
//! bank over the first two registers.

use std::collections::VecDeque;
use std::io::{self, Write};

/// IRQ line the first serial port raises.
pub const SERIAL_IRQ: u32 = 4;

/// I/O port base of ttyS0.
pub const SERIAL_BASE: u16 = 0x3f8;

/// Number of ports the UART register file decodes.
pub const SERIAL_PORTS: u16 = 8;

/// 8250 register offsets.
mod reg {
    pub const RBR: u16 = 0; // receive buffer (read) / DLL under DLAB
    pub const THR: u16 = 0; // transmit holding (write) / DLL under DLAB
    pub const IER: u16 = 1; // interrupt enable / DLM under DLAB
    pub const IIR: u16 = 2; // interrupt identification (read)
    pub const FCR: u16 = 2; // FIFO control (write)
    pub const LCR: u16 = 3; // line control
    pub const MCR: u16 = 4; // modem control
    pub const LSR: u16 = 5; // line status
    pub const MSR: u16 = 6; // modem status
    pub const SCR: u16 = 7; // scratch
}

mod lcr {
    pub const DLAB: u8 = 0x80;
}

mod ier {
    pub const RX_READY: u8 = 0x01;
    pub const TX_EMPTY: u8 = 0x02;
}

mod iir {
    pub const NONE: u8 = 0x01;
    pub const TX_EMPTY: u8 = 0x02;
    pub const RX_READY: u8 = 0x04;
}

mod lsr {
    pub const DR: u8 = 0x01; // data ready
    pub const THRE: u8 = 0x20; // transmit holding register empty
    pub const TEMT: u8 = 0x40; // transmitter empty
}

mod fcr {
    pub const RX_CLEAR: u8 = 0x02;
}

/// Carrier detect, data set ready and clear to send are permanently up;
/// the host console never drops the line.
const MSR_LINE_UP: u8 = 0xb0;

/// 8250 UART model.
pub struct Serial {
    /// Interrupt enable mask, low four bits.
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    /// Divisor latch bytes, reachable while LCR.DLAB is set.
    dll: u8,
    dlm: u8,
    /// Receive FIFO.
    rx: VecDeque<u8>,
    /// Transmit sink.
    sink: Box<dyn Write + Send>,
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serial")
            .field("ier", &self.ier)
            .field("lcr", &self.lcr)
            .field("mcr", &self.mcr)
            .field("scr", &self.scr)
            .field("dll", &self.dll)
            .field("dlm", &self.dlm)
            .field("rx", &self.rx)
            .finish_non_exhaustive()
    }
}

impl Serial {
    /// Create a serial console writing to host stdout.
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    /// Create a serial console with a custom transmit sink.
    pub fn with_writer(sink: Box<dyn Write + Send>) -> Self {
        Self {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            dll: 12, // 9600 baud
            dlm: 0,
            rx: VecDeque::new(),
            sink,
        }
    }

    /// Feed receive data (host to guest) into the FIFO.
    pub fn receive(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Line status, derived: only the data-ready bit ever varies, since
    /// transmitted bytes drain instantly.
    fn lsr(&self) -> u8 {
        let mut status = lsr::THRE | lsr::TEMT;
        if !self.rx.is_empty() {
            status |= lsr::DR;
        }
        status
    }

    /// Highest-priority pending interrupt, received data first.
    fn iir(&self) -> u8 {
        if self.ier & ier::RX_READY != 0 && !self.rx.is_empty() {
            iir::RX_READY
        } else if self.ier & ier::TX_EMPTY != 0 {
            iir::TX_EMPTY
        } else {
            iir::NONE
        }
    }

    /// Whether the UART's interrupt line is asserted.
    pub fn interrupt_pending(&self) -> bool {
        self.iir() != iir::NONE
    }

    fn dlab(&self) -> bool {
        self.lcr & lcr::DLAB != 0
    }

    /// Handle a read from a UART register.
    pub fn read(&mut self, offset: u16) -> u8 {
        if self.dlab() {
            match offset {
                reg::RBR => return self.dll,
                reg::IER => return self.dlm,
                _ => {}
            }
        }
        match offset {
            reg::RBR => self.rx.pop_front().unwrap_or(0),
            reg::IER => self.ier,
            reg::IIR => self.iir(),
            reg::LCR => self.lcr,
            reg::MCR => self.mcr,
            reg::LSR => self.lsr(),
            reg::MSR => MSR_LINE_UP,
            reg::SCR => self.scr,
            _ => 0,
        }
    }

    /// Handle a write to a UART register.
    pub fn write(&mut self, offset: u16, value: u8) {
        if self.dlab() {
            match offset {
                reg::THR => {
                    self.dll = value;
                    return;
                }
                reg::IER => {
                    self.dlm = value;
                    return;
                }
                _ => {}
            }
        }
        match offset {
            reg::THR => {
                if self.sink.write_all(&[value]).is_ok() {
                    let _ = self.sink.flush();
                }
            }
            reg::IER => self.ier = value & 0x0f,
            reg::FCR => {
                if value & fcr::RX_CLEAR != 0 {
                    self.rx.clear();
                }
            }
            reg::LCR => self.lcr = value,
            reg::MCR => self.mcr = value,
            reg::SCR => self.scr = value,
            _ => {}
        }
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Transmit sink that forwards every byte over a channel.
    struct ChannelSink(mpsc::Sender<u8>);

    impl Write for ChannelSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for &byte in buf {
                self.0
                    .send(byte)
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn wired() -> (Serial, mpsc::Receiver<u8>) {
        let (tx, rx) = mpsc::channel();
        (Serial::with_writer(Box::new(ChannelSink(tx))), rx)
    }

    fn drained(rx: &mpsc::Receiver<u8>) -> Vec<u8> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_transmit_reaches_sink() {
        let (mut serial, rx) = wired();
        for &byte in b"ok\r\n" {
            serial.write(reg::THR, byte);
        }
        assert_eq!(drained(&rx), b"ok\r\n");
    }

    #[test]
    fn test_receive_fifo_and_line_status() {
        let mut serial = Serial::new();
        assert_eq!(serial.read(reg::LSR) & lsr::DR, 0);
        assert_ne!(serial.read(reg::LSR) & lsr::THRE, 0);

        serial.receive(b"hi");
        assert_ne!(serial.read(reg::LSR) & lsr::DR, 0);
        assert_eq!(serial.read(reg::RBR), b'h');
        assert_eq!(serial.read(reg::RBR), b'i');
        // Draining the FIFO drops data-ready; an empty read yields zero.
        assert_eq!(serial.read(reg::LSR) & lsr::DR, 0);
        assert_eq!(serial.read(reg::RBR), 0);
    }

    #[test]
    fn test_divisor_latch_shadows_low_registers() {
        let mut serial = Serial::new();
        serial.write(reg::IER, 0x03);

        serial.write(reg::LCR, lcr::DLAB);
        serial.write(reg::THR, 0x18); // 4800 baud
        serial.write(reg::IER, 0x00);
        assert_eq!(serial.read(reg::RBR), 0x18);
        assert_eq!(serial.read(reg::IER), 0x00);

        // Dropping DLAB uncovers the real registers again.
        serial.write(reg::LCR, 0x03);
        assert_eq!(serial.read(reg::IER), 0x03);
    }

    #[test]
    fn test_fifo_control_clears_receive_queue() {
        let mut serial = Serial::new();
        serial.receive(b"stale");
        serial.write(reg::FCR, fcr::RX_CLEAR | 0x01);
        assert_eq!(serial.read(reg::LSR) & lsr::DR, 0);
        assert_eq!(serial.read(reg::RBR), 0);
    }

    #[test]
    fn test_interrupt_identification() {
        let mut serial = Serial::new();
        assert!(!serial.interrupt_pending());

        // The transmitter-empty interrupt fires as soon as it is enabled.
        serial.write(reg::IER, ier::TX_EMPTY);
        assert!(serial.interrupt_pending());
        assert_eq!(serial.read(reg::IIR), iir::TX_EMPTY);

        // Received data outranks it.
        serial.write(reg::IER, ier::TX_EMPTY | ier::RX_READY);
        serial.receive(b"x");
        assert_eq!(serial.read(reg::IIR), iir::RX_READY);
        serial.read(reg::RBR);
        assert_eq!(serial.read(reg::IIR), iir::TX_EMPTY);

        serial.write(reg::IER, 0);
        assert!(!serial.interrupt_pending());
    }

    #[test]
    fn test_modem_status_reports_line_up() {
        let mut serial = Serial::new();
        assert_eq!(serial.read(reg::MSR), MSR_LINE_UP);
    }
}
