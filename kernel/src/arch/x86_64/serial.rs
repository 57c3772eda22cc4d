/*
 * Serial console (COM1)
 *
 * Polled 16550 output used as the log sink. Only the transmit path is
 * needed by the scheduler core.
 */

use ::x86_64::instructions::{interrupts, port::Port};
use bitflags::bitflags;
use spin::Mutex;

const COM1: u16 = 0x3F8;

bitflags! {
    /// Line status flags
    struct LineStsFlags: u8 {
        const INPUT_FULL = 1;
        // 1 to 4 unknown
        const OUTPUT_EMPTY = 1 << 5;
        // 6 and 7 unknown
    }
}

struct SerialPort {
    data: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            line_sts: Port::new(base + 5),
        }
    }

    fn line_sts(&mut self) -> LineStsFlags {
        // SAFETY: reading the line status register of COM1 is side-effect free.
        LineStsFlags::from_bits_truncate(unsafe { self.line_sts.read() })
    }

    fn send(&mut self, byte: u8) {
        while !self.line_sts().contains(LineStsFlags::OUTPUT_EMPTY) {
            core::hint::spin_loop();
        }
        // SAFETY: the transmit holding register is empty.
        unsafe { self.data.write(byte) };
    }
}

static COM1_PORT: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// Write `s` to COM1, translating `\n` to `\r\n`
pub fn write_str(s: &str) {
    interrupts::without_interrupts(|| {
        let mut port = COM1_PORT.lock();
        for byte in s.bytes() {
            if byte == b'\n' {
                port.send(b'\r');
            }
            port.send(byte);
        }
    });
}
