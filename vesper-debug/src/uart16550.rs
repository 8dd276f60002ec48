//! 16550 UART backend for early-stage debug output on x86_64.

use core::fmt::{self, Write};

use uart_16550::SerialPort;
use vesper_sync::{Lock, TicketMutex};

/// The shared serial port for the system. Ticketed so that cores take
/// turns line-by-line instead of starving each other mid-message.
// SAFETY: 0x3F8 is the standard COM1 base; nothing else in the kernel
// SAFETY: drives these ports.
static SERIAL: TicketMutex<SerialPort> = TicketMutex::new(unsafe { SerialPort::new(0x3F8) });

/// Initializes the UART.
pub fn init() {
	SERIAL.lock().init();
}

/// Writes a line to the UART.
pub fn log(message: fmt::Arguments<'_>) {
	// The UART write itself cannot fail; ignore the fmt plumbing result.
	let _ = writeln!(SERIAL.lock(), "{message}");
}
