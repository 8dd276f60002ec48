//! Busy-wait timing built on the time-stamp counter, calibrated once
//! against the legacy programmable interval timer.

use core::hint::spin_loop;

use crate::asm::{inb, outb, rdtsc};

/// A source of bounded busy-wait delays.
pub trait Delay {
	/// Spins for at least `us` microseconds.
	fn delay_us(&self, us: u64);
}

/// The PIT input clock frequency, in hertz.
const PIT_HZ: u64 = 1_193_182;

/// The calibration window, in milliseconds.
const CALIBRATION_MS: u64 = 10;

/// The PIT mode/command port.
const PIT_COMMAND: u16 = 0x43;

/// The PIT channel 2 data port.
const PIT_CHANNEL2: u16 = 0x42;

/// The keyboard-controller port holding the channel 2 gate and output
/// bits.
const PORT_B: u16 = 0x61;

/// Converts a microsecond count into time-stamp counter ticks.
const fn ticks_for(us: u64, cycles_per_us: u64) -> u64 {
	us * cycles_per_us
}

/// The calibrated time-stamp counter: one measurement of how many
/// counter ticks elapse per microsecond, taken by the boot processor
/// and shared read-only with everything that needs to wait.
#[derive(Debug, Clone, Copy)]
pub struct Tsc {
	/// Counter ticks per microsecond.
	cycles_per_us: u64,
}

impl Tsc {
	/// Calibrates the time-stamp counter against PIT channel 2.
	///
	/// Programs the channel for a one-shot terminal count spanning the
	/// calibration window, gates it through port `0x61`, and measures
	/// the counter across the window. Call once, on the boot processor,
	/// before any secondary is started.
	///
	/// # Safety
	/// Must not race another user of PIT channel 2 or port `0x61`.
	#[must_use]
	pub unsafe fn calibrate() -> Self {
		// SAFETY: Exclusive use of the timer ports per the contract.
		unsafe {
			// Gate channel 2 on, speaker off.
			let gate = (inb(PORT_B) & !0x02) | 0x01;
			outb(PORT_B, gate);

			// Channel 2, lobyte/hibyte access, mode 0 (interrupt on
			// terminal count), binary.
			outb(PIT_COMMAND, 0xB0);
			let reload = (PIT_HZ * CALIBRATION_MS / 1000) as u16;
			outb(PIT_CHANNEL2, (reload & 0xFF) as u8);
			outb(PIT_CHANNEL2, (reload >> 8) as u8);
		}

		let start = rdtsc();
		// Output goes high at terminal count in mode 0.
		while inb(PORT_B) & 0x20 == 0 {
			spin_loop();
		}
		let end = rdtsc();

		Self {
			cycles_per_us: (end - start).max(1) / (CALIBRATION_MS * 1000),
		}
	}

	/// Builds a timekeeper from a known tick rate. Intended for
	/// harnesses that cannot touch the timer hardware.
	#[must_use]
	pub const fn from_cycles_per_us(cycles_per_us: u64) -> Self {
		Self { cycles_per_us }
	}

	/// The measured counter ticks per microsecond.
	#[must_use]
	pub const fn cycles_per_us(&self) -> u64 {
		self.cycles_per_us
	}
}

impl Delay for Tsc {
	fn delay_us(&self, us: u64) {
		let deadline = rdtsc() + ticks_for(us, self.cycles_per_us);
		while rdtsc() < deadline {
			spin_loop();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tick_conversion_scales_linearly() {
		assert_eq!(ticks_for(0, 2500), 0);
		assert_eq!(ticks_for(200, 2500), 500_000);
		assert_eq!(ticks_for(10_000, 1000), 10_000_000);
	}

	#[test]
	fn calibration_window_fits_a_pit_reload() {
		let reload = PIT_HZ * CALIBRATION_MS / 1000;
		assert_eq!(reload, 11_931);
		assert!(u16::try_from(reload).is_ok());
	}
}
