//! Driver for the Local APIC (Advanced Programmable Interrupt
//! Controller), as far as the bootstrap controller needs it: identity,
//! error clearing, and inter-processor interrupt delivery.

use core::{hint::spin_loop, mem::offset_of};

use volatile_register::{RO, RW, WO};

/// A read-only APIC register cell. Registers live on 16-byte strides.
#[repr(C, align(16))]
struct Ro(RO<u32>);

/// A read-write APIC register cell.
#[repr(C, align(16))]
struct Rw(RW<u32>);

/// A write-only APIC register cell.
#[repr(C, align(16))]
struct Wo(WO<u32>);

/// The memory-mapped register block of a local APIC.
///
/// Only the registers this driver touches are named; the rest exist to
/// keep the offsets correct.
#[repr(C, align(16))]
struct RegisterBlock {
	/// Reserved.
	_reserved0: [Ro; 2],
	/// The local APIC ID register (`0x20`).
	id:         Rw,
	/// The local APIC version register (`0x30`).
	version:    Ro,
	/// Reserved.
	_reserved1: [Ro; 4],
	/// The task priority register (`0x80`).
	tpr:        Rw,
	/// The arbitration priority register (`0x90`).
	apr:        Ro,
	/// The processor priority register (`0xA0`).
	ppr:        Ro,
	/// The end-of-interrupt register (`0xB0`).
	eoi:        Wo,
	/// The remote read register (`0xC0`).
	rrd:        Ro,
	/// The logical destination register (`0xD0`).
	ldr:        Rw,
	/// The destination format register (`0xE0`).
	dfr:        Rw,
	/// The spurious interrupt vector register (`0xF0`).
	svr:        Rw,
	/// The in-service registers (`0x100..=0x170`).
	isr:        [Ro; 8],
	/// The trigger mode registers (`0x180..=0x1F0`).
	tmr:        [Ro; 8],
	/// The interrupt request registers (`0x200..=0x270`).
	irr:        [Ro; 8],
	/// The error status register (`0x280`).
	esr:        Rw,
	/// Reserved.
	_reserved2: [Ro; 6],
	/// The LVT corrected machine check interrupt register (`0x2F0`).
	lvt_cmci:   Rw,
	/// The interrupt command registers, low then high (`0x300`, `0x310`).
	icr:        [Rw; 2],
}

const _: () = {
	assert!(offset_of!(RegisterBlock, id) == 0x20);
	assert!(offset_of!(RegisterBlock, version) == 0x30);
	assert!(offset_of!(RegisterBlock, eoi) == 0xB0);
	assert!(offset_of!(RegisterBlock, svr) == 0xF0);
	assert!(offset_of!(RegisterBlock, esr) == 0x280);
	assert!(offset_of!(RegisterBlock, icr) == 0x300);
};

/// The delivery-status bit of the low interrupt command register; set
/// while the APIC is still sending the last command.
const ICR_DELIVERY_STATUS: u32 = 1 << 12;

/// Encodes an INIT assert command into the low interrupt command
/// register, preserving the reserved high bits of `current`.
const fn encode_init_assert(current: u32) -> u32 {
	(current & 0xFFF0_0000) | 0x0000_C500
}

/// Encodes an INIT de-assert command into the low interrupt command
/// register, preserving the reserved high bits of `current`.
const fn encode_init_deassert(current: u32) -> u32 {
	(current & 0xFFF0_0000) | 0x0000_8500
}

/// Encodes a STARTUP command for `vector` (the page number the target
/// starts executing at) into the low interrupt command register.
const fn encode_startup(current: u32, vector: u8) -> u32 {
	(current & 0xFFF0_F800) | 0x0000_0600 | vector as u32
}

/// Encodes the destination `lapic_id` into the high interrupt command
/// register.
const fn encode_target(current: u32, lapic_id: u8) -> u32 {
	(current & 0x00FF_FFFF) | ((lapic_id as u32) << 24)
}

/// A handle to a memory-mapped local APIC register block.
pub struct Lapic {
	/// The virtual base address of the register block.
	base: *mut RegisterBlock,
}

// SAFETY: The register block is a fixed MMIO window; the handle can be
// moved between cores.
unsafe impl Send for Lapic {}

impl Lapic {
	/// Creates a handle from the APIC's mapped base address.
	///
	/// # Safety
	/// `base` must be the virtual address of the current translation's
	/// mapping of the local APIC register block, valid for the life of
	/// the handle.
	#[must_use]
	pub unsafe fn new(base: *mut u8) -> Self {
		Self { base: base.cast() }
	}

	/// The local APIC ID of the core this handle is read from.
	#[must_use]
	pub fn id(&self) -> u8 {
		// SAFETY: `base` is valid per the constructor contract.
		(unsafe { (*self.base).id.0.read() } >> 24) as u8
	}

	/// The version field of the version register.
	#[must_use]
	pub fn version(&self) -> u8 {
		// SAFETY: `base` is valid per the constructor contract.
		(unsafe { (*self.base).version.0.read() } & 0xFF) as u8
	}

	/// Clears the error status register.
	pub fn clear_errors(&self) {
		// SAFETY: Writing zero to ESR is the architectural way to
		// arm it for the next command.
		unsafe { (*self.base).esr.0.write(0) };
	}

	/// Signals end-of-interrupt for the interrupt currently being
	/// serviced.
	pub fn eoi(&self) {
		// SAFETY: `base` is valid per the constructor contract.
		unsafe { (*self.base).eoi.0.write(0) };
	}

	/// Selects `lapic_id` as the destination of the next interrupt
	/// command.
	fn set_target(&self, lapic_id: u8) {
		// SAFETY: `base` is valid per the constructor contract.
		unsafe {
			let current = (*self.base).icr[1].0.read();
			(*self.base).icr[1].0.write(encode_target(current, lapic_id));
		}
	}

	/// Spins until the APIC reports the last interrupt command as
	/// delivered.
	fn wait_for_delivery(&self) {
		// SAFETY: `base` is valid per the constructor contract.
		while unsafe { (*self.base).icr[0].0.read() } & ICR_DELIVERY_STATUS != 0 {
			spin_loop();
		}
	}

	/// Sends an INIT inter-processor interrupt to `lapic_id`, asserting
	/// then de-asserting it, waiting out delivery of each half.
	pub fn send_init(&self, lapic_id: u8) {
		self.clear_errors();
		self.set_target(lapic_id);
		// SAFETY: `base` is valid per the constructor contract.
		unsafe {
			let current = (*self.base).icr[0].0.read();
			(*self.base).icr[0].0.write(encode_init_assert(current));
		}
		self.wait_for_delivery();

		self.set_target(lapic_id);
		// SAFETY: `base` is valid per the constructor contract.
		unsafe {
			let current = (*self.base).icr[0].0.read();
			(*self.base).icr[0].0.write(encode_init_deassert(current));
		}
		self.wait_for_delivery();
	}

	/// Sends a STARTUP inter-processor interrupt to `lapic_id`. The
	/// target begins real-mode execution at physical page `vector`.
	pub fn send_startup(&self, lapic_id: u8, vector: u8) {
		self.clear_errors();
		self.set_target(lapic_id);
		// SAFETY: `base` is valid per the constructor contract.
		unsafe {
			let current = (*self.base).icr[0].0.read();
			(*self.base).icr[0].0.write(encode_startup(current, vector));
		}
		self.wait_for_delivery();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_commands_encode_level_triggered_init() {
		assert_eq!(encode_init_assert(0), 0x0000_C500);
		assert_eq!(encode_init_deassert(0), 0x0000_8500);
		// Reserved high bits survive a read-modify-write.
		assert_eq!(encode_init_assert(0xABF0_0000), 0xABF0_C500);
	}

	#[test]
	fn startup_command_carries_the_vector() {
		assert_eq!(encode_startup(0, 0x08), 0x0000_0608);
		// The vector field is fully replaced, not OR-merged.
		assert_eq!(encode_startup(0x0000_00FF, 0x08), 0x0000_0608);
	}

	#[test]
	fn target_lives_in_the_icr_high_byte() {
		assert_eq!(encode_target(0, 3), 0x0300_0000);
		assert_eq!(encode_target(0xFF12_3456, 0x42), 0x4212_3456);
	}
}
