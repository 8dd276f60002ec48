//! Assembly instruction stubs for the x86_64 architecture.

#![allow(clippy::inline_always)]

use core::arch::asm;

/// Reads a byte from the given I/O port.
#[inline(always)]
#[must_use]
pub fn inb(port: u16) -> u8 {
	let value: u8;
	// SAFETY: Port input has no memory effects visible to Rust.
	unsafe {
		asm!(
			"in al, dx",
			in("dx") port,
			out("al") value,
			options(nostack, preserves_flags)
		);
	}
	value
}

/// Writes a byte to the given I/O port.
///
/// # Safety
/// Callers must be prepared for the device-level consequences of
/// writing to the port.
#[inline(always)]
pub unsafe fn outb(port: u16, value: u8) {
	// SAFETY: Forwarded to the caller.
	unsafe {
		asm!(
			"out dx, al",
			in("dx") port,
			in("al") value,
			options(nostack, preserves_flags)
		);
	}
}

/// Reads the time-stamp counter.
#[inline(always)]
#[must_use]
pub fn rdtsc() -> u64 {
	let hi: u64;
	let lo: u64;
	// SAFETY: `rdtsc` only writes `edx:eax`.
	unsafe {
		asm!(
			"rdtsc",
			out("edx") hi,
			out("eax") lo,
			options(nostack, preserves_flags)
		);
	}
	(hi << 32) | lo
}

/// Returns the current value of the `cr0` register.
#[inline(always)]
#[must_use]
pub fn cr0() -> u64 {
	let cr0: u64;
	// SAFETY: Reading `cr0` has no side effects.
	unsafe {
		asm!("mov {}, cr0", out(reg) cr0, options(nostack, preserves_flags));
	}
	cr0
}

/// Returns the current value of the `cr3` register.
#[inline(always)]
#[must_use]
pub fn cr3() -> u64 {
	let cr3: u64;
	// SAFETY: Reading `cr3` has no side effects.
	unsafe {
		asm!("mov {}, cr3", out(reg) cr3, options(nostack, preserves_flags));
	}
	cr3
}

/// Returns the current value of the `cr4` register.
#[inline(always)]
#[must_use]
pub fn cr4() -> u64 {
	let cr4: u64;
	// SAFETY: Reading `cr4` has no side effects.
	unsafe {
		asm!("mov {}, cr4", out(reg) cr4, options(nostack, preserves_flags));
	}
	cr4
}

/// Flushes the entire Translation Lookaside Buffer by reloading `cr3`.
#[inline(always)]
pub fn flush_tlb() {
	// SAFETY: Rewriting `cr3` with its current value only drops cached
	// translations.
	unsafe {
		asm!(
			"mov rax, cr3",
			"mov cr3, rax",
			out("rax") _,
			options(nostack, preserves_flags)
		);
	}
}

/// Executes a full serializing memory fence (`mfence`).
#[inline(always)]
pub fn strong_memory_fence() {
	// SAFETY: `mfence` has no observable effects beyond ordering.
	unsafe {
		asm!("mfence", options(nostack, preserves_flags));
	}
}

/// Halts the processor forever, with interrupts masked.
#[inline(always)]
pub fn hang() -> ! {
	loop {
		// SAFETY: Masking interrupts and halting is always sound here;
		// this core is done.
		unsafe {
			asm!("cli", "hlt", options(nostack, preserves_flags));
		}
	}
}
