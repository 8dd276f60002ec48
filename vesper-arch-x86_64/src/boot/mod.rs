//! Multi-processor bootstrap: bringing secondary cores out of the
//! powered-down state and into the kernel runtime loop.
//!
//! The boot processor stages a real-mode trampoline in conventional
//! memory, then walks each secondary through the INIT/STARTUP
//! inter-processor interrupt sequence and waits for it to raise its
//! ready flag from long-mode Rust.

mod secondary;
mod stubs;

use core::{mem::offset_of, sync::atomic::AtomicU8};

pub use secondary::boot_secondaries;
use vesper_kernel::topo::LogicalCore;

/// Physical address of the trampoline scratch page. The startup
/// interrupt vector can only name a page below 1 MiB, and this one is
/// reliably free of firmware claims.
pub const SCRATCH_ADDR: usize = 0x8000;

/// Byte offset of the long-mode stub within the scratch page
/// (`CS:IP = 0x0800:0x0400`).
const STUB64_OFFSET: usize = 0x400;

/// Byte offset of the trampoline configuration block within the
/// scratch page.
const CONFIG_OFFSET: usize = 0x800;

/// Physical address of the configuration block, as the stubs see it.
const CONFIG_ADDR: usize = SCRATCH_ADDR + CONFIG_OFFSET;

/// Physical address of the transitional top-level page table, a copy
/// of the boot processor's own taken before each launch.
pub const TRANSITIONAL_L4_ADDR: usize = 0x9000;

/// The startup interrupt vector: the physical page number of the
/// scratch page.
pub const SIPI_VECTOR: u8 = (SCRATCH_ADDR >> 12) as u8;

/// The error type for booting secondary cores.
#[derive(Debug, PartialEq, Eq)]
pub enum BootError {
	/// The stack allocation for a secondary core failed. Fatal; the
	/// system cannot meaningfully continue without memory.
	OutOfMemory,
	/// A secondary core did not raise its ready flag within the spin
	/// budget.
	LaunchTimeout {
		/// The core that went unresponsive.
		core:  LogicalCore,
		/// How far the launch sequence had progressed.
		stage: LaunchStage,
	},
}

/// Progress marker for a single secondary-core launch, reported on
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
	/// No interrupt has been sent yet.
	NotStarted,
	/// The INIT interrupt has been delivered.
	InitSent,
	/// The first startup interrupt has been delivered.
	FirstSipiSent,
	/// The second startup interrupt has been delivered; the controller
	/// is waiting on the ready flag.
	SecondSipiSent,
	/// The core raised its ready flag.
	Running,
}

/// The configuration block the boot processor writes into the scratch
/// page for the stubs and the long-mode entry point to read.
///
/// The stubs address every field as an absolute physical address
/// computed from [`CONFIG_ADDR`] plus the field's offset, so the block
/// is `repr(C)`.
#[repr(C)]
pub(crate) struct TrampolineConfig {
	/// The GDT descriptor (limit and base) pointing at [`Self::gdt`].
	gdtr:        [u8; 6],
	/// A zero IDT descriptor; any NMI during the trampoline triple
	/// faults instead of wandering.
	null_idt:    [u8; 6],
	/// The `cr4` bits the 16-bit stub installs, as a 32-bit value,
	/// with global-page translation left off.
	cr4_bits:    u32,
	/// The top of the freshly allocated kernel stack.
	stack_ptr:   u64,
	/// The boot processor's `cr3`, installed once in long mode.
	final_cr3:   u64,
	/// The boot processor's `cr0`, installed once in long mode.
	cr0_value:   u64,
	/// The boot processor's `cr4`, installed once in long mode.
	cr4_value:   u64,
	/// The address of the long-mode Rust entry point.
	entry_point: u64,
	/// The address of the shared kernel context.
	kernel:      u64,
	/// The local APIC ID this launch is intended for.
	lapic_id:    u8,
	/// The ready flag: zero while the core is in flight, raised to one
	/// by the core from long-mode Rust. After that store the core never
	/// touches the scratch page again.
	ready:       AtomicU8,
	/// The trampoline GDT: null, 64-bit code, data.
	gdt:         [u64; 3],
}

/// The trampoline scratch page as a whole.
#[repr(C, align(4096))]
pub(crate) struct BootScratch {
	/// The 16-bit stub, entered at `CS:IP = 0x0800:0x0000`.
	stub16: [u8; STUB64_OFFSET],
	/// The long-mode stub.
	stub64: [u8; CONFIG_OFFSET - STUB64_OFFSET],
	/// The configuration block.
	config: TrampolineConfig,
}

const _: () = {
	assert!(size_of::<BootScratch>() <= 4096);
	assert!(offset_of!(BootScratch, config) == CONFIG_OFFSET);
};
