//! The machine-code trampoline stubs copied into the scratch page.
//!
//! Secondary cores enter the 16-bit stub in real mode at
//! `CS:IP = 0x0800:0x0000`, so every memory reference is a fixed
//! physical address computed at compile time from the scratch layout;
//! nothing here is position-dependent on where the kernel image was
//! loaded. Adapted from the direct-to-long-mode sequence documented on
//! the OSDev wiki.

use core::{arch::global_asm, mem::offset_of};

use super::{CONFIG_ADDR, SCRATCH_ADDR, STUB64_OFFSET, TRANSITIONAL_L4_ADDR, TrampolineConfig};

global_asm! {
	".global VESPER_AP_STUB16_START",
	".global VESPER_AP_STUB16_END",
	"VESPER_AP_STUB16_START:",
	".code16",

	// Interrupts off, string ops forward.
	"cli",
	"cld",

	// Mask every line on both legacy PICs.
	"mov al, 0xFF",
	"out 0xA1, al",
	"out 0x21, al",
	"nop",
	"nop",

	// Segments are undefined after a startup interrupt; absolute
	// addressing below goes through DS = 0.
	"xor ax, ax",
	"mov ds, ax",

	// A null IDT turns any NMI into a triple fault.
	"lidt [{null_idt}]",

	// PAE plus PSE, plus whatever the boot processor carried.
	"mov eax, 0b10100000",
	"mov ebx, [{cr4_bits}]",
	"or eax, ebx",
	"mov cr4, eax",

	// The transitional top-level table, copied in by the boot
	// processor before launch.
	"mov edx, {transitional_l4}",
	"mov cr3, edx",

	// Long-mode enable and no-execute enable in EFER.
	"xor eax, eax",
	"mov ecx, 0xC0000080",
	"rdmsr",
	"or eax, 0x00000900",
	"wrmsr",

	// Paging and protection on in one write; this is the
	// direct-to-long-mode switch.
	"mov ebx, cr0",
	"or ebx, 0x80000001",
	"mov cr0, ebx",

	"lgdt [{gdtr}]",

	// Far jump to load the 64-bit code selector.
	"ljmp 0x0008, {stub64}",

	"VESPER_AP_STUB16_END:",
	".code64",

	null_idt = const CONFIG_ADDR + offset_of!(TrampolineConfig, null_idt),
	cr4_bits = const CONFIG_ADDR + offset_of!(TrampolineConfig, cr4_bits),
	gdtr = const CONFIG_ADDR + offset_of!(TrampolineConfig, gdtr),
	transitional_l4 = const TRANSITIONAL_L4_ADDR,
	stub64 = const SCRATCH_ADDR + STUB64_OFFSET,
}

global_asm! {
	".global VESPER_AP_STUB64_START",
	".global VESPER_AP_STUB64_END",
	"VESPER_AP_STUB64_START:",
	".code64",

	// Real stack, then the real control registers.
	"mov rax, [{stack_ptr}]",
	"mov rsp, rax",

	"mov rax, [{final_cr3}]",
	"mov cr3, rax",

	"mov rax, [{cr0_value}]",
	"mov cr0, rax",

	"mov rax, [{cr4_value}]",
	"mov cr4, rax",

	// A zero return address keeps unwinders from walking off the
	// stack top.
	"push 0",
	"mov rax, [{entry_point}]",
	"jmp rax",

	"VESPER_AP_STUB64_END:",

	stack_ptr = const CONFIG_ADDR + offset_of!(TrampolineConfig, stack_ptr),
	final_cr3 = const CONFIG_ADDR + offset_of!(TrampolineConfig, final_cr3),
	cr0_value = const CONFIG_ADDR + offset_of!(TrampolineConfig, cr0_value),
	cr4_value = const CONFIG_ADDR + offset_of!(TrampolineConfig, cr4_value),
	entry_point = const CONFIG_ADDR + offset_of!(TrampolineConfig, entry_point),
}

unsafe extern "C" {
	/// First byte of the 16-bit stub.
	pub(super) static VESPER_AP_STUB16_START: u8;
	/// One past the last byte of the 16-bit stub.
	pub(super) static VESPER_AP_STUB16_END: u8;
	/// First byte of the long-mode stub.
	pub(super) static VESPER_AP_STUB64_START: u8;
	/// One past the last byte of the long-mode stub.
	pub(super) static VESPER_AP_STUB64_END: u8;
}
