//! Launch sequencing for secondary cores.

use core::{
	hint::spin_loop,
	ptr,
	sync::atomic::{
		AtomicU8,
		Ordering::{Acquire, Release},
	},
};

use vesper_debug::{dbg, dbg_warn};
use vesper_kernel::{
	Kernel,
	mem::{Alloc, PAGE_SIZE},
	topo::{LogicalCore, Topology},
};

use super::{
	BootError, BootScratch, CONFIG_ADDR, LaunchStage, SCRATCH_ADDR, SIPI_VECTOR, STUB64_OFFSET,
	TRANSITIONAL_L4_ADDR, TrampolineConfig, stubs,
};
use crate::{lapic::Lapic, time::Delay};

/// Pages allocated for each secondary core's kernel stack (2 MiB).
const STACK_PAGES: usize = 512;

/// Microseconds a core is given to settle after the INIT interrupt.
const INIT_SETTLE_US: u64 = 10_000;

/// Microseconds between the two startup interrupts.
const SIPI_GAP_US: u64 = 200;

/// Spin iterations granted to a core between its second startup
/// interrupt and its ready-flag store.
const READY_SPIN_BUDGET: u64 = 10_000_000;

/// Heartbeat interval, in spin iterations, for progress warnings while
/// a core is slow to come up.
const READY_HEARTBEAT: u64 = 1_000_000;

/// The trampoline GDT: null, 64-bit code, data.
const TRAMPOLINE_GDT: [u64; 3] = [0, 0x0020_9A00_0000_0000, 0x0000_9200_0000_0000];

/// The inter-processor interrupt operations the launch sequencer
/// needs. Implemented by [`Lapic`]; harnesses substitute their own.
pub(super) trait Ipi {
	/// Delivers an INIT interrupt to `lapic_id`, returning once the
	/// interrupt controller reports it sent.
	fn send_init(&self, lapic_id: u8);
	/// Delivers a STARTUP interrupt for `vector` to `lapic_id`,
	/// returning once the interrupt controller reports it sent.
	fn send_startup(&self, lapic_id: u8, vector: u8);
}

impl Ipi for Lapic {
	fn send_init(&self, lapic_id: u8) {
		Lapic::send_init(self, lapic_id);
	}

	fn send_startup(&self, lapic_id: u8, vector: u8) {
		Lapic::send_startup(self, lapic_id, vector);
	}
}

/// Walks one core through the INIT/STARTUP sequence and waits for its
/// ready flag.
///
/// Exactly one INIT and exactly two startup interrupts are issued,
/// with the architectural settle times between them; the only bounded
/// wait is the final ready-flag poll.
fn launch<I: Ipi, D: Delay>(
	ipi: &I,
	delay: &D,
	ready: &AtomicU8,
	core: LogicalCore,
	vector: u8,
	spin_budget: u64,
) -> Result<(), BootError> {
	let mut stage = LaunchStage::NotStarted;
	dbg!("core {}: launching ({stage:?})", core.lapic_id);

	// The flag must read as zero before anything is signalled, or a
	// stale value from the previous launch would satisfy the wait.
	ready.store(0, Release);

	ipi.send_init(core.lapic_id);
	stage = LaunchStage::InitSent;
	dbg!("core {}: {stage:?}", core.lapic_id);
	delay.delay_us(INIT_SETTLE_US);

	ipi.send_startup(core.lapic_id, vector);
	stage = LaunchStage::FirstSipiSent;
	dbg!("core {}: {stage:?}", core.lapic_id);
	delay.delay_us(SIPI_GAP_US);

	ipi.send_startup(core.lapic_id, vector);
	stage = LaunchStage::SecondSipiSent;
	dbg!("core {}: {stage:?}", core.lapic_id);

	for waited in 1..=spin_budget {
		if ready.load(Acquire) != 0 {
			stage = LaunchStage::Running;
			dbg!("core {}: {stage:?}", core.lapic_id);
			return Ok(());
		}
		if waited % READY_HEARTBEAT == 0 {
			dbg_warn!("core {}: still waiting on ready flag", core.lapic_id);
		}
		spin_loop();
	}

	Err(BootError::LaunchTimeout { core, stage })
}

/// Stages the trampoline for one launch: fresh stub copies, a fresh
/// transitional page-table copy, and a fully rewritten configuration
/// block.
///
/// # Safety
/// The scratch and transitional pages must be identity-mapped and
/// exclusively owned by the bootstrap controller, and `scratch` must
/// point at the scratch page.
unsafe fn stage_trampoline<A: Alloc>(
	scratch: *mut BootScratch,
	kernel: &Kernel,
	core: LogicalCore,
	alloc: &A,
) -> Result<(), BootError> {
	let stack_base = alloc.allocate(STACK_PAGES).ok_or(BootError::OutOfMemory)?;
	let stack_top = stack_base + (STACK_PAGES * PAGE_SIZE) as u64;

	// SAFETY: The stub symbols delimit initialized bytes in the text
	// section; the scratch page is ours per the caller contract.
	unsafe {
		let stub16_start = &raw const stubs::VESPER_AP_STUB16_START;
		let stub16_len = (&raw const stubs::VESPER_AP_STUB16_END).addr() - stub16_start.addr();
		let stub64_start = &raw const stubs::VESPER_AP_STUB64_START;
		let stub64_len = (&raw const stubs::VESPER_AP_STUB64_END).addr() - stub64_start.addr();
		assert!(stub16_len <= STUB64_OFFSET, "16-bit stub outgrew its slot");
		assert!(
			stub64_len <= size_of::<BootScratch>() - STUB64_OFFSET,
			"long-mode stub outgrew its slot"
		);

		ptr::copy_nonoverlapping(stub16_start, scratch.cast::<u8>(), stub16_len);
		ptr::copy_nonoverlapping(
			stub64_start,
			scratch.cast::<u8>().add(STUB64_OFFSET),
			stub64_len,
		);

		// The core walks this copy of the boot processor's top-level
		// table until the long-mode stub installs the real `cr3`.
		let l4 = crate::asm::cr3() & !0xFFF;
		ptr::copy_nonoverlapping(
			l4 as usize as *const u8,
			TRANSITIONAL_L4_ADDR as *mut u8,
			PAGE_SIZE,
		);

		let config = &raw mut (*scratch).config;
		(*config).gdt = TRAMPOLINE_GDT;
		(*config).null_idt = [0; 6];

		let gdt_base = (CONFIG_ADDR + core::mem::offset_of!(TrampolineConfig, gdt)) as u32;
		let gdt_limit = (size_of_val(&TRAMPOLINE_GDT) - 1) as u16;
		(&mut (*config).gdtr)[0..2].copy_from_slice(&gdt_limit.to_le_bytes());
		(&mut (*config).gdtr)[2..6].copy_from_slice(&gdt_base.to_le_bytes());

		// Global-page translation stays off until the real control
		// registers go in; stale global entries from the transitional
		// table must not survive.
		(*config).cr4_bits = (crate::asm::cr4() as u32) & !(1 << 7);
		(*config).stack_ptr = stack_top;
		(*config).final_cr3 = crate::asm::cr3();
		(*config).cr0_value = crate::asm::cr0();
		(*config).cr4_value = crate::asm::cr4();
		(*config).entry_point = vesper_ap_entry as usize as u64;
		(*config).kernel = ptr::from_ref(kernel).addr() as u64;
		(*config).lapic_id = core.lapic_id;
	}

	Ok(())
}

/// Boots every secondary core in the topology, sequentially, reusing
/// the single scratch page for each launch. Returns the number of
/// cores brought online.
///
/// Any error is fatal and aborts the remaining launches: an
/// out-of-memory stack allocation leaves nothing to run cores on, and
/// a timed-out core may still wake later and stomp a reused scratch
/// page, so continuing would be unsound.
///
/// # Safety
/// The caller must guarantee, once per boot:
/// - the kernel context has been armed via `Kernel::initialize()`, so
///   arriving cores can enter the runtime loop immediately;
/// - the pages at [`SCRATCH_ADDR`](super::SCRATCH_ADDR) and
///   [`TRANSITIONAL_L4_ADDR`](super::TRANSITIONAL_L4_ADDR) are
///   identity-mapped, writable, and owned by nothing else;
/// - `lapic` is the boot processor's own interrupt controller and
///   `tsc` has been calibrated.
pub unsafe fn boot_secondaries<A: Alloc>(
	kernel: &'static Kernel,
	topology: &Topology<'_>,
	lapic: &Lapic,
	tsc: &crate::time::Tsc,
	alloc: &A,
) -> Result<u32, BootError> {
	let scratch = SCRATCH_ADDR as *mut BootScratch;
	let mut started = 0;

	for core in topology.secondaries() {
		// SAFETY: Scratch-page ownership is forwarded from the caller;
		// no secondary is executing out of it between launches.
		unsafe {
			stage_trampoline(scratch, kernel, core, alloc)?;
		}

		// Every config write must be globally visible before the core
		// is told where to start.
		crate::asm::strong_memory_fence();

		// SAFETY: The scratch page is mapped per the caller contract.
		let ready = unsafe { &(*scratch).config.ready };
		launch(lapic, tsc, ready, core, SIPI_VECTOR, READY_SPIN_BUDGET)?;

		started += 1;
	}

	dbg!("brought {started} secondary core(s) online");
	Ok(started)
}

/// The long-mode Rust entry point for secondary cores, jumped to by
/// the trampoline with a fresh stack and the boot processor's control
/// registers installed.
#[unsafe(no_mangle)]
unsafe extern "C" fn vesper_ap_entry() -> ! {
	crate::asm::flush_tlb();

	// SAFETY: The boot processor staged the configuration block and
	// fenced before signalling this core.
	let (kernel, ready) = unsafe {
		let config = &*(CONFIG_ADDR as *const TrampolineConfig);
		let kernel = &*(config.kernel as usize as *const Kernel);
		(kernel, &config.ready)
	};

	// Everything needed from the scratch page has been read; the
	// segment descriptors it still holds are cached by the processor,
	// so the page is free for the next launch the moment this store
	// lands.
	ready.store(1, Release);

	kernel.run()
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Mutex,
		atomic::{AtomicU8, Ordering::Relaxed},
	};

	use super::*;

	/// One interrupt recorded by the mock controller. Init carries the
	/// ready-flag value observed at delivery time.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	enum Op {
		Init(u8, u8),
		Sipi(u8, u8),
	}

	struct MockIpi<'a> {
		ready: &'a AtomicU8,
		ops: Mutex<Vec<Op>>,
		wake_on_second_sipi: bool,
	}

	impl<'a> MockIpi<'a> {
		fn new(ready: &'a AtomicU8, wake_on_second_sipi: bool) -> Self {
			Self {
				ready,
				ops: Mutex::new(Vec::new()),
				wake_on_second_sipi,
			}
		}
	}

	impl Ipi for MockIpi<'_> {
		fn send_init(&self, lapic_id: u8) {
			self.ops
				.lock()
				.unwrap()
				.push(Op::Init(lapic_id, self.ready.load(Relaxed)));
		}

		fn send_startup(&self, lapic_id: u8, vector: u8) {
			let mut ops = self.ops.lock().unwrap();
			ops.push(Op::Sipi(lapic_id, vector));
			let sipis = ops
				.iter()
				.filter(|op| matches!(op, Op::Sipi(..)))
				.count();
			if self.wake_on_second_sipi && sipis % 2 == 0 {
				self.ready.store(1, Relaxed);
			}
		}
	}

	struct RecordingDelay(Mutex<Vec<u64>>);

	impl Delay for RecordingDelay {
		fn delay_us(&self, us: u64) {
			self.0.lock().unwrap().push(us);
		}
	}

	#[test]
	fn launch_issues_one_init_then_two_startups() {
		let ready = AtomicU8::new(0);
		let ipi = MockIpi::new(&ready, true);
		let delay = RecordingDelay(Mutex::new(Vec::new()));
		let core = LogicalCore { lapic_id: 7 };

		let result = launch(&ipi, &delay, &ready, core, SIPI_VECTOR, 1_000);

		assert_eq!(result, Ok(()));
		assert_eq!(
			*ipi.ops.lock().unwrap(),
			vec![Op::Init(7, 0), Op::Sipi(7, 8), Op::Sipi(7, 8)]
		);
		assert_eq!(*delay.0.lock().unwrap(), vec![10_000, 200]);
	}

	#[test]
	fn launch_clears_a_stale_ready_flag_before_signalling() {
		// Left over from a previous successful launch.
		let ready = AtomicU8::new(1);
		let ipi = MockIpi::new(&ready, true);
		let delay = RecordingDelay(Mutex::new(Vec::new()));
		let core = LogicalCore { lapic_id: 2 };

		launch(&ipi, &delay, &ready, core, SIPI_VECTOR, 1_000).unwrap();

		// The INIT must have seen the flag already cleared.
		assert_eq!(ipi.ops.lock().unwrap()[0], Op::Init(2, 0));
	}

	#[test]
	fn launching_k_cores_observes_k_ready_transitions() {
		let cores = [1u8, 2, 3, 5];
		let ready = AtomicU8::new(0);
		let ipi = MockIpi::new(&ready, true);
		let delay = RecordingDelay(Mutex::new(Vec::new()));

		let mut transitions = 0;
		for lapic_id in cores {
			let core = LogicalCore { lapic_id };
			launch(&ipi, &delay, &ready, core, SIPI_VECTOR, 1_000).unwrap();
			transitions += 1;
		}

		assert_eq!(transitions, cores.len());
		// Each launch must have found the flag freshly cleared; a
		// carried-over flag would mean fewer real transitions.
		let ops = ipi.ops.lock().unwrap();
		for op in ops.iter().filter(|op| matches!(op, Op::Init(..))) {
			assert!(matches!(op, Op::Init(_, 0)));
		}
		assert_eq!(ops.len(), cores.len() * 3);
	}

	#[test]
	fn unresponsive_core_times_out_after_the_full_sequence() {
		let ready = AtomicU8::new(0);
		let ipi = MockIpi::new(&ready, false);
		let delay = RecordingDelay(Mutex::new(Vec::new()));
		let core = LogicalCore { lapic_id: 9 };

		let result = launch(&ipi, &delay, &ready, core, SIPI_VECTOR, 1_000);

		assert_eq!(
			result,
			Err(BootError::LaunchTimeout {
				core,
				stage: LaunchStage::SecondSipiSent,
			})
		);
		// No retries: the sequence was still exactly INIT plus two
		// startups.
		assert_eq!(ipi.ops.lock().unwrap().len(), 3);
	}
}
