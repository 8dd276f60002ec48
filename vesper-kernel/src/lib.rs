//! Architecture-independent core of the Vesper kernel.
//!
//! Provides the single [`Kernel`] context object (one instance per
//! boot, passed by reference — never reached through hidden statics),
//! the steady-state runtime loop every core executes, and the
//! collaborator contracts the architecture layers plug into: the
//! [`mem::Alloc`] memory mapper and the [`topo`] processor-topology
//! types.
#![no_std]

pub mod mem;
pub mod topo;

use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

use vesper_jobs::{JobQueue, Producer};

/// The capacity of the system job queue.
pub const JOB_QUEUE_CAPACITY: usize = 256;

/// The kernel context: everything shared by all cores for the lifetime
/// of a boot.
///
/// Constructed exactly once by the boot processor, armed via
/// [`Self::initialize()`], then handed by reference into the bootstrap
/// controller and each core's runtime loop.
pub struct Kernel {
	/// The system job queue every running core drains.
	jobs:   JobQueue<JOB_QUEUE_CAPACITY>,
	/// The number of cores currently executing the runtime loop,
	/// including the boot processor once it gets there.
	online: AtomicU32,
}

impl Kernel {
	/// Creates the kernel context. Usable in statics; the queue is not
	/// yet armed.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			jobs:   JobQueue::new(),
			online: AtomicU32::new(0),
		}
	}

	/// Arms the job queue and returns its unique producer handle.
	///
	/// # Safety
	/// Must be called exactly once per boot, by the boot processor,
	/// before any secondary core is started.
	#[must_use]
	pub unsafe fn initialize(&self) -> Producer<'_, JOB_QUEUE_CAPACITY> {
		// SAFETY: Forwarded contract; no consumer exists yet.
		unsafe { self.jobs.init() }
	}

	/// The system job queue.
	#[must_use]
	pub fn jobs(&self) -> &JobQueue<JOB_QUEUE_CAPACITY> {
		&self.jobs
	}

	/// The number of cores currently online.
	#[must_use]
	pub fn online_cores(&self) -> u32 {
		self.online.load(Relaxed)
	}

	/// The steady-state body of every processor: drain the job queue
	/// forever, yielding the core with a pause hint whenever no job was
	/// ready. Never returns; this is the core's only activity from here
	/// on.
	pub fn run(&self) -> ! {
		let nth = self.online.fetch_add(1, Relaxed) + 1;
		vesper_debug::dbg!("core entering runtime loop ({nth} online)");

		loop {
			if !self.jobs.run_next() {
				::core::hint::spin_loop();
			}
		}
	}
}

impl Default for Kernel {
	fn default() -> Self {
		Self::new()
	}
}
