//! A single cache-line job slot and the unsafe machinery for moving
//! type-erased jobs in and out of it.
//!
//! Everything here is a narrow contract over raw memory; the queue logic
//! in `lib.rs` stays ordinary safe code built on top of these.

use core::{
	cell::UnsafeCell,
	mem::MaybeUninit,
	sync::atomic::{
		AtomicU32,
		Ordering::{Acquire, Relaxed, Release},
	},
};

use crate::Job;

/// The cache line size assumed for slot layout.
///
/// Correct for effectively all modern x86_64 parts (Intel and AMD).
pub const CACHE_LINE_SIZE: usize = 64;

/// The type-erased invoker installed alongside a job's bytes. Knows the
/// concrete job type, moves it out of the slot and runs it (dropping any
/// fields inline).
type Invoker = unsafe fn(*mut u8);

/// The maximum size of a job's inline payload: one cache line minus the
/// invoker pointer and two 32-bit words (sequence number and padding).
pub const JOB_DATA_SIZE: usize = CACHE_LINE_SIZE - size_of::<Invoker>() - 2 * size_of::<u32>();

/// One slot of the job ring: inline payload bytes, the erased invoker,
/// and the slot's sequence number.
///
/// The sequence number encodes ownership: it equals the lap index while
/// the slot is free (producer may write), and the lap index plus one
/// while a job is published (a consumer may claim). The payload and
/// invoker cells are only ever touched by whichever party the sequence
/// protocol says owns the slot, which is what makes the `Sync` impl
/// below sound.
#[repr(C, align(64))]
pub(crate) struct Slot {
	/// The job's payload bytes, written by the producer while the slot
	/// is free and read back by the claiming consumer.
	data:     UnsafeCell<[MaybeUninit<u8>; JOB_DATA_SIZE]>,
	/// The erased invoker for the payload currently in `data`.
	invoke:   UnsafeCell<MaybeUninit<Invoker>>,
	/// The slot's sequence number; the publication/claim handshake.
	sequence: AtomicU32,
}

const _: () = {
	assert!(size_of::<Slot>() == CACHE_LINE_SIZE);
	assert!(align_of::<Slot>() == CACHE_LINE_SIZE);
};

// SAFETY: The sequence-number protocol gives each slot exactly one owner
// SAFETY: at any point in a lap (producer while free, the single winning
// SAFETY: consumer while published); all cross-core handoffs go through
// SAFETY: release/acquire pairs on `sequence`.
unsafe impl Sync for Slot {}

impl Slot {
	/// Creates a new, empty slot. The sequence number must be set via
	/// [`Self::reset()`] before the slot takes part in the protocol.
	pub(crate) const fn new() -> Self {
		Self {
			data:     UnsafeCell::new([MaybeUninit::uninit(); JOB_DATA_SIZE]),
			invoke:   UnsafeCell::new(MaybeUninit::uninit()),
			sequence: AtomicU32::new(0),
		}
	}

	/// Resets the slot's sequence number to its ring index, marking it
	/// free for lap zero. Only called during queue initialization,
	/// before any concurrency exists.
	pub(crate) fn reset(&self, index: u32) {
		self.sequence.store(index, Relaxed);
	}

	/// Returns whether the slot is free for the producer at `head`,
	/// i.e. its previous lap's job (if any) has been fully retired.
	///
	/// The acquire load pairs with the release store in
	/// [`Self::retire()`], so a `true` result also means the previous
	/// job's execution is visible and the payload bytes are ours to
	/// overwrite.
	pub(crate) fn is_free(&self, head: u32) -> bool {
		self.sequence.load(Acquire) == head
	}

	/// Returns whether the slot holds a published job for lap position
	/// `tail`.
	///
	/// The acquire load pairs with the release store in
	/// [`Self::publish()`], guaranteeing the claiming consumer sees the
	/// payload fully written.
	pub(crate) fn is_published(&self, tail: u32) -> bool {
		self.sequence.load(Acquire) == tail.wrapping_add(1)
	}

	/// Moves `job` into the slot and installs its erased invoker.
	///
	/// Does **not** publish; the caller follows up with
	/// [`Self::publish()`] once its bookkeeping is done.
	///
	/// # Safety
	/// The caller must be the queue's single producer and the slot must
	/// be free for the current lap ([`Self::is_free()`]).
	pub(crate) unsafe fn install<J: Job>(&self, job: J) {
		const {
			assert!(size_of::<J>() <= JOB_DATA_SIZE, "job too large for queue slot");
			assert!(align_of::<J>() <= CACHE_LINE_SIZE, "job over-aligned for queue slot");
		}

		// SAFETY: Producer-exclusive access per the caller contract; the
		// SAFETY: payload buffer is cache-line aligned and large enough
		// SAFETY: per the assertions above.
		unsafe {
			self.data.get().cast::<J>().write(job);
			self.invoke.get().write(MaybeUninit::new(invoke_erased::<J>));
		}
	}

	/// Publishes the slot's job to consumers by release-storing the
	/// sequence number `seq` (the new head value, i.e. lap index + 1).
	pub(crate) fn publish(&self, seq: u32) {
		self.sequence.store(seq, Release);
	}

	/// Moves the job out of the slot and runs it.
	///
	/// # Safety
	/// The caller must have exclusively claimed this slot for the
	/// current lap (the single successful CAS on the queue's tail), and
	/// must call this at most once per claim.
	pub(crate) unsafe fn invoke(&self) {
		// SAFETY: The claim gives us exclusive access to the payload;
		// SAFETY: `install()` initialized both cells before publication,
		// SAFETY: and the acquire in `is_published()` made that visible.
		unsafe {
			let invoke = (*self.invoke.get()).assume_init();
			invoke(self.data.get().cast::<u8>());
		}
	}

	/// Returns the slot to the producer's pool for its next lap by
	/// release-storing `seq` (the lap position plus the queue capacity).
	///
	/// Must only be called after the job body has fully executed; the
	/// release pairs with the acquire in [`Self::is_free()`].
	pub(crate) fn retire(&self, seq: u32) {
		self.sequence.store(seq, Release);
	}
}

/// The concrete invoker instantiated per job type: moves the job out of
/// the slot's payload buffer and runs it by value.
///
/// # Safety
/// `data` must point at a validly initialized `J` the caller has
/// exclusive access to; the pointee is moved from and must not be
/// touched again.
unsafe fn invoke_erased<J: Job>(data: *mut u8) {
	// SAFETY: Per the function contract; the read relocates the job by
	// SAFETY: copy, which the `Job` bound declares legal.
	unsafe { data.cast::<J>().read().run() }
}
