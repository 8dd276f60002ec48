//! Single-producer, multi-consumer lock-free job queue for the Vesper
//! kernel.
//!
//! Every running core drains one shared [`JobQueue`] as its steady-state
//! activity; the boot core, once bootstrap finishes, becomes the single
//! producer. There are no locks anywhere on the hot path: publication is
//! a release-store of a slot sequence number and claiming is a single
//! compare-and-swap on the queue tail.
//!
//! Thread safety:
//! - [`Producer::try_add()`], [`Producer::add()`], [`Producer::wait_idle()`]:
//!   producer only, enforced by the unique [`Producer`] handle.
//! - [`JobQueue::run_next()`]: any number of concurrent consumers.
//!
//! Constraints:
//! - job payloads are at most [`JOB_DATA_SIZE`] bytes (checked at compile
//!   time per job type);
//! - queue capacity is a power of two, fixed at construction.
#![cfg_attr(not(test), no_std)]

mod slot;

use core::sync::atomic::{
	AtomicU32,
	Ordering::{Acquire, Relaxed, Release},
};

pub use self::slot::{CACHE_LINE_SIZE, JOB_DATA_SIZE};
use self::slot::Slot;

/// A unit of work that can be submitted to a [`JobQueue`].
///
/// Jobs are stored inline in a queue slot and relocated by bitwise copy,
/// so a job type must be movable that way (any type without
/// address-identity assumptions; the invoker drops its fields inline
/// after running). Its size must not exceed [`JOB_DATA_SIZE`], which is
/// enforced at compile time when the job is submitted.
pub trait Job: Send + 'static {
	/// Executes the job, consuming it.
	fn run(self);
}

/// Pads a value out to its own cache line so that the producer-side and
/// consumer-side counters never share one (the slots array is already
/// line-aligned per slot).
#[repr(C, align(64))]
struct CacheAligned<T>(T);

/// The fixed-capacity, single-producer/multi-consumer job ring.
///
/// `N` must be a power of two greater than one (checked at compile
/// time). The queue is constructed with [`JobQueue::new()`] (usable in
/// statics), then armed exactly once with [`JobQueue::init()`], which
/// hands back the unique [`Producer`].
pub struct JobQueue<const N: usize> {
	/// The job slots. Written by the producer while free, by the
	/// claiming consumer while published; see [`slot`].
	slots:     [Slot; N],
	/// The consumer-contested ring index; the only multi-writer field
	/// in the queue, advanced solely by compare-and-swap.
	tail:      CacheAligned<AtomicU32>,
	/// Count of fully executed jobs. Release-incremented by consumers
	/// after a job body finishes, acquire-read by
	/// [`Producer::wait_idle()`].
	completed: CacheAligned<AtomicU32>,
}

impl<const N: usize> JobQueue<N> {
	/// Creates a new, un-armed queue. All sequence numbers are zero;
	/// call [`Self::init()`] before use.
	#[must_use]
	pub const fn new() -> Self {
		const {
			assert!(
				N.is_power_of_two() && N > 1,
				"queue capacity must be a power of two greater than one"
			);
		}

		Self {
			slots:     [const { Slot::new() }; N],
			tail:      CacheAligned(AtomicU32::new(0)),
			completed: CacheAligned(AtomicU32::new(0)),
		}
	}

	/// The queue's fixed capacity.
	#[must_use]
	pub const fn capacity(&self) -> usize {
		N
	}

	/// Arms the queue: resets every slot's sequence number to its ring
	/// index, zeroes the tail and completed counters, and returns the
	/// unique [`Producer`] handle (which owns the head index).
	///
	/// # Safety
	/// Must be called exactly once per boot, by the single future
	/// producer, before any consumer touches the queue.
	#[must_use]
	pub unsafe fn init(&self) -> Producer<'_, N> {
		for (i, slot) in self.slots.iter().enumerate() {
			slot.reset(i as u32);
		}
		self.tail.0.store(0, Relaxed);
		self.completed.0.store(0, Relaxed);

		Producer {
			queue: self,
			head:  0,
		}
	}

	/// Attempts to claim and execute the next published job.
	///
	/// Safe to call from any number of cores concurrently. Returns
	/// `true` if a job body was executed on this core, `false` if the
	/// queue was empty (or the next slot not yet published).
	///
	/// Jobs are claimed in strictly increasing tail order, so execution
	/// *start* order matches submission order; completion order across
	/// cores is not guaranteed.
	pub fn run_next(&self) -> bool {
		// Optimistic read; if `tail` is stale, either the publication
		// check or the CAS below fails safely.
		let mut tail = self.tail.0.load(Relaxed);

		loop {
			let slot = &self.slots[(tail as usize) & (N - 1)];

			if !slot.is_published(tail) {
				// Next slot not ready, or `tail` went stale past the
				// published window; the caller retries later.
				return false;
			}

			// The single point of mutual exclusion between consumers:
			// exactly one CAS from `tail` to `tail + 1` succeeds per
			// lap. Acquire on success so the payload reads below are
			// not reordered ahead of the claim; weak because failure
			// is retried in this loop anyway.
			match self
				.tail
				.0
				.compare_exchange_weak(tail, tail.wrapping_add(1), Acquire, Relaxed)
			{
				Ok(_) => {
					// SAFETY: The successful CAS above is this lap's
					// SAFETY: unique claim on the slot.
					unsafe { slot.invoke() };

					// Only now, with the body fully executed, hand the
					// slot back for its next lap and count the job as
					// done.
					slot.retire(tail.wrapping_add(N as u32));
					self.completed.0.fetch_add(1, Release);

					return true;
				}
				Err(current) => {
					// Another core won the slot (or the CAS failed
					// spuriously). The queue is known non-empty, so
					// retry immediately without a pause.
					tail = current;
				}
			}
		}
	}
}

impl<const N: usize> Default for JobQueue<N> {
	fn default() -> Self {
		Self::new()
	}
}

/// The queue's unique producer handle, returned once by
/// [`JobQueue::init()`].
///
/// Owns the head index outright (it is not shared memory at all), which
/// turns the "single producer" protocol requirement into a compile-time
/// guarantee: producer operations take `&mut self` on a non-clonable
/// handle.
pub struct Producer<'q, const N: usize> {
	/// The queue being produced into.
	queue: &'q JobQueue<N>,
	/// The producer-only ring index; also the count of jobs submitted
	/// so far.
	head:  u32,
}

impl<const N: usize> Producer<'_, N> {
	/// Attempts to submit a job without blocking.
	///
	/// Returns `Err(job)` — handing the job back untouched — if the
	/// queue is full. A full queue is an expected, recoverable
	/// condition, not an error: the caller drops the job, retries
	/// later, or blocks via [`Self::add()`]. No queue state is
	/// disturbed by a failed attempt.
	pub fn try_add<J: Job>(&mut self, job: J) -> Result<(), J> {
		let slot = &self.queue.slots[(self.head as usize) & (N - 1)];

		if !slot.is_free(self.head) {
			// Slot still carries the previous lap's job; the ring is
			// holding a full capacity of outstanding work.
			return Err(job);
		}

		// SAFETY: We are the unique producer (this handle is the only
		// SAFETY: one) and the slot is free this lap per the check
		// SAFETY: above.
		unsafe { slot.install(job) };

		self.head = self.head.wrapping_add(1);

		// Publish: pairs with the acquire in the consumers'
		// publication check, making the payload writes visible.
		slot.publish(self.head);

		Ok(())
	}

	/// Submits a job, spinning with a pause hint while the queue is
	/// full. Use when backpressure on the producer is acceptable.
	pub fn add<J: Job>(&mut self, job: J) {
		let mut job = job;
		loop {
			match self.try_add(job) {
				Ok(()) => return,
				Err(returned) => {
					job = returned;
					::core::hint::spin_loop();
				}
			}
		}
	}

	/// A snapshot of submitted-minus-completed jobs. Advisory only, for
	/// status displays and diagnostics.
	#[must_use]
	pub fn active_count(&self) -> u32 {
		self.head.wrapping_sub(self.queue.completed.0.load(Relaxed))
	}

	/// Spins until every job submitted so far has fully executed.
	///
	/// The acquire read of the completed counter pairs with the
	/// consumers' release increment, so this returns only once all job
	/// *bodies* have finished, not merely been claimed. Since only this
	/// handle advances the submission count, the target never regresses
	/// while waiting.
	pub fn wait_idle(&self) {
		while self.queue.completed.0.load(Acquire) != self.head {
			::core::hint::spin_loop();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{
			Arc, Mutex,
			atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
		},
		thread,
		time::Duration,
	};

	use super::*;

	/// A job that bumps a shared counter.
	struct Count(Arc<AtomicUsize>);

	impl Job for Count {
		fn run(self) {
			self.0.fetch_add(1, Relaxed);
		}
	}

	/// A job that appends its label to a shared log.
	struct Label(Arc<Mutex<Vec<u32>>>, u32);

	impl Job for Label {
		fn run(self) {
			self.0.lock().unwrap().push(self.1);
		}
	}

	/// A job that bumps its own cell in a per-job tally.
	struct Tally(Arc<Vec<AtomicUsize>>, usize);

	impl Job for Tally {
		fn run(self) {
			self.0[self.1].fetch_add(1, Relaxed);
		}
	}

	/// A job that dawdles before raising its flag, to distinguish
	/// "claimed" from "finished".
	struct Slow(Arc<AtomicBool>);

	impl Job for Slow {
		fn run(self) {
			thread::sleep(Duration::from_millis(50));
			self.0.store(true, Relaxed);
		}
	}

	#[test]
	fn init_yields_exactly_capacity_slots() {
		let queue = JobQueue::<8>::new();
		// SAFETY: Single-threaded test; init runs once before any consumer.
		let mut producer = unsafe { queue.init() };
		let ran = Arc::new(AtomicUsize::new(0));

		for _ in 0..8 {
			assert!(producer.try_add(Count(Arc::clone(&ran))).is_ok());
		}
		assert!(producer.try_add(Count(Arc::clone(&ran))).is_err());
	}

	#[test]
	fn full_queue_rejection_preserves_pending_jobs() {
		let queue = JobQueue::<4>::new();
		// SAFETY: Single-threaded test; init runs once before any consumer.
		let mut producer = unsafe { queue.init() };
		let log = Arc::new(Mutex::new(Vec::new()));

		for label in 0..4 {
			assert!(producer.try_add(Label(Arc::clone(&log), label)).is_ok());
		}
		// The failed attempt hands the job back and disturbs nothing.
		assert!(producer.try_add(Label(Arc::clone(&log), 99)).is_err());

		while queue.run_next() {}

		assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
		assert_eq!(producer.active_count(), 0);
	}

	#[test]
	fn capacity_four_wraparound_scenario() {
		let queue = JobQueue::<4>::new();
		// SAFETY: Single-threaded test; init runs once before any consumer.
		let mut producer = unsafe { queue.init() };
		let log = Arc::new(Mutex::new(Vec::new()));
		let job = |label| Label(Arc::clone(&log), label);

		// A, B, C, D all fit.
		for label in [b'A', b'B', b'C', b'D'] {
			assert!(producer.try_add(job(u32::from(label))).is_ok());
		}
		// E is rejected while the ring is full.
		assert!(producer.try_add(job(u32::from(b'E'))).is_err());

		// Draining A frees its slot for the next lap.
		assert!(queue.run_next());
		assert!(producer.try_add(job(u32::from(b'E'))).is_ok());

		// Drain B, C, D, E.
		for _ in 0..4 {
			assert!(queue.run_next());
		}
		assert_eq!(producer.active_count(), 0);

		// The ring has wrapped; F fits.
		assert!(producer.try_add(job(u32::from(b'F'))).is_ok());
		assert!(queue.run_next());

		let order: Vec<u8> = log.lock().unwrap().iter().map(|&l| l as u8).collect();
		assert_eq!(order, b"ABCDEF");
	}

	#[test]
	fn concurrent_consumers_run_each_job_exactly_once() {
		const JOBS: usize = 10_000;
		const CONSUMERS: usize = 4;

		let queue = JobQueue::<64>::new();
		// SAFETY: init runs on this thread before any consumer is spawned.
		let mut producer = unsafe { queue.init() };

		let tally: Arc<Vec<AtomicUsize>> =
			Arc::new((0..JOBS).map(|_| AtomicUsize::new(0)).collect());
		let stop = AtomicBool::new(false);

		thread::scope(|s| {
			for _ in 0..CONSUMERS {
				s.spawn(|| {
					while !stop.load(Relaxed) {
						if !queue.run_next() {
							thread::yield_now();
						}
					}
					// Drain whatever is left after the stop signal.
					while queue.run_next() {}
				});
			}

			for i in 0..JOBS {
				producer.add(Tally(Arc::clone(&tally), i));
			}

			producer.wait_idle();
			assert_eq!(producer.active_count(), 0);
			stop.store(true, Relaxed);
		});

		for (i, cell) in tally.iter().enumerate() {
			assert_eq!(cell.load(Relaxed), 1, "job {i} ran a wrong number of times");
		}
	}

	#[test]
	fn wait_idle_waits_for_bodies_not_claims() {
		let queue = JobQueue::<4>::new();
		// SAFETY: init runs on this thread before any consumer is spawned.
		let mut producer = unsafe { queue.init() };
		let done = Arc::new(AtomicBool::new(false));

		thread::scope(|s| {
			s.spawn(|| {
				while !queue.run_next() {
					thread::yield_now();
				}
			});

			producer.add(Slow(Arc::clone(&done)));
			producer.wait_idle();

			// The job body must have fully finished, not merely been
			// claimed, before wait_idle returned.
			assert!(done.load(Relaxed));
			assert_eq!(producer.active_count(), 0);
		});
	}

	#[test]
	fn execution_starts_in_submission_order() {
		const JOBS: u32 = 1_000;

		let queue = JobQueue::<8>::new();
		// SAFETY: init runs on this thread before any consumer is spawned.
		let mut producer = unsafe { queue.init() };
		let log = Arc::new(Mutex::new(Vec::new()));
		let stop = AtomicBool::new(false);

		thread::scope(|s| {
			s.spawn(|| {
				while !stop.load(Relaxed) {
					if !queue.run_next() {
						thread::yield_now();
					}
				}
				while queue.run_next() {}
			});

			for i in 0..JOBS {
				producer.add(Label(Arc::clone(&log), i));
			}
			producer.wait_idle();
			stop.store(true, Relaxed);
		});

		let log = log.lock().unwrap();
		assert_eq!(*log, (0..JOBS).collect::<Vec<_>>());
	}

	#[test]
	fn jobs_are_dropped_after_running() {
		let queue = JobQueue::<4>::new();
		// SAFETY: Single-threaded test; init runs once before any consumer.
		let mut producer = unsafe { queue.init() };
		let ran = Arc::new(AtomicUsize::new(0));

		producer.add(Count(Arc::clone(&ran)));
		assert!(queue.run_next());

		// The invoker consumed the job by value; its Arc clone is gone.
		assert_eq!(Arc::strong_count(&ran), 1);
		assert_eq!(ran.load(Relaxed), 1);
	}
}
