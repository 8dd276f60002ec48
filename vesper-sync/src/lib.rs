//! Spin-based synchronization primitives for the Vesper kernel.
//!
//! There is no operating system below this layer; every lock here is a
//! busy-wait with a pause hint, never a true blocking operation.
#![cfg_attr(not(test), no_std)]

use core::{
	cell::UnsafeCell,
	ops::{Deref, DerefMut},
	sync::atomic::{
		AtomicBool, AtomicUsize,
		Ordering::{Acquire, Relaxed, Release},
	},
};

/// Standardized lock interface implemented for all lock types.
pub trait Lock {
	/// The target type of value being guarded.
	type Target: ?Sized;

	/// The lock guard type used by the lock implementation.
	type Guard<'a>: Drop + Deref<Target = Self::Target> + DerefMut
	where
		Self: 'a;

	/// Acquires a lock, blocking until it's available.
	fn lock(&self) -> Self::Guard<'_>;
}

/// A simple unfair, greedy spinlock. The cheapest lock in this crate;
/// makes no forward-progress guarantee under contention.
pub struct Mutex<T: ?Sized> {
	/// Whether or not the lock is currently held.
	locked: AtomicBool,
	/// The guarded value.
	value:  UnsafeCell<T>,
}

// SAFETY: The lock serializes all access to the inner value.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// SAFETY: The lock serializes all access to the inner value.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
	/// Creates a new spinlock mutex for the given value.
	pub const fn new(value: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			value:  UnsafeCell::new(value),
		}
	}
}

impl<T: ?Sized> Lock for Mutex<T> {
	type Guard<'a>
		= MutexGuard<'a, T>
	where
		T: 'a;
	type Target = T;

	fn lock(&self) -> Self::Guard<'_> {
		loop {
			if !self.locked.swap(true, Acquire) {
				return MutexGuard {
					locked: &self.locked,
					value:  self.value.get(),
				};
			}

			::core::hint::spin_loop();
		}
	}
}

impl<T: Default> Default for Mutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

/// A lock guard for the simple [`Mutex`] type.
///
/// The raw value pointer keeps this type `!Send`/`!Sync`; guards must
/// not cross cores.
pub struct MutexGuard<'a, T: ?Sized + 'a> {
	/// A handle to the mutex's lock flag.
	locked: &'a AtomicBool,
	/// A pointer to the guarded value.
	value:  *mut T,
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
	fn drop(&mut self) {
		self.locked.store(false, Release);
	}
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: The lock is held for the guard's entire lifetime.
		unsafe { &*self.value }
	}
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		// SAFETY: The lock is held for the guard's entire lifetime.
		unsafe { &mut *self.value }
	}
}

/// A fair, ticketed spinlock. Grants the lock in strict arrival order,
/// which keeps one chatty core from starving the others. Used for the
/// debug output sink, where interleaved half-lines are worse than a
/// slightly more expensive lock.
pub struct TicketMutex<T: ?Sized> {
	/// The ticket currently being served.
	now_serving: AtomicUsize,
	/// The next ticket to hand out.
	next_ticket: AtomicUsize,
	/// The guarded value.
	value:       UnsafeCell<T>,
}

// SAFETY: The lock serializes all access to the inner value.
unsafe impl<T: ?Sized + Send> Send for TicketMutex<T> {}
// SAFETY: The lock serializes all access to the inner value.
unsafe impl<T: ?Sized + Send> Sync for TicketMutex<T> {}

impl<T> TicketMutex<T> {
	/// Creates a new ticket mutex for the given value.
	pub const fn new(value: T) -> Self {
		Self {
			now_serving: AtomicUsize::new(0),
			next_ticket: AtomicUsize::new(0),
			value:       UnsafeCell::new(value),
		}
	}
}

impl<T: ?Sized> Lock for TicketMutex<T> {
	type Guard<'a>
		= TicketMutexGuard<'a, T>
	where
		T: 'a;
	type Target = T;

	fn lock(&self) -> Self::Guard<'_> {
		let ticket = self.next_ticket.fetch_add(1, Relaxed);

		// Ticket comparisons are wrapping; the distance between
		// `next_ticket` and `now_serving` is bounded by the core count,
		// so equality is unambiguous.
		while self.now_serving.load(Acquire) != ticket {
			::core::hint::spin_loop();
		}

		TicketMutexGuard {
			now_serving: &self.now_serving,
			value:       self.value.get(),
		}
	}
}

impl<T: Default> Default for TicketMutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

/// A lock guard for the [`TicketMutex`] type.
///
/// The raw value pointer keeps this type `!Send`/`!Sync`; guards must
/// not cross cores.
pub struct TicketMutexGuard<'a, T: ?Sized + 'a> {
	/// A handle to the mutex's serving counter.
	now_serving: &'a AtomicUsize,
	/// A pointer to the guarded value.
	value:       *mut T,
}

impl<T: ?Sized> Drop for TicketMutexGuard<'_, T> {
	fn drop(&mut self) {
		// Wrapping on purpose; see `TicketMutex::lock()`.
		let served = self.now_serving.load(Relaxed).wrapping_add(1);
		self.now_serving.store(served, Release);
	}
}

impl<T: ?Sized> Deref for TicketMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: The lock is held for the guard's entire lifetime.
		unsafe { &*self.value }
	}
}

impl<T: ?Sized> DerefMut for TicketMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		// SAFETY: The lock is held for the guard's entire lifetime.
		unsafe { &mut *self.value }
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, thread};

	use super::*;

	#[test]
	fn mutex_serializes_increments() {
		let counter = Arc::new(Mutex::new(0_usize));

		let handles: Vec<_> = (0..4)
			.map(|_| {
				let counter = Arc::clone(&counter);
				thread::spawn(move || {
					for _ in 0..10_000 {
						*counter.lock() += 1;
					}
				})
			})
			.collect();

		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(*counter.lock(), 40_000);
	}

	#[test]
	fn ticket_mutex_serializes_increments() {
		let counter = Arc::new(TicketMutex::new(0_usize));

		let handles: Vec<_> = (0..4)
			.map(|_| {
				let counter = Arc::clone(&counter);
				thread::spawn(move || {
					for _ in 0..10_000 {
						*counter.lock() += 1;
					}
				})
			})
			.collect();

		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(*counter.lock(), 40_000);
	}

	#[test]
	fn guard_releases_on_drop() {
		let lock = Mutex::new(5);
		drop(lock.lock());
		assert_eq!(*lock.lock(), 5);
	}
}
