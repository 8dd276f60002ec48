//! x86_64 architecture support for the Vesper kernel: the local APIC
//! driver, time-stamp-counter timing, and the multi-processor
//! bootstrap controller.
//!
//! The boot processor is expected to:
//!
//! 1. construct and [`initialize`](vesper_kernel::Kernel::initialize)
//!    the kernel context;
//! 2. calibrate a [`time::Tsc`];
//! 3. hand both, plus the discovered topology, a mapped [`lapic::Lapic`]
//!    and a page allocator, to [`boot::boot_secondaries`];
//! 4. enter [`run`](vesper_kernel::Kernel::run) itself.
#![cfg_attr(not(test), no_std)]

pub mod asm;
pub mod boot;
pub mod lapic;
pub mod time;
