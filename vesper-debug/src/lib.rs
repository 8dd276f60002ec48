//! Early-stage debug output for the Vesper kernel.
//!
//! A one-way diagnostic sink for bootstrap progress and failure
//! messages. The kernel core has no functional dependency on this
//! crate: with no backend feature enabled (or with `kernel-debug`
//! disabled) every macro compiles to a no-op and the `log` call becomes
//! inert, so the core remains correct with diagnostics entirely absent.
//!
//! Not robust by design: output is serialized with a spin lock and is
//! not interrupt-safe. Bootstrap and bring-up diagnostics only.
#![no_std]

#[cfg(all(target_arch = "x86_64", feature = "uart16550"))]
mod uart16550;

/// Initializes the debug backend, if one is enabled. Call once, early,
/// from the boot processor.
pub fn init() {
	#[cfg(all(target_arch = "x86_64", feature = "uart16550"))]
	self::uart16550::init();
}

/// Writes a message to the debug backend.
///
/// Shouldn't be used directly; use the [`dbg!`]/[`dbg_warn!`]/
/// [`dbg_err!`] macros instead.
#[allow(unused_variables)]
pub fn log(message: core::fmt::Arguments<'_>) {
	#[cfg(all(target_arch = "x86_64", feature = "uart16550"))]
	self::uart16550::log(message);
}

/// Sends a general debug message to the diagnostic sink.
#[macro_export]
macro_rules! dbg {
	($($arg:tt)*) => {{
		#[cfg(feature = "kernel-debug")]
		$crate::log(format_args!("{}:{}:I:{}", ::core::file!(), ::core::line!(), format_args!($($arg)*)));
	}};
}

/// Sends a warning message to the diagnostic sink.
#[macro_export]
macro_rules! dbg_warn {
	($($arg:tt)*) => {{
		#[cfg(feature = "kernel-debug")]
		$crate::log(format_args!("{}:{}:W:{}", ::core::file!(), ::core::line!(), format_args!($($arg)*)));
	}};
}

/// Sends an error message to the diagnostic sink.
#[macro_export]
macro_rules! dbg_err {
	($($arg:tt)*) => {{
		#[cfg(feature = "kernel-debug")]
		$crate::log(format_args!("{}:{}:E:{}", ::core::file!(), ::core::line!(), format_args!($($arg)*)));
	}};
}
