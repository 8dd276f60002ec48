//! Processor-topology types supplied by the discovery collaborator.
//!
//! The kernel core does not parse ACPI tables; the platform layer hands
//! it an ordered, deduplicated list of logical processors plus the boot
//! processor's own identity, all immutable after discovery.

/// One logical processor, identified by the value used to target it
/// through the interrupt controller. Position in the discovery list is
/// its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalCore {
	/// The processor's local APIC identifier.
	pub lapic_id: u8,
}

/// The discovered processor topology: every logical core in launch
/// order, plus which of them is already running.
#[derive(Debug, Clone, Copy)]
pub struct Topology<'a> {
	/// All discovered logical cores, in the order they will be
	/// launched.
	cores: &'a [LogicalCore],
	/// The boot processor's identifier, excluded from launching.
	boot:  LogicalCore,
}

impl<'a> Topology<'a> {
	/// Creates a topology from the discovery collaborator's output.
	#[must_use]
	pub const fn new(cores: &'a [LogicalCore], boot: LogicalCore) -> Self {
		Self { cores, boot }
	}

	/// The boot processor.
	#[must_use]
	pub const fn boot(&self) -> LogicalCore {
		self.boot
	}

	/// All discovered cores, boot processor included.
	#[must_use]
	pub const fn all(&self) -> &'a [LogicalCore] {
		self.cores
	}

	/// The secondary processors: every discovered core except the boot
	/// processor, in launch order.
	pub fn secondaries(&self) -> impl Iterator<Item = LogicalCore> + 'a {
		let boot = self.boot;
		self.cores.iter().copied().filter(move |core| *core != boot)
	}
}
