//! The memory-mapper collaborator contract.
//!
//! Physical memory management is out of scope for the kernel core; the
//! bootstrap controller only needs page-granular allocations for
//! secondary-core stacks, supplied by whatever allocator the platform
//! layer brings up from the firmware memory map.

/// The system page size, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A page-granular physical allocator.
///
/// # Safety
/// Implementors must return page-aligned physical addresses of
/// zero-initialized, unaliased memory not claimed by the kernel,
/// firmware, or any prior allocation. Returning anything else leads to
/// undefined behavior in the consumers of this trait.
pub unsafe trait Alloc {
	/// Allocates `pages` contiguous page frames, returning the physical
	/// address of the first. `None` means the system is out of memory,
	/// which callers at this layer treat as fatal.
	fn allocate(&self, pages: usize) -> Option<u64>;
}
