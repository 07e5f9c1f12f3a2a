//! General purpose memory allocator over a single contiguous heap
//! region that only ever grows. Free space is tracked with packed
//! boundary tags and segregated free lists; placement uses a bounded
//! best-of-k fit with eager coalescing, and 16 byte free blocks get a
//! footerless "mini" representation so tiny allocations waste nothing.
//!
//! The crate exposes one type, [`Segalloc`]. It reserves its address
//! space lazily and returns it to the OS when dropped:
//!
//! ```rust
//! use segalloc::Segalloc;
//!
//! let mut allocator = Segalloc::new();
//!
//! let address = allocator.allocate(128).unwrap();
//! // Payloads are always 16 aligned.
//! assert_eq!(address.as_ptr() as usize % 16, 0);
//!
//! unsafe {
//!     address.as_ptr().write_bytes(42, 128);
//!     allocator.release(Some(address));
//! }
//! ```
//!
//! The allocator is deliberately single threaded: every operation takes
//! `&mut self` and there is no internal locking. Wrap it yourself if you
//! need sharing.

use std::ptr::NonNull;

mod allocator;
mod block;
mod check;
mod heap;
mod platform;
mod seglist;
mod tag;

/// Non-null pointer to `T`. Used instead of `*mut T` wherever null is
/// meaningful so the compiler forces the `None` case to be handled.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::Segalloc;
