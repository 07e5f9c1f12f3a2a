use std::ptr::NonNull;

use crate::{
    platform,
    tag::{round_up, ALIGNMENT},
    Pointer,
};

/// The single contiguous heap region. The full address span is reserved
/// once at construction and the usable part grows monotonically from the
/// low end, sbrk style: an extension bumps the break, commits any pages
/// the break just crossed into, and hands back the address where the new
/// bytes begin. Nothing is ever returned to the OS until the whole
/// region is dropped.
///
/// ```text
///  base                    base + brk              base + capacity
///   |                          |                          |
///   v                          v                          v
///   +--------------------------+--------------------------+
///   |         in use           |    reserved, unused      |
///   +--------------------------+--------------------------+
///   ^                        ^
///   |                        |
///   lo()                     hi() (last in-use byte)
/// ```
pub(crate) struct Heap {
    /// Low end of the reserved span. Page aligned, so also 16 aligned.
    base: NonNull<u8>,
    /// Bytes currently in use. The "break".
    brk: usize,
    /// Bytes committed so far, a page multiple, always >= `brk`.
    committed: usize,
    /// Total bytes reserved. The heap can never grow past this.
    capacity: usize,
}

impl Heap {
    /// Reserves a span of `capacity` bytes (rounded up to a whole number
    /// of pages). Returns `None` if the kernel refuses the reservation.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = round_up(capacity, platform::page_size());
        let base = unsafe { platform::reserve_memory(capacity) }?;

        Some(Self {
            base,
            brk: 0,
            committed: 0,
            capacity,
        })
    }

    /// Appends `bytes` to the heap and returns the address of the first
    /// new byte, or `None` if the region is exhausted. `bytes` must be a
    /// multiple of [`ALIGNMENT`], which keeps the break 16 aligned at
    /// all times.
    pub unsafe fn extend(&mut self, bytes: usize) -> Pointer<u8> {
        debug_assert!(bytes % ALIGNMENT == 0);

        let new_brk = self.brk.checked_add(bytes)?;
        if new_brk > self.capacity {
            return None;
        }

        if new_brk > self.committed {
            let grow = round_up(new_brk - self.committed, platform::page_size());
            let at = NonNull::new_unchecked(self.base.as_ptr().add(self.committed));
            if !platform::commit_memory(at, grow) {
                return None;
            }
            self.committed += grow;
        }

        let address = NonNull::new_unchecked(self.base.as_ptr().add(self.brk));
        self.brk = new_brk;

        Some(address)
    }

    /// Lowest byte of the heap.
    #[inline]
    pub fn lo(&self) -> NonNull<u8> {
        self.base
    }

    /// Highest in-use byte of the heap (inclusive). Meaningless until
    /// the first extension.
    #[inline]
    pub fn hi(&self) -> NonNull<u8> {
        debug_assert!(self.brk > 0);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk - 1)) }
    }

    /// Bytes currently in use.
    #[inline]
    pub fn size(&self) -> usize {
        self.brk
    }

    /// Whether `addr` falls inside the in-use part of the heap.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let lo = self.base.as_ptr() as usize;
        addr >= lo && addr < lo + self.brk
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe { platform::release_memory(self.base, self.capacity) };
    }
}
