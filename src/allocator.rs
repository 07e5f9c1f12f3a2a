use std::ptr::{self, NonNull};

use crate::{
    block::Block,
    heap::Heap,
    seglist::{SegList, NUM_SEGS},
    tag::{self, round_up, Word, ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE},
};

/// Granularity of heap extensions. Whenever the free lists come up empty
/// the heap grows by at least this much, so small allocations don't pay
/// for an extension each.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// Find-fit candidate budget: the search settles for the best of this
/// many fitting blocks instead of scanning a whole bucket.
const FIT_PROBES: usize = 5;

/// Address space reserved by [`Segalloc::new`]. Reservation is lazy on
/// every supported platform, so unused capacity costs nothing.
pub(crate) const DEFAULT_CAPACITY: usize = 1 << 28;

/// Segregated-fit allocator over a single growable heap region. This is
/// where the circle gets completed: [`crate::tag`] packs block state
/// into boundary words, [`crate::block`] walks the physical block
/// sequence those words describe, [`crate::seglist`] indexes the free
/// blocks by size class, and this module drives all three to service
/// allocations:
///
/// ```text
///            +-- heap.lo()                              heap.hi() --+
///            v                                                      v
///            +----------+-------+-------+------+- ... -+----------+----------+
///            | prologue | block | block | free |  ...  |   free   | epilogue |
///            +----------+-------+-------+--|---+- ... -+----|-----+----------+
///                                          |                |
///                        seg lists:        |                |
///                        heads[2] ---------+                |
///                        heads[8] --------------------------+
/// ```
///
/// Placement policy: a bounded first-fit scan per bucket, keeping the
/// smallest of up to five fitting candidates. Oversized winners are
/// split; freed blocks coalesce eagerly with both physical neighbors, so
/// two adjacent free blocks never exist once an API call returns.
///
/// The allocator is single threaded by design. It needs `&mut self` for
/// every operation and owns its heap region exclusively; payload
/// pointers it hands out stay valid until the allocator is dropped.
pub struct Segalloc {
    /// The heap region, created lazily on first use.
    pub(crate) heap: Option<Heap>,
    /// Free lists, one bucket per size class.
    pub(crate) seg: SegList,
    /// Address space to reserve when the heap gets created.
    capacity: usize,
}

impl Segalloc {
    /// Builds an allocator with the default capacity. No memory is
    /// reserved until [`Self::init`] or the first allocation.
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Builds an allocator whose heap can grow up to `capacity` bytes
    /// (rounded up to whole pages).
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: None,
            seg: SegList::new(),
            capacity,
        }
    }

    /// Creates the heap region, writes the prologue and epilogue
    /// sentinels and seeds the free lists with one chunk-sized block.
    /// Returns `false` if the underlying reservation or the initial
    /// extension fails. Calling this on an initialized allocator is a
    /// no-op; it also runs implicitly on the first allocation.
    pub fn init(&mut self) -> bool {
        if self.heap.is_some() {
            return true;
        }

        let Some(mut heap) = Heap::new(self.capacity) else {
            return false;
        };

        unsafe {
            let Some(start) = heap.extend(2 * WORD_SIZE) else {
                return false;
            };

            // Prologue word, then the initial epilogue. Both read as
            // allocated size-0 blocks, so traversal and coalescing never
            // step outside the real blocks between them. The epilogue
            // records that its predecessor (the prologue) is allocated.
            let start = start.cast::<Word>().as_ptr();
            start.write(tag::pack(0, true, false, false));
            start.add(1).write(tag::pack(0, true, true, false));

            self.heap = Some(heap);
            self.seg = SegList::new();

            let Some(block) = self.extend_heap(CHUNK_SIZE) else {
                self.heap = None;
                return false;
            };
            self.seg.insert(block);
        }

        debug_assert!(self.check_heap(line!()));

        true
    }

    /// Allocates `size` bytes and returns the payload address, 16
    /// aligned, or `None` when `size` is 0 or the heap is exhausted.
    ///
    /// The returned memory is uninitialized and stays valid until it is
    /// released or the allocator is dropped.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(self.heap.is_none() || self.check_heap(line!()));

        if size == 0 {
            return None;
        }

        if self.heap.is_none() && !self.init() {
            return None;
        }

        let asize = Self::adjusted_size(size)?;

        unsafe {
            let block = match self.find_fit(asize) {
                Some(block) => {
                    self.seg.remove(block);
                    block
                }
                None => self.extend_heap(asize.max(CHUNK_SIZE))?,
            };

            debug_assert!(!block.is_alloc());

            // Mark the whole block allocated, tell the successor, then
            // give back whatever tail the request doesn't need.
            block.write(block.size(), true);
            block.next().set_prev_alloc(true);
            self.split(block, asize);

            debug_assert!(self.check_heap(line!()));

            Some(block.payload())
        }
    }

    /// Releases an allocation. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and must not have
    /// been released already.
    pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(address) = ptr else { return };

        debug_assert!(self.check_heap(line!()));

        let block = Block::from_payload(address);
        debug_assert!(block.is_alloc());

        block.write(block.size(), false);
        let block = self.coalesce(block);
        self.seg.insert(block);

        debug_assert!(self.check_heap(line!()));
    }

    /// Resizes an allocation by moving it: allocate, copy the smaller of
    /// the two payload sizes, release the original. `reallocate(None,
    /// size)` behaves like [`Self::allocate`]; `reallocate(ptr, 0)`
    /// behaves like [`Self::release`] and returns `None`. If the new
    /// allocation fails the original block is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::release`] for `ptr`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(address) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            self.release(Some(address));
            return None;
        }

        let block = Block::from_payload(address);
        let new_address = self.allocate(size)?;

        let count = size.min(block.payload_size());
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);

        self.release(Some(address));

        Some(new_address)
    }

    /// Allocates an array of `count` elements of `elem_size` bytes each
    /// and zero-fills it. Returns `None` when the total size overflows
    /// or the allocation fails, without touching the heap.
    pub fn callocate(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(elem_size)?;

        let address = self.allocate(total)?;
        unsafe { address.as_ptr().write_bytes(0, total) };

        Some(address)
    }

    /// Block size needed to serve a request of `size` payload bytes: one
    /// header word on top, rounded up to the alignment unit, never below
    /// the minimum block size. `None` when the arithmetic overflows,
    /// which no real request gets anywhere near.
    fn adjusted_size(size: usize) -> Option<usize> {
        let padded = size.checked_add(WORD_SIZE)?.checked_add(ALIGNMENT - 1)?;
        Some((padded / ALIGNMENT * ALIGNMENT).max(MIN_BLOCK_SIZE))
    }

    /// Bounded best-fit search. Starting at the bucket matching `asize`,
    /// walk each free list with a budget of [`FIT_PROBES`] fitting
    /// candidates and keep the smallest one seen; the first bucket that
    /// yields any candidate decides. Whole-bucket first fit would be
    /// cheaper per probe but splits sloppily; the best-of-k tie-break
    /// buys most of best-fit's utilization at a bounded cost.
    unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        let mut probes = FIT_PROBES;
        let mut best: Option<Block> = None;
        let mut best_size = 0;

        for bucket in SegList::index_for(asize)..NUM_SEGS {
            for block in self.seg.iter_bucket(bucket) {
                if probes == 0 {
                    break;
                }

                let size = block.size();
                if size >= asize {
                    if best.is_none() || size < best_size {
                        best = Some(block);
                        best_size = size;
                    }
                    probes -= 1;
                }
            }

            if best.is_some() {
                return best;
            }
        }

        None
    }

    /// Carves the unused tail off a freshly allocated block. `block` has
    /// just been written allocated with its full size; if at least a
    /// minimum block is left over past `asize`, shrink the allocation
    /// and turn the remainder into a new free block.
    unsafe fn split(&mut self, block: Block, asize: usize) {
        debug_assert!(block.is_alloc());

        let size = block.size();
        if size - asize < MIN_BLOCK_SIZE {
            return;
        }

        block.write(asize, true);

        let tail = block.next();
        tail.write_with_prev(size - asize, false, true, asize == MIN_BLOCK_SIZE);
        self.seg.insert(tail);

        // The block after the tail now follows a free block again.
        let successor = tail.next();
        successor.set_prev_alloc(false);
        successor.set_prev_mini(tail.is_mini());
    }

    /// Merges `block`, which must already be written free, with
    /// whichever physical neighbors are also free. Merged neighbors are
    /// unlinked from their buckets; the resulting block is returned
    /// without being inserted anywhere, that's the caller's call.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let next = block.next();
        let prev_alloc = block.prev_alloc();
        let next_alloc = next.is_alloc();

        let mut merged = block;
        let mut size = block.size();

        if prev_alloc && !next_alloc {
            self.seg.remove(next);
            size += next.size();
            merged.write(size, false);
        } else if !prev_alloc && next_alloc {
            let prev = block.prev();
            self.seg.remove(prev);
            size += prev.size();
            merged = prev;
            merged.write(size, false);
        } else if !prev_alloc && !next_alloc {
            let prev = block.prev();
            self.seg.remove(prev);
            self.seg.remove(next);
            size += prev.size() + next.size();
            merged = prev;
            merged.write(size, false);
        }

        // Whatever happened above, the block following the merged result
        // must describe it: preceded by a free block, mini or not.
        let successor = merged.next();
        successor.set_prev_alloc(false);
        successor.set_prev_mini(merged.is_mini());

        merged
    }

    /// Grows the heap by at least `bytes` and returns the resulting free
    /// block, already coalesced with a free block at the old high end if
    /// there was one. The caller decides whether to insert it into the
    /// free lists or use it directly.
    unsafe fn extend_heap(&mut self, bytes: usize) -> Option<Block> {
        let size = round_up(bytes, ALIGNMENT);
        let payload = self.heap.as_mut()?.extend(size)?;

        // The new block's header lands exactly on the word that used to
        // be the epilogue, inheriting its prev_alloc/prev_mini bits.
        let block = Block::from_payload(payload);
        block.write(size, false);

        // Fresh epilogue at the new high end; coalescing below fixes up
        // its predecessor bits.
        block.next().set_header(tag::pack(0, true, false, false));

        Some(self.coalesce(block))
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Segalloc {
    /// First real block, right after the prologue word.
    pub(crate) fn first_block(&self) -> Block {
        let heap = self.heap.as_ref().unwrap();
        Block(NonNull::new(unsafe { heap.lo().as_ptr().add(WORD_SIZE).cast() }).unwrap())
    }

    /// Number of free blocks seen by a physical heap walk.
    pub(crate) fn free_blocks_on_heap(&self) -> usize {
        let heap = self.heap.as_ref().unwrap();
        let epilogue = heap.hi().as_ptr() as usize - (WORD_SIZE - 1);

        let mut count = 0;
        let mut block = self.first_block();
        unsafe {
            while block.addr() != epilogue {
                if !block.is_alloc() {
                    count += 1;
                }
                block = block.next();
            }
        }

        count
    }

    /// Sizes of the free blocks in physical order.
    pub(crate) fn free_sizes_on_heap(&self) -> Vec<usize> {
        let heap = self.heap.as_ref().unwrap();
        let epilogue = heap.hi().as_ptr() as usize - (WORD_SIZE - 1);

        let mut sizes = Vec::new();
        let mut block = self.first_block();
        unsafe {
            while block.addr() != epilogue {
                if !block.is_alloc() {
                    sizes.push(block.size());
                }
                block = block.next();
            }
        }

        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CAPACITY: usize = 1 << 20;

    fn allocator() -> Segalloc {
        let mut allocator = Segalloc::with_capacity(TEST_CAPACITY);
        assert!(allocator.init());
        allocator
    }

    #[test]
    fn one_byte_allocation_gets_minimum_block() {
        let mut allocator = allocator();

        let address = allocator.allocate(1).unwrap();
        assert_eq!(address.as_ptr() as usize % ALIGNMENT, 0);

        unsafe {
            let block = Block::from_payload(address);
            assert_eq!(block.size(), MIN_BLOCK_SIZE);
            assert!(block.is_alloc());
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn initial_chunk_splits_on_allocation() {
        let mut allocator = allocator();

        let address = allocator.allocate(32).unwrap();

        unsafe {
            // 32 payload bytes + 8 header, rounded to 16: a 48 byte block
            // at the low end of the initial chunk.
            let block = Block::from_payload(address);
            assert_eq!(block.size(), 48);
            assert_eq!(block.addr(), allocator.first_block().addr());
        }

        // The rest of the initial chunk is one free block.
        assert_eq!(allocator.free_sizes_on_heap(), vec![CHUNK_SIZE - 48]);
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn release_coalesces_forward() {
        let mut allocator = allocator();

        let a = allocator.allocate(64);
        let b = allocator.allocate(64);
        let c = allocator.allocate(64);
        assert!(a.is_some() && b.is_some() && c.is_some());

        unsafe {
            allocator.release(b);
            assert_eq!(allocator.free_blocks_on_heap(), 2);

            // Releasing c merges b's block, c's block and the tail of
            // the initial chunk into a single free block after a.
            allocator.release(c);
            assert_eq!(allocator.free_blocks_on_heap(), 1);
            assert_eq!(allocator.free_sizes_on_heap(), vec![CHUNK_SIZE - 80]);
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn release_coalesces_both_sides() {
        let mut allocator = allocator();

        let a = allocator.allocate(64);
        let b = allocator.allocate(64);
        let c = allocator.allocate(64);
        assert!(a.is_some() && b.is_some() && c.is_some());

        unsafe {
            allocator.release(a);
            // c merges with the tail of the chunk as it is released, a
            // stays alone at the low end.
            allocator.release(c);
            assert_eq!(allocator.free_blocks_on_heap(), 2);

            // b sits between two free blocks; releasing it fuses the
            // whole chunk back together.
            allocator.release(b);
            assert_eq!(allocator.free_blocks_on_heap(), 1);
            assert_eq!(allocator.free_sizes_on_heap(), vec![CHUNK_SIZE]);
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn mini_blocks_use_the_mini_bucket() {
        let mut allocator = allocator();

        let a = allocator.allocate(1);
        let b = allocator.allocate(1);
        let c = allocator.allocate(1);
        let d = allocator.allocate(1);
        assert!(a.is_some() && b.is_some() && c.is_some() && d.is_some());

        unsafe {
            // a and c have allocated neighbors, so both park in the mini
            // bucket without coalescing.
            allocator.release(a);
            allocator.release(c);
            assert_eq!(allocator.seg.iter_bucket(0).count(), 2);
            assert!(allocator.check_heap(line!()));

            // Releasing b bridges them: one 48 byte block, mini bucket
            // empty again.
            allocator.release(b);
            assert_eq!(allocator.seg.iter_bucket(0).count(), 0);
            assert!(allocator.free_sizes_on_heap().contains(&48));
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn find_fit_prefers_tighter_candidates() {
        let mut allocator = allocator();

        // Lay out [96][16][64][16][tail], then free the 96 and 64
        // blocks. Both land in the 64..128 bucket, looser fit at the
        // head.
        let loose = allocator.allocate(88);
        let _gap1 = allocator.allocate(1);
        let tight = allocator.allocate(56);
        let _gap2 = allocator.allocate(1);

        let tight_addr = tight.unwrap().as_ptr() as usize;

        unsafe {
            allocator.release(tight);
            allocator.release(loose);
        }

        // A first-fit scan would settle for the 96 byte head block; the
        // best-of-k tie-break picks the exact 64 byte fit instead.
        let reused = allocator.allocate(56).unwrap();
        assert_eq!(reused.as_ptr() as usize, tight_addr);

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn allocation_extends_heap_when_lists_are_empty() {
        let mut allocator = allocator();

        let heap_size_before = allocator.heap.as_ref().unwrap().size();

        // Larger than the initial chunk, so no fit exists.
        let address = allocator.allocate(8000).unwrap();

        unsafe {
            let block = Block::from_payload(address);
            assert_eq!(block.size(), Segalloc::adjusted_size(8000).unwrap());
        }

        assert!(allocator.heap.as_ref().unwrap().size() > heap_size_before);
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn exhausted_heap_returns_none() {
        let mut allocator = Segalloc::with_capacity(1 << 16);
        assert!(allocator.init());

        assert!(allocator.allocate(1 << 20).is_none());

        // Failure leaves the allocator usable.
        assert!(allocator.check_heap(line!()));
        assert!(allocator.allocate(64).is_some());
    }

    #[test]
    fn zero_size_requests() {
        let mut allocator = allocator();

        assert!(allocator.allocate(0).is_none());
        unsafe { allocator.release(None) };
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn implicit_initialization() {
        let mut allocator = Segalloc::with_capacity(TEST_CAPACITY);
        assert!(allocator.heap.is_none());

        let address = allocator.allocate(16);
        assert!(address.is_some());
        assert!(allocator.heap.is_some());
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn reallocate_moves_contents() {
        let mut allocator = allocator();

        unsafe {
            let address = allocator.allocate(64).unwrap();
            for i in 0..64 {
                address.as_ptr().add(i).write(i as u8);
            }

            let grown = allocator.reallocate(Some(address), 256).unwrap();
            for i in 0..64 {
                assert_eq!(grown.as_ptr().add(i).read(), i as u8);
            }

            let shrunk = allocator.reallocate(Some(grown), 16).unwrap();
            for i in 0..16 {
                assert_eq!(shrunk.as_ptr().add(i).read(), i as u8);
            }

            allocator.release(Some(shrunk));
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn reallocate_boundary_semantics() {
        let mut allocator = allocator();

        unsafe {
            // Null pointer acts like allocate.
            let address = allocator.reallocate(None, 32);
            assert!(address.is_some());

            // Size 0 acts like release.
            let free_before = allocator.free_blocks_on_heap();
            assert!(allocator.reallocate(address, 0).is_none());
            assert!(allocator.free_blocks_on_heap() <= free_before + 1);
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn reallocate_failure_keeps_original() {
        let mut allocator = Segalloc::with_capacity(1 << 16);
        assert!(allocator.init());

        unsafe {
            let address = allocator.allocate(64).unwrap();
            address.as_ptr().write_bytes(0x5A, 64);

            // Impossible growth: the original must survive unharmed.
            assert!(allocator.reallocate(Some(address), 1 << 20).is_none());

            let block = Block::from_payload(address);
            assert!(block.is_alloc());
            for i in 0..64 {
                assert_eq!(address.as_ptr().add(i).read(), 0x5A);
            }
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn callocate_zero_fills() {
        let mut allocator = allocator();

        let address = allocator.callocate(16, 8).unwrap();
        unsafe {
            // Dirty the memory through a release/callocate cycle to make
            // sure the zeroing isn't an accident of fresh pages.
            address.as_ptr().write_bytes(0xFF, 128);
            allocator.release(Some(address));

            let address = allocator.callocate(16, 8).unwrap();
            for i in 0..128 {
                assert_eq!(address.as_ptr().add(i).read(), 0);
            }
        }

        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn callocate_overflow_is_rejected_without_heap_mutation() {
        let mut allocator = allocator();

        let free_before = allocator.free_sizes_on_heap();
        assert!(allocator.callocate(usize::MAX, 2).is_none());
        assert_eq!(allocator.free_sizes_on_heap(), free_before);

        assert!(allocator.callocate(0, 8).is_none());
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn payloads_never_alias() {
        let mut allocator = allocator();

        let sizes = [1, 8, 16, 24, 64, 200, 512, 4096];
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for (i, &size) in sizes.iter().enumerate() {
            let address = allocator.allocate(size).unwrap();
            let fill = (i + 1) as u8;
            unsafe { address.as_ptr().write_bytes(fill, size) };
            live.push((address, size, fill));
        }

        // Every payload still holds its own fill pattern.
        for (address, size, fill) in &live {
            for i in 0..*size {
                assert_eq!(unsafe { address.as_ptr().add(i).read() }, *fill);
            }
        }

        unsafe {
            for (address, _, _) in live {
                allocator.release(Some(address));
            }
        }

        // Everything coalesced back into single free blocks per
        // extension area.
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn alloc_release_churn() {
        let mut allocator = allocator();

        // Miri is really slow, but we don't need as many operations to
        // find bugs with it.
        let rounds = if cfg!(miri) { 8 } else { 200 };

        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        for round in 0..rounds {
            let size = (round * 37) % 600 + 1;
            let address = allocator.allocate(size).unwrap();
            unsafe { address.as_ptr().write_bytes(round as u8, size) };
            live.push((address, size));

            // Release every other allocation to keep churn going.
            if round % 2 == 1 {
                let (address, _) = live.swap_remove(round / 2 % live.len());
                unsafe { allocator.release(Some(address)) };
            }
        }

        unsafe {
            for (address, _) in live {
                allocator.release(Some(address));
            }
        }

        assert!(allocator.check_heap(line!()));
        assert_eq!(allocator.seg.len(), allocator.free_blocks_on_heap());
    }

    #[test]
    fn adjusted_sizes() {
        assert_eq!(Segalloc::adjusted_size(1), Some(MIN_BLOCK_SIZE));
        assert_eq!(Segalloc::adjusted_size(8), Some(16));
        assert_eq!(Segalloc::adjusted_size(9), Some(32));
        assert_eq!(Segalloc::adjusted_size(32), Some(48));
        assert_eq!(Segalloc::adjusted_size(usize::MAX), None);
    }
}
