//! Heap consistency sweep. Debug builds run this on every public entry
//! and exit point through `debug_assert!`, so a corrupted invariant is
//! caught at the API boundary closest to the bug instead of whenever the
//! damage happens to bite. The sweep is O(heap) and compiles away
//! entirely in release builds.

use std::ptr::NonNull;

use crate::{
    allocator::Segalloc,
    block::Block,
    heap::Heap,
    seglist::{SegList, NUM_SEGS},
    tag::{ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE},
};

/// Reports one violation with the line tag of the API call that
/// triggered the sweep, then fails the sweep.
fn fail(line: u32, what: &str) -> bool {
    eprintln!("heap check failed (called from line {line}): {what}");
    false
}

/// First real block, one word past the prologue.
fn first_block(heap: &Heap) -> Block {
    unsafe { Block(NonNull::new_unchecked(heap.lo().as_ptr().add(WORD_SIZE).cast())) }
}

/// Address of the epilogue word, the last word of the heap.
fn epilogue_addr(heap: &Heap) -> usize {
    heap.hi().as_ptr() as usize - (WORD_SIZE - 1)
}

impl Segalloc {
    /// Verifies every structural invariant of the heap and the free
    /// lists. Returns `false` (after reporting on stderr) on the first
    /// violation found. `line` tags the report with the call site.
    pub fn check_heap(&self, line: u32) -> bool {
        let Some(heap) = &self.heap else {
            return fail(line, "heap is not initialized");
        };

        let lo = heap.lo().as_ptr() as usize;
        let epilogue = epilogue_addr(heap);

        unsafe {
            // Sentinels: size 0, allocated, at the exact ends.
            let prologue = Block(heap.lo().cast());
            if prologue.size() != 0 || !prologue.is_alloc() {
                return fail(line, "prologue is malformed");
            }
            if lo % ALIGNMENT != 0 {
                return fail(line, "prologue is misaligned");
            }

            let epilogue_block = Block(NonNull::new_unchecked(
                heap.hi().as_ptr().sub(WORD_SIZE - 1).cast(),
            ));
            if epilogue_block.size() != 0 || !epilogue_block.is_alloc() {
                return fail(line, "epilogue is malformed");
            }
            if epilogue % ALIGNMENT != WORD_SIZE {
                return fail(line, "epilogue is misaligned");
            }

            let Some(free_on_heap) = self.sweep_heap(line, heap, epilogue) else {
                return false;
            };

            let Some(free_on_lists) = self.sweep_lists(line, heap, epilogue) else {
                return false;
            };

            // Every free block must be reachable both ways.
            if free_on_heap != free_on_lists {
                return fail(line, "heap walk and free lists disagree on free block count");
            }
        }

        true
    }

    /// Physical walk from the first block to the epilogue. Returns the
    /// number of free blocks, or `None` after reporting a violation.
    unsafe fn sweep_heap(&self, line: u32, heap: &Heap, epilogue: usize) -> Option<usize> {
        let mut free_count = 0;

        // The prologue behaves as an allocated non-mini block.
        let mut prev_was_alloc = true;
        let mut prev_was_mini = false;

        let mut block = first_block(heap);
        while block.addr() != epilogue {
            if block.addr() % ALIGNMENT != WORD_SIZE {
                fail(line, "block header is misaligned");
                return None;
            }

            let size = block.size();
            if size % ALIGNMENT != 0 || size < MIN_BLOCK_SIZE {
                fail(line, "block size is not a positive multiple of the alignment");
                return None;
            }

            // The packed neighbor bits must describe the block we just
            // came from.
            if block.prev_alloc() != prev_was_alloc {
                fail(line, "prev_alloc bit does not match the preceding block");
                return None;
            }
            if block.prev_mini() != prev_was_mini {
                fail(line, "prev_mini bit does not match the preceding block");
                return None;
            }

            // Validate the step before dereferencing the next header.
            let next = block.next();
            if next.addr() > epilogue {
                fail(line, "heap walk ran past the epilogue");
                return None;
            }

            if !block.is_alloc() {
                free_count += 1;

                if !prev_was_alloc || !next.is_alloc() {
                    fail(line, "two adjacent free blocks escaped coalescing");
                    return None;
                }

                if !block.is_mini() {
                    if block.header() != block.footer_word() {
                        fail(line, "free block header and footer disagree");
                        return None;
                    }
                    if !self.check_links(line, heap, block) {
                        return None;
                    }
                }
            }

            prev_was_alloc = block.is_alloc();
            prev_was_mini = block.is_mini();
            block = next;
        }

        Some(free_count)
    }

    /// Free-list pointer sanity for one non-mini free block.
    unsafe fn check_links(&self, line: u32, heap: &Heap, block: Block) -> bool {
        if let Some(next) = block.next_free() {
            if !heap.contains(next.addr()) {
                return fail(line, "free-list next pointer leaves the heap");
            }
            if next.prev_free() != Some(block) {
                return fail(line, "free-list next/prev pointers are inconsistent");
            }
        }

        if let Some(prev) = block.prev_free() {
            if !heap.contains(prev.addr()) {
                return fail(line, "free-list prev pointer leaves the heap");
            }
        }

        true
    }

    /// Bucket-by-bucket walk of the segregated lists. Returns the total
    /// number of listed blocks, or `None` after reporting a violation.
    /// Empty buckets are skipped before any dereference.
    unsafe fn sweep_lists(&self, line: u32, heap: &Heap, epilogue: usize) -> Option<usize> {
        // A corrupted list could cycle; no well-formed heap can hold
        // more blocks than this.
        let max_blocks = heap.size() / MIN_BLOCK_SIZE + 1;

        let mut listed = 0;

        for bucket in 0..NUM_SEGS {
            let mut steps = 0;
            let mut current = self.seg.head(bucket);

            while let Some(block) = current {
                if !heap.contains(block.addr()) || block.addr() >= epilogue {
                    fail(line, "listed block lies outside the heap");
                    return None;
                }
                if block.is_alloc() {
                    fail(line, "allocated block found in a free list");
                    return None;
                }
                if SegList::index_for(block.size()) != bucket {
                    fail(line, "free block is filed in the wrong bucket");
                    return None;
                }
                if bucket == 0 && !block.is_mini() {
                    fail(line, "non-mini block in the mini bucket");
                    return None;
                }

                listed += 1;
                steps += 1;
                if steps > max_blocks {
                    fail(line, "free list appears to be cyclic");
                    return None;
                }

                current = block.next_free();
            }
        }

        Some(listed)
    }
}
