//! Black-box checks of the public API contract.

use segalloc::Segalloc;

const CAPACITY: usize = 4 << 20;

#[test]
fn zero_sized_allocation_is_refused() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);
    assert!(allocator.allocate(0).is_none());
}

#[test]
fn releasing_null_is_a_no_op() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);
    unsafe { allocator.release(None) };

    // Still fully functional afterwards.
    assert!(allocator.allocate(1).is_some());
    assert!(allocator.check_heap(line!()));
}

#[test]
fn payloads_are_16_aligned() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);

    for size in [1, 2, 7, 8, 15, 16, 17, 100, 1000, 4096, 10_000] {
        let address = allocator.allocate(size).unwrap();
        assert_eq!(address.as_ptr() as usize % 16, 0, "size {size}");
    }

    assert!(allocator.check_heap(line!()));
}

#[test]
fn init_is_idempotent() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);
    assert!(allocator.init());
    assert!(allocator.init());
    assert!(allocator.check_heap(line!()));
}

#[test]
fn reallocate_of_null_allocates() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);

    let address = unsafe { allocator.reallocate(None, 64) };
    assert!(address.is_some());
    assert!(allocator.check_heap(line!()));
}

#[test]
fn reallocate_to_zero_releases() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);

    let address = allocator.allocate(64);
    assert!(unsafe { allocator.reallocate(address, 0) }.is_none());
    assert!(allocator.check_heap(line!()));
}

#[test]
fn reallocate_preserves_prefix() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);

    unsafe {
        let address = allocator.allocate(100).unwrap();
        for i in 0..100 {
            address.as_ptr().add(i).write(i as u8);
        }

        let same = allocator.reallocate(Some(address), 100).unwrap();
        for i in 0..100 {
            assert_eq!(same.as_ptr().add(i).read(), i as u8);
        }
    }

    assert!(allocator.check_heap(line!()));
}

#[test]
fn callocate_returns_zeroed_memory() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);

    // Dirty some memory first so fresh zero pages can't mask a missing
    // memset.
    let scratch = allocator.allocate(512).unwrap();
    unsafe {
        scratch.as_ptr().write_bytes(0xAB, 512);
        allocator.release(Some(scratch));
    }

    let address = allocator.callocate(64, 8).unwrap();
    for i in 0..512 {
        assert_eq!(unsafe { address.as_ptr().add(i).read() }, 0, "byte {i}");
    }

    assert!(allocator.check_heap(line!()));
}

#[test]
fn callocate_overflow_returns_null() {
    let mut allocator = Segalloc::with_capacity(CAPACITY);

    assert!(allocator.callocate(usize::MAX, 2).is_none());
    assert!(allocator.callocate(usize::MAX / 2 + 1, 4).is_none());
}

#[test]
fn oom_surfaces_as_null() {
    let mut allocator = Segalloc::with_capacity(64 << 10);

    assert!(allocator.allocate(1 << 20).is_none());

    // An out of memory failure must not corrupt anything.
    assert!(allocator.allocate(128).is_some());
    assert!(allocator.check_heap(line!()));
}
