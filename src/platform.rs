use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific virtual memory handling. The heap
/// needs one contiguous span of address space reserved up front, pages
/// made usable as the break advances, and the whole span given back when
/// the allocator is dropped. How that maps to syscalls is the only thing
/// that differs per OS.
trait PlatformSpecificMemory {
    /// Reserves `length` bytes of contiguous address space. The pages
    /// may not be usable yet, see [`Self::commit_memory`].
    unsafe fn reserve_memory(length: usize) -> Pointer<u8>;

    /// Makes `length` bytes starting at `address` readable and
    /// writable. Both arguments are page aligned.
    unsafe fn commit_memory(address: NonNull<u8>, length: usize) -> bool;

    /// Returns the entire reserved span to the kernel.
    unsafe fn release_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be
/// a constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll mutate a global variable and reuse it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper for [`PlatformSpecificMemory::reserve_memory`].
#[inline]
pub(crate) unsafe fn reserve_memory(length: usize) -> Pointer<u8> {
    Platform::reserve_memory(length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::commit_memory`].
#[inline]
pub(crate) unsafe fn commit_memory(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit_memory(address, length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::release_memory`].
#[inline]
pub(crate) unsafe fn release_memory(address: NonNull<u8>, length: usize) {
    Platform::release_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve_memory(length: usize) -> Pointer<u8> {
            // Read-Write, private, not backed by any file. MAP_NORESERVE
            // keeps the kernel from charging swap for the whole span; the
            // pages materialize lazily as the heap actually grows into
            // them.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn commit_memory(_address: NonNull<u8>, _length: usize) -> bool {
            // The whole span is already mapped read-write.
            true
        }

        unsafe fn release_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? Memory region is
                // still valid here, it wasn't unmapped.
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve_memory(length: usize) -> Pointer<u8> {
            // Unlike mmap, reservation and commit are separate steps
            // here; committing happens page-wise as the heap grows. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(
                None,
                length,
                Memory::MEM_RESERVE,
                Memory::PAGE_NOACCESS,
            );

            NonNull::new(address.cast())
        }

        unsafe fn commit_memory(address: NonNull<u8>, length: usize) -> bool {
            let committed = Memory::VirtualAlloc(
                Some(address.as_ptr() as *const _),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            !committed.is_null()
        }

        unsafe fn release_memory(address: NonNull<u8>, _length: usize) {
            // Length must be 0 with MEM_RELEASE, the whole reservation
            // goes away at once. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;

            if !Memory::VirtualFree(address, length, Memory::MEM_RELEASE).as_bool() {
                // TODO: Release failed, don't know what to do here yet.
                // Same problem as munmap on Linux.
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap`
    //! because there's no FFI support, so instead we'll use the global
    //! allocator to mock low level memory management. This also lets
    //! Miri catch leaks of the heap span itself.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn commit_memory(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn release_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
