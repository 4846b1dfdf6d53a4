use std::{
    io,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{error::MappingFailure, utils::checked_align};

/// Virtual memory page size of the computer. This is usually 4096.
/// This value should be a constant, but we can't do that since we
/// don't know the value at compile time, so it is cached on first use.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// A chunk of memory handed out by the kernel. The base is always page
/// aligned and `len` is always a whole number of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub base: NonNull<u8>,
    pub len: usize,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this, has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or the OS error if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size() -> usize;
}

/// Zero-sized handle the platform implementations hang off.
struct Kernel;

/// Wrapper to calculate the computer's page size.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = Kernel::page_size();
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Maps a fresh, private, read-write region able to hold at least `min_bytes`.
/// The request is rounded up to the next multiple of [`page_size`].
pub(crate) fn acquire(min_bytes: usize) -> Result<Mapping, MappingFailure> {
    let len = checked_align(min_bytes.max(1), page_size())
        .ok_or(MappingFailure::Oversized { requested: min_bytes })?;

    let base = unsafe { Kernel::request_memory(len) }
        .map_err(|source| MappingFailure::Map { len, source })?;

    Ok(Mapping { base, len })
}

/// Returns `mapping` to the kernel.
///
/// **SAFETY**: nothing may touch the address range once this returns, whatever
/// the result. A failed unmap still leaves the caller unable to trust the range.
pub(crate) unsafe fn release(mapping: Mapping) -> Result<(), MappingFailure> {
    unsafe { Kernel::return_memory(mapping.base, mapping.len) }.map_err(|source| {
        MappingFailure::Unmap {
            addr: mapping.base.as_ptr() as usize,
            len: mapping.len,
            source,
        }
    })
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        io,
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => Err(io::Error::last_os_error()),
                    addr => NonNull::new(addr.cast::<u8>())
                        .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory)),
                }
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, len: usize) -> io::Result<()> {
            match unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{io, mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast()).ok_or_else(io::Error::last_os_error)
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize) -> io::Result<()> {
            unsafe {
                Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE)
                    .map_err(|_| io::Error::last_os_error())
            }
        }

        fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
