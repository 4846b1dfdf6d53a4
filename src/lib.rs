//! A general purpose allocator that takes every byte it hands out straight from
//! the kernel with `mmap` (`VirtualAlloc` on windows).
//!
//! Memory is organized in regions (one per mapping) split into blocks. Every
//! block starts with a header that precedes the memory given to the user:
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | Header | Payload ...   | Header | Payload ...  | Header | (free)   |
//! +-------------------------------------------------------------------+
//!  <------- block -------> <------- block ------> <----- block ----->
//!  <----------------------------- region ---------------------------->
//! ```
//!
//! All the headers of all the regions form a single linked list, the ledger.
//! To serve a request we look for a block with enough spare capacity (using the
//! configured [`Placement`]) and either reuse it or carve a new block out of
//! its tail. When nothing fits, a new region is mapped. Freeing a block only
//! marks it as free, unless it was the last block in use of its region: then the
//! whole region goes back to the kernel.
//!
//! A single lock guards the ledger, so [`MapAlloc`] can be shared between threads
//! and used as the `#[global_allocator]`:
//!
//! ```no_run
//! use mapalloc::MapAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: MapAlloc = MapAlloc::new();
//!
//! fn main() {
//!     let v = vec![1, 2, 3];
//!     println!("{v:?}");
//! }
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    io,
    ptr::{self, NonNull},
};

use log::Level;
use spin::mutex::SpinMutex;

mod block;
mod config;
mod diagnostics;
mod engine;
mod error;
mod kernel;
mod ledger;
mod placement;
mod region;
mod trace;
mod utils;

#[cfg(all(feature = "c_api", unix))]
pub mod ffi;

pub use crate::{
    block::MIN_ALIGN,
    config::{Config, PLACEMENT_VAR, PlacementSource, SCRIBBLE_BYTE},
    diagnostics::{BlockInfo, Blocks},
    error::{AllocError, LedgerError, MappingFailure},
    kernel::page_size,
    placement::Placement,
    region::Usage,
};

use crate::{
    engine::{Engine, Freed, Grant, Resized},
    trace::event,
    utils::align,
};

/// The allocator. See the crate documentation for how it works.
///
/// Every operation takes the same lock around the ledger. Logging always
/// happens after the lock has been released.
pub struct MapAlloc {
    engine: SpinMutex<Engine>,
    config: Config,
}

impl MapAlloc {
    /// Allocator reading its placement policy from `ALLOCATOR_ALGORITHM`.
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            engine: SpinMutex::new(Engine::new()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a pointer to at least `size` writable bytes, aligned to
    /// [`MIN_ALIGN`]. `size` may be zero, the pointer is still unique.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let placement = self.config.placement();
        let result = self.engine.lock().allocate(size, placement);

        handed_out("allocate", size, placement, result, self.config.scribble)
    }

    /// Like [`MapAlloc::allocate`] for `count` elements of `elem_size` bytes,
    /// with every byte set to zero. Fails with [`AllocError::InvalidSize`]
    /// if the total size overflows.
    pub fn zero_allocate(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(size) = count.checked_mul(elem_size) else {
            let err = AllocError::InvalidSize { count, elem_size };
            event!(Level::Warn, "zero_allocate({count}, {elem_size}) failed: {err}");
            return Err(err);
        };

        let placement = self.config.placement();
        let result = self
            .engine
            .lock()
            .allocate(size, placement)
            .map_err(|err| match err {
                AllocError::InvalidSize { .. } => AllocError::InvalidSize { count, elem_size },
                err => err,
            });

        handed_out("zero_allocate", size, placement, result, Some(0))
    }

    /// Gives the block at `ptr` back. Null pointers are ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer returned by this allocator that has not
    /// been freed yet. Nothing checks this: a bad pointer corrupts the ledger.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let freed = unsafe { self.engine.lock().deallocate(ptr) };
        report_freed(ptr, &freed);
    }

    /// Changes the size of the block at `ptr` to `new_size` bytes, moving it
    /// (and its contents) if it does not span that much.
    ///
    /// A null `ptr` allocates, a zero `new_size` frees and returns `None`. On
    /// failure the original block is left untouched.
    ///
    /// # Safety
    /// Same contract as [`MapAlloc::deallocate`]. When the block moves the old
    /// pointer is freed.
    pub unsafe fn resize(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.allocate(new_size).map(Some);
        };

        if new_size == 0 {
            unsafe { self.deallocate(ptr.as_ptr()) };
            return Ok(None);
        }

        // The moving path allocates, copies and frees without releasing the
        // lock in between, through the engine rather than our own entry points.
        let placement = self.config.placement();
        let result = unsafe { self.engine.lock().resize(ptr, new_size, placement) };

        match result {
            Ok(Resized::InPlace(grant)) => {
                event!(Level::Trace, "resize({ptr:p}, {new_size}) in place");
                Ok(Some(grant.ptr))
            }
            Ok(Resized::Moved { grant, freed }) => {
                event!(
                    Level::Trace,
                    "resize({ptr:p}, {new_size}) -> {:p} id={} [{placement}]",
                    grant.ptr,
                    grant.alloc_id
                );
                report_freed(ptr, &freed);
                Ok(Some(grant.ptr))
            }
            Err(err) => {
                event!(Level::Warn, "resize({ptr:p}, {new_size}) failed: {err}");
                Err(err)
            }
        }
    }

    /// Bytes that can be written at `ptr`: the request rounded up to
    /// [`MIN_ALIGN`].
    ///
    /// # Safety
    /// `ptr` must be a live pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { self.engine.lock().usable_size(ptr) }
    }

    /// Totals over the ledger. Never allocates.
    pub fn usage(&self) -> Usage {
        self.engine.lock().usage()
    }

    /// Walks the whole ledger checking its invariants, see [`LedgerError`].
    pub fn verify(&self) -> Result<Usage, LedgerError> {
        self.engine.lock().verify()
    }

    /// Snapshots of every block, in ledger order.
    ///
    /// # Safety
    /// Reads the ledger without taking the lock: no other thread may use
    /// this allocator while the iterator is alive.
    pub unsafe fn blocks(&self) -> Blocks<'_> {
        let engine = unsafe { &*self.engine.as_mut_ptr() };
        diagnostics::blocks(engine.ledger())
    }

    /// Writes every region and block to `out`, one line each.
    ///
    /// # Safety
    /// Same as [`MapAlloc::blocks`]. If `out` allocates through this allocator
    /// it must not be called from another thread meanwhile either.
    pub unsafe fn write_memory(&self, out: &mut impl io::Write) -> io::Result<()> {
        let engine = unsafe { &*self.engine.as_mut_ptr() };
        diagnostics::write_memory(engine.ledger(), out)
    }

    /// [`MapAlloc::write_memory`] to stdout.
    ///
    /// # Safety
    /// Same as [`MapAlloc::write_memory`].
    pub unsafe fn print_memory(&self) -> io::Result<()> {
        unsafe { self.write_memory(&mut io::stdout().lock()) }
    }

    /// Serves requests aligned past [`MIN_ALIGN`]. We ask for `align` extra
    /// bytes, move the pointer forward to the next boundary and stash the
    /// original pointer in the word right before it:
    ///
    /// ```text
    /// origin                    aligned
    /// |                         |
    /// v                         v
    /// +-------------+---------+-----------------------+
    /// |   padding   | origin  |     size bytes        |
    /// +-------------+---------+-----------------------+
    /// ```
    fn allocate_aligned(&self, layout: Layout, zeroed: bool) -> *mut u8 {
        let Some(padded) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };

        let origin = match zeroed {
            true => self.zero_allocate(1, padded),
            false => self.allocate(padded),
        };
        let Ok(origin) = origin else {
            return ptr::null_mut();
        };

        let addr = origin.as_ptr() as usize;
        let offset = align(addr + 1, layout.align()) - addr;

        unsafe {
            let aligned = origin.as_ptr().add(offset);
            aligned.cast::<*mut u8>().sub(1).write(origin.as_ptr());
            aligned
        }
    }
}

/// Fills and reports a block that is about to be handed to the user.
fn handed_out(
    op: &str,
    size: usize,
    placement: Placement,
    result: Result<Grant, AllocError>,
    fill: Option<u8>,
) -> Result<NonNull<u8>, AllocError> {
    match result {
        Ok(grant) => {
            if let Some(byte) = fill {
                // The block is ours alone now, no need for the lock.
                unsafe { grant.ptr.as_ptr().write_bytes(byte, grant.len) };
            }
            if grant.mapped {
                event!(Level::Debug, "mapped a new region for {op}({size})");
            }
            event!(
                Level::Trace,
                "{op}({size}) -> {:p} id={} [{placement}]",
                grant.ptr,
                grant.alloc_id
            );
            Ok(grant.ptr)
        }
        Err(err) => {
            event!(Level::Warn, "{op}({size}) failed: {err}");
            Err(err)
        }
    }
}

/// Recovers the pointer stashed by [`MapAlloc::allocate_aligned`].
unsafe fn aligned_origin(ptr: *mut u8) -> *mut u8 {
    unsafe { ptr.cast::<*mut u8>().sub(1).read() }
}

fn report_freed(ptr: NonNull<u8>, freed: &Freed) {
    match freed {
        Freed::Retained { alloc_id } => {
            event!(Level::Trace, "deallocate({ptr:p}) id={alloc_id}");
        }
        Freed::Released {
            alloc_id,
            mapping,
            unmapped,
        } => {
            event!(Level::Trace, "deallocate({ptr:p}) id={alloc_id}, region is empty");
            match unmapped {
                Ok(()) => event!(
                    Level::Debug,
                    "unmapped region {:p} ({} bytes)",
                    mapping.base,
                    mapping.len
                ),
                Err(err) => event!(Level::Warn, "{err}, region dropped from the ledger anyway"),
            }
        }
    }
}

impl Default for MapAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MapAlloc {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.engine.get_mut().release_all() } {
            event!(Level::Warn, "releasing regions on drop: {err}");
        }
    }
}

unsafe impl GlobalAlloc for MapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return self.allocate_aligned(layout, false);
        }

        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return self.allocate_aligned(layout, true);
        }

        self.zero_allocate(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            if layout.align() > MIN_ALIGN {
                self.deallocate(aligned_origin(ptr));
            } else {
                self.deallocate(ptr);
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return match unsafe { self.resize(ptr, new_size) } {
                Ok(Some(ptr)) => ptr.as_ptr(),
                _ => ptr::null_mut(),
            };
        }

        // The payload of an over-aligned block does not start at its header,
        // so it always moves.
        unsafe {
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new_ptr = self.alloc(new_layout);
            if !new_ptr.is_null() {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            new_ptr
        }
    }
}
