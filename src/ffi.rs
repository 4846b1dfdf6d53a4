//! C entry points, built with the `c_api` feature.
//!
//! The `cdylib` then replaces the C allocator of any program it is preloaded
//! into:
//!
//! ```text
//! LD_PRELOAD=target/release/libmapalloc.so ls
//! ALLOCATOR_ALGORITHM=best_fit LD_PRELOAD=target/release/libmapalloc.so ls
//! ```
//!
//! Fresh blocks from `malloc` are filled with [`SCRIBBLE_BYTE`]
//! so that code reading memory it never wrote is easier to spot.

use std::{
    ffi::c_void,
    ptr::{self, NonNull},
};

use log::Level;

use crate::{
    MapAlloc,
    config::{Config, SCRIBBLE_BYTE},
    trace::event,
};

static ALLOCATOR: MapAlloc = MapAlloc::with_config(Config::new().with_scribble(SCRIBBLE_BYTE));

fn raw(ptr: Option<NonNull<u8>>) -> *mut c_void {
    ptr.map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    raw(ALLOCATOR.allocate(size).ok())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    raw(ALLOCATOR.zero_allocate(nmemb, size).ok())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    raw(unsafe { ALLOCATOR.resize(ptr.cast(), size) }.ok().flatten())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { ALLOCATOR.deallocate(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        Some(ptr) => unsafe { ALLOCATOR.usable_size(ptr) },
        None => 0,
    }
}

/// Dumps every region and block to stdout.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn print_memory() {
    if let Err(err) = unsafe { ALLOCATOR.print_memory() } {
        event!(Level::Warn, "print_memory failed: {err}");
    }
}
