//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.


/// It aligns `to_be_aligned` up to the next multiple of `aligment`, which must be
/// a power of two.
///
/// This method is used to align region sizes to be a multiple of [`crate::kernel::page_size`]
/// and block sizes to be a multiple of the block header alignment, so that every header we
/// write inside a region lands on a properly aligned address.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when the
/// result does not fit in a `usize`.
pub fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|size| size & !(aligment - 1))
}
