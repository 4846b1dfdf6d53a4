use std::io;

use thiserror::Error;

/// The operating system refused to hand out (or take back) a memory mapping.
#[derive(Debug, Error)]
pub enum MappingFailure {
    #[error("mapping {len} bytes failed: {source}")]
    Map { len: usize, source: io::Error },

    #[error("unmapping {len} bytes at {addr:#x} failed: {source}")]
    Unmap {
        addr: usize,
        len: usize,
        source: io::Error,
    },

    /// Rounding the request up to whole pages would overflow `usize`.
    #[error("{requested} bytes cannot be rounded up to a whole number of pages")]
    Oversized { requested: usize },
}

/// Failure of one of the allocation entry points.
#[derive(Debug, Error)]
pub enum AllocError {
    /// No existing block could hold the request and a new region could not be mapped.
    #[error("out of memory")]
    OutOfMemory(#[from] MappingFailure),

    /// `count * elem_size` (plus bookkeeping) does not fit in the address space.
    #[error("allocation of {count} x {elem_size} bytes overflows the address space")]
    InvalidSize { count: usize, elem_size: usize },
}

/// A broken ledger invariant, reported by [`crate::MapAlloc::verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("block at {block:#x} uses {used} bytes but only spans {capacity}")]
    Overcommitted {
        block: usize,
        used: usize,
        capacity: usize,
    },

    #[error("blocks of region {region:#x} span {blocks} bytes but the region maps {mapped}")]
    RegionSizeMismatch {
        region: usize,
        blocks: usize,
        mapped: usize,
    },

    #[error("block at {block:#x} does not follow the previous block of its region")]
    Discontiguous { block: usize },

    #[error("block at {block:#x} belongs to region {region:#x} but is not listed with it")]
    Scattered { block: usize, region: usize },
}
