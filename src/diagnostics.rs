//! Human readable dump of the ledger.
//!
//! The dump lists every region followed by its blocks:
//!
//! ```text
//! -- Current Memory State --
//! [REGION] 0x7f2b4c000000-0x7f2b4c001000 4096
//! [BLOCK]  0x7f2b4c000000-0x7f2b4c0000a0 (0) 160 160 112
//! [BLOCK]  0x7f2b4c0000a0-0x7f2b4c001000 (1) 3936 0 0
//! ```
//!
//! Block columns are: address range, `(alloc_id)`, capacity, used bytes
//! (header included) and payload bytes in use.
//!
//! Nothing here takes the allocator lock, the caller must make sure no other
//! thread is allocating while a dump is being written.

use std::{io, ptr::NonNull};

use crate::{
    block::Block,
    ledger::{self, Ledger},
    region::{self, Region},
};

/// Copy of a block header, detached from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the header.
    pub addr: usize,
    pub alloc_id: u64,
    /// Bytes spanned by the block, header included.
    pub capacity: usize,
    /// Bytes claimed by the user, header included. Zero on free blocks.
    pub used: usize,
    /// Bytes of payload the user asked for (rounded up to the header alignment).
    pub payload: usize,
    /// Address of the first block of the region.
    pub region: usize,
    /// Size of the region mapping, only on the first block of each region.
    pub region_capacity: Option<usize>,
}

impl BlockInfo {
    pub(crate) fn of(block: NonNull<Block>) -> Self {
        let header = unsafe { block.as_ref() };

        Self {
            addr: block.as_ptr() as usize,
            alloc_id: header.alloc_id,
            capacity: header.capacity,
            used: header.used,
            payload: header.payload_len(),
            region: header.region.as_ptr() as usize,
            region_capacity: header
                .is_region_owner()
                .then_some(header.region_capacity),
        }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.addr + self.capacity
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.used == 0
    }
}

/// Iterator over [`BlockInfo`] snapshots of every block, in ledger order.
pub struct Blocks<'a> {
    inner: ledger::Iter<'a>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(BlockInfo::of)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub(crate) fn blocks(ledger: &Ledger) -> Blocks<'_> {
    Blocks {
        inner: ledger.iter(),
    }
}

/// Writes the dump of `ledger` to `out`.
pub(crate) fn write_memory(ledger: &Ledger, out: &mut impl io::Write) -> io::Result<()> {
    writeln!(out, "-- Current Memory State --")?;

    for region in region::regions(ledger) {
        write_region(region, out)?;
    }

    Ok(())
}

fn write_region(region: Region, out: &mut impl io::Write) -> io::Result<()> {
    writeln!(
        out,
        "[REGION] {:#x}-{:#x} {}",
        region.base(),
        region.base() + region.capacity(),
        region.capacity()
    )?;

    for block in region.blocks() {
        let block = BlockInfo::of(block);
        writeln!(
            out,
            "[BLOCK]  {:#x}-{:#x} ({}) {} {} {}",
            block.addr,
            block.end(),
            block.alloc_id,
            block.capacity,
            block.used,
            block.payload
        )?;
    }

    Ok(())
}
