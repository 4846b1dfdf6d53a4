use std::{marker::PhantomData, ptr::NonNull};

use crate::{
    block::{Block, Link},
    error::LedgerError,
    kernel::Mapping,
    ledger::{self, Ledger},
};

/// A region is one mapping obtained from the kernel. It has no header of its
/// own: its first block (the owner) carries the mapping size in
/// [`Block::region_capacity`], and every block of the region points back to
/// the owner through [`Block::region`].
///
/// ```text
/// +-----------------------------------------------------------+
/// | +-------------+    +-------------+    +-------------+     |
/// | | Owner Block | -> |    Block    | -> |    Block    | ... |
/// | +-------------+    +-------------+    +-------------+     |
/// +-----------------------------------------------------------+
/// <--------------------- region_capacity --------------------->
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    owner: NonNull<Block>,
}

impl Region {
    /// Region containing `block`.
    ///
    /// **SAFETY**: `block` must be a valid header inside a mapped region.
    pub unsafe fn of(block: NonNull<Block>) -> Self {
        Self {
            owner: unsafe { block.as_ref().region },
        }
    }

    #[inline]
    pub fn owner(&self) -> NonNull<Block> {
        self.owner
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.owner.as_ptr() as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.owner.as_ref().region_capacity }
    }

    pub fn mapping(&self) -> Mapping {
        Mapping {
            base: self.owner.cast(),
            len: self.capacity(),
        }
    }

    /// Blocks of this region, in ledger order, starting with the owner.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            current: Some(self.owner),
            owner: self.owner,
            marker: PhantomData,
        }
    }

    /// A region is free once none of its blocks is in use. At that point it
    /// can be handed back to the kernel.
    pub fn is_free(&self) -> bool {
        self.blocks().all(|block| unsafe { block.as_ref().is_free() })
    }
}

pub(crate) struct Blocks<'a> {
    current: Link<Block>,
    owner: NonNull<Block>,
    marker: PhantomData<&'a Region>,
}

impl Iterator for Blocks<'_> {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        unsafe {
            if block.as_ref().region != self.owner {
                self.current = None;
                return None;
            }
            self.current = block.as_ref().next;
        }

        Some(block)
    }
}

/// Walks the ledger region by region.
pub(crate) struct Regions<'a> {
    blocks: ledger::Iter<'a>,
}

impl Iterator for Regions<'_> {
    type Item = Region;

    fn next(&mut self) -> Option<Self::Item> {
        self.blocks
            .find(|block| unsafe { block.as_ref().is_region_owner() })
            .map(|owner| Region { owner })
    }
}

pub(crate) fn regions(ledger: &Ledger) -> Regions<'_> {
    Regions {
        blocks: ledger.iter(),
    }
}

/// Totals over every mapped region.
///
/// `used_bytes + spare_bytes == mapped_bytes` holds whenever the ledger is
/// consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Regions currently mapped.
    pub regions: usize,
    /// Blocks in the ledger, free or not.
    pub blocks: usize,
    /// Blocks currently in use.
    pub live_blocks: usize,
    /// Sum of the size of every mapped region.
    pub mapped_bytes: usize,
    /// Bytes claimed by live blocks, headers included.
    pub used_bytes: usize,
    /// Bytes of every block not claimed by its owner.
    pub spare_bytes: usize,
    /// Regions mapped since the allocator was created.
    pub maps: u64,
    /// Regions unmapped since the allocator was created.
    pub unmaps: u64,
}

impl Usage {
    pub(crate) fn of(ledger: &Ledger) -> Self {
        let mut usage = Self {
            blocks: ledger.len(),
            ..Self::default()
        };

        for region in regions(ledger) {
            usage.regions += 1;
            usage.mapped_bytes += region.capacity();
        }

        for block in ledger {
            let block = unsafe { block.as_ref() };
            usage.live_blocks += usize::from(!block.is_free());
            usage.used_bytes += block.used;
            usage.spare_bytes += block.spare();
        }

        usage
    }
}

/// Checks every structural invariant of the ledger in one pass:
/// - `used <= capacity` on every block.
/// - The blocks of a region are listed together, right after their owner.
/// - Each block starts where the previous one of its region ends.
/// - The blocks of a region span exactly the whole mapping.
pub(crate) fn verify(ledger: &Ledger) -> Result<(), LedgerError> {
    // (owner, bytes spanned so far, address where the next block must start)
    let mut current: Option<(NonNull<Block>, usize, usize)> = None;

    for block in ledger {
        let header = unsafe { block.as_ref() };
        let addr = block.as_ptr() as usize;

        if header.used > header.capacity {
            return Err(LedgerError::Overcommitted {
                block: addr,
                used: header.used,
                capacity: header.capacity,
            });
        }

        if header.is_region_owner() {
            if let Some((owner, spanned, _)) = current.take() {
                check_span(owner, spanned)?;
            }
            current = Some((block, 0, addr));
        }

        let scattered = LedgerError::Scattered {
            block: addr,
            region: header.region.as_ptr() as usize,
        };
        let Some((owner, spanned, expected)) = current.as_mut() else {
            return Err(scattered);
        };
        if header.region != *owner {
            return Err(scattered);
        }
        if addr != *expected {
            return Err(LedgerError::Discontiguous { block: addr });
        }

        *spanned += header.capacity;
        *expected += header.capacity;
    }

    match current {
        Some((owner, spanned, _)) => check_span(owner, spanned),
        None => Ok(()),
    }
}

fn check_span(owner: NonNull<Block>, spanned: usize) -> Result<(), LedgerError> {
    let mapped = unsafe { owner.as_ref().region_capacity };
    if spanned == mapped {
        Ok(())
    } else {
        Err(LedgerError::RegionSizeMismatch {
            region: owner.as_ptr() as usize,
            blocks: spanned,
            mapped,
        })
    }
}
