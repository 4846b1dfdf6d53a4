use std::ptr::{self, NonNull};

use crate::{
    block::{Block, real_size},
    error::{AllocError, LedgerError, MappingFailure},
    kernel::{self, Mapping},
    ledger::Ledger,
    placement::Placement,
    region::{self, Region, Usage},
};

/// The internal data structure of the allocator: the ledger of every block
/// plus the counters that go with it. Nothing in here is synchronized, the
/// caller ([`crate::MapAlloc`]) keeps it behind its lock.
pub(crate) struct Engine {
    ledger: Ledger,
    /// Next `alloc_id` to hand out.
    next_id: u64,
    maps: u64,
    unmaps: u64,
}

// The raw pointers in the ledger only point into regions this engine owns.
unsafe impl Send for Engine {}

/// A block just handed to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grant {
    pub ptr: NonNull<u8>,
    /// Usable bytes at `ptr` (the request rounded up to the header alignment).
    pub len: usize,
    pub alloc_id: u64,
    /// Whether a new region had to be mapped to serve it.
    pub mapped: bool,
}

/// What happened to the region of a block after freeing it.
#[derive(Debug)]
pub(crate) enum Freed {
    /// Some other block of the region is still in use.
    Retained { alloc_id: u64 },
    /// The whole region was free and has been dropped from the ledger.
    /// `unmapped` carries the result of giving it back to the kernel.
    Released {
        alloc_id: u64,
        mapping: Mapping,
        unmapped: Result<(), MappingFailure>,
    },
}

#[derive(Debug)]
pub(crate) enum Resized {
    /// The block already spans the new size, the pointer does not change.
    InPlace(Grant),
    /// Contents were copied to `grant` and the old block was freed.
    Moved { grant: Grant, freed: Freed },
}

impl Engine {
    pub const fn new() -> Self {
        Self {
            ledger: Ledger::new(),
            next_id: 0,
            maps: 0,
            unmaps: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Finds room for `size` bytes, reusing spare capacity when `placement`
    /// finds a block for it and mapping a new region otherwise.
    pub fn allocate(&mut self, size: usize, placement: Placement) -> Result<Grant, AllocError> {
        let required = real_size(size)?;

        let candidate = placement.select(
            self.ledger
                .iter()
                .map(|block| (block, unsafe { block.as_ref().spare() })),
            required,
        );

        let (block, mapped) = match candidate {
            None => (self.map_region(required)?, true),
            Some(block) if unsafe { block.as_ref().is_free() } => {
                (unsafe { self.claim(block, required) }, false)
            }
            Some(block) => (unsafe { self.split(block, required) }, false),
        };

        let header = unsafe { block.as_ref() };
        Ok(Grant {
            ptr: Block::payload(block),
            len: header.payload_len(),
            alloc_id: header.alloc_id,
            mapped,
        })
    }

    /// Maps a region for `required` bytes and records it as a single block
    /// at the end of the ledger.
    fn map_region(&mut self, required: usize) -> Result<NonNull<Block>, MappingFailure> {
        let mapping = kernel::acquire(required)?;
        self.maps += 1;

        let header = mapping.base.cast::<Block>();
        let block = unsafe {
            Block::write(
                mapping.base,
                Block {
                    alloc_id: self.next_id(),
                    capacity: mapping.len,
                    used: required,
                    region: header,
                    region_capacity: mapping.len,
                    next: None,
                },
            )
        };

        unsafe { self.ledger.push_region(block) };

        Ok(block)
    }

    /// Takes over a free block. Whatever the request does not use stays as the
    /// block's spare capacity, ready for a later split.
    ///
    /// **SAFETY**: `block` must be a free block of the ledger with at least
    /// `required` bytes of capacity.
    unsafe fn claim(&mut self, mut block: NonNull<Block>, required: usize) -> NonNull<Block> {
        let alloc_id = self.next_id();
        let header = unsafe { block.as_mut() };
        header.alloc_id = alloc_id;
        header.used = required;
        block
    }

    /// Carves a new block out of the spare capacity of `donor`:
    ///
    /// ```text
    /// Before:
    /// +-----------------+---------------------------------+
    /// | Donor (used)    | Spare                           |
    /// +-----------------+---------------------------------+
    ///
    /// After:
    /// +-----------------+---------------------+-----------+
    /// | Donor           | New (required)      | Spare     |
    /// +-----------------+---------------------+-----------+
    /// ```
    ///
    /// The donor keeps its id and its contents, and its capacity shrinks to what
    /// it uses. The new block inherits the donor's region and all of its spare.
    ///
    /// **SAFETY**: `donor` must be a block of the ledger in use, with at least
    /// `required` spare bytes.
    unsafe fn split(&mut self, mut donor: NonNull<Block>, required: usize) -> NonNull<Block> {
        let alloc_id = self.next_id();

        unsafe {
            let header = donor.as_mut();
            let addr = donor.cast::<u8>().add(header.used);

            let block = Block::write(
                addr,
                Block {
                    alloc_id,
                    capacity: header.spare(),
                    used: required,
                    region: header.region,
                    region_capacity: 0,
                    next: None,
                },
            );
            header.capacity = header.used;
            self.ledger.insert_after(donor, block);

            block
        }
    }

    /// Marks the block of `ptr` as free. If that leaves its whole region unused
    /// the region is dropped from the ledger and unmapped.
    ///
    /// The block is dropped from the ledger even if unmapping fails, the
    /// returned [`Freed::Released`] carries that failure so it can be reported.
    ///
    /// **SAFETY**: `ptr` must come from [`Engine::allocate`] on this engine and
    /// must not have been freed already.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Freed {
        let mut block = unsafe { Block::from_payload(ptr) };

        let alloc_id = unsafe {
            let header = block.as_mut();
            header.used = 0;
            header.alloc_id
        };

        let region = unsafe { Region::of(block) };
        if !region.is_free() {
            return Freed::Retained { alloc_id };
        }

        let mapping = region.mapping();
        unsafe {
            self.ledger.unlink_region(region.owner());
        }
        self.unmaps += 1;

        Freed::Released {
            alloc_id,
            mapping,
            unmapped: unsafe { kernel::release(mapping) },
        }
    }

    /// Gives the block of `ptr` room for `new_size` bytes. When the block does
    /// not span that much, the contents move to a new block and the old one
    /// is freed, all without releasing the engine.
    ///
    /// **SAFETY**: same contract as [`Engine::deallocate`].
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        placement: Placement,
    ) -> Result<Resized, AllocError> {
        let required = real_size(new_size)?;
        let mut block = unsafe { Block::from_payload(ptr) };

        let header = unsafe { block.as_mut() };
        if header.capacity >= required {
            // Shrinking leaves the tail as spare capacity of this same block.
            header.used = required;
            return Ok(Resized::InPlace(Grant {
                ptr,
                len: header.payload_len(),
                alloc_id: header.alloc_id,
                mapped: false,
            }));
        }

        let old_len = header.payload_len();
        let grant = self.allocate(new_size, placement)?;

        unsafe {
            ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                grant.ptr.as_ptr(),
                old_len.min(new_size),
            );
        }

        let freed = unsafe { self.deallocate(ptr) };
        Ok(Resized::Moved { grant, freed })
    }

    /// Bytes that can be written at `ptr`. Only the claimed part of the block
    /// counts, its spare tail may be split off for another request.
    ///
    /// **SAFETY**: same contract as [`Engine::deallocate`].
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { Block::from_payload(ptr).as_ref().payload_len() }
    }

    pub fn usage(&self) -> Usage {
        Usage {
            maps: self.maps,
            unmaps: self.unmaps,
            ..Usage::of(&self.ledger)
        }
    }

    pub fn verify(&self) -> Result<Usage, LedgerError> {
        region::verify(&self.ledger)?;
        Ok(self.usage())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Unmaps every region, whatever is still in use inside them.
    ///
    /// **SAFETY**: no pointer handed out by this engine may be used afterwards.
    pub unsafe fn release_all(&mut self) -> Result<(), MappingFailure> {
        let mut result = Ok(());

        while let Some(owner) = self.ledger.first() {
            let mapping = unsafe { Region::of(owner) }.mapping();
            unsafe {
                self.ledger.unlink_region(owner);
            }
            self.unmaps += 1;

            if let Err(err) = unsafe { kernel::release(mapping) } {
                result = Err(err);
            }
        }

        self.ledger.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{BLOCK_HEADER_SIZE, MIN_ALIGN},
        kernel::page_size,
    };

    const FIRST: Placement = Placement::FirstFit;

    /// `(alloc_id, capacity, used)` of every block, in ledger order.
    fn blocks(engine: &Engine) -> Vec<(u64, usize, usize)> {
        engine
            .ledger()
            .iter()
            .map(|b| unsafe { b.as_ref() })
            .map(|b| (b.alloc_id, b.capacity, b.used))
            .collect()
    }

    struct Scoped(Engine);

    impl Drop for Scoped {
        fn drop(&mut self) {
            unsafe { self.0.release_all() }.unwrap();
        }
    }

    fn engine() -> Scoped {
        Scoped(Engine::new())
    }

    #[test]
    fn first_allocation_maps_a_region() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let grant = engine.allocate(100, FIRST).unwrap();

        assert!(grant.mapped);
        assert_eq!(0, grant.alloc_id);
        assert_eq!(112, grant.len);
        assert_eq!(0, grant.ptr.as_ptr() as usize % 16);
        assert_eq!(
            vec![(0, page_size(), real_size(100).unwrap())],
            blocks(engine)
        );
        assert_eq!(1, engine.usage().maps);
    }

    #[test]
    fn second_allocation_splits_the_first_block() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let a = engine.allocate(100, FIRST).unwrap();
        let b = engine.allocate(50, FIRST).unwrap();
        let (used_a, used_b) = (real_size(100).unwrap(), real_size(50).unwrap());

        assert!(!b.mapped);
        assert!(a.alloc_id < b.alloc_id);
        assert_eq!(a.ptr.as_ptr() as usize + used_a, b.ptr.as_ptr() as usize);
        assert_eq!(
            vec![(0, used_a, used_a), (1, page_size() - used_a, used_b)],
            blocks(engine)
        );

        let usage = engine.verify().unwrap();
        assert_eq!(1, usage.regions);
        assert_eq!(page_size(), usage.mapped_bytes);
    }

    #[test]
    fn freeing_the_only_block_unmaps_the_region() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let grant = engine.allocate(64, FIRST).unwrap();
        let freed = unsafe { engine.deallocate(grant.ptr) };

        assert!(matches!(
            freed,
            Freed::Released { alloc_id: 0, unmapped: Ok(()), .. }
        ));
        assert!(engine.ledger().is_empty());

        let again = engine.allocate(64, FIRST).unwrap();
        assert!(again.mapped);
        assert_eq!(1, again.alloc_id);

        let usage = engine.usage();
        assert_eq!((2, 1), (usage.maps, usage.unmaps));
    }

    #[test]
    fn freed_block_stays_until_its_region_is_empty() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let a = engine.allocate(100, FIRST).unwrap();
        let b = engine.allocate(100, FIRST).unwrap();

        let freed = unsafe { engine.deallocate(a.ptr) };
        assert!(matches!(freed, Freed::Retained { alloc_id: 0 }));
        assert_eq!(2, engine.ledger().len());
        assert_eq!(0, engine.usage().unmaps);

        let freed = unsafe { engine.deallocate(b.ptr) };
        assert!(matches!(freed, Freed::Released { alloc_id: 1, .. }));
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn free_block_is_reused_with_a_new_id() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let a = engine.allocate(100, FIRST).unwrap();
        let _b = engine.allocate(100, FIRST).unwrap();
        unsafe { engine.deallocate(a.ptr) };

        // An exact fit for the hole left by `a`.
        let c = engine.allocate(100, FIRST).unwrap();
        assert_eq!(a.ptr, c.ptr);
        assert_eq!(2, c.alloc_id);

        // Smaller requests claim the free block and keep the rest as spare.
        unsafe { engine.deallocate(c.ptr) };
        let d = engine.allocate(10, FIRST).unwrap();
        assert_eq!(a.ptr, d.ptr);
        assert_eq!(
            (real_size(100).unwrap(), real_size(10).unwrap()),
            blocks(engine).first().map(|b| (b.1, b.2)).unwrap()
        );

        // That spare is split off for the next small request.
        let e = engine.allocate(10, FIRST).unwrap();
        assert_eq!(d.ptr.as_ptr() as usize + real_size(10).unwrap(), e.ptr.as_ptr() as usize);
        engine.verify().unwrap();
    }

    /// Leaves three free blocks with spare capacities large, small and medium
    /// (in ledger order), each pinned by a live neighbour, and nothing else with
    /// spare capacity in the region.
    fn three_holes(engine: &mut Engine) -> [NonNull<u8>; 3] {
        let holes = [1024, 256, 512].map(|size| {
            let hole = engine.allocate(size, FIRST).unwrap();
            engine.allocate(16, FIRST).unwrap();
            hole.ptr
        });

        let last = engine.ledger().last().unwrap();
        let rest = unsafe { last.as_ref().spare() };
        engine.allocate(rest - BLOCK_HEADER_SIZE, FIRST).unwrap();
        assert_eq!(0, engine.usage().spare_bytes);

        for hole in holes {
            unsafe { engine.deallocate(hole) };
        }
        holes
    }

    #[test]
    fn placement_policies_pick_different_holes() {
        for (placement, expected) in [
            (Placement::FirstFit, 0),
            (Placement::BestFit, 1),
            (Placement::WorstFit, 0),
        ] {
            let mut engine = engine();
            let engine = &mut engine.0;
            let holes = three_holes(engine);

            let grant = engine.allocate(200, placement).unwrap();
            assert_eq!(holes[expected], grant.ptr, "{placement}");
            assert!(!grant.mapped);
            engine.verify().unwrap();
        }
    }

    #[test]
    fn requests_larger_than_a_page_get_their_own_region() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let small = engine.allocate(10, FIRST).unwrap();
        let large = engine.allocate(3 * page_size(), FIRST).unwrap();

        assert!(large.mapped);
        assert_eq!(2, engine.usage().regions);
        assert_eq!(5 * page_size(), engine.usage().mapped_bytes);

        unsafe {
            large.ptr.as_ptr().write_bytes(0xCD, 3 * page_size());
            engine.deallocate(large.ptr);
        }
        assert_eq!(1, engine.usage().regions);

        unsafe { engine.deallocate(small.ptr) };
        assert_eq!(0, engine.usage().regions);
    }

    #[test]
    fn resize_in_place_keeps_the_pointer() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let grant = engine.allocate(1000, FIRST).unwrap();
        let resized = unsafe { engine.resize(grant.ptr, 10, FIRST) }.unwrap();

        let Resized::InPlace(shrunk) = resized else {
            panic!("shrinking should not move the block");
        };
        assert_eq!(grant.ptr, shrunk.ptr);
        assert_eq!(grant.alloc_id, shrunk.alloc_id);

        // Growing back within the same capacity does not move either.
        let resized = unsafe { engine.resize(grant.ptr, 1000, FIRST) }.unwrap();
        assert!(matches!(resized, Resized::InPlace(g) if g.ptr == grant.ptr));
        engine.verify().unwrap();
    }

    #[test]
    fn resize_past_capacity_moves_the_contents() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let grant = engine.allocate(10, FIRST).unwrap();
        let _pin = engine.allocate(10, FIRST).unwrap();
        unsafe {
            for i in 0..10 {
                grant.ptr.as_ptr().add(i).write(i as u8);
            }
        }

        let resized = unsafe { engine.resize(grant.ptr, 1000, FIRST) }.unwrap();
        let Resized::Moved { grant: moved, freed } = resized else {
            panic!("growing past the capacity should move the block");
        };

        assert_ne!(grant.ptr, moved.ptr);
        assert!(matches!(freed, Freed::Retained { .. }));
        let copied = unsafe { std::slice::from_raw_parts(moved.ptr.as_ptr(), 10) };
        assert_eq!(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], copied);
        engine.verify().unwrap();
    }

    #[test]
    fn usable_size_stops_at_the_claimed_bytes() {
        let mut engine = engine();
        let engine = &mut engine.0;

        let grant = engine.allocate(1, FIRST).unwrap();
        let usable = unsafe { engine.usable_size(grant.ptr) };
        assert_eq!(MIN_ALIGN, usable);
        assert_eq!(grant.len, usable);

        // The spare tail goes to the next request, right after the usable bytes.
        let next = engine.allocate(50, FIRST).unwrap();
        assert_eq!(
            grant.ptr.as_ptr() as usize + usable + BLOCK_HEADER_SIZE,
            next.ptr.as_ptr() as usize
        );

        unsafe { grant.ptr.as_ptr().write_bytes(0xFF, usable) };
        engine.verify().unwrap();
        assert_eq!(usable, unsafe { engine.usable_size(grant.ptr) });
    }

    #[test]
    fn oversized_requests_fail_without_touching_the_ledger() {
        let mut engine = engine();
        let engine = &mut engine.0;

        assert!(matches!(
            engine.allocate(usize::MAX - 8, FIRST),
            Err(AllocError::InvalidSize { .. })
        ));
        assert!(matches!(
            engine.allocate(usize::MAX - 4 * BLOCK_HEADER_SIZE, FIRST),
            Err(AllocError::OutOfMemory(MappingFailure::Oversized { .. }))
        ));
        assert!(engine.ledger().is_empty());
        assert_eq!(0, engine.usage().maps);
    }
}
