use std::{marker::PhantomData, ptr::NonNull};

use crate::block::{Block, Link};

/// Singly linked list holding every [`Block`] of every mapped region, in the
/// order the regions were mapped.
///
/// The blocks of one region are always consecutive and start with the region
/// owner, so walking the ledger also walks the regions:
///
/// ```text
///   head                                                           tail
///    |                                                               |
/// +--v------------------------------+      +-------------------------v--+
/// | +-------+    +-------+    +---+ |      | +-------+    +-------+      |
/// | | Owner | -> | Block | -> |...|-|----->| | Owner | -> | Block |      |
/// | +-------+    +-------+    +---+ |      | +-------+    +-------+      |
/// +---------------------------------+      +----------------------------+
///              Region                                 Region
/// ```
///
/// It is very important for us that, because we are the actual memory
/// allocator, none of these methods can make allocations themselves. Every
/// node lives inside a region, in the header of the block it describes.
pub(crate) struct Ledger {
    head: Link<Block>,
    tail: Link<Block>,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Link<Block>,
    remaining: usize,
    marker: PhantomData<&'a Block>,
}

impl Ledger {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Block> {
        self.head
    }

    #[cfg(test)]
    pub fn last(&self) -> Link<Block> {
        self.tail
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends the owner block of a freshly mapped region at the end of the ledger.
    ///
    /// **SAFETY**: `block` must be a valid header not already in the ledger.
    pub unsafe fn push_region(&mut self, mut block: NonNull<Block>) {
        unsafe {
            block.as_mut().next = None;

            if let Some(mut tail) = self.tail {
                tail.as_mut().next = Some(block);
            } else {
                self.head = Some(block);
            }
        }

        self.tail = Some(block);
        self.len += 1;
    }

    /// Links `block` right after `at`. This is how split blocks enter the ledger.
    ///
    /// **SAFETY**: `at` must be in the ledger and `block` must be a valid header
    /// not already in it.
    pub unsafe fn insert_after(&mut self, mut at: NonNull<Block>, mut block: NonNull<Block>) {
        unsafe {
            block.as_mut().next = at.as_ref().next;
            at.as_mut().next = Some(block);
        }

        if self.tail == Some(at) {
            self.tail = Some(block);
        }
        self.len += 1;
    }

    /// Splices every block of the region owned by `owner` out of the ledger and
    /// returns how many blocks were removed. The region memory is not touched
    /// after this returns, so the caller may unmap it.
    ///
    /// **SAFETY**: `owner` must be a region owner currently in the ledger.
    pub unsafe fn unlink_region(&mut self, owner: NonNull<Block>) -> usize {
        let mut removed = 1;
        let mut after = unsafe { owner.as_ref().next };

        while let Some(block) = after {
            unsafe {
                if block.as_ref().region != owner {
                    break;
                }
                after = block.as_ref().next;
            }
            removed += 1;
        }

        let prev = self.predecessor(owner);
        match prev {
            None => self.head = after,
            Some(mut prev) => unsafe { prev.as_mut().next = after },
        }

        if after.is_none() {
            self.tail = prev;
        }
        self.len -= removed;

        removed
    }

    /// Block whose `next` is `block`, or `None` when `block` is the head.
    fn predecessor(&self, block: NonNull<Block>) -> Link<Block> {
        let mut current = self.head?;
        if current == block {
            return None;
        }

        unsafe {
            while let Some(next) = current.as_ref().next {
                if next == block {
                    return Some(current);
                }
                current = next;
            }
        }

        None
    }

    /// Forgets every block without touching them. Used once all regions
    /// have been returned to the kernel.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        unsafe {
            self.current = block.as_ref().next;
        }
        self.remaining -= 1;

        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a Ledger {
    type Item = NonNull<Block>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds `count` headers, grouped into regions by `owners` (the index of
    /// the owner of every block). Headers live in a `Vec` that is never resized.
    fn headers(count: usize) -> Vec<Block> {
        (0..count)
            .map(|_| Block {
                alloc_id: 0,
                capacity: 64,
                used: 64,
                region: NonNull::dangling(),
                region_capacity: 0,
                next: None,
            })
            .collect()
    }

    fn link(storage: &mut [Block], owners: &[usize]) -> Vec<NonNull<Block>> {
        let base = storage.as_mut_ptr();
        let blocks: Vec<_> = (0..storage.len())
            .map(|i| unsafe { NonNull::new_unchecked(base.add(i)) })
            .collect();

        for (block, &owner) in blocks.iter().zip(owners) {
            unsafe { (*block.as_ptr()).region = blocks[owner] };
        }
        blocks
    }

    fn ids(ledger: &Ledger, blocks: &[NonNull<Block>]) -> Vec<usize> {
        ledger
            .iter()
            .map(|b| blocks.iter().position(|x| *x == b).unwrap())
            .collect()
    }

    #[test]
    fn new_ledger_is_empty() {
        let ledger = Ledger::new();

        assert_eq!(ledger.len(), 0);
        assert!(ledger.is_empty());
        assert!(ledger.first().is_none());
        assert!(ledger.iter().next().is_none());
    }

    #[test]
    fn regions_append_and_splits_insert_in_place() {
        let owners = [0, 0, 2];
        let mut storage = headers(owners.len());
        let blocks = link(&mut storage, &owners);
        let mut ledger = Ledger::new();

        unsafe {
            ledger.push_region(blocks[0]);
            ledger.push_region(blocks[2]);
            ledger.insert_after(blocks[0], blocks[1]);
        }

        assert_eq!(vec![0, 1, 2], ids(&ledger, &blocks));
        assert_eq!(Some(blocks[2]), ledger.last());
        assert_eq!(3, ledger.iter().len());
    }

    #[test]
    fn split_of_the_tail_moves_the_tail() {
        let owners = [0, 0];
        let mut storage = headers(owners.len());
        let blocks = link(&mut storage, &owners);
        let mut ledger = Ledger::new();

        unsafe {
            ledger.push_region(blocks[0]);
            ledger.insert_after(blocks[0], blocks[1]);
        }

        assert_eq!(Some(blocks[1]), ledger.last());
    }

    #[test]
    fn unlink_region_splices_head_middle_and_tail() {
        let owners = [0, 0, 2, 2, 2, 5];
        let mut storage = headers(owners.len());
        let blocks = link(&mut storage, &owners);
        let mut ledger = Ledger::new();

        unsafe {
            ledger.push_region(blocks[0]);
            ledger.insert_after(blocks[0], blocks[1]);
            ledger.push_region(blocks[2]);
            ledger.insert_after(blocks[2], blocks[3]);
            ledger.insert_after(blocks[3], blocks[4]);
            ledger.push_region(blocks[5]);

            // Middle region.
            assert_eq!(3, ledger.unlink_region(blocks[2]));
            assert_eq!(vec![0, 1, 5], ids(&ledger, &blocks));

            // Tail region.
            assert_eq!(1, ledger.unlink_region(blocks[5]));
            assert_eq!(vec![0, 1], ids(&ledger, &blocks));
            assert_eq!(Some(blocks[1]), ledger.last());

            // Head (and only) region.
            assert_eq!(2, ledger.unlink_region(blocks[0]));
        }

        assert!(ledger.is_empty());
        assert!(ledger.first().is_none());
        assert!(ledger.last().is_none());
    }
}
