use std::{mem, ptr::NonNull};

use crate::{error::AllocError, utils::checked_align};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Header size of a block. Every block, allocated or free, starts with one.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Alignment of every header and therefore of every payload we hand out.
pub const MIN_ALIGN: usize = mem::align_of::<Block>();

/// This is the structure of a block. The fields of the block are it's metadata,
/// content is placed right after this header, inside the same region.
///
/// ```text
/// +---------------------+ <------+
/// |      alloc_id       |        |
/// +---------------------+        |
/// |      capacity       |        |
/// +---------------------+        |
/// |        used         |        |
/// +---------------------+        | -> Header
/// |       region        |        |
/// +---------------------+        |
/// |   region_capacity   |        |
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content (used - header)
/// +---------------------+ <------+
/// |     Spare bytes     |        | -> capacity - used, available for a split
/// +---------------------+ <------+
/// ```
///
/// Both `capacity` and `used` count the header. A block with `used == 0` is free.
///
/// The header is aligned to 16 bytes and every size we store is a multiple of
/// that, so a block carved at offset `used` of another block is aligned too.
#[repr(C, align(16))]
pub(crate) struct Block {
    /// Allocation number. Assigned every time the block goes from free to used.
    pub alloc_id: u64,
    /// Bytes spanned by the block, header included.
    pub capacity: usize,
    /// Bytes claimed from the front of `capacity`, header included.
    pub used: usize,
    /// First block of the region this block lives in. Points to itself on
    /// the first block.
    pub region: NonNull<Block>,
    /// Size of the whole mapping. Only meaningful on the region owner,
    /// zero everywhere else.
    pub region_capacity: usize,
    /// Next block in the ledger.
    pub next: Link<Block>,
}

impl Block {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.used == 0
    }

    #[inline]
    pub fn spare(&self) -> usize {
        self.capacity - self.used
    }

    /// Bytes of content currently claimed by the user.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.used.saturating_sub(BLOCK_HEADER_SIZE)
    }

    #[inline]
    pub fn is_region_owner(&self) -> bool {
        ptr_eq(self.region, self)
    }

    /// Writes `block` at `addr`, turning those bytes into a header.
    ///
    /// **SAFETY**: `addr` must be aligned to [`MIN_ALIGN`] and point to at least
    /// [`BLOCK_HEADER_SIZE`] writable bytes that we own.
    pub unsafe fn write(addr: NonNull<u8>, block: Block) -> NonNull<Block> {
        let header = addr.cast::<Block>();
        unsafe { header.as_ptr().write(block) };
        header
    }

    /// Address of the content that follows the header.
    #[inline]
    pub fn payload(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
    }

    /// Recovers the header of a payload returned by [`Block::payload`].
    ///
    /// **SAFETY**: `ptr` must have been produced by this allocator and its
    /// region must still be mapped.
    #[inline]
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<Block> {
        unsafe { ptr.sub(BLOCK_HEADER_SIZE).cast::<Block>() }
    }
}

#[inline]
fn ptr_eq(a: NonNull<Block>, b: &Block) -> bool {
    std::ptr::eq(a.as_ptr(), b)
}

/// Bytes a request of `size` really takes inside a region: the content rounded
/// up to [`MIN_ALIGN`] plus the header.
pub(crate) fn real_size(size: usize) -> Result<usize, AllocError> {
    checked_align(size, MIN_ALIGN)
        .and_then(|size| size.checked_add(BLOCK_HEADER_SIZE))
        .ok_or(AllocError::InvalidSize {
            count: 1,
            elem_size: size,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keeps_payloads_aligned() {
        assert_eq!(0, BLOCK_HEADER_SIZE % MIN_ALIGN);
        assert!(MIN_ALIGN >= 16);
    }

    #[test]
    fn real_size_counts_header_and_padding() {
        assert_eq!(BLOCK_HEADER_SIZE, real_size(0).unwrap());
        assert_eq!(BLOCK_HEADER_SIZE + 16, real_size(1).unwrap());
        assert_eq!(BLOCK_HEADER_SIZE + 16, real_size(16).unwrap());
        assert_eq!(BLOCK_HEADER_SIZE + 112, real_size(100).unwrap());
        assert!(matches!(
            real_size(usize::MAX),
            Err(AllocError::InvalidSize { count: 1, elem_size: usize::MAX })
        ));
    }

    #[test]
    fn payload_and_header_round_trip() {
        let mut storage = Block {
            alloc_id: 7,
            capacity: 256,
            used: 64,
            region: NonNull::dangling(),
            region_capacity: 0,
            next: None,
        };
        let block = NonNull::from(&mut storage);
        unsafe { (*block.as_ptr()).region = block };

        let payload = Block::payload(block);
        assert_eq!(block.as_ptr() as usize + BLOCK_HEADER_SIZE, payload.as_ptr() as usize);
        assert_eq!(block, unsafe { Block::from_payload(payload) });

        let header = unsafe { block.as_ref() };
        assert!(header.is_region_owner());
        assert_eq!(192, header.spare());
        assert_eq!(64 - BLOCK_HEADER_SIZE, header.payload_len());
        assert!(!header.is_free());
    }
}
