//! Block mapping for volume I/O
//!
//! Maps byte ranges requested by the export front end onto the volume's
//! fixed-size blocks.

use crate::error::{VolumeError, VolumeResult};
use replvol_common::BlockIndex;

/// A range of bytes within a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    /// Block index
    pub block: BlockIndex,
    /// Byte offset within the block
    pub offset_in_block: u64,
    /// Number of bytes in this range
    pub length: u64,
}

impl BlockRange {
    /// Whether the range covers the whole block
    #[must_use]
    pub const fn is_full(&self, block_size: u64) -> bool {
        self.offset_in_block == 0 && self.length == block_size
    }
}

/// Maps byte offsets to blocks
///
/// ```text
/// Volume (block_count × block_size)
/// ├── Block 0:  bytes 0 .. bs
/// ├── Block 1:  bytes bs .. 2bs
/// │   ...
/// └── Block N-1
/// ```
#[derive(Debug, Clone)]
pub struct BlockMapper {
    block_size: u64,
    block_count: u64,
}

impl BlockMapper {
    /// Create a new block mapper
    ///
    /// `block_size` must be a non-zero power of two; descriptors are
    /// validated before a mapper is built.
    #[must_use]
    pub fn new(block_size: u64, block_count: u64) -> Self {
        debug_assert!(block_size.is_power_of_two(), "block size must be a power of two");
        Self {
            block_size,
            block_count,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Total addressable bytes
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.block_count)
    }

    /// Convert a byte offset to a block index
    #[must_use]
    pub const fn byte_offset_to_block(&self, byte_offset: u64) -> BlockIndex {
        byte_offset / self.block_size
    }

    /// Reject ranges that run past the end of the volume
    pub fn check_bounds(&self, offset: u64, length: u64) -> VolumeResult<()> {
        let size = self.size_bytes();
        match offset.checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(VolumeError::OutOfBounds {
                offset,
                length,
                size,
            }),
        }
    }

    /// Convert a byte range to block ranges
    ///
    /// Returns a list of block ranges that cover the specified byte range,
    /// splitting at block boundaries.
    #[must_use]
    pub fn byte_range_to_blocks(&self, start_byte: u64, length: u64) -> Vec<BlockRange> {
        if length == 0 {
            return Vec::new();
        }

        let end_byte = start_byte + length;
        let start_block = start_byte / self.block_size;
        let end_block = (end_byte - 1) / self.block_size;

        (start_block..=end_block)
            .map(|block| {
                let block_start = block * self.block_size;
                let block_end = block_start + self.block_size;

                // Intersection of [start_byte, end_byte) and [block_start, block_end)
                let range_start = start_byte.max(block_start);
                let range_end = end_byte.min(block_end);

                BlockRange {
                    block,
                    offset_in_block: range_start - block_start,
                    length: range_end - range_start,
                }
            })
            .collect()
    }
}
