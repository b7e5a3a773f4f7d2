//! Splits an object into chunk descriptors.

use filelake_protocol::HttpRange;

use crate::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, TransferError};

/// One contiguous byte range of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Ordinal position; equals the chunk's rank by offset.
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    /// Retries already issued for this chunk. 0 on the first try.
    pub attempt: u32,
}

impl ChunkDescriptor {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            attempt: 0,
        }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// The request range for this chunk.
    pub fn range(&self) -> HttpRange {
        HttpRange::new(self.offset, self.length)
    }
}

/// Output of [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunks: Vec<ChunkDescriptor>,
    /// The whole object moves in one operation.
    pub single_shot: bool,
}

impl ChunkPlan {
    pub fn total_size(&self) -> u64 {
        self.chunks.last().map_or(0, ChunkDescriptor::end)
    }
}

/// Plans a transfer of `total_size` bytes.
///
/// At or below `single_shot_threshold` the plan is one descriptor covering
/// the whole object (a zero-length object included). Above it the object is
/// cut into `ceil(total_size / block_size)` chunks, the last one carrying
/// the remainder.
pub fn plan(
    total_size: u64,
    block_size: Option<u64>,
    single_shot_threshold: u64,
) -> Result<ChunkPlan, TransferError> {
    let block_size = checked_block_size(block_size)?;

    if total_size <= single_shot_threshold {
        return Ok(ChunkPlan {
            chunks: vec![ChunkDescriptor::new(0, 0, total_size)],
            single_shot: true,
        });
    }

    let count = total_size.div_ceil(block_size);
    let chunks = (0..count)
        .map(|i| {
            let offset = i * block_size;
            let length = block_size.min(total_size - offset);
            ChunkDescriptor::new(i as usize, offset, length)
        })
        .collect();

    Ok(ChunkPlan {
        chunks,
        single_shot: false,
    })
}

/// Hands out descriptors one at a time for sources of unknown length.
#[derive(Debug, Clone)]
pub struct ChunkCursor {
    block_size: u64,
    next_index: usize,
    next_offset: u64,
}

impl ChunkCursor {
    pub fn new(block_size: Option<u64>) -> Result<Self, TransferError> {
        Ok(Self {
            block_size: checked_block_size(block_size)?,
            next_index: 0,
            next_offset: 0,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Offset the next descriptor will start at.
    pub fn offset(&self) -> u64 {
        self.next_offset
    }

    /// Emits the next descriptor with the given length, which may be short
    /// only for the final chunk.
    pub fn advance(&mut self, length: u64) -> ChunkDescriptor {
        let descriptor = ChunkDescriptor::new(self.next_index, self.next_offset, length);
        self.next_index += 1;
        self.next_offset += length;
        descriptor
    }
}

/// Converts a byte count to an in-memory length.
pub(crate) fn to_usize(len: u64) -> Result<usize, TransferError> {
    usize::try_from(len).map_err(|_| {
        TransferError::InvalidArgument(format!("{len} bytes cannot be buffered in memory"))
    })
}

fn checked_block_size(block_size: Option<u64>) -> Result<u64, TransferError> {
    match block_size {
        None => Ok(DEFAULT_BLOCK_SIZE),
        Some(0) => Err(TransferError::InvalidArgument(
            "block size must be greater than 0".into(),
        )),
        Some(size) if size > MAX_BLOCK_SIZE => Err(TransferError::InvalidArgument(format!(
            "block size {size} exceeds the maximum of {MAX_BLOCK_SIZE}"
        ))),
        Some(size) => Ok(size),
    }
}
