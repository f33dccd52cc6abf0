use std::cmp::min;
use std::fmt::{Display, Formatter};
use anyhow::bail;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Block size of a blockwise transfer, stored as the exponent `szx` (size is `2^(szx+4)`,
///  i.e. powers of two from 16 to 1024). Ordering is by size.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct BlockSize(u8);

impl BlockSize {
    pub const S16: BlockSize = BlockSize(0);
    pub const S32: BlockSize = BlockSize(1);
    pub const S64: BlockSize = BlockSize(2);
    pub const S128: BlockSize = BlockSize(3);
    pub const S256: BlockSize = BlockSize(4);
    pub const S512: BlockSize = BlockSize(5);
    pub const S1024: BlockSize = BlockSize(6);

    pub fn from_szx(szx: u8) -> anyhow::Result<BlockSize> {
        if szx > 6 {
            bail!("block size exponent {} is out of range", szx);
        }
        Ok(BlockSize(szx))
    }

    pub fn from_size(size: usize) -> anyhow::Result<BlockSize> {
        for szx in 0..=6 {
            if 1usize << (szx + 4) == size {
                return Ok(BlockSize(szx));
            }
        }
        bail!("{} is not a valid block size (powers of two, 16..=1024)", size)
    }

    pub fn szx(&self) -> u8 {
        self.0
    }

    pub fn size(&self) -> usize {
        1usize << (self.0 + 4)
    }
}

impl Display for BlockSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.size())
    }
}

/// Decoded value of a Block1 / Block2 option: `num << 4 | more << 3 | szx`, transported as a
///  minimal-length uint option value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub size: BlockSize,
}

impl BlockOption {
    pub fn to_raw(&self) -> u32 {
        self.num << 4 | (self.more as u32) << 3 | self.size.szx() as u32
    }

    pub fn from_raw(raw: u32) -> anyhow::Result<BlockOption> {
        Ok(BlockOption {
            num: raw >> 4,
            more: raw & 0x08 != 0,
            size: BlockSize::from_szx((raw & 0x07) as u8)?,
        })
    }
}

/// Outcome of offering an inbound block to a [BlockAssembly].
#[derive(Debug, PartialEq, Eq)]
pub enum BlockIngestion {
    /// the expected next block was stored, the transfer continues
    Accepted,
    /// the final block was stored: this is the fully reassembled payload
    Complete(Vec<u8>),
    /// out-of-order, duplicated or mis-sized block: state is unchanged, the peer's
    ///  retransmission recovers the transfer
    Ignored,
    /// accepting the block would exceed the transfer size cap; the transfer is dead
    Overflow,
}

/// Reassembles a payload that arrives split into blocks.
///
/// Blocks are accepted strictly in order, and non-final blocks only at exactly the negotiated
///  block size. Anything else leaves the state untouched so that a retransmission of the
///  expected block can still succeed.
pub struct BlockAssembly {
    block_size: BlockSize,
    next_block_num: u32,
    buffer: Vec<u8>,
    finished: bool,
    max_transfer_size: usize,
}

impl BlockAssembly {
    pub fn new(block_size: BlockSize, max_transfer_size: usize) -> BlockAssembly {
        BlockAssembly {
            block_size,
            next_block_num: 0,
            buffer: Vec::new(),
            finished: false,
            max_transfer_size,
        }
    }

    /// the block number this assembly waits for next
    pub fn next_block_num(&self) -> u32 {
        self.next_block_num
    }

    /// The block size of the transfer. The first block fixes this value: the peer may answer
    ///  with a smaller size than proposed, and that size then binds for the whole transfer.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn on_block(&mut self, block: BlockOption, payload: &[u8]) -> BlockIngestion {
        if self.finished || block.num != self.next_block_num {
            return BlockIngestion::Ignored;
        }

        if block.num == 0 {
            self.block_size = block.size;
        }
        else if block.size != self.block_size {
            return BlockIngestion::Ignored;
        }

        if block.more && payload.len() != self.block_size.size() {
            return BlockIngestion::Ignored;
        }
        if payload.len() > self.block_size.size() {
            return BlockIngestion::Ignored;
        }
        if self.buffer.len() + payload.len() > self.max_transfer_size {
            return BlockIngestion::Overflow;
        }

        self.buffer.extend_from_slice(payload);
        self.next_block_num += 1;

        if block.more {
            BlockIngestion::Accepted
        }
        else {
            self.finished = true;
            BlockIngestion::Complete(std::mem::take(&mut self.buffer))
        }
    }
}

/// Serves a payload that is too big for a single datagram in blocks.
///
/// Access is random by block number (the response side answers whatever block number the
///  peer requests); the cursor is for the request side, where this side drives the transfer
///  block by block.
pub struct BlockSource {
    block_size: BlockSize,
    payload: Vec<u8>,
    next_block_num: u32,
}

impl BlockSource {
    pub fn new(block_size: BlockSize, payload: Vec<u8>) -> BlockSource {
        BlockSource {
            block_size,
            payload,
            next_block_num: 0,
        }
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// the highest valid block number; an empty payload still has one (empty) block
    pub fn max_block_num(&self) -> u32 {
        if self.payload.len() <= self.block_size.size() {
            return 0;
        }
        ((self.payload.len() - 1) / self.block_size.size()).prechecked_cast()
    }

    /// The given block of the payload, or None for block numbers past the end. The returned
    ///  option's `more` flag is set for all blocks but the last.
    pub fn block(&self, num: u32) -> Option<(BlockOption, Vec<u8>)> {
        if num > self.max_block_num() {
            return None;
        }

        let size = self.block_size.size();
        let start = <u32 as SafeCast<usize>>::safe_cast(num) * size;
        let end = min(start + size, self.payload.len());

        let block = BlockOption {
            num,
            more: num < self.max_block_num(),
            size: self.block_size,
        };
        Some((block, self.payload[start..end].to_vec()))
    }

    pub fn next_block_num(&self) -> u32 {
        self.next_block_num
    }

    pub fn advance(&mut self) {
        self.next_block_num += 1;
    }
}
