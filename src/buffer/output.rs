//! Send-side chained buffer.
//!
//! Producers stage bytes with [`OutputBuffer::append`] or by claiming a
//! writable fragment; the flush path drains the unflushed region with a
//! single vectored write per attempt and releases blocks as soon as they are
//! fully flushed.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

use super::{Block, DEFAULT_BLOCK_SIZE};

/// Send-side buffer: a chain of blocks plus a count of unflushed bytes.
pub struct OutputBuffer {
    blocks: VecDeque<Block>,
    pending: usize,
    block_size: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        let mut blocks = VecDeque::new();
        blocks.push_back(Block::new(block_size));
        Self {
            blocks,
            pending: 0,
            block_size,
        }
    }

    /// Bytes staged but not yet flushed.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Number of blocks currently held.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Claim the free tail of the chain as a writable fragment, growing the
    /// chain when the last block is full. The whole fragment counts as
    /// pending until the unused tail is returned with
    /// [`OutputBuffer::back_up`].
    pub fn next_mut(&mut self) -> &mut [u8] {
        if self.blocks.back().map(Block::is_full).unwrap_or(true) {
            self.blocks.push_back(Block::new(self.block_size));
        }
        let block = self.blocks.back_mut().expect("chain is never empty");
        let start = block.end;
        block.end = block.data.len();
        self.pending += block.data.len() - start;
        &mut block.data[start..]
    }

    /// Retract up to `n` bytes claimed by the most recent `next_mut`.
    pub fn back_up(&mut self, n: usize) {
        let block = self.blocks.back_mut().expect("chain is never empty");
        let retract = n.min(block.unread());
        block.end -= retract;
        self.pending -= retract;
    }

    /// Copy `data` into the chain, growing it as needed.
    pub fn append(&mut self, data: &[u8]) {
        let mut off = 0;
        while off < data.len() {
            let frag = self.next_mut();
            let frag_len = frag.len();
            let take = frag_len.min(data.len() - off);
            frag[..take].copy_from_slice(&data[off..off + take]);
            off += take;
            if frag_len > take {
                self.back_up(frag_len - take);
            }
        }
    }

    /// The unflushed region as slices for a scatter write.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.blocks
            .iter()
            .filter(|b| b.unread() > 0)
            .map(|b| IoSlice::new(&b.data[b.begin..b.end]))
            .collect()
    }

    /// Stable pointer to the first unflushed fragment, for completion-based
    /// backends. Valid until [`OutputBuffer::consume`] advances past it.
    pub fn first_fragment(&self) -> Option<(*const u8, usize)> {
        self.blocks
            .iter()
            .find(|b| b.unread() > 0)
            .map(|b| (b.data[b.begin..].as_ptr(), b.unread()))
    }

    /// Advance the flush cursor by `n` bytes, releasing fully flushed blocks
    /// and resetting a lone empty block for reuse.
    pub fn consume(&mut self, mut n: usize) {
        debug_assert!(n <= self.pending);
        while n > 0 {
            let multi = self.blocks.len() > 1;
            let block = &mut self.blocks[0];
            let take = n.min(block.unread());
            block.begin += take;
            let exhausted = block.exhausted();
            self.pending -= take;
            n -= take;
            if exhausted && multi {
                self.blocks.pop_front();
            } else if take == 0 {
                break;
            }
        }
        if self.blocks.len() == 1 {
            let block = &mut self.blocks[0];
            if block.begin == block.end {
                block.begin = 0;
                block.end = 0;
            }
        }
    }

    /// One vectored write of the unflushed region into `w`, advancing the
    /// flush cursor by however much was accepted.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = {
            let slices = self.io_slices();
            w.write_vectored(&slices)?
        };
        self.consume(n);
        Ok(n)
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_grows_and_flush_drains() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut buf = OutputBuffer::with_block_size(16);
        buf.append(&data);
        assert_eq!(buf.pending(), 100);
        assert_eq!(buf.block_count(), 7);

        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(n, 100);
        assert_eq!(sink, data);
        assert!(buf.is_empty());
        assert_eq!(buf.block_count(), 1);
    }

    #[test]
    fn next_mut_and_back_up_round_trip() {
        let mut buf = OutputBuffer::with_block_size(32);
        let frag = buf.next_mut();
        frag[..5].copy_from_slice(b"frame");
        let unused = frag.len() - 5;
        buf.back_up(unused);
        assert_eq!(buf.pending(), 5);

        let mut sink = Vec::new();
        buf.write_to(&mut sink).unwrap();
        assert_eq!(sink, b"frame");
    }

    #[test]
    fn partial_consume_keeps_remainder() {
        let mut buf = OutputBuffer::with_block_size(8);
        buf.append(b"abcdefghij");
        buf.consume(4);
        assert_eq!(buf.pending(), 6);

        let mut sink = Vec::new();
        buf.write_to(&mut sink).unwrap();
        assert_eq!(sink, b"efghij");
    }

    #[test]
    fn flushed_blocks_are_released() {
        let mut buf = OutputBuffer::with_block_size(8);
        buf.append(&[1u8; 24]);
        assert_eq!(buf.block_count(), 3);
        buf.consume(16);
        assert_eq!(buf.block_count(), 1);
        assert_eq!(buf.pending(), 8);
    }

    #[test]
    fn io_slices_cover_exactly_the_unflushed_region() {
        let mut buf = OutputBuffer::with_block_size(8);
        buf.append(&[9u8; 20]);
        buf.consume(3);
        let total: usize = buf.io_slices().iter().map(|s| s.len()).sum();
        assert_eq!(total, 17);
        let (_, first_len) = buf.first_fragment().unwrap();
        assert_eq!(first_len, 5);
    }
}
