use std::cmp::min;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use log::{debug, trace};

use super::block::{load_block, DataBlock};
use super::error::{Error, Result};
use super::source::ReadAt;
use super::superblock::Compressor;

/// Forward-only reader over a run of data blocks.
///
/// Only the current block is held in memory. Blocks are located lazily: each one starts where
/// the previous one ended, so the image offset of block N is known once block N-1 has been
/// materialized.
pub struct DataReader {
    source: Arc<dyn ReadAt>,
    compressor: Compressor,
    block_size: u32,
    next_offset: u64,       // Image offset of the first block not yet materialized
    blocks: Vec<DataBlock>,
    cur_block: usize,
    cur_data: Vec<u8>,
    cur_pos: usize,         // Read position within cur_data
}

impl DataReader {
    /// Create a reader over the blocks described by `sizes`, the first of which is stored at
    /// `start`. Block 0 is read immediately, so an unreadable first block fails here.
    pub fn new(source: Arc<dyn ReadAt>, compressor: Compressor, block_size: u32, start: u64, sizes: &[u32])
        -> Result<Self>
    {
        let blocks = sizes.iter()
            .map(|raw| DataBlock::from_raw(*raw, block_size))
            .collect();
        let mut reader = Self {
            source,
            compressor,
            block_size,
            next_offset: start,
            blocks,
            cur_block: 0,
            cur_data: Vec::new(),
            cur_pos: 0,
        };
        if !reader.blocks.is_empty() {
            reader.cur_data = reader.materialize(0)?;
        }
        Ok(reader)
    }

    /// Descriptors of the blocks, with the offsets and sizes learned so far
    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    /// Fill `buf` from the stream. Running out of blocks before `buf` is full fails with
    /// [`Error::EndOfBlocks`], whose `copied` count tells how much of `buf` was filled.
    ///
    /// If the next block cannot be read the reader stays on the last good block, so a later
    /// call retries the failed block.
    pub fn read_blocks(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.fill(buf) {
            (copied, None) => Ok(copied),
            (copied, Some(Error::EndOfBlocks { .. })) => Err(Error::EndOfBlocks { copied }),
            (_, Some(e)) => Err(e),
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> (usize, Option<Error>) {
        let mut copied = 0;
        while copied < buf.len() {
            if self.cur_pos >= self.cur_data.len() {
                if let Err(e) = self.advance() {
                    return (copied, Some(e));
                }
                continue;
            }
            let n = min(buf.len() - copied, self.cur_data.len() - self.cur_pos);
            buf[copied..copied + n].copy_from_slice(&self.cur_data[self.cur_pos..self.cur_pos + n]);
            self.cur_pos += n;
            copied += n;
        }
        (copied, None)
    }

    fn advance(&mut self) -> Result<()> {
        let next = self.cur_block + 1;
        if next >= self.blocks.len() {
            return Err(Error::EndOfBlocks { copied: 0 });
        }
        // Only commit to the new block once it is in hand
        let data = self.materialize(next).map_err(|e| {
            debug!("block {next} failed, staying on block {}: {e}", self.cur_block);
            e
        })?;
        self.cur_block = next;
        self.cur_data = data;
        self.cur_pos = 0;
        Ok(())
    }

    fn materialize(&mut self, index: usize) -> Result<Vec<u8>> {
        let block = self.blocks[index];
        let offset = block.offset.unwrap_or(self.next_offset);
        let data = load_block(&*self.source, self.compressor, self.block_size, offset, &block)?;
        trace!("block {index} at {offset}: {} bytes", data.len());

        let block = &mut self.blocks[index];
        if block.offset.is_none() {
            block.offset = Some(offset);
            self.next_offset = offset + u64::from(block.disk_size);
        }
        block.uncompressed_size.get_or_insert(data.len() as u32);
        Ok(data)
    }
}

impl Read for DataReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.fill(buf) {
            (copied, None) => Ok(copied),
            // Report what was copied; a failure will show up again on the next call
            (copied, Some(_)) if copied > 0 => Ok(copied),
            (_, Some(Error::EndOfBlocks { .. })) => Ok(0),
            (_, Some(e)) => Err(e.into()),
        }
    }
}

impl fmt::Debug for DataReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataReader")
            .field("compressor", &self.compressor)
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.len())
            .field("cur_block", &self.cur_block)
            .field("cur_pos", &self.cur_pos)
            .finish()
    }
}
