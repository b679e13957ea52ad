use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use parking_lot::Mutex;

use super::error::{Error, Result};
use super::source::ReadAt;
use super::superblock::Compressor;

/// Bit of a data block size word that marks the block as stored uncompressed
pub const UNCOMPRESSED_BIT: u32 = 1 << 24;

/// Bits of a data block size word that hold the on-disk size
pub const SIZE_MASK: u32 = UNCOMPRESSED_BIT - 1;

// SquashFS metadata blocks hold at most 8K of data, fixed by the on-disk format
pub(crate) const METADATA_BLOCK_SIZE: usize = 8192;

// Decoded metadata blocks kept around at once, 8 MiB at most
const METADATA_CACHE_LIMIT: usize = 1024;

/// Decoded form of one entry from a file's block size list.
///
/// `offset` is filled in when the block is first materialized and `uncompressed_size` once it
/// is known; neither changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    pub offset: Option<u64>,
    pub disk_size: u32,
    pub compressed: bool,
    pub uncompressed_size: Option<u32>,
}

impl DataBlock {
    pub fn from_raw(raw: u32, block_size: u32) -> Self {
        let disk_size = raw & SIZE_MASK;
        let compressed = raw & UNCOMPRESSED_BIT == 0;
        let uncompressed_size = if disk_size == 0 {
            Some(block_size)
        } else if !compressed {
            Some(disk_size)
        } else {
            None
        };
        Self { offset: None, disk_size, compressed, uncompressed_size }
    }

    /// A sparse block has no bytes in the image and reads as a block of zeros
    pub fn is_sparse(&self) -> bool {
        self.disk_size == 0
    }
}

/// Read one data block stored at `offset` and return its uncompressed bytes. Sparse blocks
/// come back as `block_size` zeros without touching the source.
pub fn load_block(source: &dyn ReadAt, compressor: Compressor, block_size: u32, offset: u64, block: &DataBlock)
    -> Result<Vec<u8>>
{
    if block.is_sparse() {
        trace!("sparse block at {offset}");
        return Ok(vec![0; block_size as usize]);
    }
    let mut raw = vec![0; block.disk_size as usize];
    source.read_exact_at(&mut raw, offset)?;
    if block.compressed {
        trace!("decompressing {} byte block at {offset}", block.disk_size);
        compressor.decompress(&raw, block_size as usize)
    } else {
        Ok(raw)
    }
}

/// One decompressed metadata block, plus the image address of the block that follows it
#[derive(Debug)]
pub(crate) struct MetaBlock {
    pub data: Vec<u8>,
    pub next: u64,
}

/// A store of decompressed metadata blocks keyed by their image address. Blocks are decoded
/// once and shared by every reader that needs them, until the store fills up and starts over.
pub(crate) struct MetadataCache {
    source: Arc<dyn ReadAt>,
    compressor: Compressor,
    blocks: Mutex<HashMap<u64, Arc<MetaBlock>>>,
    limit: usize,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn ReadAt>, compressor: Compressor) -> Self {
        Self::with_limit(source, compressor, METADATA_CACHE_LIMIT)
    }

    fn with_limit(source: Arc<dyn ReadAt>, compressor: Compressor, limit: usize) -> Self {
        Self { source, compressor, blocks: Mutex::new(HashMap::new()), limit }
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn block(&self, addr: u64) -> Result<Arc<MetaBlock>> {
        if let Some(b) = self.blocks.lock().get(&addr) {
            return Ok(b.clone());
        }
        // Decode outside the lock. Two threads may race on the same block; both results are
        // identical so the later insert is harmless.
        let block = Arc::new(self.load(addr)?);
        let mut blocks = self.blocks.lock();
        // Readers hold their own Arc, so dropping entries never pulls a block from under them
        if blocks.len() >= self.limit {
            blocks.clear();
        }
        blocks.insert(addr, block.clone());
        Ok(block)
    }

    fn load(&self, addr: u64) -> Result<MetaBlock> {
        // The size of metadata blocks is stored in a 16-bit header
        let mut header = [0; 2];
        self.source.read_exact_at(&mut header, addr)?;
        let header = LittleEndian::read_u16(&header);
        let size = usize::from(header & 0x7FFF);
        let compressed = header & 0x8000 == 0;

        if size > METADATA_BLOCK_SIZE {
            return Err(Error::Corrupt(format!("metadata block at {addr} is {size} bytes")));
        }

        let mut raw = vec![0; size];
        self.source.read_exact_at(&mut raw, addr + 2)?;
        let data = if compressed {
            self.compressor.decompress(&raw, METADATA_BLOCK_SIZE)?
        } else {
            raw
        };
        trace!("metadata block at {addr}: {size} bytes on disk, {} decoded", data.len());

        // Don't forget about the 2-byte header
        Ok(MetaBlock { data, next: addr + 2 + size as u64 })
    }

    /// Create a reader positioned `offset` bytes into the metadata block at `addr`. The reader
    /// rolls into the following blocks as needed.
    pub fn reader(&self, addr: u64, offset: u16) -> Result<MetadataReader<'_>> {
        let block = self.block(addr)?;
        let pos = usize::from(offset);
        if pos > block.data.len() {
            return Err(Error::Corrupt(format!(
                "offset {pos} is past the end of metadata block {addr}")));
        }
        Ok(MetadataReader { cache: self, block, pos })
    }
}

pub(crate) struct MetadataReader<'a> {
    cache: &'a MetadataCache,
    block: Arc<MetaBlock>,
    pos: usize,
}

impl Read for MetadataReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.block.data.len() {
            // This must be the end of the block. Start on the next one.
            self.block = self.cache.block(self.block.next)?;
            self.pos = 0;
        }
        let n = Read::read(&mut &self.block.data[self.pos..], buf)?;
        self.pos += n;
        Ok(n)
    }
}
