//! See https://dr-emann.github.io/squashfs/squashfs.html
//! for details on the SquashFS binary format

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::block::{load_block, DataBlock, MetadataCache};
use super::catalog::Catalog;
use super::error::{Error, Result};
use super::file::FileNode;
use super::metadata::{self, DirEntry, DirInfo, EntryReference, FragmentEntry, Inode};
use super::source::ReadAt;
use super::superblock::{Compressor, Superblock, SUPERBLOCK_SIZE};

// Decoded fragment blocks kept around at once. Files sharing a fragment block tend to sit
// next to each other in a directory, so a small cache catches most reuse.
const FRAGMENT_CACHE_LIMIT: usize = 32;

/// The top-level interface to a SquashFS filesystem. It decodes inodes and directory listings
/// on demand and hands out [`FileNode`]s for the tree.
pub struct SquashFS {
    source: Arc<dyn ReadAt>,
    sb: Superblock,
    metadata: MetadataCache,
    ids: Vec<u32>,
    fragments: Vec<FragmentEntry>,
    fragment_cache: Mutex<HashMap<u32, Arc<Vec<u8>>>>,
}

impl SquashFS {
    /// Open the contents of a filepath as a SquashFS
    pub fn open<P>(path: P) -> Result<Self>
    where P: AsRef<Path>
    {
        Self::new(File::open(path)?)
    }

    /// Create a new SquashFS instance from the provided source
    pub fn new<S: ReadAt + 'static>(source: S) -> Result<Self> {
        Self::from_source(Arc::new(source))
    }

    pub fn from_source(source: Arc<dyn ReadAt>) -> Result<Self> {
        let mut raw = [0; SUPERBLOCK_SIZE];
        source.read_exact_at(&mut raw, 0)?;
        let sb = Superblock::from_bytes(&raw)?;
        let metadata = MetadataCache::new(source.clone(), sb.compressor);

        let ids = metadata::read_lookup_table::<u32>(&metadata, &*source, sb.id_table, sb.id_count.into())?;
        let fragments = if sb.has_fragments() {
            metadata::read_lookup_table::<FragmentEntry>(&metadata, &*source, sb.frag_table, sb.frag_count)?
        } else {
            Vec::new()
        };
        debug!("opened {:?} image: {} inodes, block size {}, {} ids, {} fragments",
            sb.compressor, sb.inode_count, sb.block_size, ids.len(), fragments.len());

        Ok(SquashFS {
            source,
            sb,
            metadata,
            ids,
            fragments,
            fragment_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Retrieve the node for the '/' directory. The node keeps the filesystem alive.
    pub fn root(self) -> Result<FileNode> {
        FileNode::root(Arc::new(self))
    }
}

impl Catalog for SquashFS {
    fn source(&self) -> &Arc<dyn ReadAt> {
        &self.source
    }

    fn compressor(&self) -> Compressor {
        self.sb.compressor
    }

    fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    fn root_ref(&self) -> EntryReference {
        self.sb.root_inode
    }

    fn inode(&self, inode_ref: EntryReference) -> Result<Inode> {
        let mut reader = self.metadata.reader(self.sb.inode_table + inode_ref.location(), inode_ref.offset())?;
        Inode::read(&mut reader, self.sb.block_size)
    }

    fn read_dir(&self, dir: &DirInfo) -> Result<Vec<DirEntry>> {
        // An empty listing may point just past the end of the directory table
        if dir.file_size <= 3 {
            return Ok(Vec::new());
        }
        let addr = self.sb.dir_table + u64::from(dir.block_index);
        let mut reader = self.metadata.reader(addr, dir.block_offset)?;
        metadata::read_directory(&mut reader, dir.file_size)
    }

    fn id(&self, index: u16) -> Result<u32> {
        self.ids.get(usize::from(index))
            .copied()
            .ok_or_else(|| Error::Corrupt(format!("id index {index} out of range")))
    }

    fn fragment_block(&self, index: u32) -> Result<Arc<Vec<u8>>> {
        if let Some(block) = self.fragment_cache.lock().get(&index) {
            return Ok(block.clone());
        }
        let entry = self.fragments.get(index as usize)
            .ok_or_else(|| Error::Corrupt(format!("fragment index {index} out of range")))?;
        let block = DataBlock::from_raw(entry.size, self.sb.block_size);
        let data = Arc::new(load_block(&*self.source, self.sb.compressor, self.sb.block_size, entry.start, &block)?);
        debug!("loaded fragment block {index}: {} bytes", data.len());

        let mut cache = self.fragment_cache.lock();
        if cache.len() >= FRAGMENT_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(index, data.clone());
        Ok(data)
    }
}

impl fmt::Debug for SquashFS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SquashFS")
            .field("sb", &self.sb)
            .field("ids", &self.ids)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}
