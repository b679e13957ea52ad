use std::sync::Arc;

use super::error::Result;
use super::metadata::{DirEntry, DirInfo, EntryReference, Inode};
use super::source::ReadAt;
use super::superblock::Compressor;

/// The view of an image that file nodes and extraction are built on: inode and directory
/// lookups plus what is needed to read file data.
pub trait Catalog: Send + Sync {
    fn source(&self) -> &Arc<dyn ReadAt>;

    fn compressor(&self) -> Compressor;

    fn block_size(&self) -> u32;

    fn root_ref(&self) -> EntryReference;

    fn inode(&self, inode_ref: EntryReference) -> Result<Inode>;

    /// Full listing of a directory, in on-disk order
    fn read_dir(&self, dir: &DirInfo) -> Result<Vec<DirEntry>>;

    /// Resolve a uid/gid index to the id it stands for
    fn id(&self, index: u16) -> Result<u32>;

    /// Decoded contents of the fragment block with the given index
    fn fragment_block(&self, index: u32) -> Result<Arc<Vec<u8>>>;
}
