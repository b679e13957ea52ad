mod block;
mod catalog;
mod codec;
mod datareader;
mod error;
mod extract;
mod file;
mod fullreader;
mod source;
mod squashfs;
mod superblock;
#[cfg(test)]
mod testimage;

pub mod metadata;
pub mod path;

pub use block::{load_block, DataBlock, SIZE_MASK, UNCOMPRESSED_BIT};
pub use catalog::Catalog;
pub use datareader::DataReader;
pub use error::{Error, Result};
pub use extract::{DeviceKind, ExtractOptions, LogSink, Mknod, MknodCommand};
pub use file::{FileNode, FileStream, Metadata};
pub use fullreader::FullReader;
pub use metadata::{DirEntry, FileKind, Inode};
pub use source::{OffsetSource, ReadAt, SharedReader};
pub use squashfs::SquashFS;
pub use superblock::{Compressor, Superblock, SuperblockFlags};
