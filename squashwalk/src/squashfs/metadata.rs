use std::ffi::{OsStr, OsString};
use std::fmt::Debug;
use std::io::Read;
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::block::{MetadataCache, METADATA_BLOCK_SIZE};
use super::error::{Error, Result};
use super::source::ReadAt;

// Divide x by y, rounding up any fractional result
macro_rules! div_ceil {
    ($x:expr, $y:expr) => { ($x + $y - 1) / $y }
}

// Guards against allocating for absurd counts read from a corrupt image
const MAX_PREALLOC: usize = 1 << 16;
const MAX_SYMLINK_LEN: u32 = 1 << 16;

// A directory header never covers more than this many entries
const MAX_DIR_RUN: u32 = 256;

/// An opaque reference value that locates an inode inside the inode table: the offset of the
/// metadata block in the upper bits and the offset within that block in the lower 16.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryReference {
    val: u64
}

impl EntryReference {
    pub fn new(location: u64, offset: u16) -> Self {
        Self {
            val: (location << 16) | u64::from(offset),
        }
    }

    pub fn location(&self) -> u64 {
        self.val >> 16
    }

    pub fn offset(&self) -> u16 {
        (self.val & 0xFFFF) as u16
    }

    pub(crate) fn read<R>(r: &mut R) -> Result<Self>
    where R: Read
    {
        Ok(Self {
            val: r.read_u64::<LittleEndian>()?
        })
    }
}

impl Debug for EntryReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.location(), self.offset())
    }
}

pub(crate) trait FromBytes {
    const BYTE_SIZE: usize;
    fn from_bytes(buf: &[u8]) -> Self;
}

impl FromBytes for u32 {
    const BYTE_SIZE: usize = 4;
    fn from_bytes(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

/// Location of a fragment block, which packs the tail ends of several files
#[derive(Debug, Clone, Copy)]
pub struct FragmentEntry {
    pub start: u64,
    /// Size word in the same format as a data block size
    pub size: u32,
}

impl FromBytes for FragmentEntry {
    const BYTE_SIZE: usize = 16;
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            start: LittleEndian::read_u64(&buf[0..8]),
            size: LittleEndian::read_u32(&buf[8..12]),
        }
    }
}

/// Read a lookup table: a list of u64 metadata block addresses at `table_offset`, followed by
/// the packed entries those blocks hold.
pub(crate) fn read_lookup_table<I: FromBytes>(cache: &MetadataCache, source: &dyn ReadAt, table_offset: u64, count: u32)
    -> Result<Vec<I>>
{
    let count = count as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let per_block = METADATA_BLOCK_SIZE / I::BYTE_SIZE;
    let block_count = div_ceil!(count, per_block);

    let mut pointers = vec![0; block_count * 8];
    source.read_exact_at(&mut pointers, table_offset)?;

    let mut entries = Vec::with_capacity(count.min(MAX_PREALLOC));
    for pointer in pointers.chunks_exact(8) {
        let block = cache.block(LittleEndian::read_u64(pointer))?;
        for raw in block.data.chunks_exact(I::BYTE_SIZE) {
            if entries.len() == count {
                break;
            }
            entries.push(I::from_bytes(raw));
        }
    }
    if entries.len() != count {
        return Err(Error::Corrupt(format!(
            "lookup table at {table_offset} holds {} of {count} entries", entries.len())));
    }
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum InodeType {
    BasicDir = 1,
    BasicFile = 2,
    BasicSymlink = 3,
    BasicBlockDev = 4,
    BasicCharDev = 5,
    BasicNamedPipe = 6,
    BasicSocket = 7,
    ExtDir = 8,
    ExtFile = 9,
    ExtSymlink = 10,
    ExtBlockDev = 11,
    ExtCharDev = 12,
    ExtNamedPipe = 13,
    ExtSocket = 14,
}

impl InodeType {
    fn parse(tag: u16) -> Result<Self> {
        InodeType::try_from(tag).map_err(|_| Error::Corrupt(format!("unknown inode type {tag}")))
    }

    pub fn kind(self) -> FileKind {
        match self {
            InodeType::BasicDir | InodeType::ExtDir => FileKind::Directory,
            InodeType::BasicFile | InodeType::ExtFile => FileKind::File,
            InodeType::BasicSymlink | InodeType::ExtSymlink => FileKind::Symlink,
            InodeType::BasicBlockDev | InodeType::ExtBlockDev => FileKind::BlockDevice,
            InodeType::BasicCharDev | InodeType::ExtCharDev => FileKind::CharDevice,
            InodeType::BasicNamedPipe | InodeType::ExtNamedPipe => FileKind::Fifo,
            InodeType::BasicSocket | InodeType::ExtSocket => FileKind::Socket,
        }
    }
}

/// The kind of filesystem object, without the basic/extended distinction of the on-disk format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// File type bits as used in `st_mode`
    pub fn mode_bits(self) -> u16 {
        match self {
            FileKind::Fifo => 0o010000,
            FileKind::CharDevice => 0o020000,
            FileKind::Directory => 0o040000,
            FileKind::BlockDevice => 0o060000,
            FileKind::File => 0o100000,
            FileKind::Symlink => 0o120000,
            FileKind::Socket => 0o140000,
        }
    }
}

/// Information about an object in the filesystem (ex. file, directory, device node)
#[derive(Debug, Clone)]
pub struct Inode {
    inode_type: InodeType,
    permissions: u16,
    uid_index: u16,
    gid_index: u16,
    mtime: u32,
    inode_number: u32,
    pub data: InodeData,
}

/// Type-specific information about a filesystem object. Basic and extended inodes decode into
/// the same variants.
#[derive(Debug, Clone)]
pub enum InodeData {
    Dir(DirInfo),
    File(FileInfo),
    Symlink(SymlinkInfo),
    Device(DeviceInfo),
    Ipc(IpcInfo),
}

/// Where a directory's listing lives in the directory table
#[derive(Debug, Clone)]
pub struct DirInfo {
    pub block_index: u32,
    pub block_offset: u16,
    /// Listing size plus three, as stored on disk
    pub file_size: u32,
    pub link_count: u32,
    pub parent_inode: u32,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub blocks_start: u64,
    pub file_size: u64,
    pub frag_index: u32,
    pub block_offset: u32,
    pub block_sizes: Vec<u32>,
}

impl FileInfo {
    pub fn has_fragment(&self) -> bool {
        self.frag_index != u32::MAX
    }

    /// Bytes of the file stored in the fragment block
    pub fn tail_len(&self, block_size: u32) -> u64 {
        if self.has_fragment() {
            self.file_size % u64::from(block_size)
        } else {
            0
        }
    }

    /// Bytes of the file stored in full data blocks
    pub fn blocks_len(&self, block_size: u32) -> u64 {
        self.file_size - self.tail_len(block_size)
    }
}

#[derive(Debug, Clone)]
pub struct SymlinkInfo {
    pub link_count: u32,
    pub target: OsString,
}

impl SymlinkInfo {
    pub fn target_path(&self) -> PathBuf {
        PathBuf::from(&self.target)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub link_count: u32,
    pub dev_number: u32,
}

impl DeviceInfo {
    pub fn major(&self) -> u32 {
        self.dev_number >> 8
    }

    pub fn minor(&self) -> u32 {
        self.dev_number & 0xFF
    }
}

#[derive(Debug, Clone)]
pub struct IpcInfo {
    pub link_count: u32,
}

impl Inode {
    pub(crate) fn read<R>(r: &mut R, block_size: u32) -> Result<Self>
    where R: Read
    {
        let inode_type = InodeType::parse(r.read_u16::<LittleEndian>()?)?;
        let permissions = r.read_u16::<LittleEndian>()?;
        let uid_index = r.read_u16::<LittleEndian>()?;
        let gid_index = r.read_u16::<LittleEndian>()?;
        let mtime = r.read_u32::<LittleEndian>()?;
        let inode_number = r.read_u32::<LittleEndian>()?;
        let data = match inode_type {
            InodeType::BasicDir => {
                let block_index = r.read_u32::<LittleEndian>()?;
                let link_count = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u16::<LittleEndian>()?.into();
                let block_offset = r.read_u16::<LittleEndian>()?;
                let parent_inode = r.read_u32::<LittleEndian>()?;
                InodeData::Dir(DirInfo { block_index, block_offset, file_size, link_count, parent_inode })
            },
            InodeType::ExtDir => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?;
                let block_index = r.read_u32::<LittleEndian>()?;
                let parent_inode = r.read_u32::<LittleEndian>()?;
                let _index_count = r.read_u16::<LittleEndian>()?;
                let block_offset = r.read_u16::<LittleEndian>()?;
                let _xattr_index = r.read_u32::<LittleEndian>()?;
                InodeData::Dir(DirInfo { block_index, block_offset, file_size, link_count, parent_inode })
            },
            InodeType::BasicFile => {
                let blocks_start = r.read_u32::<LittleEndian>()?.into();
                let frag_index = r.read_u32::<LittleEndian>()?;
                let block_offset = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?.into();
                let block_sizes = read_block_sizes(r, file_size, frag_index, block_size)?;
                InodeData::File(FileInfo { blocks_start, file_size, frag_index, block_offset, block_sizes })
            },
            InodeType::ExtFile => {
                let blocks_start = r.read_u64::<LittleEndian>()?;
                let file_size = r.read_u64::<LittleEndian>()?;
                let _sparse = r.read_u64::<LittleEndian>()?;
                let _link_count = r.read_u32::<LittleEndian>()?;
                let frag_index = r.read_u32::<LittleEndian>()?;
                let block_offset = r.read_u32::<LittleEndian>()?;
                let _xattr_index = r.read_u32::<LittleEndian>()?;
                let block_sizes = read_block_sizes(r, file_size, frag_index, block_size)?;
                InodeData::File(FileInfo { blocks_start, file_size, frag_index, block_offset, block_sizes })
            },
            InodeType::BasicSymlink | InodeType::ExtSymlink => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let target_size = r.read_u32::<LittleEndian>()?;
                if target_size > MAX_SYMLINK_LEN {
                    return Err(Error::Corrupt(format!("symlink target of {target_size} bytes")));
                }
                let mut target = vec![0; target_size as usize];
                r.read_exact(&mut target)?;
                // The extended form carries an xattr index that is not used here
                InodeData::Symlink(SymlinkInfo { link_count, target: os_string(target) })
            },
            InodeType::BasicBlockDev | InodeType::BasicCharDev
            | InodeType::ExtBlockDev | InodeType::ExtCharDev => {
                InodeData::Device(DeviceInfo {
                    link_count: r.read_u32::<LittleEndian>()?,
                    dev_number: r.read_u32::<LittleEndian>()?,
                })
            },
            InodeType::BasicNamedPipe | InodeType::BasicSocket
            | InodeType::ExtNamedPipe | InodeType::ExtSocket => {
                InodeData::Ipc(IpcInfo {
                    link_count: r.read_u32::<LittleEndian>()?,
                })
            },
        };

        Ok(Self {
            inode_type, permissions, uid_index, gid_index, mtime, inode_number, data
        })
    }

    pub fn inode_type(&self) -> InodeType {
        self.inode_type
    }

    pub fn kind(&self) -> FileKind {
        self.inode_type.kind()
    }

    pub fn is_file(&self) -> bool {
        self.kind() == FileKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    pub fn permissions(&self) -> u16 {
        self.permissions
    }

    pub fn mode(&self) -> u16 {
        self.permissions | self.kind().mode_bits()
    }

    pub fn uid_index(&self) -> u16 {
        self.uid_index
    }

    pub fn gid_index(&self) -> u16 {
        self.gid_index
    }

    pub fn mtime(&self) -> u32 {
        self.mtime
    }

    /// Size as `stat` would report it: content length for files, target length for symlinks,
    /// the stored listing size for directories and zero for everything else.
    pub fn file_size(&self) -> u64 {
        match &self.data {
            InodeData::File(i) => i.file_size,
            InodeData::Dir(i) => i.file_size.into(),
            InodeData::Symlink(i) => i.target.len() as u64,
            InodeData::Device(_) | InodeData::Ipc(_) => 0,
        }
    }
}

fn read_block_sizes<R: Read>(r: &mut R, file_size: u64, frag_index: u32, block_size: u32) -> Result<Vec<u32>> {
    let block_size = u64::from(block_size);
    let num_blocks = if frag_index == u32::MAX {
        div_ceil!(file_size, block_size)
    } else {
        file_size / block_size
    };
    let num_blocks = usize::try_from(num_blocks)
        .map_err(|_| Error::Corrupt(format!("file of {file_size} bytes")))?;
    let mut block_sizes = Vec::with_capacity(num_blocks.min(MAX_PREALLOC));
    for _ in 0..num_blocks {
        block_sizes.push(r.read_u32::<LittleEndian>()?);
    }
    Ok(block_sizes)
}

#[cfg(unix)]
fn os_string(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn os_string(bytes: Vec<u8>) -> OsString {
    String::from_utf8_lossy(&bytes).into_owned().into()
}

/// A DirEntry, like in std::fs, represents a named inode-reference within a directory. For
/// example, a filename together with a reference to the file's inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: OsString,
    inode_ref: EntryReference,
    inode_number: u32,
    inode_type: InodeType,
}

impl DirEntry {
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn file_name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }

    pub fn inode_ref(&self) -> EntryReference {
        self.inode_ref
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    pub fn kind(&self) -> FileKind {
        self.inode_type.kind()
    }
}

/// Decode a directory listing. SquashFS splits a listing into runs that share an inode
/// metadata block and a base inode number; the runs are flattened here. `file_size` is the
/// size stored in the directory inode, which counts three bytes more than the listing.
pub(crate) fn read_directory<R: Read>(r: &mut R, file_size: u32) -> Result<Vec<DirEntry>> {
    let mut r = r.take(u64::from(file_size.saturating_sub(3)));
    let mut entries = Vec::new();
    while r.limit() > 0 {
        let count = r.read_u32::<LittleEndian>()? + 1;
        let start = r.read_u32::<LittleEndian>()?;
        let base_inode = r.read_u32::<LittleEndian>()?;
        if count > MAX_DIR_RUN {
            return Err(Error::Corrupt(format!("directory run of {count} entries")));
        }
        for _ in 0..count {
            let offset = r.read_u16::<LittleEndian>()?;
            let inode_offset = r.read_i16::<LittleEndian>()?;
            let inode_type = InodeType::parse(r.read_u16::<LittleEndian>()?)?;
            let name_size = usize::from(r.read_u16::<LittleEndian>()?) + 1;
            let mut name = vec![0; name_size];
            r.read_exact(&mut name)?;
            entries.push(DirEntry {
                name: os_string(name),
                inode_ref: EntryReference::new(start.into(), offset),
                inode_number: base_inode.wrapping_add_signed(inode_offset.into()),
                inode_type,
            });
        }
    }
    Ok(entries)
}
