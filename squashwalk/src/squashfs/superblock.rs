use std::io::Read;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::error::{Error, Result};
use super::metadata::EntryReference;

pub const MAGIC: u32 = 0x73717368;

/// Size of the on-disk superblock
pub const SUPERBLOCK_SIZE: usize = 96;

const MIN_BLOCK_SIZE: u32 = 4096;
const MAX_BLOCK_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: SuperblockFlags,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: EntryReference,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

bitflags! {
    pub struct SuperblockFlags: u16 {
        const INODES_UNCOMPRESSED = 0x0001;
        const DATABLOCKS_UNCOMPRESSED = 0x0002;
        const FRAGMENTS_UNCOMPRESSED = 0x0008;
        const FRAGMENTS_NOT_USED = 0x0010;
        const FRAGMENTS_ALWAYS_GENERATED = 0x0020;
        const DATA_DEDUPLICATED = 0x0040;
        const NFS_EXPORT_EXISTS = 0x0080;
        const XATTRS_UNCOMPRESSED = 0x0100;
        const NO_XATTRS = 0x0200;
        const COMPRESSOR_OPTIONS_PRESENT = 0x0400;
        const ID_TABLE_UNCOMPRESSED = 0x0800;
    }
}

/// Compression method tag. The numeric values are the SquashFS compressor ids; `None` is
/// never stored in a superblock and marks data that is kept as-is.
#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzo = 2,
    Lzma = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl Superblock {
    /// Parse and validate a superblock
    pub fn read<R>(r: &mut R) -> Result<Superblock>
    where R: Read
    {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(Error::Corrupt(format!("bad superblock magic {magic:#010x}")));
        }
        let inode_count = r.read_u32::<LittleEndian>()?;
        let mod_time = r.read_u32::<LittleEndian>()?;
        let block_size = r.read_u32::<LittleEndian>()?;
        let frag_count = r.read_u32::<LittleEndian>()?;
        let compressor_id = r.read_u16::<LittleEndian>()?;
        let compressor = match Compressor::try_from(compressor_id) {
            Ok(Compressor::None) | Err(_) => {
                return Err(Error::Corrupt(format!("unknown compressor id {compressor_id}")));
            }
            Ok(c) => c,
        };
        let sb = Superblock {
            magic,
            inode_count,
            mod_time,
            block_size,
            frag_count,
            compressor,
            block_log: r.read_u16::<LittleEndian>()?,
            flags: SuperblockFlags::from_bits_truncate(r.read_u16::<LittleEndian>()?),
            id_count: r.read_u16::<LittleEndian>()?,
            version_major: r.read_u16::<LittleEndian>()?,
            version_minor: r.read_u16::<LittleEndian>()?,
            root_inode: EntryReference::read(r)?,
            bytes_used: r.read_u64::<LittleEndian>()?,
            id_table: r.read_u64::<LittleEndian>()?,
            xattr_table: r.read_u64::<LittleEndian>()?,
            inode_table: r.read_u64::<LittleEndian>()?,
            dir_table: r.read_u64::<LittleEndian>()?,
            frag_table: r.read_u64::<LittleEndian>()?,
            export_table: r.read_u64::<LittleEndian>()?,
        };
        sb.validate()?;
        Ok(sb)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Superblock>
    {
        Superblock::read(&mut &b[..])
    }

    fn validate(&self) -> Result<()> {
        if (self.version_major, self.version_minor) != (4, 0) {
            return Err(Error::Corrupt(format!(
                "unsupported version {}.{}", self.version_major, self.version_minor)));
        }
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Error::Corrupt(format!("invalid block size {}", self.block_size)));
        }
        if u32::from(self.block_log) != self.block_size.trailing_zeros() {
            return Err(Error::Corrupt(format!(
                "block log {} does not match block size {}", self.block_log, self.block_size)));
        }
        Ok(())
    }

    pub fn has_fragments(&self) -> bool {
        self.frag_count > 0 && self.frag_table != u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn raw_superblock(compressor: u16, block_size: u32, block_log: u16, major: u16) -> Vec<u8> {
        let mut b = Vec::with_capacity(SUPERBLOCK_SIZE);
        b.write_u32::<LittleEndian>(MAGIC).unwrap();
        b.write_u32::<LittleEndian>(3).unwrap();
        b.write_u32::<LittleEndian>(1_700_000_000).unwrap();
        b.write_u32::<LittleEndian>(block_size).unwrap();
        b.write_u32::<LittleEndian>(0).unwrap();
        b.write_u16::<LittleEndian>(compressor).unwrap();
        b.write_u16::<LittleEndian>(block_log).unwrap();
        b.write_u16::<LittleEndian>(0x0200).unwrap();
        b.write_u16::<LittleEndian>(1).unwrap();
        b.write_u16::<LittleEndian>(major).unwrap();
        b.write_u16::<LittleEndian>(0).unwrap();
        b.write_u64::<LittleEndian>(0x0020_0010).unwrap();
        for v in [4096u64, 4000, u64::MAX, 200, 300, u64::MAX, u64::MAX] {
            b.write_u64::<LittleEndian>(v).unwrap();
        }
        assert_eq!(b.len(), SUPERBLOCK_SIZE);
        b
    }

    #[test]
    fn test_read_superblock() -> Result<()> {
        let sb = Superblock::from_bytes(&raw_superblock(1, 131072, 17, 4))?;
        assert_eq!(sb.magic, MAGIC);
        assert_eq!(sb.compressor, Compressor::Gzip);
        assert_eq!(sb.block_size, 131072);
        assert_eq!(sb.root_inode.location(), 0x20);
        assert_eq!(sb.root_inode.offset(), 0x10);
        assert!(sb.flags.contains(SuperblockFlags::NO_XATTRS));
        assert!(!sb.has_fragments());
        Ok(())
    }

    #[test]
    fn test_rejects_bad_superblocks() {
        let mut bad_magic = raw_superblock(1, 131072, 17, 4);
        bad_magic[0] = 0;
        assert!(matches!(Superblock::from_bytes(&bad_magic), Err(Error::Corrupt(_))));
        assert!(matches!(Superblock::from_bytes(&raw_superblock(9, 131072, 17, 4)), Err(Error::Corrupt(_))));
        assert!(matches!(Superblock::from_bytes(&raw_superblock(0, 131072, 17, 4)), Err(Error::Corrupt(_))));
        assert!(matches!(Superblock::from_bytes(&raw_superblock(1, 131072, 16, 4)), Err(Error::Corrupt(_))));
        assert!(matches!(Superblock::from_bytes(&raw_superblock(1, 1000, 10, 4)), Err(Error::Corrupt(_))));
        assert!(matches!(Superblock::from_bytes(&raw_superblock(1, 131072, 17, 3)), Err(Error::Corrupt(_))));
        assert!(matches!(Superblock::from_bytes(&raw_superblock(1, 131072, 17, 4)[..40]), Err(Error::Io(_))));
    }
}
