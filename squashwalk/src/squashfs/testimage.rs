//! Writes small SquashFS images in memory so tests can exercise the readers against real
//! on-disk layouts.

use std::collections::BTreeMap;

use byteorder::{LittleEndian, WriteBytesExt};

use super::block::{METADATA_BLOCK_SIZE, UNCOMPRESSED_BIT};
use super::superblock::{MAGIC, SUPERBLOCK_SIZE};

pub(crate) const UID: u32 = 1000;
pub(crate) const GID: u32 = 100;
pub(crate) const MTIME: u32 = 1_700_000_000;

#[derive(Debug, Clone)]
enum Node {
    Dir(BTreeMap<String, Node>),
    File { data: Vec<u8>, mode: u16 },
    Symlink(String),
    Device { char: bool, major: u32, minor: u32 },
    Fifo,
    Socket,
}

impl Node {
    fn count(&self) -> u32 {
        match self {
            Node::Dir(children) => 1 + children.values().map(Node::count).sum::<u32>(),
            _ => 1,
        }
    }

    fn basic_type(&self) -> u16 {
        match self {
            Node::Dir(_) => 1,
            Node::File { .. } => 2,
            Node::Symlink(_) => 3,
            Node::Device { char: false, .. } => 4,
            Node::Device { char: true, .. } => 5,
            Node::Fifo => 6,
            Node::Socket => 7,
        }
    }
}

/// Builder for an image. Paths are relative to the root; missing parent directories are
/// created along the way.
#[derive(Debug, Clone)]
pub(crate) struct ImageBuilder {
    block_size: u32,
    compressed: bool,
    fragments: bool,
    extended: bool,
    root: BTreeMap<String, Node>,
}

impl ImageBuilder {
    pub fn new(block_size: u32) -> Self {
        Self { block_size, compressed: false, fragments: false, extended: false, root: BTreeMap::new() }
    }

    /// zlib-compress data and metadata blocks where that makes them smaller
    pub fn compressed(mut self, yes: bool) -> Self {
        self.compressed = yes;
        self
    }

    /// Pack the tail ends of files into shared fragment blocks
    pub fn fragments(mut self, yes: bool) -> Self {
        self.fragments = yes;
        self
    }

    /// Write every inode in its extended form
    pub fn extended(mut self, yes: bool) -> Self {
        self.extended = yes;
        self
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.file_with_mode(path, data, 0o644)
    }

    pub fn file_with_mode(self, path: &str, data: &[u8], mode: u16) -> Self {
        self.insert(path, Node::File { data: data.to_vec(), mode })
    }

    pub fn dir(self, path: &str) -> Self {
        self.insert(path, Node::Dir(BTreeMap::new()))
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.insert(path, Node::Symlink(target.to_string()))
    }

    pub fn char_dev(self, path: &str, major: u32, minor: u32) -> Self {
        self.insert(path, Node::Device { char: true, major, minor })
    }

    pub fn block_dev(self, path: &str, major: u32, minor: u32) -> Self {
        self.insert(path, Node::Device { char: false, major, minor })
    }

    pub fn fifo(self, path: &str) -> Self {
        self.insert(path, Node::Fifo)
    }

    pub fn socket(self, path: &str) -> Self {
        self.insert(path, Node::Socket)
    }

    fn insert(mut self, path: &str, node: Node) -> Self {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let name = parts.pop().expect("path needs a name");
        let mut dir = &mut self.root;
        for part in parts {
            dir = match dir.entry(part.to_string()).or_insert_with(|| Node::Dir(BTreeMap::new())) {
                Node::Dir(children) => children,
                _ => panic!("{part} is not a directory"),
            };
        }
        let keep_existing = matches!(node, Node::Dir(_)) && matches!(dir.get(name), Some(Node::Dir(_)));
        if !keep_existing {
            dir.insert(name.to_string(), node);
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut w = Writer {
            block_size: self.block_size,
            compressed: self.compressed,
            fragments: self.fragments,
            extended: self.extended,
            out: vec![0; SUPERBLOCK_SIZE],
            inodes: MetaWriter::new(self.compressed),
            dirs: MetaWriter::new(self.compressed),
            frag_entries: Vec::new(),
            frag_buf: Vec::new(),
        };
        let root = Node::Dir(self.root.clone());
        let inode_count = root.count();
        let (root_block, root_offset) = w.write_node(&root, 1, inode_count + 1);
        w.flush_fragment();

        let inodes = std::mem::replace(&mut w.inodes, MetaWriter::new(false));
        let dirs = std::mem::replace(&mut w.dirs, MetaWriter::new(false));
        let inode_table = w.out.len() as u64;
        w.out.extend_from_slice(&inodes.finish().0);
        let dir_table = w.out.len() as u64;
        w.out.extend_from_slice(&dirs.finish().0);

        let frag_count = w.frag_entries.len() as u32;
        let frag_table = if w.frag_entries.is_empty() {
            u64::MAX
        } else {
            let mut table = MetaWriter::new(self.compressed);
            for (start, size) in w.frag_entries.clone() {
                let mut entry = Vec::new();
                entry.write_u64::<LittleEndian>(start).unwrap();
                entry.write_u32::<LittleEndian>(size).unwrap();
                entry.write_u32::<LittleEndian>(0).unwrap();
                table.write(&entry);
            }
            w.lookup_table(table)
        };

        let mut ids = MetaWriter::new(self.compressed);
        for id in [UID, GID] {
            ids.write(&id.to_le_bytes());
        }
        let id_table = w.lookup_table(ids);

        let mut flags = 0x0200u16;
        if !self.compressed {
            flags |= 0x0001 | 0x0002 | 0x0008;
        }
        if !self.fragments {
            flags |= 0x0010;
        }

        let mut sb = Vec::with_capacity(SUPERBLOCK_SIZE);
        sb.write_u32::<LittleEndian>(MAGIC).unwrap();
        sb.write_u32::<LittleEndian>(inode_count).unwrap();
        sb.write_u32::<LittleEndian>(MTIME).unwrap();
        sb.write_u32::<LittleEndian>(self.block_size).unwrap();
        sb.write_u32::<LittleEndian>(frag_count).unwrap();
        sb.write_u16::<LittleEndian>(1).unwrap();
        sb.write_u16::<LittleEndian>(self.block_size.trailing_zeros() as u16).unwrap();
        sb.write_u16::<LittleEndian>(flags).unwrap();
        sb.write_u16::<LittleEndian>(2).unwrap();
        sb.write_u16::<LittleEndian>(4).unwrap();
        sb.write_u16::<LittleEndian>(0).unwrap();
        sb.write_u64::<LittleEndian>((u64::from(root_block) << 16) | u64::from(root_offset)).unwrap();
        sb.write_u64::<LittleEndian>(w.out.len() as u64).unwrap();
        for table in [id_table, u64::MAX, inode_table, dir_table, frag_table, u64::MAX] {
            sb.write_u64::<LittleEndian>(table).unwrap();
        }
        w.out[..SUPERBLOCK_SIZE].copy_from_slice(&sb);
        w.out
    }
}

fn zlib(data: &[u8]) -> Option<Vec<u8>> {
    #[cfg(feature = "flate2")]
    {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        enc.write_all(data).ok()?;
        enc.finish().ok()
    }
    #[cfg(not(feature = "flate2"))]
    {
        let _ = data;
        None
    }
}

// Accumulates metadata and cuts it into 8K blocks
struct MetaWriter {
    compressed: bool,
    out: Vec<u8>,
    pending: Vec<u8>,
    starts: Vec<u64>,
}

impl MetaWriter {
    fn new(compressed: bool) -> Self {
        Self { compressed, out: Vec::new(), pending: Vec::new(), starts: Vec::new() }
    }

    // Block start relative to the table, and offset within the block
    fn position(&self) -> (u32, u16) {
        (self.out.len() as u32, self.pending.len() as u16)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= METADATA_BLOCK_SIZE {
            let rest = self.pending.split_off(METADATA_BLOCK_SIZE);
            let block = std::mem::replace(&mut self.pending, rest);
            self.flush_block(&block);
        }
    }

    fn flush_block(&mut self, block: &[u8]) {
        self.starts.push(self.out.len() as u64);
        if self.compressed {
            if let Some(packed) = zlib(block).filter(|p| p.len() < block.len()) {
                self.out.write_u16::<LittleEndian>(packed.len() as u16).unwrap();
                self.out.extend_from_slice(&packed);
                return;
            }
        }
        self.out.write_u16::<LittleEndian>(block.len() as u16 | 0x8000).unwrap();
        self.out.extend_from_slice(block);
    }

    fn finish(mut self) -> (Vec<u8>, Vec<u64>) {
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.flush_block(&block);
        }
        (self.out, self.starts)
    }
}

struct Listed {
    name: String,
    block: u32,
    offset: u16,
    number: u32,
    kind: u16,
}

struct Writer {
    block_size: u32,
    compressed: bool,
    fragments: bool,
    extended: bool,
    out: Vec<u8>,
    inodes: MetaWriter,
    dirs: MetaWriter,
    frag_entries: Vec<(u64, u32)>,
    frag_buf: Vec<u8>,
}

impl Writer {
    fn header(&self, b: &mut Vec<u8>, basic_type: u16, mode: u16, number: u32) {
        let inode_type = if self.extended { basic_type + 7 } else { basic_type };
        b.write_u16::<LittleEndian>(inode_type).unwrap();
        b.write_u16::<LittleEndian>(mode).unwrap();
        b.write_u16::<LittleEndian>(0).unwrap();
        b.write_u16::<LittleEndian>(1).unwrap();
        b.write_u32::<LittleEndian>(MTIME).unwrap();
        b.write_u32::<LittleEndian>(number).unwrap();
    }

    // Write a node and everything below it, children before parents. Returns the inode's
    // position in the inode table.
    fn write_node(&mut self, node: &Node, number: u32, parent: u32) -> (u32, u16) {
        let mut b = Vec::new();
        match node {
            Node::Dir(children) => {
                let mut listing = Vec::new();
                let mut next = number + 1;
                for (name, child) in children {
                    let (block, offset) = self.write_node(child, next, number);
                    listing.push(Listed { name: name.clone(), block, offset, number: next, kind: child.basic_type() });
                    next += child.count();
                }
                let (block_index, block_offset) = self.dirs.position();
                let bytes = encode_listing(&listing);
                self.dirs.write(&bytes);
                let file_size = bytes.len() as u32 + 3;
                let links = 2 + children.values().filter(|c| matches!(c, Node::Dir(_))).count() as u32;

                self.header(&mut b, 1, 0o755, number);
                if self.extended {
                    b.write_u32::<LittleEndian>(links).unwrap();
                    b.write_u32::<LittleEndian>(file_size).unwrap();
                    b.write_u32::<LittleEndian>(block_index).unwrap();
                    b.write_u32::<LittleEndian>(parent).unwrap();
                    b.write_u16::<LittleEndian>(0).unwrap();
                    b.write_u16::<LittleEndian>(block_offset).unwrap();
                    b.write_u32::<LittleEndian>(u32::MAX).unwrap();
                } else {
                    b.write_u32::<LittleEndian>(block_index).unwrap();
                    b.write_u32::<LittleEndian>(links).unwrap();
                    b.write_u16::<LittleEndian>(file_size as u16).unwrap();
                    b.write_u16::<LittleEndian>(block_offset).unwrap();
                    b.write_u32::<LittleEndian>(parent).unwrap();
                }
            },
            Node::File { data, mode } => {
                let (start, sizes, frag) = self.write_data(data);
                let (frag_index, frag_offset) = frag.unwrap_or((u32::MAX, 0));
                self.header(&mut b, 2, *mode, number);
                if self.extended {
                    b.write_u64::<LittleEndian>(start).unwrap();
                    b.write_u64::<LittleEndian>(data.len() as u64).unwrap();
                    b.write_u64::<LittleEndian>(0).unwrap();
                    b.write_u32::<LittleEndian>(1).unwrap();
                    b.write_u32::<LittleEndian>(frag_index).unwrap();
                    b.write_u32::<LittleEndian>(frag_offset).unwrap();
                    b.write_u32::<LittleEndian>(u32::MAX).unwrap();
                } else {
                    b.write_u32::<LittleEndian>(start as u32).unwrap();
                    b.write_u32::<LittleEndian>(frag_index).unwrap();
                    b.write_u32::<LittleEndian>(frag_offset).unwrap();
                    b.write_u32::<LittleEndian>(data.len() as u32).unwrap();
                }
                for size in sizes {
                    b.write_u32::<LittleEndian>(size).unwrap();
                }
            },
            Node::Symlink(target) => {
                self.header(&mut b, 3, 0o777, number);
                b.write_u32::<LittleEndian>(1).unwrap();
                b.write_u32::<LittleEndian>(target.len() as u32).unwrap();
                b.extend_from_slice(target.as_bytes());
                if self.extended {
                    b.write_u32::<LittleEndian>(u32::MAX).unwrap();
                }
            },
            Node::Device { major, minor, .. } => {
                self.header(&mut b, node.basic_type(), 0o600, number);
                b.write_u32::<LittleEndian>(1).unwrap();
                b.write_u32::<LittleEndian>((major << 8) | (minor & 0xFF)).unwrap();
                if self.extended {
                    b.write_u32::<LittleEndian>(u32::MAX).unwrap();
                }
            },
            Node::Fifo | Node::Socket => {
                self.header(&mut b, node.basic_type(), 0o644, number);
                b.write_u32::<LittleEndian>(1).unwrap();
                if self.extended {
                    b.write_u32::<LittleEndian>(u32::MAX).unwrap();
                }
            },
        }
        let position = self.inodes.position();
        self.inodes.write(&b);
        position
    }

    fn write_data(&mut self, data: &[u8]) -> (u64, Vec<u32>, Option<(u32, u32)>) {
        let bs = self.block_size as usize;
        let split = if self.fragments { data.len() - data.len() % bs } else { data.len() };
        let (body, tail) = data.split_at(split);
        let start = self.out.len() as u64;
        let mut sizes = Vec::new();
        for chunk in body.chunks(bs) {
            let size = if chunk.iter().all(|b| *b == 0) { 0 } else { self.write_block(chunk) };
            sizes.push(size);
        }
        let frag = (!tail.is_empty()).then(|| self.add_tail(tail));
        (start, sizes, frag)
    }

    fn write_block(&mut self, chunk: &[u8]) -> u32 {
        if self.compressed {
            if let Some(packed) = zlib(chunk).filter(|p| p.len() < chunk.len()) {
                self.out.extend_from_slice(&packed);
                return packed.len() as u32;
            }
        }
        self.out.extend_from_slice(chunk);
        chunk.len() as u32 | UNCOMPRESSED_BIT
    }

    fn add_tail(&mut self, tail: &[u8]) -> (u32, u32) {
        if self.frag_buf.len() + tail.len() > self.block_size as usize {
            self.flush_fragment();
        }
        let offset = self.frag_buf.len() as u32;
        self.frag_buf.extend_from_slice(tail);
        (self.frag_entries.len() as u32, offset)
    }

    fn flush_fragment(&mut self) {
        if self.frag_buf.is_empty() {
            return;
        }
        let buf = std::mem::take(&mut self.frag_buf);
        let start = self.out.len() as u64;
        let size = self.write_block(&buf);
        self.frag_entries.push((start, size));
    }

    // Append a lookup table's metadata blocks and then the list of pointers to them. Returns
    // the position of the pointer list.
    fn lookup_table(&mut self, table: MetaWriter) -> u64 {
        let (bytes, starts) = table.finish();
        let base = self.out.len() as u64;
        self.out.extend_from_slice(&bytes);
        let pointers = self.out.len() as u64;
        for start in starts {
            self.out.write_u64::<LittleEndian>(base + start).unwrap();
        }
        pointers
    }
}

// Split a listing into runs that share an inode block and stay within the reach of a 16-bit
// inode number delta
fn encode_listing(entries: &[Listed]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let first = &entries[i];
        let mut j = i;
        while j < entries.len()
            && j - i < 256
            && entries[j].block == first.block
            && (i64::from(entries[j].number) - i64::from(first.number)).abs() < 0x7FFF
        {
            j += 1;
        }
        out.write_u32::<LittleEndian>((j - i - 1) as u32).unwrap();
        out.write_u32::<LittleEndian>(first.block).unwrap();
        out.write_u32::<LittleEndian>(first.number).unwrap();
        for e in &entries[i..j] {
            out.write_u16::<LittleEndian>(e.offset).unwrap();
            out.write_i16::<LittleEndian>((i64::from(e.number) - i64::from(first.number)) as i16).unwrap();
            out.write_u16::<LittleEndian>(e.kind).unwrap();
            out.write_u16::<LittleEndian>((e.name.len() - 1) as u16).unwrap();
            out.extend_from_slice(e.name.as_bytes());
        }
        i = j;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squashfs::error::Result;
    use crate::squashfs::squashfs::SquashFS;
    use crate::squashfs::superblock::SuperblockFlags;
    use std::io::Read;

    #[test]
    fn test_extended_inodes_read_like_basic_ones() -> Result<()> {
        for extended in [false, true] {
            let root = SquashFS::new(ImageBuilder::new(8192)
                .extended(extended)
                .fragments(true)
                .file("a/b/c.txt", &[7; 10000])
                .symlink("a/link", "b/c.txt")
                .char_dev("a/tty", 4, 64)
                .build())?
                .root()?;
            let mut c = root.open("a/b/c.txt")?;
            assert_eq!(c.stat().size, 10000);
            let mut data = Vec::new();
            c.read_to_end(&mut data)?;
            assert_eq!(data, vec![7; 10000]);
            assert_eq!(root.open("a/link")?.symlink_target()?, std::path::PathBuf::from("b/c.txt"));
            assert_eq!(root.open("a/tty")?.device_numbers(), Some((4, 64)));
        }
        Ok(())
    }

    #[test]
    fn test_superblock_of_built_image() -> Result<()> {
        let sqfs = SquashFS::new(ImageBuilder::new(4096).file("x", b"y").build())?;
        let sb = sqfs.superblock();
        assert_eq!(sb.inode_count, 2);
        assert_eq!(sb.block_log, 12);
        assert!(sb.flags.contains(SuperblockFlags::FRAGMENTS_NOT_USED | SuperblockFlags::NO_XATTRS));
        Ok(())
    }
}
