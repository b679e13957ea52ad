use std::cmp::min;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::catalog::Catalog;
use super::datareader::DataReader;
use super::error::{Error, Result};
use super::fullreader::FullReader;
use super::metadata::{DirEntry, EntryReference, FileInfo, FileKind, Inode, InodeData, InodeType};
use super::path;

/// One step of the chain from a node back to the root: the name a node was reached by and
/// where its inode lives. Only names and references are kept, never the nodes themselves.
#[derive(Debug)]
pub(crate) struct Crumb {
    pub name: OsString,
    pub inode_ref: EntryReference,
    pub parent: Option<Arc<Crumb>>,
}

impl Crumb {
    pub fn root(inode_ref: EntryReference) -> Arc<Crumb> {
        Arc::new(Crumb { name: OsString::new(), inode_ref, parent: None })
    }

    pub fn child(self: &Arc<Self>, name: &OsStr, inode_ref: EntryReference) -> Arc<Crumb> {
        Arc::new(Crumb { name: name.to_os_string(), inode_ref, parent: Some(self.clone()) })
    }

    pub fn top(self: &Arc<Self>) -> Arc<Crumb> {
        let mut crumb = self.clone();
        while let Some(parent) = crumb.parent.clone() {
            crumb = parent;
        }
        crumb
    }

    pub fn path(&self) -> PathBuf {
        let mut names = Vec::new();
        let mut crumb = Some(self);
        while let Some(c) = crumb {
            if c.parent.is_some() {
                names.push(c.name.as_os_str());
            }
            crumb = c.parent.as_deref();
        }
        let mut path = PathBuf::from("/");
        path.extend(names.iter().rev());
        path
    }
}

/// The `stat` view of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    pub inode_type: InodeType,
    pub permissions: u16,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub size: u64,
    pub inode_number: u32,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// Location of a file's tail end inside a fragment block
#[derive(Debug, Clone, Copy)]
struct Tail {
    index: u32,
    offset: usize,
    len: usize,
}

impl Tail {
    fn of(info: &FileInfo, block_size: u32) -> Option<Tail> {
        let len = info.tail_len(block_size) as usize;
        (len > 0).then(|| Tail { index: info.frag_index, offset: info.block_offset as usize, len })
    }

    fn load(&self, catalog: &dyn Catalog) -> Result<Vec<u8>> {
        let block = catalog.fragment_block(self.index)?;
        block.get(self.offset..self.offset + self.len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Corrupt(format!(
                "tail end {}+{} is outside fragment block {}", self.offset, self.len, self.index)))
    }
}

/// A sequential reader over the whole content of a file: its data blocks, then its tail end
pub struct FileStream {
    catalog: Arc<dyn Catalog>,
    blocks: io::Take<DataReader>,
    pending_tail: Option<Tail>,
    tail: Cursor<Vec<u8>>,
}

impl FileStream {
    fn new(catalog: Arc<dyn Catalog>, info: &FileInfo) -> Result<Self> {
        let bs = catalog.block_size();
        let reader = DataReader::new(catalog.source().clone(), catalog.compressor(), bs,
            info.blocks_start, &info.block_sizes)?;
        Ok(FileStream {
            blocks: reader.take(info.blocks_len(bs)),
            pending_tail: Tail::of(info, bs),
            tail: Cursor::new(Vec::new()),
            catalog,
        })
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.blocks.limit() > 0 {
            let n = self.blocks.read(buf)?;
            if n == 0 {
                return Err(Error::Corrupt("file data blocks end before the file does".to_string()).into());
            }
            return Ok(n);
        }
        if let Some(tail) = &self.pending_tail {
            self.tail = Cursor::new(tail.load(&*self.catalog)?);
            self.pending_tail = None;
        }
        self.tail.read(buf)
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("blocks", self.blocks.get_ref())
            .field("remaining", &self.blocks.limit())
            .field("pending_tail", &self.pending_tail)
            .finish()
    }
}

/// An entry in the filesystem tree together with its decoded inode.
///
/// Regular files can be read as a stream (`io::Read`), at arbitrary offsets
/// ([`FileNode::read_at`]) or copied out whole ([`FileNode::write_to`]). Directories list their
/// children through a cursor ([`FileNode::read_dir`]).
pub struct FileNode {
    catalog: Arc<dyn Catalog>,
    crumb: Arc<Crumb>,
    inode: Inode,
    uid: u32,
    gid: u32,
    stream: Option<FileStream>,
    full: Option<FullReader>,
    children: OnceLock<Vec<DirEntry>>,
    dirs_read: usize,
}

impl FileNode {
    pub(crate) fn root(catalog: Arc<dyn Catalog>) -> Result<FileNode> {
        let crumb = Crumb::root(catalog.root_ref());
        FileNode::from_crumb(catalog, crumb)
    }

    pub(crate) fn from_crumb(catalog: Arc<dyn Catalog>, crumb: Arc<Crumb>) -> Result<FileNode> {
        let inode = catalog.inode(crumb.inode_ref)?;
        let uid = catalog.id(inode.uid_index())?;
        let gid = catalog.id(inode.gid_index())?;
        let full = match &inode.data {
            InodeData::File(info) => {
                let bs = catalog.block_size();
                let reader = FullReader::new(catalog.source().clone(), catalog.compressor(), bs,
                    info.blocks_start, &info.block_sizes);
                Some(reader.with_len(info.blocks_len(bs)))
            },
            _ => None,
        };
        Ok(FileNode {
            catalog,
            crumb,
            inode,
            uid,
            gid,
            stream: None,
            full,
            children: OnceLock::new(),
            dirs_read: 0,
        })
    }

    pub(crate) fn crumb(&self) -> &Arc<Crumb> {
        &self.crumb
    }

    pub(crate) fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// The same node under another name, keeping its place in the tree. Used when a symlink
    /// is replaced by a copy of its target.
    pub(crate) fn with_name(self, name: &OsStr) -> FileNode {
        let crumb = Arc::new(Crumb {
            name: name.to_os_string(),
            inode_ref: self.crumb.inode_ref,
            parent: self.crumb.parent.clone(),
        });
        FileNode { crumb, ..self }
    }

    pub fn stat(&self) -> Metadata {
        Metadata {
            kind: self.inode.kind(),
            inode_type: self.inode.inode_type(),
            permissions: self.inode.permissions(),
            mode: self.inode.mode(),
            uid: self.uid,
            gid: self.gid,
            mtime: self.inode.mtime(),
            size: self.inode.file_size(),
            inode_number: self.inode.inode_number(),
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn kind(&self) -> FileKind {
        self.inode.kind()
    }

    pub fn inode_number(&self) -> u32 {
        self.inode.inode_number()
    }

    pub fn permissions(&self) -> u16 {
        self.inode.permissions()
    }

    /// Name the node was reached by; empty for the root
    pub fn name(&self) -> &OsStr {
        &self.crumb.name
    }

    /// Absolute path of the node inside the image, rebuilt from the names along the way
    pub fn path(&self) -> PathBuf {
        self.crumb.path()
    }

    fn file_info(&self) -> Result<&FileInfo> {
        match &self.inode.data {
            InodeData::File(info) => Ok(info),
            _ => Err(Error::NotAFile(self.path())),
        }
    }

    /// A fresh stream over the file content, independent of the node's own read position
    pub fn stream(&self) -> Result<FileStream> {
        FileStream::new(self.catalog.clone(), self.file_info()?)
    }

    /// Read file content at `offset` without moving the stream position. Reading at the end
    /// returns 0; past the end fails with [`Error::OutOfRange`].
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let info = self.file_info()?;
        if offset > info.file_size {
            return Err(Error::OutOfRange { offset, len: info.file_size });
        }
        let bs = self.catalog.block_size();
        let blocks_len = info.blocks_len(bs);
        let want = min(buf.len() as u64, info.file_size - offset) as usize;
        let buf = &mut buf[..want];

        let mut copied = 0;
        if offset < blocks_len && !buf.is_empty() {
            let n = min(want as u64, blocks_len - offset) as usize;
            if let Some(full) = &self.full {
                copied = full.read_at(&mut buf[..n], offset)?;
            }
        }
        if copied < want {
            if let Some(tail) = Tail::of(info, bs) {
                let data = tail.load(&*self.catalog)?;
                let from = (offset + copied as u64).checked_sub(blocks_len)
                    .ok_or_else(|| Error::Corrupt(format!("{}: data blocks are short", self.path().display())))?
                    as usize;
                let n = min(want - copied, data.len().saturating_sub(from));
                buf[copied..copied + n].copy_from_slice(&data[from..from + n]);
                copied += n;
            }
        }
        Ok(copied)
    }

    /// Copy the whole file to `sink`, decoding blocks in parallel. Returns the bytes written.
    pub fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> Result<u64> {
        let info = self.file_info()?;
        let mut written = match &self.full {
            Some(full) => full.write_to(sink)?,
            None => 0,
        };
        if let Some(tail) = Tail::of(info, self.catalog.block_size()) {
            let data = tail.load(&*self.catalog)?;
            sink.write_all(&data)?;
            written += data.len() as u64;
        }
        Ok(written)
    }

    /// The full directory listing, read once and kept. Does not move the `read_dir` cursor.
    pub fn entries(&self) -> Result<&[DirEntry]> {
        if let Some(children) = self.children.get() {
            return Ok(children);
        }
        let InodeData::Dir(info) = &self.inode.data else {
            return Err(Error::NotADirectory(self.path()));
        };
        let children = self.catalog.read_dir(info)?;
        Ok(self.children.get_or_init(|| children))
    }

    /// Return up to `n` directory entries past the ones already returned, or all remaining
    /// entries when `n` is 0. Once every entry has been returned, asking for more with `n > 0`
    /// fails with [`Error::EndOfListing`].
    pub fn read_dir(&mut self, n: usize) -> Result<Vec<DirEntry>> {
        let start = self.dirs_read;
        let entries = self.entries()?;
        if n > 0 && start >= entries.len() {
            return Err(Error::EndOfListing(self.path()));
        }
        let end = if n == 0 { entries.len() } else { min(entries.len(), start + n) };
        let batch = entries[start.min(end)..end].to_vec();
        self.dirs_read = end;
        Ok(batch)
    }

    pub fn open_child(&self, entry: &DirEntry) -> Result<FileNode> {
        let crumb = self.crumb.child(entry.name(), entry.inode_ref());
        FileNode::from_crumb(self.catalog.clone(), crumb)
    }

    /// Look up a node by path. Relative paths start at this node, absolute paths at the root
    /// of the image. Symlinks along the way are followed, but a symlink named by the last
    /// component is returned as is.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<FileNode> {
        let path = path.as_ref();
        let start = if path.is_absolute() { self.crumb.top() } else { self.crumb.clone() };
        path::resolve(&self.catalog, start, path, true, false)?
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    pub fn symlink_target(&self) -> Result<PathBuf> {
        match &self.inode.data {
            InodeData::Symlink(info) => Ok(info.target_path()),
            _ => Err(Error::NotFound(self.path())),
        }
    }

    /// Major and minor numbers of a block or character device
    pub fn device_numbers(&self) -> Option<(u32, u32)> {
        match &self.inode.data {
            InodeData::Device(info) => Some((info.major(), info.minor())),
            _ => None,
        }
    }

    /// Find the node a relative symlink points to, starting from the directory holding the
    /// link. Returns `None` for absolute targets, targets outside the image, dangling links
    /// and anything that is not a symlink.
    pub fn resolve_symlink(&self) -> Result<Option<FileNode>> {
        let InodeData::Symlink(info) = &self.inode.data else {
            return Ok(None);
        };
        let target = info.target_path();
        if target.as_os_str().is_empty() || target.is_absolute() {
            return Ok(None);
        }
        let Some(parent) = self.crumb.parent.clone() else {
            return Ok(None);
        };
        path::resolve(&self.catalog, parent, &target, false, false)
    }
}

impl Read for FileNode {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stream.is_none() {
            self.stream = Some(self.stream()?);
        }
        match &mut self.stream {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }
}

impl fmt::Debug for FileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileNode")
            .field("path", &self.path())
            .field("inode_ref", &self.crumb.inode_ref)
            .field("inode", &self.inode)
            .field("dirs_read", &self.dirs_read)
            .finish()
    }
}
