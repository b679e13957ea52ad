use std::env;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;

use super::error::{Error, Result};
use super::file::FileNode;
use super::metadata::{DirEntry, FileKind};
use super::path::MAX_SYMLINK_HOPS;

const COPY_BUF_SIZE: usize = 128 * 1024;

/// Where verbose extraction messages go
pub type LogSink = Arc<Mutex<dyn Write + Send>>;

/// The kind of special file handed to a [`Mknod`] implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
    Fifo,
}

impl DeviceKind {
    /// Type argument of the `mknod` command
    pub fn letter(self) -> char {
        match self {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
            DeviceKind::Fifo => 'p',
        }
    }
}

/// Creates device nodes and FIFOs during extraction. `numbers` holds the major and minor
/// numbers for devices and is `None` for FIFOs.
pub trait Mknod: Send + Sync {
    /// Returns whatever the tool printed, shown in verbose extraction output
    fn mknod(&self, path: &Path, kind: DeviceKind, numbers: Option<(u32, u32)>) -> io::Result<String>;
}

/// Creates special files by running an external `mknod` program
#[derive(Debug, Clone)]
pub struct MknodCommand {
    program: PathBuf,
}

impl MknodCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self { program: program.into() }
    }

    /// Look for `mknod` on `PATH`
    pub fn find() -> Option<Self> {
        let paths = env::var_os("PATH")?;
        env::split_paths(&paths)
            .map(|dir| dir.join("mknod"))
            .find(|candidate| candidate.is_file())
            .map(Self::new)
    }
}

impl Mknod for MknodCommand {
    fn mknod(&self, path: &Path, kind: DeviceKind, numbers: Option<(u32, u32)>) -> io::Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(path).arg(kind.letter().to_string());
        if let Some((major, minor)) = numbers {
            cmd.arg(major.to_string()).arg(minor.to_string());
        }
        let output = cmd.output()?;
        let mut printed = String::from_utf8_lossy(&output.stdout).into_owned();
        printed.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::Other, format!(
                "{} {}: {}", self.program.display(), output.status, printed.trim())));
        }
        Ok(printed)
    }
}

/// How [`FileNode::extract_with_options`] materializes a tree
#[derive(Clone)]
pub struct ExtractOptions {
    /// Destination for verbose messages; standard output when unset
    pub log_output: Option<LogSink>,
    /// Replace symlinks with a copy of what they point to
    pub dereference_symlinks: bool,
    /// Also extract the target of each symlink next to where the link expects it, so links
    /// out of an extracted subtree do not dangle
    pub unbreak_symlinks: bool,
    pub verbose: bool,
    /// Mode of created directories
    pub folder_perm: u32,
    /// Apply the permission bits stored in the image to extracted files and directories
    pub preserve_permissions: bool,
    /// Size of the extraction thread pool; 0 uses the available parallelism
    pub workers: usize,
    /// Used for device nodes and FIFOs. Without one they fail with
    /// [`Error::NoMknodAvailable`].
    pub mknod: Option<Arc<dyn Mknod>>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            log_output: None,
            dereference_symlinks: false,
            unbreak_symlinks: false,
            verbose: false,
            folder_perm: 0o755,
            preserve_permissions: false,
            workers: 0,
            mknod: MknodCommand::find().map(|m| Arc::new(m) as Arc<dyn Mknod>),
        }
    }
}

impl fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("log_output", &self.log_output.is_some())
            .field("dereference_symlinks", &self.dereference_symlinks)
            .field("unbreak_symlinks", &self.unbreak_symlinks)
            .field("verbose", &self.verbose)
            .field("folder_perm", &format_args!("{:#o}", self.folder_perm))
            .field("preserve_permissions", &self.preserve_permissions)
            .field("workers", &self.workers)
            .field("mknod", &self.mknod.is_some())
            .finish()
    }
}

impl FileNode {
    /// Extract this node into `folder` with the default options. A directory has its
    /// contents extracted into `folder`; anything else lands at `folder/<name>`.
    pub fn extract_to<P: AsRef<Path>>(&self, folder: P) -> Result<()> {
        self.extract_with_options(folder, &ExtractOptions::default())
    }

    /// Extract this node into `folder`. Directory entries are extracted concurrently; the
    /// first failure is returned once every entry has finished, and later failures are
    /// logged. Nothing already written is removed on failure.
    pub fn extract_with_options<P: AsRef<Path>>(&self, folder: P, options: &ExtractOptions) -> Result<()> {
        let workers = match options.workers {
            0 => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("squashwalk-extract-{index}"))
            .build()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        let folder = folder.as_ref();
        let folder = if folder.is_absolute() { folder.to_path_buf() } else { env::current_dir()?.join(folder) };
        // The folder standing in for the image root. Unbroken symlinks may not place
        // anything outside of it, so there is none if the image root would lie above `/`.
        let depth = match self.kind() {
            FileKind::Directory => self.path().components().count(),
            _ => self.path().components().count().saturating_sub(1),
        };
        let root = lexical_clean(&folder).and_then(|mut root| {
            for _ in 1..depth {
                if !root.pop() {
                    return None;
                }
            }
            Some(root)
        });

        let walker = Walker { options, root };
        debug!("extracting {} to {} on {workers} threads", self.path().display(), folder.display());
        pool.install(|| walker.extract_node(self, &folder, None, 0))
    }
}

// Inode numbers of the directories currently being extracted, innermost first
struct Lineage<'a> {
    inode_number: u32,
    parent: Option<&'a Lineage<'a>>,
}

impl Lineage<'_> {
    fn contains(&self, inode_number: u32) -> bool {
        let mut cur = Some(self);
        while let Some(l) = cur {
            if l.inode_number == inode_number {
                return true;
            }
            cur = l.parent;
        }
        false
    }
}

struct Walker<'a> {
    options: &'a ExtractOptions,
    root: Option<PathBuf>,
}

impl Walker<'_> {
    // `links` counts the symlinks replaced on the way to this node since the last directory
    fn extract_node(&self, node: &FileNode, folder: &Path, lineage: Option<&Lineage>, links: usize) -> Result<()> {
        self.create_folder(folder)?;
        let result = match node.kind() {
            FileKind::Directory => self.extract_dir(node, folder, lineage),
            FileKind::File => self.extract_file(node, folder),
            FileKind::Symlink => self.extract_symlink(node, folder, lineage, links),
            FileKind::BlockDevice | FileKind::CharDevice | FileKind::Fifo => self.extract_special(node, folder),
            FileKind::Socket => Err(Error::UnsupportedType {
                path: node.path(),
                tag: node.inode().inode_type().into(),
            }),
        };
        if let Err(e) = &result {
            if !matches!(node.kind(), FileKind::Directory) {
                self.note(format_args!("error extracting {}: {e}", node.path().display()));
            }
        }
        result
    }

    fn extract_dir(&self, node: &FileNode, folder: &Path, lineage: Option<&Lineage>) -> Result<()> {
        let entries = node.entries()?;
        let lineage = Lineage { inode_number: node.inode_number(), parent: lineage };
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(&DirEntry, Result<()>)>();

        rayon::scope(|s| {
            for entry in entries {
                let done_tx = done_tx.clone();
                let lineage = &lineage;
                s.spawn(move |_| {
                    let result = node.open_child(entry)
                        .and_then(|child| self.extract_child(child, folder, Some(lineage), 0));
                    let _ = done_tx.send((entry, result));
                });
            }
        });
        drop(done_tx);

        let mut first = None;
        for (entry, result) in done_rx.iter() {
            let Err(e) = result else { continue };
            if first.is_none() {
                first = Some(e);
            } else {
                warn!("{}: also failed: {e}", folder.join(entry.name()).display());
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Place `node` inside `folder`. A directory gets its own folder, created before anything
    // is extracted into it.
    fn extract_child(&self, node: FileNode, folder: &Path, lineage: Option<&Lineage>, links: usize) -> Result<()> {
        if node.kind() != FileKind::Directory {
            return self.extract_node(&node, folder, lineage, links);
        }
        if lineage.map_or(false, |l| l.contains(node.inode_number())) {
            return Err(Error::SymlinkLoop(node.path()));
        }
        let target = folder.join(node.name());
        self.create_folder(&target)?;
        self.extract_node(&node, &target, lineage, 0)?;
        if self.options.preserve_permissions {
            set_mode(&target, node.permissions())?;
        }
        Ok(())
    }

    fn extract_file(&self, node: &FileNode, folder: &Path) -> Result<()> {
        let path = folder.join(node.name());
        self.note(format_args!("{}", path.display()));
        let write_err = |source| Error::Write { path: path.clone(), source };

        // A stale symlink would send the data somewhere else
        if fs::symlink_metadata(&path).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            fs::remove_file(&path).map_err(write_err)?;
        }
        let mut out = File::create(&path).map_err(write_err)?;
        let mut stream = node.stream()?;
        let mut buf = vec![0; COPY_BUF_SIZE];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e)),
            };
            out.write_all(&buf[..n]).map_err(write_err)?;
        }

        if self.options.preserve_permissions {
            set_mode(&path, node.permissions())?;
        }
        Ok(())
    }

    fn extract_symlink(&self, node: &FileNode, folder: &Path, lineage: Option<&Lineage>, links: usize) -> Result<()> {
        let path = folder.join(node.name());
        let link = node.symlink_target()?;
        let unresolvable = || Error::UnresolvableSymlink { path: node.path(), target: link.clone() };

        if self.options.dereference_symlinks || self.options.unbreak_symlinks {
            if links >= MAX_SYMLINK_HOPS {
                return Err(unresolvable());
            }
            let target = node.resolve_symlink()?.ok_or_else(unresolvable)?;

            if self.options.dereference_symlinks {
                self.note(format_args!("{} (copy of {})", path.display(), target.path().display()));
                return self.extract_child(target.with_name(node.name()), folder, lineage, links + 1);
            }

            // Put the target where it lives in the image, which is also where the link finds
            // it once the symlinked directories on its way are extracted. Then make the link
            // as usual.
            let target_path = target.path();
            let parent = target_path.parent().unwrap_or_else(|| Path::new("/"));
            let location = self.root.as_ref()
                .zip(parent.strip_prefix("/").ok())
                .and_then(|(root, parent)| lexical_clean(&root.join(parent)))
                .filter(|loc| self.root.as_ref().map_or(false, |root| loc.starts_with(root)))
                .ok_or_else(unresolvable)?;
            self.create_folder(&location)?;
            self.extract_child(target, &location, lineage, links + 1)?;
        }

        self.note(format_args!("{} -> {}", path.display(), link.display()));
        make_symlink(&link, &path)
    }

    fn extract_special(&self, node: &FileNode, folder: &Path) -> Result<()> {
        let path = folder.join(node.name());
        let Some(mknod) = &self.options.mknod else {
            return Err(Error::NoMknodAvailable(node.path()));
        };
        let kind = match node.kind() {
            FileKind::CharDevice => DeviceKind::Char,
            FileKind::BlockDevice => DeviceKind::Block,
            _ => DeviceKind::Fifo,
        };
        self.note(format_args!("{} ({})", path.display(), kind.letter()));
        let printed = mknod.mknod(&path, kind, node.device_numbers())
            .map_err(|source| Error::Write { path: path.clone(), source })?;
        let printed = printed.trim();
        if !printed.is_empty() {
            self.note(format_args!("{}: {printed}", path.display()));
        }
        Ok(())
    }

    fn create_folder(&self, path: &Path) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.options.folder_perm);
        }
        builder.create(path).map_err(|source| Error::Write { path: path.to_path_buf(), source })
    }

    fn note(&self, args: fmt::Arguments<'_>) {
        debug!("{args}");
        if !self.options.verbose {
            return;
        }
        match &self.options.log_output {
            Some(sink) => {
                let _ = writeln!(sink.lock(), "{args}");
            },
            None => println!("{args}"),
        }
    }
}

// Normalize a path without touching the filesystem. Fails if `..` climbs above the start of
// a relative path or above the root of an absolute one.
fn lexical_clean(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {},
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            },
            Component::Normal(name) => {
                out.push(name);
                depth += 1;
            },
        }
    }
    Some(out)
}

fn make_symlink(link: &Path, path: &Path) -> Result<()> {
    let write_err = |source| Error::Write { path: path.to_path_buf(), source };
    match symlink(link, path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_file(path).map_err(write_err)?;
            symlink(link, path).map_err(write_err)
        },
        other => other.map_err(write_err),
    }
}

#[cfg(unix)]
fn symlink(link: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, path)
}

#[cfg(not(unix))]
fn symlink(_link: &Path, _path: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are only extracted on unix"))
}

#[cfg(unix)]
fn set_mode(path: &Path, permissions: u16) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(u32::from(permissions)))
        .map_err(|source| Error::Write { path: path.to_path_buf(), source })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _permissions: u16) -> Result<()> {
    Ok(())
}
