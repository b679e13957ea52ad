//! Pathname lookup inside an image.
//!
//! Lookups follow POSIX pathname resolution (Open Group Base Specifications, Section 4.13)
//! with one twist: the image has no notion of the host root, so `..` above the image root and,
//! for symlink targets, absolute paths do not resolve.
//! https://pubs.opengroup.org/onlinepubs/9699919799/basedefs/V1_chap04.html#tag_04_13

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use log::trace;

use super::catalog::Catalog;
use super::error::{Error, Result};
use super::file::{Crumb, FileNode};
use super::metadata::{FileKind, InodeData};

/// Symlinks followed during one lookup before giving up, matching Linux's MAXSYMLINKS
pub const MAX_SYMLINK_HOPS: usize = 40;

enum Step {
    Root,
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> VecDeque<Step> {
    path.components()
        .filter_map(|c| match c {
            Component::RootDir | Component::Prefix(_) => Some(Step::Root),
            Component::ParentDir => Some(Step::Parent),
            Component::Normal(name) => Some(Step::Name(name.to_os_string())),
            Component::CurDir => None,
        })
        .collect()
}

/// Walk `path` starting at the directory `start`.
///
/// Symlinks met in the middle of the path are followed; the last component is followed only
/// when `follow_last` is set. Absolute symlink targets restart at the image root when
/// `absolute_links` is set and fail the lookup otherwise. Anything that does not resolve
/// (a missing name, a non-directory in the middle, `..` above the root, too many symlinks)
/// yields `Ok(None)`; errors are reserved for failures to read the image.
pub(crate) fn resolve(catalog: &Arc<dyn Catalog>, start: Arc<Crumb>, path: &Path, absolute_links: bool, follow_last: bool)
    -> Result<Option<FileNode>>
{
    let mut current = start;
    let mut pending = steps(path);
    let mut hops = 0;
    while let Some(step) = pending.pop_front() {
        match step {
            Step::Root => current = current.top(),
            // "As a special case, in the root directory, dot-dot may refer to the root
            // directory itself." Not here: the root of an image is not the root of anything.
            Step::Parent => match current.parent.clone() {
                Some(parent) => current = parent,
                None => return Ok(None),
            },
            Step::Name(name) => {
                let dir = catalog.inode(current.inode_ref)?;
                let InodeData::Dir(info) = &dir.data else {
                    return Ok(None);
                };
                let Some(entry) = catalog.read_dir(info)?.into_iter().find(|e| e.name() == name) else {
                    trace!("{}: no entry {:?}", current.path().display(), name);
                    return Ok(None);
                };

                if entry.kind() != FileKind::Symlink || (pending.is_empty() && !follow_last) {
                    current = current.child(entry.name(), entry.inode_ref());
                    continue;
                }

                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Ok(None);
                }
                let link = catalog.inode(entry.inode_ref())?;
                let InodeData::Symlink(link) = &link.data else {
                    return Err(Error::Corrupt(format!(
                        "{}: listed as a symlink but its inode is not", entry.file_name())));
                };
                let target = link.target_path();
                if target.as_os_str().is_empty() || (target.is_absolute() && !absolute_links) {
                    return Ok(None);
                }
                // The target is relative to the directory holding the link, which is `current`
                for step in steps(&target).into_iter().rev() {
                    pending.push_front(step);
                }
            },
        }
    }
    FileNode::from_crumb(catalog.clone(), current).map(Some)
}

/// The absolute path `path` refers to once every symlink, including a final one, is
/// resolved. Relative paths start at `cwd`.
pub fn canonicalize<P: AsRef<Path>>(cwd: &FileNode, path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    // "A null pathname shall not be successfully resolved"
    if path.as_os_str().is_empty() {
        return Err(Error::NotFound(PathBuf::new()));
    }
    let start = if path.is_absolute() { cwd.crumb().top() } else { cwd.crumb().clone() };
    match resolve(cwd.catalog(), start, path, true, true)? {
        Some(node) => Ok(node.path()),
        None => Err(Error::NotFound(path.to_path_buf())),
    }
}
