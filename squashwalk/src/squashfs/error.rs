use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::superblock::Compressor;

/// Errors produced while reading or extracting a SquashFS image.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{compressor:?} block failed to decode: {reason}")]
    Decode { compressor: Compressor, reason: String },

    #[error("{0:?} compression is not supported by this build")]
    UnsupportedCompressor(Compressor),

    /// A sequential read ran past the last data block. `copied` bytes were
    /// still written to the front of the caller's buffer.
    #[error("read past the last data block ({copied} bytes copied)")]
    EndOfBlocks { copied: usize },

    #[error("offset {offset} is beyond the end of the content ({len} bytes)")]
    OutOfRange { offset: u64, len: u64 },

    #[error("{}: not a regular file", .0.display())]
    NotAFile(PathBuf),

    #[error("{}: not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{}: all directory entries have been returned", .0.display())]
    EndOfListing(PathBuf),

    #[error("{}: cannot resolve symlink target {}", .path.display(), .target.display())]
    UnresolvableSymlink { path: PathBuf, target: PathBuf },

    #[error("{}: symlink leads back into a directory being extracted", .0.display())]
    SymlinkLoop(PathBuf),

    #[error("{}: no mknod facility available for device nodes", .0.display())]
    NoMknodAvailable(PathBuf),

    #[error("{}: unsupported inode type {tag}", .path.display())]
    UnsupportedType { path: PathBuf, tag: u16 },

    #[error("{}: no such file or directory", .0.display())]
    NotFound(PathBuf),

    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// Failure on the extraction target rather than the image.
    #[error("{}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Recover an `Error` that was carried through an `io::Error`, as happens
    /// when one of the `Read` adapters is driven by `io::copy` or similar.
    pub(crate) fn from_io(e: io::Error) -> Error {
        if !e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(e);
        }
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(err)) => *err,
            _ => Error::Corrupt("wrapped error could not be recovered".to_string()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match e {
            Error::Io(inner) => return inner,
            Error::Write { ref source, .. } => source.kind(),
            Error::Decode { .. } | Error::Corrupt(_) => io::ErrorKind::InvalidData,
            Error::UnsupportedCompressor(_)
            | Error::UnsupportedType { .. }
            | Error::NoMknodAvailable(_) => io::ErrorKind::Unsupported,
            Error::EndOfBlocks { .. } => io::ErrorKind::UnexpectedEof,
            Error::OutOfRange { .. }
            | Error::NotAFile(_)
            | Error::NotADirectory(_)
            | Error::EndOfListing(_) => io::ErrorKind::InvalidInput,
            Error::NotFound(_) | Error::UnresolvableSymlink { .. } => io::ErrorKind::NotFound,
            Error::SymlinkLoop(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
