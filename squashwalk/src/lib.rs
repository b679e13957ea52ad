//! Squashwalk reads SquashFS images and extracts them to disk. Data blocks can be decoded on a
//! pool of worker threads while still being written out in file order, and whole subtrees are
//! extracted in parallel.
//!
//! ## Feature Flags
//! Each compressor is behind its own feature, all enabled by default:
//! - `gzip`: zlib compressed images, via `flate2`
//! - `xz`: xz and lzma images, via `lzma-rs`
//! - `zstd`: zstd images, via `ruzstd`
//! - `lz4`: lz4 images, via `lz4_flex`
//!
//! Images using a compressor that was compiled out (or LZO, which is never supported) can still
//! be opened, but reading compressed blocks from them fails with
//! [`Error::UnsupportedCompressor`](squashfs::Error::UnsupportedCompressor).
//!
//! ## Usage Example
//! ```no_run
//! use std::io;
//! use squashwalk::squashfs::SquashFS;
//! fn unpack_etc() -> squashwalk::squashfs::Result<()> {
//!     // Open the SquashFS and take its root directory
//!     let root = SquashFS::open("rootfs.squashfs")?.root()?;
//!
//!     // List the contents of a directory
//!     let mut etc = root.open("/etc")?;
//!     for d in etc.read_dir(0)? {
//!         println!("{}", d.file_name())
//!     }
//!
//!     // Copy a file to stdout
//!     let group = root.open("/etc/group")?;
//!     group.write_to(&mut io::stdout().lock())?;
//!
//!     // Extract the whole directory below ./out
//!     etc.extract_to("out")?;
//!     Ok(())
//! }
//! ```

pub mod squashfs;
