use std::fmt::Display;
#[cfg(feature = "lzma-rs")]
use std::io::{self, Cursor, Write};
#[cfg(feature = "ruzstd")]
use std::io::Read;

#[cfg(feature = "lzma-rs")]
use byteorder::{BigEndian, ReadBytesExt};

#[cfg(feature = "flate2")]
use flate2::{Decompress, FlushDecompress, Status};

#[cfg(feature = "ruzstd")]
use ruzstd::decoding::StreamingDecoder;

use super::error::{Error, Result};
use super::superblock::Compressor;

impl Compressor {
    /// Decompress one complete block. The output may not exceed `max_size` bytes; a larger
    /// result means the block is corrupt.
    ///
    /// Every call is independent, so the same `Compressor` may be used from many threads.
    pub fn decompress(self, input: &[u8], max_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compressor::None => input.to_vec(),
            #[cfg(feature = "flate2")]
            Compressor::Gzip => {
                // Decompress in one shot so a truncated stream is reported instead of
                // yielding a short block. The spare byte lets an oversized stream show up in
                // the length check below.
                let mut out = Vec::with_capacity(max_size + 1);
                let mut z = Decompress::new(true);
                let status = z.decompress_vec(input, &mut out, FlushDecompress::Finish)
                    .map_err(|e| self.decode_error(e))?;
                if status != Status::StreamEnd {
                    return Err(self.decode_error("stream truncated or larger than a block"));
                }
                out
            },
            #[cfg(feature = "lzma-rs")]
            Compressor::Lzma => {
                // The dictionary grows with the output, so the memory limit also caps the
                // output of streams whose dictionary is larger than a block
                let options = lzma_rs::decompress::Options {
                    memlimit: Some(max_size + 1),
                    ..Default::default()
                };
                let mut out = BoundedWriter::new(max_size);
                lzma_rs::lzma_decompress_with_options(&mut &input[..], &mut out, &options)
                    .map_err(|e| self.decode_error(e))?;
                out.buf
            },
            #[cfg(feature = "lzma-rs")]
            Compressor::Xz => {
                // The xz decoder buffers a whole xz block before writing any of it, so the
                // sizes declared by the LZMA2 chunk headers are checked first
                let declared = xz_unpacked_size(input)
                    .ok_or_else(|| self.decode_error("malformed xz container"))?;
                if declared > max_size as u64 {
                    return Err(self.decode_error(format_args!(
                        "{} bytes declared, limit is {}", declared, max_size)));
                }
                let mut out = BoundedWriter::new(max_size);
                lzma_rs::xz_decompress(&mut &input[..], &mut out)
                    .map_err(|e| self.decode_error(e))?;
                out.buf
            },
            #[cfg(feature = "lz4_flex")]
            Compressor::Lz4 => {
                lz4_flex::block::decompress(input, max_size)
                    .map_err(|e| self.decode_error(e))?
            },
            #[cfg(feature = "ruzstd")]
            Compressor::Zstd => {
                let dec = StreamingDecoder::new(input)
                    .map_err(|e| self.decode_error(e))?;
                let mut out = Vec::with_capacity(max_size);
                // One extra byte is enough to notice an oversized frame
                dec.take(max_size as u64 + 1).read_to_end(&mut out)
                    .map_err(|e| self.decode_error(e))?;
                out
            },
            _ => return Err(Error::UnsupportedCompressor(self)),
        };

        if out.len() > max_size {
            return Err(self.decode_error(format_args!(
                "{} bytes decompressed, limit is {}", out.len(), max_size)));
        }
        Ok(out)
    }

    /// Whether this build can decompress data tagged with this compressor
    pub fn is_supported(self) -> bool {
        match self {
            Compressor::None => true,
            Compressor::Gzip => cfg!(feature = "flate2"),
            Compressor::Lzma | Compressor::Xz => cfg!(feature = "lzma-rs"),
            Compressor::Lz4 => cfg!(feature = "lz4_flex"),
            Compressor::Zstd => cfg!(feature = "ruzstd"),
            Compressor::Lzo => false,
        }
    }

    fn decode_error<E: Display>(self, reason: E) -> Error {
        Error::Decode { compressor: self, reason: reason.to_string() }
    }
}

/// Collects decoder output and refuses to grow past `limit` bytes
#[cfg(feature = "lzma-rs")]
struct BoundedWriter {
    buf: Vec<u8>,
    limit: usize,
}

#[cfg(feature = "lzma-rs")]
impl BoundedWriter {
    fn new(limit: usize) -> Self {
        Self { buf: Vec::with_capacity(limit), limit }
    }
}

#[cfg(feature = "lzma-rs")]
impl Write for BoundedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData,
                format!("more than {} bytes decompressed", self.limit)));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sum the uncompressed sizes the LZMA2 chunk headers of an xz stream declare, without
/// decoding anything. `None` if the container cannot be walked.
#[cfg(feature = "lzma-rs")]
fn xz_unpacked_size(input: &[u8]) -> Option<u64> {
    // Stream header: 6 magic bytes, 2 flag bytes, CRC32
    let mut cur = Cursor::new(input);
    cur.set_position(7);
    let check_size = match cur.read_u8().ok()? & 0x0F {
        0 => 0,
        1..=3 => 4,
        4..=6 => 8,
        7..=9 => 16,
        10..=12 => 32,
        _ => 64,
    };
    cur.set_position(12);

    let mut total = 0u64;
    loop {
        let block_start = cur.position();
        let header_size = cur.read_u8().ok()?;
        if header_size == 0 {
            // Index, no more blocks
            return Some(total);
        }
        cur.set_position(block_start + (u64::from(header_size) + 1) * 4);

        loop {
            let control = cur.read_u8().ok()?;
            let (unpacked, skip) = match control {
                0 => break,
                // Stored chunk
                1 | 2 => {
                    let n = u64::from(cur.read_u16::<BigEndian>().ok()?) + 1;
                    (n, n)
                },
                0x80..=0xFF => {
                    let low = u64::from(cur.read_u16::<BigEndian>().ok()?);
                    let unpacked = ((u64::from(control & 0x1F) << 16) | low) + 1;
                    let packed = u64::from(cur.read_u16::<BigEndian>().ok()?) + 1;
                    // Chunks that reset the properties carry one properties byte
                    let props = u64::from(control >= 0xC0);
                    (unpacked, packed + props)
                },
                _ => return None,
            };
            total += unpacked;
            cur.set_position(cur.position() + skip);
        }

        // Blocks are padded to four bytes and followed by their check
        let block_len = cur.position() - block_start;
        cur.set_position(block_start + block_len.next_multiple_of(4) + check_size);
    }
}
