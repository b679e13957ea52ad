use std::cmp::min;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace};

use super::block::{load_block, DataBlock};
use super::error::{Error, Result};
use super::source::ReadAt;
use super::superblock::Compressor;

// Marks an uncompressed size that has not been learned yet
const UNKNOWN: u32 = u32::MAX;

type Decoded = (usize, Result<Vec<u8>>);

/// Random-access reader over a run of data blocks.
///
/// Nothing is cached between calls. Every block's image offset follows from the size list, so
/// the reader can jump straight to any block; uncompressed sizes of compressed blocks are
/// learned as blocks are decoded, unless [`FullReader::with_len`] supplies them up front.
pub struct FullReader {
    source: Arc<dyn ReadAt>,
    compressor: Compressor,
    block_size: u32,
    blocks: Vec<DataBlock>,
    sizes: Vec<AtomicU32>,
    workers: usize,
}

impl FullReader {
    pub fn new(source: Arc<dyn ReadAt>, compressor: Compressor, block_size: u32, start: u64, sizes: &[u32]) -> Self {
        let mut offset = start;
        let blocks: Vec<DataBlock> = sizes.iter()
            .map(|raw| {
                let mut block = DataBlock::from_raw(*raw, block_size);
                block.offset = Some(offset);
                offset += u64::from(block.disk_size);
                block
            })
            .collect();
        let sizes = blocks.iter()
            .map(|b| AtomicU32::new(b.uncompressed_size.unwrap_or(UNKNOWN)))
            .collect();
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { source, compressor, block_size, blocks, sizes, workers }
    }

    /// Declare the total content length. Every block but the last then holds exactly
    /// `block_size` bytes, and output is cut off at `len` even when the last block decodes
    /// to more, as a trailing sparse block does.
    pub fn with_len(self, len: u64) -> Self {
        let block_size = u64::from(self.block_size);
        for (index, size) in self.sizes.iter().enumerate() {
            let start = index as u64 * block_size;
            let logical = len.saturating_sub(start).min(block_size);
            size.store(logical as u32, Ordering::Relaxed);
        }
        self
    }

    /// Number of threads used by [`FullReader::write_to`]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total uncompressed length. Compressed blocks of unknown size are decoded to find out.
    pub fn content_len(&self) -> Result<u64> {
        let mut total = 0;
        for index in 0..self.blocks.len() {
            total += match self.sizes[index].load(Ordering::Acquire) {
                UNKNOWN => self.decode(index)?.len() as u64,
                known => u64::from(known),
            };
        }
        Ok(total)
    }

    /// Copy the bytes at `offset` into `buf`, returning how many were copied. Only the blocks
    /// overlapping the range are decoded, each at most once. Reading at exactly the end
    /// returns 0; any further out is [`Error::OutOfRange`].
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            let len = self.content_len()?;
            return if offset > len { Err(Error::OutOfRange { offset, len }) } else { Ok(0) };
        }

        let mut block_start = 0;
        let mut copied = 0;
        for index in 0..self.blocks.len() {
            if copied == buf.len() {
                break;
            }
            let mut decoded = None;
            let len = match self.sizes[index].load(Ordering::Acquire) {
                UNKNOWN => {
                    let data = self.decode(index)?;
                    let len = data.len() as u64;
                    decoded = Some(data);
                    len
                },
                known => u64::from(known),
            };
            let block_end = block_start + len;
            let pos = offset + copied as u64;
            if pos < block_end {
                let data = match decoded {
                    Some(data) => data,
                    None => self.decode(index)?,
                };
                let from = (pos - block_start) as usize;
                let n = min(buf.len() - copied, data.len() - from);
                buf[copied..copied + n].copy_from_slice(&data[from..from + n]);
                copied += n;
            }
            block_start = block_end;
        }

        if copied == 0 && offset > block_start {
            return Err(Error::OutOfRange { offset, len: block_start });
        }
        Ok(copied)
    }

    /// Write the whole content to `sink` and return the number of bytes written.
    ///
    /// Blocks are decoded on a pool of worker threads while the calling thread writes them
    /// in order. At most twice as many blocks as workers are in flight. The first error stops
    /// the pipeline and is returned; whatever reached `sink` before that stays there.
    pub fn write_to<W: Write + ?Sized>(&self, sink: &mut W) -> Result<u64> {
        let count = self.blocks.len();
        let workers = min(self.workers, count);
        if workers <= 1 {
            let mut written = 0;
            for index in 0..count {
                let data = self.decode(index)?;
                sink.write_all(&data)?;
                written += data.len() as u64;
            }
            return Ok(written);
        }

        let window = workers * 2;
        let abort = AtomicBool::new(false);
        let (job_tx, job_rx) = crossbeam_channel::bounded::<usize>(window);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<Decoded>();
        debug!("decoding {count} blocks on {workers} workers");

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let abort = &abort;
                scope.spawn(move || {
                    for index in job_rx.iter() {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = self.decode(index);
                        if result.is_err() {
                            abort.store(true, Ordering::Relaxed);
                        }
                        if done_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            let result = self.drain_ordered(sink, job_tx, &done_rx, window);
            if result.is_err() {
                abort.store(true, Ordering::Relaxed);
            }
            result
        })
    }

    // Feed block indexes to the workers and write their results in block order. Dropping
    // `jobs` on return lets idle workers exit.
    fn drain_ordered<W: Write + ?Sized>(&self, sink: &mut W, jobs: Sender<usize>, done: &Receiver<Decoded>, window: usize)
        -> Result<u64>
    {
        let count = self.blocks.len();
        let mut fed = 0;
        while fed < min(count, window) {
            // Cannot block: the channel holds a whole window
            let _ = jobs.send(fed);
            fed += 1;
        }

        let mut pending = BTreeMap::new();
        let mut next = 0;
        let mut written = 0;
        while next < count {
            let (index, result) = done.recv()
                .map_err(|_| Error::Corrupt("block decoders stopped early".to_string()))?;
            pending.insert(index, result?);
            while let Some(data) = pending.remove(&next) {
                sink.write_all(&data)?;
                written += data.len() as u64;
                next += 1;
                if fed < count {
                    let _ = jobs.send(fed);
                    fed += 1;
                }
            }
        }
        Ok(written)
    }

    // Decode one block and trim it to its logical size, recording the size if it was unknown
    fn decode(&self, index: usize) -> Result<Vec<u8>> {
        let block = &self.blocks[index];
        let offset = block.offset.unwrap_or_default();
        let mut data = load_block(&*self.source, self.compressor, self.block_size, offset, block)?;
        trace!("full reader decoded block {index}: {} bytes", data.len());

        match self.sizes[index].compare_exchange(UNKNOWN, data.len() as u32, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {},
            Err(known) => {
                let known = known as usize;
                if data.len() < known {
                    return Err(Error::Corrupt(format!(
                        "block {index} decoded to {} bytes, expected {known}", data.len())));
                }
                data.truncate(known);
            },
        }
        Ok(data)
    }
}

impl fmt::Debug for FullReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullReader")
            .field("compressor", &self.compressor)
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks)
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Read};
    use crate::squashfs::block::UNCOMPRESSED_BIT;
    use crate::squashfs::datareader::DataReader;

    const BS: u32 = 4096;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    // Stored blocks with a sparse block in the middle
    fn fixture() -> (Arc<dyn ReadAt>, Vec<u32>, Vec<u8>) {
        let mut image = vec![0x55; 32];
        let mut sizes = Vec::new();
        let mut expected = Vec::new();
        for i in 0..9u8 {
            if i == 4 {
                sizes.push(0);
                expected.extend_from_slice(&[0; BS as usize]);
                continue;
            }
            let len = if i == 8 { 777 } else { BS as usize };
            let b = pattern(len, i);
            image.extend_from_slice(&b);
            expected.extend_from_slice(&b);
            sizes.push(len as u32 | UNCOMPRESSED_BIT);
        }
        (Arc::new(image), sizes, expected)
    }

    #[test]
    fn test_read_at_matches_sequential() -> Result<()> {
        let (image, sizes, expected) = fixture();
        let mut sequential = Vec::new();
        DataReader::new(image.clone(), Compressor::Gzip, BS, 32, &sizes)?.read_to_end(&mut sequential)?;
        assert_eq!(sequential, expected);

        let full = FullReader::new(image, Compressor::Gzip, BS, 32, &sizes);
        assert_eq!(full.content_len()?, expected.len() as u64);
        for (offset, len) in [(0usize, 10usize), (4090, 20), (4096 * 4 - 3, 4102), (33000, 9000), (0, expected.len())] {
            let mut buf = vec![0; len];
            let n = full.read_at(&mut buf, offset as u64)?;
            let end = min(offset + len, expected.len());
            assert_eq!(n, end - offset);
            assert_eq!(&buf[..n], &expected[offset..end], "offset {offset} len {len}");
        }
        Ok(())
    }

    #[test]
    fn test_read_at_bounds() -> Result<()> {
        let (image, sizes, expected) = fixture();
        let full = FullReader::new(image, Compressor::Gzip, BS, 32, &sizes);
        let len = expected.len() as u64;
        let mut buf = [0; 16];
        assert_eq!(full.read_at(&mut buf, len)?, 0);
        assert_eq!(full.read_at(&mut [], len)?, 0);
        assert!(matches!(full.read_at(&mut buf, len + 1), Err(Error::OutOfRange { .. })));
        assert!(matches!(full.read_at(&mut [], len + 1), Err(Error::OutOfRange { .. })));
        Ok(())
    }

    #[test]
    fn test_write_to_is_deterministic() -> Result<()> {
        let (image, sizes, expected) = fixture();
        for workers in [1, 2, 4, 8] {
            let full = FullReader::new(image.clone(), Compressor::Gzip, BS, 32, &sizes).with_workers(workers);
            let mut out = Vec::new();
            assert_eq!(full.write_to(&mut out)?, expected.len() as u64);
            assert_eq!(out, expected, "{workers} workers");
            // The same reader can be used again
            let mut again = Vec::new();
            full.write_to(&mut again)?;
            assert_eq!(again, expected);
        }
        Ok(())
    }

    #[test]
    fn test_with_len_truncates_trailing_sparse_block() -> Result<()> {
        let head = pattern(BS as usize, 1);
        let mut image = head.clone();
        image.extend_from_slice(&[0; 8]);
        let sizes = [BS | UNCOMPRESSED_BIT, 0];
        let full = FullReader::new(Arc::new(image), Compressor::Gzip, BS, 0, &sizes)
            .with_len(u64::from(BS) + 100)
            .with_workers(2);
        let mut out = Vec::new();
        assert_eq!(full.write_to(&mut out)?, u64::from(BS) + 100);
        assert_eq!(&out[..BS as usize], &head[..]);
        assert!(out[BS as usize..].iter().all(|b| *b == 0));
        assert_eq!(full.content_len()?, u64::from(BS) + 100);
        Ok(())
    }

    struct FailingSink {
        accepted: usize,
        limit: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accepted + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "sink full"));
            }
            self.accepted += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_to_fails_fast() -> Result<()> {
        let (image, mut sizes, _) = fixture();
        // Point block 6 past the end of the image
        sizes[6] = 60000 | UNCOMPRESSED_BIT;
        for workers in [1, 3] {
            let full = FullReader::new(image.clone(), Compressor::Gzip, BS, 32, &sizes).with_workers(workers);
            let mut out = Vec::new();
            assert!(matches!(full.write_to(&mut out), Err(Error::Io(_))));
            // Nothing from the bad block or after it was written
            assert!(out.len() <= 6 * BS as usize);
        }

        let (image, sizes, _) = fixture();
        let full = FullReader::new(image, Compressor::Gzip, BS, 32, &sizes).with_workers(4);
        let mut sink = FailingSink { accepted: 0, limit: 3 * BS as usize };
        assert!(matches!(full.write_to(&mut sink), Err(Error::Io(_))));
        assert_eq!(sink.accepted, 3 * BS as usize);
        Ok(())
    }

    #[test]
    fn test_empty_reader() -> Result<()> {
        let full = FullReader::new(Arc::new(Vec::<u8>::new()), Compressor::Gzip, BS, 0, &[]);
        let mut out = Vec::new();
        assert_eq!(full.write_to(&mut out)?, 0);
        assert_eq!(full.read_at(&mut [0; 4], 0)?, 0);
        assert!(matches!(full.read_at(&mut [0; 4], 1), Err(Error::OutOfRange { offset: 1, len: 0 })));
        Ok(())
    }

    #[cfg(feature = "flate2")]
    #[test]
    fn test_compressed_sizes_are_learned() -> Result<()> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;

        let mut image = Vec::new();
        let mut sizes = Vec::new();
        let mut expected = Vec::new();
        for i in 0..6u8 {
            let plain = vec![i; 1000 + usize::from(i) * 300];
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&plain)?;
            let packed = enc.finish()?;
            sizes.push(packed.len() as u32);
            image.extend_from_slice(&packed);
            expected.extend_from_slice(&plain);
        }
        let full = FullReader::new(Arc::new(image), Compressor::Gzip, BS, 0, &sizes).with_workers(3);
        let mut buf = vec![0; 2000];
        let n = full.read_at(&mut buf, 2500)?;
        assert_eq!(n, 2000);
        assert_eq!(&buf[..], &expected[2500..4500]);

        let mut out = Vec::new();
        full.write_to(&mut out)?;
        assert_eq!(out, expected);
        assert_eq!(full.content_len()?, expected.len() as u64);
        Ok(())
    }
}
