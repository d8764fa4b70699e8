//! Cache layer (§4.2): two single-block buffers above the block device.
//!
//! `rcache` holds the most recently read window; `pcache` holds bytes
//! staged for programming but not yet flushed. Both are zeroed whenever
//! they stop describing the block they claim to, so stale bytes never
//! leak across an invalidation.

use std::cmp::Ordering;
use std::cmp::max;
use std::cmp::min;

use crate::bd::BlockDevice;
use crate::bd::Geometry;
use crate::error::Errno;
use crate::error::Result;

const NO_BLOCK: u32 = u32::MAX;

/// A single aligned window of one block's contents.
#[derive(Debug)]
pub struct BlockCache {
    block: u32,
    off: u32,
    size: u32,
    buffer: Vec<u8>,
}

impl BlockCache {
    fn new(cache_size: u32) -> Self {
        BlockCache {
            block: NO_BLOCK,
            off: 0,
            size: 0,
            buffer: vec![0u8; cache_size as usize],
        }
    }

    /// Drops the cache so the next access misses and refills from device.
    pub fn drop_cache(&mut self) {
        self.block = NO_BLOCK;
        self.off = 0;
        self.size = 0;
        for b in &mut self.buffer {
            *b = 0;
        }
    }

    fn contains(&self, block: u32, off: u32, size: u32) -> bool {
        self.block == block && off >= self.off && off + size <= self.off + self.size
    }
}

/// Owns the read and program caches for one mounted filesystem.
#[derive(Debug)]
pub struct Caches {
    pub rcache: BlockCache,
    pub pcache: BlockCache,
    geometry: Geometry,
}

impl Caches {
    pub fn new(geometry: Geometry) -> Self {
        Caches {
            rcache: BlockCache::new(geometry.cache_size),
            pcache: BlockCache::new(geometry.cache_size),
            geometry,
        }
    }

    /// Reads `size` bytes at `block`/`off` into `buf`, satisfying from
    /// `pcache` first, then `rcache`, then the device (§4.2 `bd_read`).
    ///
    /// `hint` is the size the caller actually needs "soon", used to decide
    /// how much of the surrounding block to pull into `rcache` in one go.
    pub fn bd_read(
        &mut self,
        dev: &mut dyn BlockDevice,
        hint: u32,
        block: u32,
        off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let size = buf.len() as u32;
        if off + size > self.geometry.block_size {
            return Err(Errno::Corrupt);
        }

        let mut off = off;
        let mut written: u32 = 0;
        while written < size {
            let chunk_off = off;
            let remaining = size - written;

            if self.pcache.contains(block, chunk_off, 1.min(remaining)) {
                let avail = min(remaining, self.pcache.off + self.pcache.size - chunk_off);
                let start = (chunk_off - self.pcache.off) as usize;
                buf[written as usize..(written + avail) as usize]
                    .copy_from_slice(&self.pcache.buffer[start..start + avail as usize]);
                written += avail;
                off += avail;
                continue;
            }

            if self.rcache.contains(block, chunk_off, 1.min(remaining)) {
                let avail = min(remaining, self.rcache.off + self.rcache.size - chunk_off);
                let start = (chunk_off - self.rcache.off) as usize;
                buf[written as usize..(written + avail) as usize]
                    .copy_from_slice(&self.rcache.buffer[start..start + avail as usize]);
                written += avail;
                off += avail;
                continue;
            }

            // Miss: refill rcache aligned down to read_size, sized up to
            // cover at least `hint` bytes (clamped to the cache buffer).
            let read_size = self.geometry.read_size;
            let aligned_off = (chunk_off / read_size) * read_size;
            let want = max(remaining, hint);
            let aligned_size = min(
                align_up(aligned_off + want, read_size) - aligned_off,
                self.geometry.cache_size,
            )
            .min(self.geometry.block_size - aligned_off);

            self.rcache.drop_cache();
            let n = aligned_size as usize;
            dev.read(block, aligned_off, &mut self.rcache.buffer[..n])
                .inspect_err(|_| self.rcache.drop_cache())?;
            self.rcache.block = block;
            self.rcache.off = aligned_off;
            self.rcache.size = aligned_size;
        }
        Ok(())
    }

    /// Appends `buf` to `pcache`, flushing when it fills or when the
    /// write would cross a block/program boundary (§4.2 `bd_prog`).
    pub fn bd_prog(
        &mut self,
        dev: &mut dyn BlockDevice,
        block: u32,
        off: u32,
        buf: &[u8],
    ) -> Result<()> {
        let mut off = off;
        let mut consumed = 0usize;
        while consumed < buf.len() {
            if self.pcache.block != NO_BLOCK && self.pcache.block != block {
                self.flush_pcache(dev)?;
            }
            if self.pcache.block == NO_BLOCK {
                self.pcache.block = block;
                self.pcache.off = off;
                self.pcache.size = 0;
            }

            let cap = self.geometry.cache_size - self.pcache.size;
            if cap == 0 {
                self.flush_pcache(dev)?;
                continue;
            }

            let remaining = (buf.len() - consumed) as u32;
            let n = min(cap, remaining) as usize;
            let start = self.pcache.size as usize;
            self.pcache.buffer[start..start + n].copy_from_slice(&buf[consumed..consumed + n]);
            self.pcache.size += n as u32;
            consumed += n;
            off += n as u32;

            if self.pcache.off + self.pcache.size >= self.geometry.block_size {
                self.flush_pcache(dev)?;
            }
        }
        Ok(())
    }

    /// Flushes pending `pcache` bytes to the device and invalidates the
    /// shadowed region of `rcache` so subsequent reads see fresh data.
    pub fn flush_pcache(&mut self, dev: &mut dyn BlockDevice) -> Result<()> {
        if self.pcache.block == NO_BLOCK || self.pcache.size == 0 {
            self.pcache.drop_cache();
            return Ok(());
        }
        let n = self.pcache.size as usize;
        dev.prog(self.pcache.block, self.pcache.off, &self.pcache.buffer[..n])?;
        if self.rcache.block == self.pcache.block {
            self.rcache.drop_cache();
        }
        self.pcache.drop_cache();
        Ok(())
    }

    pub fn sync(&mut self, dev: &mut dyn BlockDevice) -> Result<()> {
        self.flush_pcache(dev)?;
        dev.sync()
    }

    /// Streams `size` bytes at `block`/`off` through a CRC-32 without
    /// materializing them in a caller-visible buffer (§4.2 `bd_crc`).
    pub fn bd_crc(
        &mut self,
        dev: &mut dyn BlockDevice,
        block: u32,
        off: u32,
        size: u32,
        crc: &mut crc32fast::Hasher,
    ) -> Result<()> {
        let mut remaining = size;
        let mut off = off;
        let mut scratch = vec![0u8; min(size, self.geometry.cache_size) as usize];
        while remaining > 0 {
            let n = min(remaining, scratch.len() as u32);
            self.bd_read(dev, remaining, block, off, &mut scratch[..n as usize])?;
            crc.update(&scratch[..n as usize]);
            off += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Compares `size` bytes at `block`/`off` against `expected`
    /// (§4.2 `bd_cmp`).
    pub fn bd_cmp(
        &mut self,
        dev: &mut dyn BlockDevice,
        block: u32,
        off: u32,
        expected: &[u8],
    ) -> Result<Ordering> {
        let mut scratch = vec![0u8; expected.len()];
        self.bd_read(dev, expected.len() as u32, block, off, &mut scratch)?;
        Ok(scratch.as_slice().cmp(expected))
    }
}

fn align_up(v: u32, a: u32) -> u32 {
    v.div_ceil(a) * a
}
