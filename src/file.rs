//! File content engine (§4.6): inline storage for small files, a CTZ
//! (count-trailing-zeros) skip list for everything else, and the
//! `File` handle POSIX operations are built on.
//!
//! Simplification from the original (DESIGN.md): writes that are not a
//! pure end-of-file append buffer the whole desired tail content in
//! memory and rewrite the CTZ chain from scratch on flush, rather than
//! patching the skip list in place. This costs the mid-file-overwrite
//! performance optimization but keeps every content-correctness
//! invariant, and is bounded by `file_max`. Pure appends (the common
//! case for a log-structured workload) still stream block-by-block
//! without buffering the whole file.

use bitflags::bitflags;
use smallvec::SmallVec;
use smallvec::smallvec;

use crate::alloc::Allocator;
use crate::ctx::Context;
use crate::error::Errno;
use crate::error::Result;

/// A CTZ pointer list never exceeds `32` entries in practice (would need
/// a ~4 billion block file at the smallest allowed block size), so the
/// common case of a handful of pointers never touches the heap.
type Trail = SmallVec<[u32; 8]>;

/// On-disk content structure of a file, as recorded by its STRUCT
/// attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Struct {
    Inline(Vec<u8>),
    Ctz(Ctz),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ctz {
    pub head: u32,
    pub size: u32,
}

impl Struct {
    pub fn size(&self) -> u32 {
        match self {
            Struct::Inline(b) => b.len() as u32,
            Struct::Ctz(c) => c.size,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Struct::Inline(b) => b.clone(),
            Struct::Ctz(c) => {
                let mut v = Vec::with_capacity(8);
                v.extend_from_slice(&c.head.to_le_bytes());
                v.extend_from_slice(&c.size.to_le_bytes());
                v
            }
        }
    }

    pub fn decode_ctz(bytes: &[u8]) -> Result<Ctz> {
        if bytes.len() != 8 {
            return Err(Errno::Corrupt);
        }
        Ok(Ctz {
            head: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        })
    }
}

bitflags! {
    /// Per-open-file state (§4.0 open flags, low byte is the POSIX
    /// access mode, high bits are engine-internal state).
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct OpenFlags: u32 {
        const RDONLY   = 0x01;
        const WRONLY   = 0x02;
        const RDWR     = 0x03;
        const CREAT    = 0x100;
        const EXCL     = 0x200;
        const TRUNC    = 0x400;
        const APPEND   = 0x800;
        const F_DIRTY   = 0x01_0000;
        const F_WRITING = 0x02_0000;
        const F_READING = 0x04_0000;
        const F_ERRED   = 0x08_0000;
        const F_INLINE  = 0x10_0000;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.intersects(OpenFlags::RDONLY | OpenFlags::RDWR)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

fn ctz_pointer_count(index: u32) -> u32 {
    if index == 0 { 0 } else { index.trailing_zeros() + 1 }
}

/// `(block_index, offset_within_block)` a byte position resolves to,
/// matching the original's closed-form CTZ index computation so a seek
/// never needs to walk the chain just to find its target.
pub fn ctz_index(size: u32, block_size: u32) -> (u32, u32) {
    let b = block_size - 8;
    if size == 0 {
        return (0, 0);
    }
    let mut i = size / b;
    if i != 0 {
        i = (size - 4 * (pop(i - 1) + 2)) / b;
    }
    let off = size - b * i - 4 * pop(i);
    (i, off)
}

fn pop(x: u32) -> u32 {
    x.count_ones()
}

/// Walks the skip list backward from `head` (at `head_index`) to the
/// block at `target_index`, following the largest safe power-of-two hop
/// at each step.
fn walk_to_block(ctx: &mut Context, head: u32, head_index: u32, target_index: u32) -> Result<u32> {
    let mut block = head;
    let mut index = head_index;
    while index > target_index {
        let npointers = ctz_pointer_count(index);
        let mut chosen = None;
        for i in (0..npointers).rev() {
            if index >= (1u32 << i) && index - (1u32 << i) >= target_index {
                chosen = Some(i);
                break;
            }
        }
        let i = chosen.ok_or(Errno::Corrupt)?;
        let mut buf = [0u8; 4];
        ctx.caches.bd_read(ctx.dev, 4, block, i * 4, &mut buf)?;
        block = u32::from_le_bytes(buf);
        index -= 1u32 << i;
    }
    Ok(block)
}

/// Reads `buf.len()` bytes starting at file offset `offset` out of a
/// CTZ-structured file (§4.6 "Read").
pub fn read(ctx: &mut Context, ctz: &Ctz, offset: u32, buf: &mut [u8]) -> Result<()> {
    if offset + buf.len() as u32 > ctz.size {
        return Err(Errno::Inval);
    }
    let block_size = ctx.geometry.block_size;
    let (head_index, _) = ctz_index(ctz.size.saturating_sub(1).max(0), block_size);

    let mut read_so_far = 0u32;
    while (read_so_far as usize) < buf.len() {
        let pos = offset + read_so_far;
        let (index, block_off) = ctz_index(pos, block_size);
        let block = if index == head_index {
            ctz.head
        } else {
            walk_to_block(ctx, ctz.head, head_index, index)?
        };
        // `block_off` from `ctz_index` is already an absolute in-block
        // byte offset (it accounts for that block's own header size).
        let avail = (block_size - block_off).min(buf.len() as u32 - read_so_far);
        ctx.caches.bd_read(
            ctx.dev,
            avail,
            block,
            block_off,
            &mut buf[read_so_far as usize..(read_so_far + avail) as usize],
        )?;
        read_so_far += avail;
    }
    Ok(())
}

struct CtzWriter {
    trail: Trail,
    next_index: u32,
}

impl CtzWriter {
    fn new() -> Self {
        CtzWriter { trail: smallvec![], next_index: 0 }
    }

    fn pointers_for_next(&self) -> Trail {
        let npointers = ctz_pointer_count(self.next_index) as usize;
        self.trail[..npointers.min(self.trail.len())].into()
    }

    /// Folds the just-written `block` (at the old `next_index`) into the
    /// trail: slot 0 becomes `block` and the previous occupants of slots
    /// `0..npointers` shift up by one, since each is now one hop further
    /// from the block about to be written next. Slots beyond `npointers`
    /// are untouched -- they're still the correct ancestor for whichever
    /// future index eventually needs that larger a jump.
    fn record(&mut self, block: u32) {
        let npointers = ctz_pointer_count(self.next_index) as usize;
        while self.trail.len() < npointers + 1 {
            self.trail.push(0);
        }
        for i in (1..=npointers).rev() {
            self.trail[i] = self.trail[i - 1];
        }
        self.trail[0] = block;
        self.next_index += 1;
    }

    /// Seeds `trail` for resuming an append onto an existing chain, by
    /// fetching every power-of-two predecessor of the next block from
    /// `head` up front.
    fn resume(ctx: &mut Context, head: u32, head_index: u32) -> Result<Self> {
        let mut w = CtzWriter::new();
        w.next_index = head_index + 1;
        let max_slot = 32u32.min(w.next_index.max(1).ilog2() + 2);
        for i in 0..max_slot {
            if w.next_index < (1u32 << i) {
                break;
            }
            let target = w.next_index - (1u32 << i);
            let blk = if target == head_index {
                head
            } else {
                walk_to_block(ctx, head, head_index, target)?
            };
            while w.trail.len() <= i as usize {
                w.trail.push(0);
            }
            w.trail[i as usize] = blk;
        }
        Ok(w)
    }
}

fn alloc_block(_ctx: &mut Context, alloc: &mut Allocator) -> Result<u32> {
    alloc.alloc(|_| Ok(()))
}

/// Appends `data` to an existing CTZ chain, streaming block-by-block
/// without buffering the whole file (§4.6 "Append", the common case).
pub fn append(ctx: &mut Context, alloc: &mut Allocator, ctz: &Ctz, data: &[u8]) -> Result<Ctz> {
    let block_size = ctx.geometry.block_size;
    let (head_index, head_off) = if ctz.size == 0 {
        (0, 0)
    } else {
        ctz_index(ctz.size - 1, block_size)
    };

    let mut writer = if ctz.size == 0 {
        CtzWriter::new()
    } else {
        CtzWriter::resume(ctx, ctz.head, head_index)?
    };

    let mut head = ctz.head;
    let mut cur_off = if ctz.size == 0 { 0 } else { head_off + 1 };
    let mut consumed = 0usize;
    let mut size = ctz.size;

    // Top up the current tail block if it has spare room. `cur_off` is
    // already an absolute in-block offset (see `ctz_index`).
    if ctz.size != 0 {
        let room = block_size - cur_off;
        if room > 0 && consumed < data.len() {
            let n = (room as usize).min(data.len() - consumed);
            ctx.caches.bd_prog(ctx.dev, head, cur_off, &data[consumed..consumed + n])?;
            consumed += n;
            cur_off += n as u32;
            size += n as u32;
        }
        writer.next_index = head_index + 1;
    }

    while consumed < data.len() {
        let new_block = alloc_block(ctx, alloc)?;
        ctx.dev.erase(new_block)?;
        let pointers = writer.pointers_for_next();
        let mut header = Vec::with_capacity(pointers.len() * 4);
        for p in &pointers {
            header.extend_from_slice(&p.to_le_bytes());
        }
        if !header.is_empty() {
            ctx.caches.bd_prog(ctx.dev, new_block, 0, &header)?;
        }
        let data_cap = block_size - header.len() as u32;
        let n = (data_cap as usize).min(data.len() - consumed);
        ctx.caches
            .bd_prog(ctx.dev, new_block, header.len() as u32, &data[consumed..consumed + n])?;
        consumed += n;
        size += n as u32;
        writer.record(new_block);
        head = new_block;
    }

    ctx.caches.flush_pcache(ctx.dev)?;
    Ok(Ctz { head, size })
}

/// Rewrites the entire content of a file as a fresh CTZ chain (§4.6,
/// used for any write that is not a pure tail append). The file's prior
/// blocks, if any, are simply left unreferenced; the allocator's next
/// tree rescan reclaims them.
pub fn write_all(ctx: &mut Context, alloc: &mut Allocator, content: &[u8]) -> Result<Struct> {
    if content.is_empty() {
        return Ok(Struct::Ctz(Ctz { head: 0, size: 0 }));
    }
    let empty = Ctz { head: 0, size: 0 };
    let result = append(ctx, alloc, &empty, content)?;
    Ok(Struct::Ctz(result))
}

/// Lists every block of a CTZ chain from `ctz.head` back to the first
/// block, following each block's slot-0 pointer (always a jump of
/// exactly one index) rather than the larger skip-list hops used for
/// random access. Used by the allocator's tree rescan (`fs.rs`) to mark
/// every block a file still references as in-use.
pub fn blocks(ctx: &mut Context, ctz: &Ctz) -> Result<Vec<u32>> {
    if ctz.size == 0 {
        return Ok(Vec::new());
    }
    let block_size = ctx.geometry.block_size;
    let (head_index, _) = ctz_index(ctz.size - 1, block_size);
    let mut out = Vec::with_capacity(head_index as usize + 1);
    let mut block = ctz.head;
    let mut index = head_index;
    out.push(block);
    while index > 0 {
        let mut buf = [0u8; 4];
        ctx.caches.bd_read(ctx.dev, 4, block, 0, &mut buf)?;
        block = u32::from_le_bytes(buf);
        index -= 1;
        out.push(block);
    }
    Ok(out)
}

/// Materializes the full content of `structure` into memory. Bounded by
/// `file_max`; used when a write touches anything but the tail.
pub fn read_all(ctx: &mut Context, structure: &Struct) -> Result<Vec<u8>> {
    match structure {
        Struct::Inline(b) => Ok(b.clone()),
        Struct::Ctz(c) => {
            let mut buf = vec![0u8; c.size as usize];
            if c.size > 0 {
                read(ctx, c, 0, &mut buf)?;
            }
            Ok(buf)
        }
    }
}

/// An open file's in-memory state (§4.6, §4.0 open flags).
///
/// Reads are served straight from the on-disk structure. A write
/// promotes the file into a fully-buffered "dirty" state (see module
/// docs); the buffer is only materialized into blocks on `flush`.
pub struct FileHandle {
    pub flags: OpenFlags,
    pub pos: u32,
    pub committed: Struct,
    pub dirty: Option<Vec<u8>>,
}

impl FileHandle {
    pub fn new(flags: OpenFlags, committed: Struct) -> Self {
        let is_inline = matches!(committed, Struct::Inline(_));
        let mut flags = flags;
        flags.set(OpenFlags::F_INLINE, is_inline);
        FileHandle { flags, pos: 0, committed, dirty: None }
    }

    pub fn size(&self) -> u32 {
        match &self.dirty {
            Some(buf) => buf.len() as u32,
            None => self.committed.size(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(OpenFlags::F_DIRTY)
    }

    pub fn read(&mut self, ctx: &mut Context, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.readable() {
            return Err(Errno::BadF);
        }
        self.flags.insert(OpenFlags::F_READING);
        let size = self.size();
        if self.pos >= size {
            return Ok(0);
        }
        let n = (buf.len() as u32).min(size - self.pos) as usize;
        if let Some(dirty) = &self.dirty {
            buf[..n].copy_from_slice(&dirty[self.pos as usize..self.pos as usize + n]);
        } else {
            match &self.committed {
                Struct::Inline(b) => buf[..n].copy_from_slice(&b[self.pos as usize..self.pos as usize + n]),
                Struct::Ctz(c) => read(ctx, c, self.pos, &mut buf[..n])?,
            }
        }
        self.pos += n as u32;
        Ok(n)
    }

    fn materialize(&mut self, ctx: &mut Context) -> Result<()> {
        if self.dirty.is_none() {
            self.dirty = Some(read_all(ctx, &self.committed)?);
        }
        Ok(())
    }

    pub fn write(&mut self, ctx: &mut Context, buf: &[u8], file_max: u32) -> Result<usize> {
        if !self.flags.writable() {
            return Err(Errno::BadF);
        }
        self.materialize(ctx)?;
        let dirty = self.dirty.as_mut().unwrap();
        let write_pos = if self.flags.contains(OpenFlags::APPEND) {
            dirty.len() as u32
        } else {
            self.pos
        };
        let end = write_pos as usize + buf.len();
        if end as u32 > file_max {
            return Err(Errno::FBig);
        }
        if dirty.len() < end {
            dirty.resize(end, 0);
        }
        dirty[write_pos as usize..end].copy_from_slice(buf);
        self.pos = end as u32;
        self.flags.insert(OpenFlags::F_DIRTY | OpenFlags::F_WRITING);
        Ok(buf.len())
    }

    pub fn truncate(&mut self, ctx: &mut Context, new_size: u32) -> Result<()> {
        self.materialize(ctx)?;
        let dirty = self.dirty.as_mut().unwrap();
        dirty.resize(new_size as usize, 0);
        self.flags.insert(OpenFlags::F_DIRTY);
        Ok(())
    }

    /// Commits the dirty buffer to a content structure. Returns `None`
    /// when there was nothing to flush.
    pub fn flush(&mut self, ctx: &mut Context, alloc: &mut Allocator, inline_max: u32) -> Result<Option<Struct>> {
        let Some(buf) = self.dirty.take() else {
            return Ok(None);
        };
        let result = if buf.len() as u32 <= inline_max {
            Ok(Struct::Inline(buf))
        } else {
            write_all(ctx, alloc, &buf)
        };
        match result {
            Ok(s) => {
                self.committed = s.clone();
                self.flags.set(OpenFlags::F_INLINE, matches!(s, Struct::Inline(_)));
                self.flags.remove(OpenFlags::F_DIRTY | OpenFlags::F_WRITING);
                Ok(Some(s))
            }
            Err(e) => {
                self.flags.insert(OpenFlags::F_ERRED);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::Geometry;
    use crate::cache::Caches;
    use crate::config::MountConfig;
    use crate::testutil::RamBlockDevice;

    fn with_ctx<F: FnOnce(&mut Context)>(block_size: u32, block_count: u32, f: F) {
        let geometry = Geometry {
            block_size,
            read_size: 16,
            prog_size: 16,
            cache_size: 16,
            block_count,
        };
        let mut dev = RamBlockDevice::new(geometry);
        let mut caches = Caches::new(geometry);
        let config = MountConfig::default().build(geometry.block_size).unwrap();
        let mut ctx = Context {
            dev: &mut dev,
            caches: &mut caches,
            geometry,
            config: &config,
        };
        f(&mut ctx);
    }

    #[test]
    fn ctz_index_is_monotonic_and_zero_at_zero() {
        let (i, off) = ctz_index(0, 128);
        assert_eq!((i, off), (0, 0));
        let (i1, _) = ctz_index(500, 128);
        let (i2, _) = ctz_index(1000, 128);
        assert!(i2 >= i1);
    }

    #[test]
    fn write_then_read_small_file_roundtrips() {
        with_ctx(128, 64, |ctx| {
            let mut alloc = Allocator::new(ctx.geometry.block_count, 1);
            let data = b"hello, file content engine".to_vec();
            let structure = write_all(ctx, &mut alloc, &data).unwrap();
            let Struct::Ctz(ctz) = structure else { panic!("expected ctz") };
            assert_eq!(ctz.size, data.len() as u32);
            let mut out = vec![0u8; data.len()];
            read(ctx, &ctz, 0, &mut out).unwrap();
            assert_eq!(out, data);
        });
    }

    #[test]
    fn write_then_read_multiblock_file_roundtrips() {
        with_ctx(64, 256, |ctx| {
            let mut alloc = Allocator::new(ctx.geometry.block_count, 4);
            let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
            let structure = write_all(ctx, &mut alloc, &data).unwrap();
            let Struct::Ctz(ctz) = structure else { panic!("expected ctz") };
            let mut out = vec![0u8; data.len()];
            read(ctx, &ctz, 0, &mut out).unwrap();
            assert_eq!(out, data);

            // Partial read in the middle exercises skip-list seeking.
            let mut mid = vec![0u8; 100];
            read(ctx, &ctz, 900, &mut mid).unwrap();
            assert_eq!(mid, data[900..1000]);
        });
    }

    #[test]
    fn append_after_reopen_extends_chain() {
        with_ctx(64, 256, |ctx| {
            let mut alloc = Allocator::new(ctx.geometry.block_count, 4);
            let first: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
            let Struct::Ctz(ctz1) = write_all(ctx, &mut alloc, &first).unwrap() else { panic!() };
            let second: Vec<u8> = (0..500u32).map(|i| (i + 1) as u8).collect();
            let ctz2 = append(ctx, &mut alloc, &ctz1, &second).unwrap();
            assert_eq!(ctz2.size, 1000);
            let mut out = vec![0u8; 1000];
            read(ctx, &ctz2, 0, &mut out).unwrap();
            assert_eq!(&out[..500], &first[..]);
            assert_eq!(&out[500..], &second[..]);
        });
    }
}
