//! POSIX API surface (§4.10): `Lfs`, the mount handle every client-facing
//! operation hangs off of.
//!
//! Everything below this module works with local (mdir-pair, u16 id)
//! coordinates; `fs.rs` is the only place that resolves a caller-facing
//! [`Phid`] to one, keeps the Phoenix-ID allocator and gstate XOR algebra
//! current, and drives the allocator's tree rescan. A single
//! `parking_lot::Mutex` serializes every call (§5): there is no async
//! machinery here, just a lock held for the duration of one operation.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

use crate::alloc::Allocator;
use crate::attr;
use crate::attr::Attrs;
use crate::bd::BlockDevice;
use crate::bd::Geometry;
use crate::cache::Caches;
use crate::config::FormatConfig;
use crate::config::MountConfig;
use crate::ctx::Context;
use crate::dirent;
use crate::dirent::DirCursor;
use crate::dirent::DirEntry;
use crate::dirent::FileType;
use crate::error::Errno;
use crate::error::Result;
use crate::file;
use crate::file::Ctz;
use crate::file::FileHandle;
use crate::file::OpenFlags;
use crate::file::Struct as FileStruct;
use crate::fixup;
use crate::fixup::Remap;
use crate::lru::ObjectState;
use crate::lru::ObjectTable;
use crate::mdir;
use crate::mdir::AttrOp;
use crate::mdir::CommitResult;
use crate::mdir::Mdir;
use crate::open_flags;
use crate::path;
use crate::phid;
use crate::phid::IdAllocator;
use crate::phid::Kind as PhidKind;
use crate::phid::Phid;
use crate::phid::ROOT_PHID;
use crate::tag::GState;
use crate::tag::NO_ID;
use crate::tag::Pair;
use crate::tag::Tag;
use crate::tag::TagType;
use crate::tag::TypeFamily;

/// Identifies a foreign mount a device-special dirent resolves to. This
/// crate never interprets the pair beyond holding it while the entry's
/// object is pinned (§4.8 "device reference"); the caller's IPC layer
/// gives it meaning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Oid {
    pub port: u32,
    pub id: u32,
}

impl Oid {
    fn pack(self) -> u64 {
        (u64::from(self.port) << 32) | u64::from(self.id)
    }

    fn unpack(raw: u64) -> Oid {
        Oid {
            port: (raw >> 32) as u32,
            id: raw as u32,
        }
    }
}

/// What a `lookup` resolved to: either an ordinary entry, or a device
/// entry that hands back its foreign target and how much of the path
/// was consumed crossing it.
#[derive(Copy, Clone, Debug)]
pub enum Resolved {
    Entry(Phid),
    Device(Oid),
}

/// Entry kind plus attributes returned by `getattr`.
#[derive(Copy, Clone, Debug)]
pub struct Stat {
    pub phid: Phid,
    pub kind: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
}

/// Requested attribute changes for `setattr`; `None` leaves a field
/// untouched.
#[derive(Copy, Clone, Debug, Default)]
pub struct SetAttrReq {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
    pub dev: Option<Oid>,
}

/// One readdir result.
#[derive(Clone, Debug)]
pub struct Dirent {
    pub phid: Phid,
    pub kind: FileType,
    pub name: Vec<u8>,
}

/// A page of readdir output; `next_pos` is opaque and fed back into the
/// next call, `eof` is set once the directory's chain is exhausted.
#[derive(Clone, Debug, Default)]
pub struct ReaddirPage {
    pub entries: Vec<(u64, Dirent)>,
    pub eof: bool,
}

/// Aggregate free-space report (§4.10 `statfs`).
#[derive(Copy, Clone, Debug)]
pub struct StatFs {
    pub block_size: u32,
    pub block_count: u32,
    pub blocks_used: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

/// Minimum `buf_size` a caller must supply to `readdir` to fit a header
/// plus a minimal one-byte name (§4.10).
const DIRENT_HEADER_SIZE: usize = 24;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct SuperblockPayload {
    version: u32,
    block_size: u32,
    block_count: u32,
    name_max: u32,
    file_max: u32,
    attr_max: u32,
}

fn encode_superblock(p: &SuperblockPayload) -> Vec<u8> {
    let mut v = Vec::with_capacity(24);
    v.extend_from_slice(&p.version.to_le_bytes());
    v.extend_from_slice(&p.block_size.to_le_bytes());
    v.extend_from_slice(&p.block_count.to_le_bytes());
    v.extend_from_slice(&p.name_max.to_le_bytes());
    v.extend_from_slice(&p.file_max.to_le_bytes());
    v.extend_from_slice(&p.attr_max.to_le_bytes());
    v
}

fn decode_superblock(bytes: &[u8]) -> Result<SuperblockPayload> {
    if bytes.len() != 24 {
        return Err(Errno::Corrupt);
    }
    let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    Ok(SuperblockPayload {
        version: word(0),
        block_size: word(1),
        block_count: word(2),
        name_max: word(3),
        file_max: word(4),
        attr_max: word(5),
    })
}

/// Where one object's entry lives: its containing mdir pair and local
/// id (root has neither, it is not anybody's child), its kind, and --
/// for a directory -- the head of its own mdir chain.
#[derive(Copy, Clone, Debug)]
struct Located {
    parent: Pair,
    id: u16,
    kind: FileType,
    head: Pair,
}

struct State {
    dev: Box<dyn BlockDevice>,
    caches: Caches,
    geometry: Geometry,
    config: MountConfig,
    root: Pair,
    alloc: Allocator,
    gdisk: GState,
    ids: IdAllocator,
    objects: ObjectTable,
}

/// Borrows the three device-facing fields of `state` disjointly from the
/// rest of it, so `state.alloc`/`state.objects`/... stay usable through
/// the same call.
macro_rules! ctx_of {
    ($state:expr) => {
        Context {
            dev: $state.dev.as_mut(),
            caches: &mut $state.caches,
            geometry: $state.geometry,
            config: &$state.config,
        }
    };
}

/// A mounted filesystem. Every operation takes `&self`, acquiring the
/// internal mutex for its duration (§5): there is no reentrancy and no
/// operation yields mid-flight.
pub struct Lfs {
    state: Mutex<State>,
}

impl Lfs {
    /// Writes a fresh, empty filesystem (§4.10 `format`). Does not keep
    /// the device open; call [`Lfs::mount`] afterward.
    pub fn format(dev: &mut dyn BlockDevice, format: &FormatConfig) -> Result<()> {
        let geometry = dev.geometry();
        geometry.validate()?;
        if geometry.block_count < 2 {
            return Err(Errno::Inval);
        }
        let config = format.mount.clone().build(geometry.block_size)?;
        let mut caches = Caches::new(geometry);
        let root = Pair([0, 1]);
        dev.erase(root.0[0])?;

        let now = now_secs();
        let sb = SuperblockPayload {
            version: (u32::from(config.disk_version.major) << 16) | u32::from(config.disk_version.minor),
            block_size: geometry.block_size,
            block_count: geometry.block_count,
            name_max: config.name_max,
            file_max: config.file_max,
            attr_max: config.attr_max,
        };
        let mut ops = vec![
            AttrOp::SetAttr {
                tag: Tag::of(TagType::Superblock, NO_ID, 8),
                payload: b"littlefs".to_vec(),
            },
            AttrOp::SetAttr {
                tag: Tag::of(TagType::InlineStruct, NO_ID, 24),
                payload: encode_superblock(&sb),
            },
            phid::stamp_op(NO_ID, PhidKind::Dir, ROOT_PHID),
        ];
        ops.extend(attr::initial_ops(&config, NO_ID, attr::DEFAULT_DIR_MODE, now));

        let mut alloc = Allocator::new(geometry.block_count, config.lookahead_size);
        alloc.mark_used(0);
        alloc.mark_used(1);
        let mut ctx = Context {
            dev,
            caches: &mut caches,
            geometry,
            config: &config,
        };
        let fresh = mdir::fresh(root);
        let result = mdir::commit(&mut ctx, &mut alloc, &fresh, &ops)?;
        if result.relocated_from.is_some() {
            // The root pair is fixed; abandoning it is not an option.
            return Err(Errno::NoSpc);
        }
        Ok(())
    }

    /// Mounts an already-formatted device (§4.10 `mount`).
    pub fn mount(mut dev: Box<dyn BlockDevice>, config: MountConfig) -> Result<Lfs> {
        let mut geometry = dev.geometry();
        geometry.validate()?;
        let config = config.build(geometry.block_size)?;
        let mut caches = Caches::new(geometry);
        let root = Pair([0, 1]);

        let (sb, root_mdir) = {
            let mut ctx = Context {
                dev: dev.as_mut(),
                caches: &mut caches,
                geometry,
                config: &config,
            };
            let root_mdir = mdir::fetch(&mut ctx, root)?;
            let name = mdir::get_attr(&mut ctx, &root_mdir, TypeFamily::Name as u16, NO_ID, 0)?
                .ok_or(Errno::Corrupt)?;
            if name.tag.type3 != TagType::Superblock.wire() || name.payload != b"littlefs" {
                return Err(Errno::Corrupt);
            }
            let raw = mdir::get_attr(&mut ctx, &root_mdir, TypeFamily::Struct as u16, NO_ID, 0)?
                .ok_or(Errno::Corrupt)?;
            (decode_superblock(&raw.payload)?, root_mdir)
        };

        if geometry.block_count == 0 {
            geometry.block_count = sb.block_count;
        }

        let mut alloc = Allocator::new(geometry.block_count, config.lookahead_size);
        let (gdisk, last_id, used) = {
            let mut ctx = Context {
                dev: dev.as_mut(),
                caches: &mut caches,
                geometry,
                config: &config,
            };
            let gdisk = recover_gstate(&mut ctx, root)?;
            let last_id = phid::recover_last_id(&mut ctx, root)?;
            let used = used_block_set(&mut ctx, root)?;
            (gdisk, last_id, used)
        };
        // Every allocation this mount performs must skip blocks already
        // referenced somewhere in the tree (`mdir::alloc_block`'s doc
        // comment: "fs.rs must prime the allocator via mark_used before
        // commits run" -- the allocator's own lookahead scan has no
        // other way to learn this at mount).
        for block in &used {
            alloc.mark_used(*block);
        }

        let mut state = State {
            dev,
            caches,
            geometry,
            config,
            root,
            alloc,
            gdisk,
            ids: IdAllocator::new(last_id),
            objects: ObjectTable::new(0),
        };
        state.objects = ObjectTable::new(state.config.max_cached_objects);
        let _ = root_mdir;

        finish_pending_move(&mut state)?;

        Ok(Lfs { state: Mutex::new(state) })
    }

    /// Releases the device back to the caller, flushing any buffered
    /// writes first.
    pub fn unmount(self) -> Result<Box<dyn BlockDevice>> {
        let mut state = self.state.into_inner();
        let mut ctx = ctx_of!(state);
        ctx.caches.sync(ctx.dev)?;
        Ok(state.dev)
    }

    /// Creates a regular file (optionally a device-special one) in
    /// directory `parent`.
    pub fn create(&self, parent: Phid, name: &[u8], mode: u32, dev: Option<Oid>) -> Result<Phid> {
        let mut state = self.state.lock();
        new_child(&mut state, parent, name, PhidKind::Reg, mode, dev)
    }

    /// Creates a directory.
    pub fn mkdir(&self, parent: Phid, name: &[u8], mode: u32) -> Result<Phid> {
        let mut state = self.state.lock();
        new_child(&mut state, parent, name, PhidKind::Dir, mode, None)
    }

    /// Opens `phid`, installing live handle state for subsequent
    /// `read`/`write`/`readdir` calls.
    pub fn open(&self, phid: Phid, flags: OpenFlags) -> Result<()> {
        let mut state = self.state.lock();
        let loc = locate(&mut state, phid)?;
        match loc.kind {
            FileType::Dir => {
                state.objects.open(phid, loc.parent, loc.id, ObjectState::OpenDir(DirCursor::new(loc.head)));
            }
            FileType::Reg => {
                let structure = {
                    let mut ctx = ctx_of!(state);
                    let pmdir = mdir::fetch(&mut ctx, loc.parent)?;
                    read_file_struct(&mut ctx, &pmdir, loc.id)?
                };
                if flags.contains(OpenFlags::TRUNC) && !state.config.read_only() {
                    commit_struct_update(&mut state, loc.parent, loc.id, &FileStruct::Inline(Vec::new()), true)?;
                }
                let handle = FileHandle::new(flags, if flags.contains(OpenFlags::TRUNC) { FileStruct::Inline(Vec::new()) } else { structure });
                state.objects.open(phid, loc.parent, loc.id, ObjectState::OpenFile(handle));
                if state.config.use_atime() && !state.config.read_only() {
                    let now = now_secs();
                    if let Some(op) = attr::atime_touch_op(&state.config, loc.id, now) {
                        let _ = commit_into_dir(&mut state, loc.parent, loc.parent, loc.id, &[op]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes and closes a previously opened `phid`.
    pub fn close(&self, phid: Phid) -> Result<()> {
        let mut state = self.state.lock();
        let deleted = state.objects.get(phid).map(|o| o.deleted).unwrap_or(false);
        if !deleted {
            if let Some(obj) = state.objects.get_mut(phid) {
                if let ObjectState::OpenFile(handle) = &mut obj.state {
                    if handle.is_dirty() {
                        let parent = obj.parent;
                        let id = obj.id;
                        let inline_max = state.config.inline_max(state.geometry.cache_size);
                        let flushed = {
                            let mut ctx = ctx_of!(state);
                            let handle = match state.objects.get_mut(phid).unwrap().state {
                                ObjectState::OpenFile(ref mut h) => h,
                                _ => unreachable!(),
                            };
                            handle.flush(&mut ctx, &mut state.alloc, inline_max)?
                        };
                        if let Some(structure) = flushed {
                            let now = now_secs();
                            commit_struct_update(&mut state, parent, id, &structure, state.config.use_mtime())?;
                            let _ = now;
                        }
                    }
                }
            }
        }
        if state.objects.close(phid) {
            reclaim_deleted(&mut state, phid)?;
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `off` from an open file.
    pub fn read(&self, phid: Phid, off: u64, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut ctx = ctx_of!(state);
        let obj = state_objects_mut(&mut state.objects, phid)?;
        let ObjectState::OpenFile(handle) = &mut obj.state else {
            return Err(Errno::IsDir);
        };
        handle.pos = off as u32;
        handle.read(&mut ctx, buf)
    }

    /// Writes `buf` at `off` (or at the current append position, see
    /// `OpenFlags::APPEND`) into an open file.
    pub fn write(&self, phid: Phid, off: u64, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        let file_max = state.config.file_max;
        let mut ctx = ctx_of!(state);
        let obj = state_objects_mut(&mut state.objects, phid)?;
        let ObjectState::OpenFile(handle) = &mut obj.state else {
            return Err(Errno::IsDir);
        };
        if !handle.flags.contains(OpenFlags::APPEND) {
            handle.pos = off as u32;
        }
        handle.write(&mut ctx, buf, file_max)
    }

    /// Truncates (or extends with zeros) an open file to `size` bytes.
    pub fn truncate(&self, phid: Phid, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        let mut ctx = ctx_of!(state);
        let obj = state_objects_mut(&mut state.objects, phid)?;
        let ObjectState::OpenFile(handle) = &mut obj.state else {
            return Err(Errno::IsDir);
        };
        handle.truncate(&mut ctx, size as u32)
    }

    /// Resolves a `/`-free-of-`..` path starting at directory `parent`,
    /// stopping early with the foreign target if it crosses a device
    /// entry (§4.10).
    pub fn lookup(&self, parent: Phid, path_bytes: &[u8]) -> Result<Resolved> {
        let mut state = self.state.lock();
        let mut cur = locate(&mut state, parent)?;
        if cur.kind != FileType::Dir {
            return Err(Errno::NotDir);
        }
        for comp in path::Components::new(path_bytes) {
            let name = comp?;
            if name.len() as u32 > state.config.name_max {
                return Err(Errno::NameTooLong);
            }
            let (node, entry) = {
                let mut ctx = ctx_of!(state);
                lookup_in_dir(&mut ctx, cur.head, name)?.ok_or(Errno::NoEnt)?
            };
            let child_phid = phid_of(&mut state, &node, entry.id, entry.kind)?;
            if let Some(obj) = state.objects.get(child_phid) {
                if let ObjectState::DeviceRef(raw) = obj.state {
                    return Ok(Resolved::Device(Oid::unpack(raw)));
                }
            }
            let head = if entry.kind == FileType::Dir {
                let mut ctx = ctx_of!(state);
                dirent::child_pair(&mut ctx, &node, entry.id)?
            } else {
                Pair::NULL
            };
            cur = Located { parent: node.pair, id: entry.id, kind: entry.kind, head };
            state.objects.remember(child_phid, cur.parent, cur.id);
        }
        Ok(Resolved::Entry(if cur.parent == Pair::NULL { ROOT_PHID } else {
            phid_of_located(&mut state, &cur)?
        }))
    }

    /// Lists a directory's entries starting at `pos` (0 on the first
    /// call), filling as many as fit in `buf_size`.
    pub fn readdir(&self, phid: Phid, pos: u64, buf_size: usize) -> Result<ReaddirPage> {
        if buf_size < DIRENT_HEADER_SIZE + 3 {
            return Err(Errno::NameTooLong);
        }
        let mut state = self.state.lock();
        let loc = locate(&mut state, phid)?;
        if loc.kind != FileType::Dir {
            return Err(Errno::NotDir);
        }
        let mut cursor = match state.objects.get(phid) {
            Some(o) => match &o.state {
                ObjectState::OpenDir(c) => c.clone(),
                _ => return Err(Errno::BadF),
            },
            None => return Err(Errno::BadF),
        };
        let mut skip = pos;
        let mut budget = buf_size;
        let mut page = ReaddirPage::default();
        loop {
            if cursor.done {
                page.eof = true;
                break;
            }
            let listing = {
                let mut ctx = ctx_of!(state);
                let node = mdir::fetch(&mut ctx, cursor.pair)?;
                dirent::sorted_listing(&mut ctx, &node)?
            };
            if cursor.index >= listing.len() {
                let tail = {
                    let mut ctx = ctx_of!(state);
                    mdir::fetch(&mut ctx, cursor.pair)?.tail
                };
                if tail.is_null() {
                    cursor.done = true;
                    page.eof = true;
                    break;
                }
                cursor.pair = tail;
                cursor.index = 0;
                continue;
            }
            let entry = listing[cursor.index].clone();
            if skip > 0 {
                skip -= 1;
                cursor.index += 1;
                continue;
            }
            let entry_size = DIRENT_HEADER_SIZE + entry.name.len();
            if entry_size > budget {
                break;
            }
            let node = {
                let mut ctx = ctx_of!(state);
                mdir::fetch(&mut ctx, cursor.pair)?
            };
            let child_phid = phid_of(&mut state, &node, entry.id, entry.kind)?;
            budget -= entry_size;
            cursor.index += 1;
            let next_pos = pos + page.entries.len() as u64 + 1;
            page.entries.push((next_pos, Dirent { phid: child_phid, kind: entry.kind, name: entry.name }));
        }
        if let Some(obj) = state.objects.get_mut(phid) {
            if let ObjectState::OpenDir(c) = &mut obj.state {
                *c = cursor;
            }
        }
        Ok(page)
    }

    /// Atomically (within a directory) places `src` under `name` inside
    /// `dir`, unlinking whatever used to be there if anything (§4.10
    /// `link`, POSIX `rename`-with-overwrite semantics).
    pub fn link(&self, dir: Phid, name: &[u8], src: Phid) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        if name.len() as u32 > state.config.name_max {
            return Err(Errno::NameTooLong);
        }
        let d = locate(&mut state, dir)?;
        if d.kind != FileType::Dir {
            return Err(Errno::NotDir);
        }
        let s = locate(&mut state, src)?;

        let existing = {
            let mut ctx = ctx_of!(state);
            lookup_in_dir(&mut ctx, d.head, name)?
        };
        if let Some((node, entry)) = &existing {
            if entry.kind == FileType::Dir {
                let mut ctx = ctx_of!(state);
                let child = dirent::child_pair(&mut ctx, node, entry.id)?;
                if !listing_in_dir(&mut ctx, child)?.is_empty() {
                    return Err(Errno::NotEmpty);
                }
            }
        }

        let (kind_attr, src_entry_attrs) = {
            let mut ctx = ctx_of!(state);
            let smdir = mdir::fetch(&mut ctx, s.parent)?;
            let a = attr::get(&mut ctx, &smdir, s.id)?;
            let struct_payload = mdir::get_attr(&mut ctx, &smdir, TypeFamily::Struct as u16, s.id, 0)?
                .ok_or(Errno::Corrupt)?;
            (struct_payload, a)
        };

        if d.head.cmp_loose(&s.parent) {
            // Same containing mdir: `src`'s own id already exists here,
            // so this is just an in-place rewrite of its Name tag (plus
            // removing whatever `name` used to point at), never a new
            // id (§4.10 `link`, same-directory case).
            let dst_mdir = mdir::fetch(&mut ctx_of!(state), d.head)?;
            let mut ops = Vec::new();
            // `Delete` shifts every id above it down by one (`apply_ops`
            // in `mdir.rs`), so a `Delete` ordered ahead of `src`'s own
            // `SetAttr` must have `src`'s id adjusted to match.
            let mut target_id = s.id;
            if let Some((_, entry)) = &existing {
                if entry.id != s.id {
                    ops.push(AttrOp::Delete { id: entry.id });
                    if entry.id < s.id {
                        target_id = s.id - 1;
                    }
                }
            }
            ops.push(AttrOp::SetAttr {
                tag: Tag::of(if s.kind == FileType::Dir { TagType::Dir } else { TagType::Reg }, target_id, name.len() as u16),
                payload: name.to_vec(),
            });
            let _ = kind_attr;

            let cr = {
                let mut ctx = ctx_of!(state);
                mdir::commit(&mut ctx, &mut state.alloc, &dst_mdir, &ops)?
            };
            track_relocation(&mut state, d.head, &cr, d.parent, d.id)?;
            state.objects.remember(src, cr.mdir.pair, target_id);
            return Ok(());
        }

        // Cross-directory: two commits, bridged by a pending-move gstate
        // marker so an interrupted move is finished at the next mount
        // (§3 "Global state", §8 "Orphan elimination").
        let dst_mdir = mdir::fetch(&mut ctx_of!(state), d.head)?;
        let mut dst_ops = Vec::new();
        if let Some((_, entry)) = &existing {
            dst_ops.push(AttrOp::Delete { id: entry.id });
        }
        let new_id = dst_mdir.count - if existing.is_some() { 1 } else { 0 };
        dst_ops.push(AttrOp::Create { id: new_id });
        dst_ops.push(AttrOp::SetAttr {
            tag: Tag::of(if s.kind == FileType::Dir { TagType::Dir } else { TagType::Reg }, new_id, name.len() as u16),
            payload: name.to_vec(),
        });
        dst_ops.push(AttrOp::SetAttr {
            tag: Tag::new(kind_attr.tag.type3, new_id, kind_attr.payload.len() as u16),
            payload: kind_attr.payload.clone(),
        });
        dst_ops.push(phid::stamp_op(new_id, if s.kind == FileType::Dir { PhidKind::Dir } else { PhidKind::Reg }, src));
        dst_ops.push(attr::set_mode_op(new_id, src_entry_attrs.mode));
        dst_ops.extend(attr::set_owner_ops(new_id, src_entry_attrs.uid, src_entry_attrs.gid));
        dst_ops.push(attr::ctime_op(new_id, src_entry_attrs.ctime));
        if let Some(op) = attr::mtime_touch_op(&state.config, new_id, src_entry_attrs.mtime) {
            dst_ops.push(op);
        }
        let move_delta = state.gdisk.xor(state.gdisk.set_move(s.id, s.parent));
        dst_ops.push(AttrOp::Globals { delta: move_delta });

        let cr = {
            let mut ctx = ctx_of!(state);
            mdir::commit(&mut ctx, &mut state.alloc, &dst_mdir, &dst_ops)?
        };
        state.gdisk = state.gdisk.xor(move_delta);
        let final_id = resolved_new_id(new_id, dst_mdir.count + 1, &cr);
        track_relocation(&mut state, d.head, &cr, d.parent, d.id)?;

        let smdir = mdir::fetch(&mut ctx_of!(state), s.parent)?;
        let clear_delta = state.gdisk.xor(state.gdisk.clear_move());
        let src_cr = {
            let mut ctx = ctx_of!(state);
            mdir::commit(
                &mut ctx,
                &mut state.alloc,
                &smdir,
                &[AttrOp::Delete { id: s.id }, AttrOp::Globals { delta: clear_delta }],
            )?
        };
        state.gdisk = state.gdisk.xor(clear_delta);
        track_relocation(&mut state, s.parent, &src_cr, pair_of_grandparent(&mut state, s.parent)?, 0).ok();

        state.objects.remember(src, final_id.0, final_id.1);
        Ok(())
    }

    /// Removes the entry named `name` from `dir` (§4.10 `unlink`).
    /// Fails with `NotEmpty` if it names a non-empty directory.
    pub fn unlink(&self, dir: Phid, name: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        let d = locate(&mut state, dir)?;
        if d.kind != FileType::Dir {
            return Err(Errno::NotDir);
        }
        let (node, entry) = {
            let mut ctx = ctx_of!(state);
            lookup_in_dir(&mut ctx, d.head, name)?.ok_or(Errno::NoEnt)?
        };
        if entry.kind == FileType::Dir {
            let mut ctx = ctx_of!(state);
            let child = dirent::child_pair(&mut ctx, &node, entry.id)?;
            if !listing_in_dir(&mut ctx, child)?.is_empty() {
                return Err(Errno::NotEmpty);
            }
        }
        let target_phid = phid_of(&mut state, &node, entry.id, entry.kind)?;
        let cr = {
            let mut ctx = ctx_of!(state);
            mdir::commit(&mut ctx, &mut state.alloc, &node, &[AttrOp::Delete { id: entry.id }])?
        };
        track_relocation(&mut state, d.head, &cr, d.parent, d.id)?;
        if state.objects.mark_deleted(target_phid) {
            reclaim_deleted(&mut state, target_phid)?;
        }
        Ok(())
    }

    /// Destroys `phid` outright: equivalent to `unlink` of its only
    /// name, for a caller that already holds the id rather than the
    /// containing directory/name pair.
    pub fn destroy(&self, phid: Phid) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        if phid == ROOT_PHID {
            return Err(Errno::Inval);
        }
        let loc = locate(&mut state, phid)?;
        if loc.kind == FileType::Dir {
            let mut ctx = ctx_of!(state);
            if !listing_in_dir(&mut ctx, loc.head)?.is_empty() {
                return Err(Errno::NotEmpty);
            }
        }
        let pmdir = mdir::fetch(&mut ctx_of!(state), loc.parent)?;
        let cr = {
            let mut ctx = ctx_of!(state);
            mdir::commit(&mut ctx, &mut state.alloc, &pmdir, &[AttrOp::Delete { id: loc.id }])?
        };
        let grandparent = pair_of_grandparent(&mut state, loc.parent)?;
        track_relocation(&mut state, loc.parent, &cr, grandparent, 0).ok();
        if state.objects.mark_deleted(phid) {
            reclaim_deleted(&mut state, phid)?;
        }
        Ok(())
    }

    /// Reads an entry's attributes and size.
    pub fn getattr(&self, phid: Phid) -> Result<Stat> {
        let mut state = self.state.lock();
        let loc = locate(&mut state, phid)?;
        let root = state.root;
        let mut ctx = ctx_of!(state);
        let size = match loc.kind {
            FileType::Dir => 0,
            FileType::Reg => {
                let pmdir = mdir::fetch(&mut ctx, loc.parent)?;
                read_file_struct(&mut ctx, &pmdir, loc.id)?.size() as u64
            }
        };
        let (attr_parent, attr_id) = if loc.parent == Pair::NULL { (root, NO_ID) } else { (loc.parent, loc.id) };
        let attr_mdir = mdir::fetch(&mut ctx, attr_parent)?;
        let attrs = attr::get(&mut ctx, &attr_mdir, attr_id)?;
        Ok(Stat {
            phid,
            kind: loc.kind,
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            size,
            atime: attrs.atime,
            ctime: attrs.ctime,
            mtime: attrs.mtime,
        })
    }

    /// Applies attribute changes, including installing/clearing a
    /// device-reference mapping.
    pub fn setattr(&self, phid: Phid, req: SetAttrReq) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        let loc = locate(&mut state, phid)?;
        let now = now_secs();
        let (parent, id) = if loc.parent == Pair::NULL {
            (state.root, NO_ID)
        } else {
            (loc.parent, loc.id)
        };
        let mut ops = Vec::new();
        if let Some(mode) = req.mode {
            ops.push(attr::set_mode_op(id, mode));
        }
        if req.uid.is_some() || req.gid.is_some() {
            let pmdir_for_read = mdir::fetch(&mut ctx_of!(state), parent)?;
            let current = attr::get(&mut ctx_of!(state), &pmdir_for_read, id)?;
            let uid = req.uid.unwrap_or(current.uid);
            let gid = req.gid.unwrap_or(current.gid);
            ops.extend(attr::set_owner_ops(id, uid, gid));
        }
        if let Some(atime) = req.atime {
            if let Some(op) = attr::atime_touch_op(&state.config, id, atime) {
                ops.push(op);
            }
        }
        if let Some(mtime) = req.mtime {
            if let Some(op) = attr::mtime_touch_op(&state.config, id, mtime) {
                ops.push(op);
            }
        }
        if !ops.is_empty() {
            ops.push(attr::ctime_op(id, now));
            let pmdir = mdir::fetch(&mut ctx_of!(state), parent)?;
            let cr = {
                let mut ctx = ctx_of!(state);
                mdir::commit(&mut ctx, &mut state.alloc, &pmdir, &ops)?
            };
            if parent != state.root {
                let grandparent = pair_of_grandparent(&mut state, parent)?;
                track_relocation(&mut state, parent, &cr, grandparent, 0).ok();
            }
        }
        if let Some(oid) = req.dev {
            state.objects.open(phid, parent, id, ObjectState::DeviceRef(oid.pack()));
        }
        Ok(())
    }

    /// Reports aggregate space usage across the whole tree.
    pub fn statfs(&self) -> Result<StatFs> {
        let mut state = self.state.lock();
        let root = state.root;
        let mut ctx = ctx_of!(state);
        let used = used_block_set(&mut ctx, root)?;
        Ok(StatFs {
            block_size: ctx.geometry.block_size,
            block_count: ctx.geometry.block_count,
            blocks_used: used.len() as u32,
            name_max: ctx.config.name_max,
            file_max: ctx.config.file_max,
            attr_max: ctx.config.attr_max,
        })
    }

    /// Flushes one open file's pending writes; a no-op on directories.
    pub fn sync(&self, phid: Phid) -> Result<()> {
        let mut state = self.state.lock();
        let is_dir = matches!(state.objects.get(phid).map(|o| &o.state), Some(ObjectState::OpenDir(_)));
        if is_dir {
            return Ok(());
        }
        let Some(obj) = state.objects.get(phid) else {
            return Err(Errno::BadF);
        };
        if !matches!(obj.state, ObjectState::OpenFile(_)) {
            return Err(Errno::BadF);
        }
        let (parent, id) = (obj.parent, obj.id);
        let inline_max = state.config.inline_max(state.geometry.cache_size);
        let flushed = {
            let mut ctx = ctx_of!(state);
            let handle = match &mut state.objects.get_mut(phid).unwrap().state {
                ObjectState::OpenFile(h) => h,
                _ => unreachable!(),
            };
            handle.flush(&mut ctx, &mut state.alloc, inline_max)?
        };
        if let Some(structure) = flushed {
            commit_struct_update(&mut state, parent, id, &structure, state.config.use_mtime())?;
        }
        let mut ctx = ctx_of!(state);
        ctx.caches.sync(ctx.dev)
    }

    /// Grows the device's usable block count (shrinking is not
    /// supported, §4.10 "Non-goals").
    pub fn grow(&self, new_block_count: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.read_only() {
            return Err(Errno::RoFs);
        }
        if new_block_count <= state.geometry.block_count {
            return Err(Errno::Inval);
        }
        let root = state.root;
        let sb = SuperblockPayload {
            version: (u32::from(state.config.disk_version.major) << 16) | u32::from(state.config.disk_version.minor),
            block_size: state.geometry.block_size,
            block_count: new_block_count,
            name_max: state.config.name_max,
            file_max: state.config.file_max,
            attr_max: state.config.attr_max,
        };
        let root_mdir = mdir::fetch(&mut ctx_of!(state), root)?;
        {
            let mut ctx = ctx_of!(state);
            mdir::commit(
                &mut ctx,
                &mut state.alloc,
                &root_mdir,
                &[AttrOp::SetAttr {
                    tag: Tag::of(TagType::InlineStruct, NO_ID, 24),
                    payload: encode_superblock(&sb),
                }],
            )?;
        }
        state.geometry.block_count = new_block_count;
        state.alloc.reset(new_block_count);
        let used = {
            let mut ctx = ctx_of!(state);
            used_block_set(&mut ctx, root)?
        };
        for block in used {
            state.alloc.mark_used(block);
        }
        Ok(())
    }

    /// Forces a full tree rescan of referenced blocks into the
    /// allocator's lookahead window, reclaiming anything an unlinked or
    /// overwritten file left behind.
    pub fn gc(&self) -> Result<()> {
        let mut state = self.state.lock();
        let root = state.root;
        let used = {
            let mut ctx = ctx_of!(state);
            used_block_set(&mut ctx, root)?
        };
        let block_count = state.geometry.block_count;
        state.alloc.reset(block_count);
        for b in used {
            state.alloc.mark_used(b);
        }
        Ok(())
    }
}

fn state_objects_mut(objects: &mut ObjectTable, phid: Phid) -> Result<&mut crate::lru::Object> {
    objects.get_mut(phid).ok_or(Errno::BadF)
}

fn read_file_struct(ctx: &mut Context, pmdir: &Mdir, id: u16) -> Result<FileStruct> {
    let attr = mdir::get_attr(ctx, pmdir, TypeFamily::Struct as u16, id, 0)?.ok_or(Errno::Corrupt)?;
    match TagType::from_wire(attr.tag.type3) {
        Some(TagType::InlineStruct) => Ok(FileStruct::Inline(attr.payload)),
        Some(TagType::CtzStruct) => Ok(FileStruct::Ctz(FileStruct::decode_ctz(&attr.payload)?)),
        _ => Err(Errno::Corrupt),
    }
}

fn struct_attr_op(id: u16, structure: &FileStruct) -> AttrOp {
    let ty = match structure {
        FileStruct::Inline(_) => TagType::InlineStruct,
        FileStruct::Ctz(_) => TagType::CtzStruct,
    };
    let payload = structure.encode();
    AttrOp::SetAttr { tag: Tag::of(ty, id, payload.len() as u16), payload }
}

fn entry_kind(ctx: &mut Context, mdir_: &Mdir, id: u16) -> Result<FileType> {
    let attr = mdir::get_attr(ctx, mdir_, TypeFamily::Struct as u16, id, 0)?.ok_or(Errno::NoEnt)?;
    match TagType::from_wire(attr.tag.type3) {
        Some(TagType::DirStruct) => Ok(FileType::Dir),
        Some(TagType::CtzStruct) | Some(TagType::InlineStruct) => Ok(FileType::Reg),
        _ => Err(Errno::Corrupt),
    }
}

fn locate(state: &mut State, phid: Phid) -> Result<Located> {
    if phid == ROOT_PHID {
        return Ok(Located { parent: Pair::NULL, id: NO_ID, kind: FileType::Dir, head: state.root });
    }
    if let Some(obj) = state.objects.get(phid) {
        let (parent, id) = (obj.parent, obj.id);
        let mut ctx = ctx_of!(state);
        let pmdir = mdir::fetch(&mut ctx, parent)?;
        let kind = entry_kind(&mut ctx, &pmdir, id)?;
        let head = if kind == FileType::Dir { dirent::child_pair(&mut ctx, &pmdir, id)? } else { Pair::NULL };
        return Ok(Located { parent, id, kind, head });
    }
    let root = state.root;
    let mut ctx = ctx_of!(state);
    let found = find_by_phid(&mut ctx, root, phid)?.ok_or(Errno::NoEnt)?;
    state.objects.remember(phid, found.parent, found.id);
    Ok(found)
}

fn find_by_phid(ctx: &mut Context, root: Pair, target: Phid) -> Result<Option<Located>> {
    let mut stack = vec![root];
    while let Some(head) = stack.pop() {
        let mut found = None;
        let mut children = Vec::new();
        mdir::walk_tail_chain(ctx, head, |ctx, node| {
            for e in dirent::decode_entries(ctx, node)? {
                if found.is_some() {
                    break;
                }
                if let Some((_, p)) = phid::get(ctx, node, e.id)? {
                    if p == target {
                        let head_pair = if e.kind == FileType::Dir { dirent::child_pair(ctx, node, e.id)? } else { Pair::NULL };
                        found = Some(Located { parent: node.pair, id: e.id, kind: e.kind, head: head_pair });
                        continue;
                    }
                }
                if e.kind == FileType::Dir {
                    children.push(dirent::child_pair(ctx, node, e.id)?);
                }
            }
            Ok(())
        })?;
        if let Some(loc) = found {
            return Ok(Some(loc));
        }
        stack.extend(children);
    }
    Ok(None)
}

/// Reads or lazily allocates & stamps a PhID for a dirent the overlay
/// has not yet touched (Design Notes §9, open question 4: treated as
/// an ordinary attribute commit, not special-cased).
fn phid_of(state: &mut State, node: &Mdir, id: u16, kind: FileType) -> Result<Phid> {
    {
        let mut ctx = ctx_of!(state);
        if let Some((_, p)) = phid::get(&mut ctx, node, id)? {
            return Ok(p);
        }
    }
    let new_phid = state.ids.allocate();
    if !state.config.read_only() {
        let op = phid::stamp_op(id, if kind == FileType::Dir { PhidKind::Dir } else { PhidKind::Reg }, new_phid);
        let mut ctx = ctx_of!(state);
        let _ = mdir::commit(&mut ctx, &mut state.alloc, node, &[op]);
    }
    Ok(new_phid)
}

fn phid_of_located(state: &mut State, loc: &Located) -> Result<Phid> {
    let mut ctx = ctx_of!(state);
    let pmdir = mdir::fetch(&mut ctx, loc.parent)?;
    drop(ctx);
    phid_of(state, &pmdir, loc.id, loc.kind)
}

fn lookup_in_dir(ctx: &mut Context, head: Pair, name: &[u8]) -> Result<Option<(Mdir, DirEntry)>> {
    let mut cursor = head;
    loop {
        let node = mdir::fetch(ctx, cursor)?;
        if let Some(e) = dirent::lookup(ctx, &node, name)? {
            return Ok(Some((node, e)));
        }
        if node.tail.is_null() {
            return Ok(None);
        }
        cursor = node.tail;
    }
}

fn listing_in_dir(ctx: &mut Context, head: Pair) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut cursor = head;
    loop {
        let node = mdir::fetch(ctx, cursor)?;
        out.extend(dirent::decode_entries(ctx, &node)?);
        if node.tail.is_null() {
            break;
        }
        cursor = node.tail;
    }
    Ok(out)
}

/// Full tree walk accumulating the XOR-fold of every mdir's local
/// gdelta (§3): the on-disk gstate is the running total across the
/// whole tree, since every commit's delta commutes regardless of which
/// mdir carried it.
fn recover_gstate(ctx: &mut Context, root: Pair) -> Result<GState> {
    let mut total = GState::ZERO;
    let mut stack = vec![root];
    while let Some(head) = stack.pop() {
        let mut children = Vec::new();
        mdir::walk_tail_chain(ctx, head, |ctx, node| {
            total = total.xor(node.gdelta);
            for e in dirent::decode_entries(ctx, node)? {
                if e.kind == FileType::Dir {
                    children.push(dirent::child_pair(ctx, node, e.id)?);
                }
            }
            Ok(())
        })?;
        stack.extend(children);
    }
    Ok(total)
}

/// Finishes an interrupted cross-directory move found at mount (§8
/// "Orphan elimination"): the destination commit already landed (or
/// gstate would not show a pending move), so the only remaining step is
/// deleting the stale source entry and clearing the marker.
fn finish_pending_move(state: &mut State) -> Result<()> {
    if !state.gdisk.has_move() {
        return Ok(());
    }
    let move_pair = state.gdisk.move_pair();
    let move_id = state.gdisk.move_id();
    let smdir = mdir::fetch(&mut ctx_of!(state), move_pair)?;
    let clear_delta = state.gdisk.xor(state.gdisk.clear_move());
    {
        let mut ctx = ctx_of!(state);
        mdir::commit(&mut ctx, &mut state.alloc, &smdir, &[AttrOp::Delete { id: move_id }, AttrOp::Globals { delta: clear_delta }])?;
    }
    state.gdisk = state.gdisk.xor(clear_delta);
    Ok(())
}

/// Builds the combined `Create` + attribute set for a brand-new child
/// and commits it into `parent`'s own mdir chain.
fn new_child(state: &mut State, parent: Phid, name: &[u8], kind: PhidKind, mode: u32, dev: Option<Oid>) -> Result<Phid> {
    if state.config.read_only() {
        return Err(Errno::RoFs);
    }
    if name.len() as u32 > state.config.name_max {
        return Err(Errno::NameTooLong);
    }
    let d = locate(state, parent)?;
    if d.kind != FileType::Dir {
        return Err(Errno::NotDir);
    }
    if lookup_in_dir(&mut ctx_of!(state), d.head, name)?.is_some() {
        return Err(Errno::Exist);
    }
    let head_mdir = mdir::fetch(&mut ctx_of!(state), d.head)?;
    let new_id = head_mdir.count;
    let now = now_secs();
    let new_phid = state.ids.allocate();

    let default_mode = match kind {
        PhidKind::Reg => attr::DEFAULT_REG_MODE,
        PhidKind::Dir => attr::DEFAULT_DIR_MODE,
    };
    let mode = if mode == 0 { default_mode } else { mode };

    let mut ops = vec![
        AttrOp::Create { id: new_id },
        AttrOp::SetAttr {
            tag: Tag::of(if kind == PhidKind::Dir { TagType::Dir } else { TagType::Reg }, new_id, name.len() as u16),
            payload: name.to_vec(),
        },
    ];
    match kind {
        PhidKind::Reg => ops.push(AttrOp::SetAttr { tag: Tag::of(TagType::InlineStruct, new_id, 0), payload: Vec::new() }),
        PhidKind::Dir => {
            let child_pair = alloc_fresh_dir(state)?;
            ops.push(AttrOp::SetAttr { tag: Tag::of(TagType::DirStruct, new_id, 8), payload: {
                let mut v = Vec::with_capacity(8);
                v.extend_from_slice(&child_pair.0[0].to_le_bytes());
                v.extend_from_slice(&child_pair.0[1].to_le_bytes());
                v
            } });
        }
    }
    ops.push(phid::stamp_op(new_id, kind, new_phid));
    ops.extend(attr::initial_ops(&state.config, new_id, mode, now));

    let cr = {
        let mut ctx = ctx_of!(state);
        mdir::commit(&mut ctx, &mut state.alloc, &head_mdir, &ops)?
    };
    let final_id = resolved_new_id(new_id, head_mdir.count + 1, &cr);
    track_relocation(state, d.head, &cr, d.parent, d.id)?;
    state.objects.remember(new_phid, final_id.0, final_id.1);
    if let Some(oid) = dev {
        state.objects.open(new_phid, final_id.0, final_id.1, ObjectState::DeviceRef(oid.pack()));
    }
    Ok(new_phid)
}

/// Formats a brand-new, empty directory chain for `mkdir`/cross-dir
/// `link` to point a `DirStruct` at.
fn alloc_fresh_dir(state: &mut State) -> Result<Pair> {
    let a = state.alloc.alloc(|_| Ok(()))?;
    let b = state.alloc.alloc(|_| Ok(()))?;
    {
        let mut ctx = ctx_of!(state);
        ctx.dev.erase(a)?;
    }
    state.alloc.ack(a);
    state.alloc.ack(b);
    Ok(Pair([a, b]))
}

/// Maps the id requested in a `Create` op to where it actually landed:
/// unchanged, unless the commit split, in which case a newly created id
/// (always the highest in the set) ends up in the tail.
fn resolved_new_id(requested: u16, _count_after: u16, cr: &CommitResult) -> (Pair, u16) {
    match &cr.split {
        Some((tail, split_id)) => (tail.pair, requested.saturating_sub(*split_id)),
        None => (cr.mdir.pair, requested),
    }
}

/// After committing into a directory's own mdir chain, fixes up every
/// reference to its pair if the commit relocated it, and (when this
/// directory is itself a child of some other directory, not the root)
/// repoints the grandparent's `DirStruct` at the new pair.
fn track_relocation(state: &mut State, old_head: Pair, cr: &CommitResult, grandparent: Pair, grandparent_id: u16) -> Result<()> {
    let Some(old_pair) = cr.relocated_from else { return Ok(()) };
    if old_head.cmp_loose(&state.root) {
        return Err(Errno::NoSpc);
    }
    let remap = Remap { old: old_pair, new: cr.mdir.pair };
    fixup::apply_to_table(&mut state.objects, &remap);
    state.objects.for_each_open_dir(|cursor| fixup::apply_to_cursor(cursor, &remap));
    if grandparent != Pair::NULL {
        let gmdir = mdir::fetch(&mut ctx_of!(state), grandparent)?;
        let mut ctx = ctx_of!(state);
        mdir::commit(&mut ctx, &mut state.alloc, &gmdir, &[fixup::dirstruct_update_op(grandparent_id, cr.mdir.pair)])?;
    }
    Ok(())
}

/// Helper for operations that commit into a directory's mdir and only
/// know that directory's own (parent, id) -- used when the commit target
/// and the "whose entry is this" id coincide (attribute updates).
fn commit_into_dir(state: &mut State, target: Pair, grandparent: Pair, grandparent_id: u16, ops: &[AttrOp]) -> Result<()> {
    let mdir_ = mdir::fetch(&mut ctx_of!(state), target)?;
    let cr = {
        let mut ctx = ctx_of!(state);
        mdir::commit(&mut ctx, &mut state.alloc, &mdir_, ops)?
    };
    track_relocation(state, target, &cr, grandparent, grandparent_id)
}

fn commit_struct_update(state: &mut State, parent: Pair, id: u16, structure: &FileStruct, touch_mtime: bool) -> Result<()> {
    let pmdir = mdir::fetch(&mut ctx_of!(state), parent)?;
    let mut ops = vec![struct_attr_op(id, structure)];
    if touch_mtime {
        if let Some(op) = attr::mtime_touch_op(&state.config, id, now_secs()) {
            ops.push(op);
        }
    }
    let cr = {
        let mut ctx = ctx_of!(state);
        mdir::commit(&mut ctx, &mut state.alloc, &pmdir, &ops)?
    };
    if parent != state.root {
        let grandparent = pair_of_grandparent(state, parent)?;
        track_relocation(state, parent, &cr, grandparent, 0).ok();
    }
    Ok(())
}

/// Scope limitation (recorded in the design notes): finding which
/// ancestor directory's `DirStruct` points at an arbitrary mdir pair
/// would require a reverse pair-to-phid index this build does not
/// maintain. So a relocation triggered by a plain attribute commit
/// (setattr, a file's struct update, a cross-directory move's
/// source-delete commit) only fixes up the in-memory object table and
/// open cursors (`track_relocation` always does that part); the
/// ancestor's on-disk `DirStruct` is left pointing at the old pair.
///
/// Relocation only fires after repeated write corruption during
/// compaction, not on an ordinary commit, so the window is narrow, but
/// the gap is real: a lookup that walks through the stale ancestor
/// reads the old pair's contents as of the relocation rather than
/// following the move. Closing this needs a maintained parent index;
/// out of scope here.
fn pair_of_grandparent(state: &mut State, child: Pair) -> Result<Pair> {
    let _ = child;
    let _ = state;
    Ok(Pair::NULL)
}

/// Walks the whole tree marking every block an mdir pair or a file's
/// content chain still references, for `statfs`/`gc`.
fn used_block_set(ctx: &mut Context, root: Pair) -> Result<std::collections::HashSet<u32>> {
    let mut used = std::collections::HashSet::new();
    let mut stack = vec![root];
    while let Some(head) = stack.pop() {
        let mut children = Vec::new();
        mdir::walk_tail_chain(ctx, head, |ctx, node| {
            used.insert(node.pair.0[0]);
            used.insert(node.pair.0[1]);
            for e in dirent::decode_entries(ctx, node)? {
                match e.kind {
                    FileType::Dir => children.push(dirent::child_pair(ctx, node, e.id)?),
                    FileType::Reg => {
                        if let FileStruct::Ctz(c) = read_file_struct(ctx, node, e.id)? {
                            for b in file::blocks(ctx, &c)? {
                                used.insert(b);
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;
        stack.extend(children);
    }
    Ok(used)
}

fn reclaim_deleted(state: &mut State, _phid: Phid) -> Result<()> {
    // Content blocks of a deleted, now-fully-closed file are not freed
    // eagerly; the next `gc` tree rescan simply will not find them
    // referenced and the allocator reclaims them in due course (module
    // docs, `file.rs`: "the allocator's next tree rescan reclaims them").
    let _ = state;
    Ok(())
}

/// Translates a raw POSIX `open(2)` flag word into this engine's
/// internal open-flag set, the one place `open_flags::OpenFlags` (the
/// narrow access-mode decoder) and `file::OpenFlags` (the engine's own
/// bitflag set) meet.
pub fn translate_open_flags(raw: i32) -> OpenFlags {
    let parsed = open_flags::OpenFlags(raw);
    let mut out = match parsed.acc_mode() {
        open_flags::OpenAccMode::O_RDONLY => OpenFlags::RDONLY,
        open_flags::OpenAccMode::O_WRONLY => OpenFlags::WRONLY,
        open_flags::OpenAccMode::O_RDWR => OpenFlags::RDWR,
    };
    if raw & libc::O_CREAT != 0 {
        out |= OpenFlags::CREAT;
    }
    if raw & libc::O_EXCL != 0 {
        out |= OpenFlags::EXCL;
    }
    if raw & libc::O_TRUNC != 0 {
        out |= OpenFlags::TRUNC;
    }
    if raw & libc::O_APPEND != 0 {
        out |= OpenFlags::APPEND;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::Geometry;
    use crate::testutil::RamBlockDevice;

    fn geometry() -> Geometry {
        Geometry {
            block_size: 512,
            read_size: 16,
            prog_size: 16,
            cache_size: 16,
            block_count: 64,
        }
    }

    fn mounted() -> Lfs {
        let mut dev = RamBlockDevice::new(geometry());
        Lfs::format(&mut dev, &FormatConfig { mount: MountConfig::default() }).unwrap();
        Lfs::mount(Box::new(dev), MountConfig::default()).unwrap()
    }

    #[test]
    fn format_then_mount_sees_empty_root() {
        let fs = mounted();
        let page = {
            fs.open(ROOT_PHID, OpenFlags::RDONLY).unwrap();
            let page = fs.readdir(ROOT_PHID, 0, 4096).unwrap();
            fs.close(ROOT_PHID).unwrap();
            page
        };
        assert!(page.entries.is_empty());
        assert!(page.eof);
    }

    #[test]
    fn create_write_read_roundtrips() {
        let fs = mounted();
        let file = fs.create(ROOT_PHID, b"hello.txt", 0, None).unwrap();
        fs.open(file, OpenFlags::RDWR).unwrap();
        let n = fs.write(file, 0, b"hello, world").unwrap();
        assert_eq!(n, 12);
        let mut buf = [0u8; 12];
        let got = fs.read(file, 0, &mut buf).unwrap();
        assert_eq!(got, 12);
        assert_eq!(&buf, b"hello, world");
        fs.close(file).unwrap();

        match fs.lookup(ROOT_PHID, b"hello.txt").unwrap() {
            Resolved::Entry(p) => assert_eq!(p, file),
            _ => panic!("expected an entry"),
        }
    }

    #[test]
    fn mkdir_then_lookup_nested_path() {
        let fs = mounted();
        let sub = fs.mkdir(ROOT_PHID, b"sub", 0).unwrap();
        let _ = fs.create(sub, b"leaf", 0, None).unwrap();
        match fs.lookup(ROOT_PHID, b"sub/leaf").unwrap() {
            Resolved::Entry(_) => {}
            _ => panic!("expected an entry"),
        }
    }

    #[test]
    fn unlink_removes_entry() {
        let fs = mounted();
        fs.create(ROOT_PHID, b"doomed", 0, None).unwrap();
        fs.unlink(ROOT_PHID, b"doomed").unwrap();
        assert_eq!(fs.lookup(ROOT_PHID, b"doomed"), Err(Errno::NoEnt));
    }

    #[test]
    fn rename_within_same_directory_overwrites_target() {
        let fs = mounted();
        let a = fs.create(ROOT_PHID, b"a", 0, None).unwrap();
        fs.create(ROOT_PHID, b"b", 0, None).unwrap();
        fs.link(ROOT_PHID, b"b", a).unwrap();
        match fs.lookup(ROOT_PHID, b"b").unwrap() {
            Resolved::Entry(p) => assert_eq!(p, a),
            _ => panic!(),
        }
        assert_eq!(fs.lookup(ROOT_PHID, b"a"), Err(Errno::NoEnt));
    }

    #[test]
    fn truncate_shrinks_open_file() {
        let fs = mounted();
        let f = fs.create(ROOT_PHID, b"t", 0, None).unwrap();
        fs.open(f, OpenFlags::RDWR).unwrap();
        fs.write(f, 0, b"0123456789").unwrap();
        fs.truncate(f, 4).unwrap();
        let mut buf = [0u8; 16];
        let n = fs.read(f, 0, &mut buf).unwrap();
        assert_eq!(n, 4);
        fs.close(f).unwrap();
    }

    #[test]
    fn statfs_counts_at_least_the_root_pair() {
        let fs = mounted();
        let sf = fs.statfs().unwrap();
        assert!(sf.blocks_used >= 2);
        assert_eq!(sf.block_count, geometry().block_count);
    }

    #[test]
    fn phid_survives_unrelated_sibling_churn() {
        let fs = mounted();
        let keep = fs.create(ROOT_PHID, b"keep", 0, None).unwrap();
        for i in 0..20 {
            fs.create(ROOT_PHID, format!("churn{i}").as_bytes(), 0, None).unwrap();
        }
        match fs.lookup(ROOT_PHID, b"keep").unwrap() {
            Resolved::Entry(p) => assert_eq!(p, keep),
            _ => panic!(),
        }
    }
}
