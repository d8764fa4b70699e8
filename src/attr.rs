//! POSIX attribute overlay (§4.0 ambient attributes): mtime/ctime/atime,
//! uid/gid and mode, each stored the same way the Phoenix-ID overlay
//! stores its own tag (`phid.rs`) — a `UserAttr` sub-type keyed to the
//! entry's local id, read back with `mdir::get_attr`.

use crate::config::MountConfig;
use crate::ctx::Context;
use crate::error::Errno;
use crate::error::Result;
use crate::mdir::AttrOp;
use crate::mdir::Mdir;
use crate::mdir;
use crate::tag::Tag;
use crate::tag::TagType;
use crate::tag::TypeFamily;
use crate::tag::userattr;

/// Default mode bits for a newly created entry, before any `chmod`.
pub const DEFAULT_REG_MODE: u32 = 0o100644;
pub const DEFAULT_DIR_MODE: u32 = 0o040755;

#[derive(Copy, Clone, Debug, Default)]
pub struct Attrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
}

fn get_u32(ctx: &mut Context, mdir: &Mdir, id: u16, sub: u8) -> Result<Option<u32>> {
    let Some(attr) = mdir::get_attr(ctx, mdir, TypeFamily::UserAttr as u16, id, sub as u16)? else {
        return Ok(None);
    };
    if attr.payload.len() != 4 {
        return Err(Errno::Corrupt);
    }
    Ok(Some(u32::from_le_bytes(attr.payload[..4].try_into().unwrap())))
}

fn get_u64(ctx: &mut Context, mdir: &Mdir, id: u16, sub: u8) -> Result<Option<u64>> {
    let Some(attr) = mdir::get_attr(ctx, mdir, TypeFamily::UserAttr as u16, id, sub as u16)? else {
        return Ok(None);
    };
    if attr.payload.len() != 8 {
        return Err(Errno::Corrupt);
    }
    Ok(Some(u64::from_le_bytes(attr.payload[..8].try_into().unwrap())))
}

/// Reads every attribute stamped on `id`, defaulting anything absent
/// (a file created before an attribute existed, or with its tracking
/// disabled by `MountConfig`) to zero.
pub fn get(ctx: &mut Context, mdir: &Mdir, id: u16) -> Result<Attrs> {
    Ok(Attrs {
        mode: get_u32(ctx, mdir, id, userattr::MODE)?.unwrap_or(0),
        uid: get_u32(ctx, mdir, id, userattr::UID)?.unwrap_or(0),
        gid: get_u32(ctx, mdir, id, userattr::GID)?.unwrap_or(0),
        atime: get_u64(ctx, mdir, id, userattr::ATIME)?.unwrap_or(0),
        ctime: get_u64(ctx, mdir, id, userattr::CTIME)?.unwrap_or(0),
        mtime: get_u64(ctx, mdir, id, userattr::MTIME)?.unwrap_or(0),
    })
}

fn set_u32_op(id: u16, sub: u8, value: u32) -> AttrOp {
    AttrOp::SetAttr {
        tag: Tag::of(TagType::UserAttr(sub), id, 4),
        payload: value.to_le_bytes().to_vec(),
    }
}

fn set_u64_op(id: u16, sub: u8, value: u64) -> AttrOp {
    AttrOp::SetAttr {
        tag: Tag::of(TagType::UserAttr(sub), id, 8),
        payload: value.to_le_bytes().to_vec(),
    }
}

pub fn set_mode_op(id: u16, mode: u32) -> AttrOp {
    set_u32_op(id, userattr::MODE, mode)
}

pub fn set_owner_ops(id: u16, uid: u32, gid: u32) -> [AttrOp; 2] {
    [set_u32_op(id, userattr::UID, uid), set_u32_op(id, userattr::GID, gid)]
}

/// Stamps ctime unconditionally, for entry creation (the only attribute
/// every entry carries regardless of `MountConfig` flags).
pub fn ctime_op(id: u16, now: u64) -> AttrOp {
    set_u64_op(id, userattr::CTIME, now)
}

/// Builds the mtime-touch op, or `None` if `MountConfig` disables mtime
/// tracking.
pub fn mtime_touch_op(config: &MountConfig, id: u16, now: u64) -> Option<AttrOp> {
    config.use_mtime().then(|| set_u64_op(id, userattr::MTIME, now))
}

/// Builds the atime-touch op, or `None` if `MountConfig` disables atime
/// tracking (the common case — littlefs-style media rarely wants a
/// write-on-every-read attribute).
pub fn atime_touch_op(config: &MountConfig, id: u16, now: u64) -> Option<AttrOp> {
    config.use_atime().then(|| set_u64_op(id, userattr::ATIME, now))
}

/// The initial attribute set stamped when an entry is created: mode
/// plus ctime unconditionally, mtime if tracked (atime starts absent
/// until first read).
pub fn initial_ops(config: &MountConfig, id: u16, mode: u32, now: u64) -> Vec<AttrOp> {
    let mut ops = vec![set_mode_op(id, mode), ctime_op(id, now)];
    if let Some(op) = mtime_touch_op(config, id, now) {
        ops.push(op);
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::bd::Geometry;
    use crate::cache::Caches;
    use crate::mdir::AttrOp as Op;
    use crate::tag::GState;
    use crate::tag::Pair;
    use crate::testutil::RamBlockDevice;

    fn with_ctx<F: FnOnce(&mut Context)>(f: F) {
        let geometry = Geometry {
            block_size: 512,
            read_size: 16,
            prog_size: 16,
            cache_size: 16,
            block_count: 16,
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
    fn missing_attrs_default_to_zero() {
        with_ctx(|ctx| {
            let mut alloc = Allocator::new(ctx.geometry.block_count, 1);
            let a = alloc.alloc(|_| Ok(())).unwrap();
            let b = alloc.alloc(|_| Ok(())).unwrap();
            ctx.dev.erase(a).unwrap();
            let fresh = Mdir {
                pair: Pair([a, b]),
                rev: 0,
                off: 4,
                ptag: 0xffff_ffff,
                count: 0,
                erased: true,
                split: false,
                tail: Pair::NULL,
                gdelta: GState::ZERO,
            };
            let r = mdir::commit(ctx, &mut alloc, &fresh, &[Op::Create { id: 0 }]).unwrap();
            let got = get(ctx, &r.mdir, 0).unwrap();
            assert_eq!(got.mode, 0);
            assert_eq!(got.uid, 0);
        });
    }

    #[test]
    fn stamped_attrs_round_trip() {
        with_ctx(|ctx| {
            let mut alloc = Allocator::new(ctx.geometry.block_count, 1);
            let a = alloc.alloc(|_| Ok(())).unwrap();
            let b = alloc.alloc(|_| Ok(())).unwrap();
            ctx.dev.erase(a).unwrap();
            let fresh = Mdir {
                pair: Pair([a, b]),
                rev: 0,
                off: 4,
                ptag: 0xffff_ffff,
                count: 0,
                erased: true,
                split: false,
                tail: Pair::NULL,
                gdelta: GState::ZERO,
            };
            let mut ops = vec![Op::Create { id: 0 }];
            ops.extend(initial_ops(ctx.config, 0, DEFAULT_REG_MODE, 1_000));
            let r = mdir::commit(ctx, &mut alloc, &fresh, &ops).unwrap();
            let got = get(ctx, &r.mdir, 0).unwrap();
            assert_eq!(got.mode, DEFAULT_REG_MODE);
            assert_eq!(got.ctime, 1_000);
        });
    }
}
