//! Phoenix-ID overlay (§4.7): a persistent 64-bit file identifier layered
//! on top of littlefs's local, mdir-scoped ids via a USERATTR tag.
//!
//! A local id is only stable for as long as an mdir's current compaction
//! generation; a PhID survives renames, compactions and splits, giving
//! callers outside the FS mutex (an IPC layer caching open handles by
//! id) something they can hold onto indefinitely.

use crate::dirent;
use crate::dirent::FileType;
use crate::mdir;
use crate::mdir::AttrOp;
use crate::mdir::Mdir;
use crate::mdir::RawAttr;
use crate::tag::NO_ID;
use crate::tag::Pair;
use crate::tag::Tag;
use crate::tag::TagType;
use crate::tag::TypeFamily;
use crate::tag::userattr;
use crate::ctx::Context;
use crate::error::Result;

pub type Phid = u64;

pub const ROOT_PHID: Phid = 1;
pub const INVALID_PHID: Phid = 0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    Reg,
    Dir,
}

impl Kind {
    fn sub(self) -> u8 {
        match self {
            Kind::Reg => userattr::PHID_REG,
            Kind::Dir => userattr::PHID_DIR,
        }
    }
}

/// Builds the `SetAttr` op that stamps `phid` onto `id` as a Phoenix-ID
/// user attribute.
pub fn stamp_op(id: u16, kind: Kind, phid: Phid) -> AttrOp {
    AttrOp::SetAttr {
        tag: Tag::of(TagType::UserAttr(kind.sub()), id, 8),
        payload: phid.to_le_bytes().to_vec(),
    }
}

/// Reads the Phoenix-ID stamped on `id` within `mdir`, if any (a file
/// created before the overlay existed has none until `upgrade`s it).
pub fn get(ctx: &mut Context, mdir: &Mdir, id: u16) -> Result<Option<(Kind, Phid)>> {
    for kind in [Kind::Reg, Kind::Dir] {
        if let Some(attr) = mdir::get_attr(
            ctx,
            mdir,
            TypeFamily::UserAttr as u16,
            id,
            kind.sub() as u16,
        )? {
            return Ok(Some((kind, decode_phid(&attr)?)));
        }
    }
    Ok(None)
}

fn decode_phid(attr: &RawAttr) -> Result<Phid> {
    if attr.payload.len() != 8 {
        return Err(crate::error::Errno::Corrupt);
    }
    Ok(u64::from_le_bytes(attr.payload[..8].try_into().unwrap()))
}

/// Scans every live id in `mdir` for one stamped with `phid`.
pub fn find_in_mdir(ctx: &mut Context, mdir: &Mdir, phid: Phid) -> Result<Option<u16>> {
    let entries = mdir::live_entries(ctx, mdir)?;
    for e in &entries {
        let family = e.tag.family();
        if family != TypeFamily::UserAttr as u16 {
            continue;
        }
        let sub = (e.tag.type3 & 0xff) as u8;
        if (sub == userattr::PHID_REG || sub == userattr::PHID_DIR) && e.tag.id != NO_ID {
            if decode_phid(e)? == phid {
                return Ok(Some(e.tag.id));
            }
        }
    }
    Ok(None)
}

/// The running allocator state: the highest Phoenix-ID issued so far.
/// Recovered at mount by a full-tree walk (`recover_last_id` in `fs.rs`,
/// since only it can walk the whole directory chain).
pub struct IdAllocator {
    last_id: Phid,
}

impl IdAllocator {
    pub fn new(last_id: Phid) -> Self {
        IdAllocator { last_id: last_id.max(ROOT_PHID) }
    }

    pub fn last_id(&self) -> Phid {
        self.last_id
    }

    pub fn observe(&mut self, phid: Phid) {
        if phid > self.last_id {
            self.last_id = phid;
        }
    }

    pub fn allocate(&mut self) -> Phid {
        self.last_id += 1;
        self.last_id
    }
}

/// Walks the whole directory tree from `root` once, taking the max PhID
/// payload encountered across every mdir chain, recursively descending
/// into subdirectories with an explicit stack rather than recursion
/// (Design Notes §9, "depth <= 3" caveat does not bound this walk's
/// actual depth -- it bounds the in-memory stack representation, not
/// the directory nesting this crate accepts). Defaults to `ROOT_PHID`
/// on a freshly formatted filesystem with no PhIDs stamped yet.
pub fn recover_last_id(ctx: &mut Context, root: Pair) -> Result<Phid> {
    let mut max_id = ROOT_PHID;
    let mut stack = vec![root];

    while let Some(head) = stack.pop() {
        let mut children = Vec::new();
        mdir::walk_tail_chain(ctx, head, |ctx, mdir| {
            for e in mdir::live_entries(ctx, mdir)? {
                if e.tag.family() == TypeFamily::UserAttr as u16 {
                    let sub = (e.tag.type3 & 0xff) as u8;
                    if sub == userattr::PHID_REG || sub == userattr::PHID_DIR {
                        let v = decode_phid(&e)?;
                        if v > max_id {
                            max_id = v;
                        }
                    }
                }
            }
            for entry in dirent::decode_entries(ctx, mdir)? {
                if entry.kind == FileType::Dir {
                    children.push(dirent::child_pair(ctx, mdir, entry.id)?);
                }
            }
            Ok(())
        })?;
        stack.extend(children);
    }

    Ok(max_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotonic_and_starts_above_root() {
        let mut a = IdAllocator::new(INVALID_PHID);
        assert_eq!(a.last_id(), ROOT_PHID);
        let first = a.allocate();
        let second = a.allocate();
        assert!(second > first);
        assert!(first > ROOT_PHID);
    }

    #[test]
    fn observe_only_moves_forward() {
        let mut a = IdAllocator::new(5);
        a.observe(3);
        assert_eq!(a.last_id(), 5);
        a.observe(10);
        assert_eq!(a.last_id(), 10);
    }
}
