//! Directory entry decoding and iteration (§4.5 "Name lookup", §4.6
//! "Readdir"): turns an mdir's raw attribute set into named, typed
//! children, and tracks a readdir cursor's position across an mdir
//! chain (a directory's entries can span more than one mdir once it
//! has split).

use crate::ctx::Context;
use crate::error::Result;
use crate::mdir;
use crate::mdir::Mdir;
use crate::tag::NO_ID;
use crate::tag::Pair;
use crate::tag::TagType;
use crate::tag::name_cmp;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    Reg,
    Dir,
}

impl FileType {
    fn from_tag_type(ty: TagType) -> Option<FileType> {
        match ty {
            TagType::Reg => Some(FileType::Reg),
            TagType::Dir => Some(FileType::Dir),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub id: u16,
    pub kind: FileType,
    pub name: Vec<u8>,
}

/// Decodes every Name-family attribute in `mdir` into a `DirEntry`,
/// dropping the deleted-dir dummy entry at `NO_ID` (if any) and any
/// other non-name attribute.
pub fn decode_entries(ctx: &mut Context, mdir: &Mdir) -> Result<Vec<DirEntry>> {
    let raw = mdir::live_entries(ctx, mdir)?;
    let mut out = Vec::new();
    for e in raw {
        if e.tag.id == NO_ID {
            continue;
        }
        let Some(ty) = TagType::from_wire(e.tag.type3) else {
            continue;
        };
        let Some(kind) = FileType::from_tag_type(ty) else {
            continue;
        };
        out.push(DirEntry {
            id: e.tag.id,
            kind,
            name: e.payload,
        });
    }
    Ok(out)
}

/// Entries sorted by name, matching the on-disk binary-search order
/// (`name_cmp`'s quirk, see `tag.rs`) so readdir output is stable
/// across mounts even though our live set is gathered via a hash map.
pub fn sorted_listing(ctx: &mut Context, mdir: &Mdir) -> Result<Vec<DirEntry>> {
    let mut entries = decode_entries(ctx, mdir)?;
    entries.sort_by(|a, b| name_cmp(&a.name, &b.name));
    Ok(entries)
}

/// Finds the entry named `name` directly within `mdir` (one mdir of a
/// chain; the caller walks `tail` to cover a split directory).
pub fn lookup(ctx: &mut Context, mdir: &Mdir, name: &[u8]) -> Result<Option<DirEntry>> {
    let entries = decode_entries(ctx, mdir)?;
    Ok(entries.into_iter().find(|e| e.name == name))
}

/// Reads the block pair a directory entry's `DirStruct` attribute
/// points at -- the head of the child directory's own mdir chain.
pub fn child_pair(ctx: &mut Context, mdir: &Mdir, id: u16) -> Result<Pair> {
    let attr = mdir::get_attr(ctx, mdir, crate::tag::TypeFamily::Struct as u16, id, 0)?
        .ok_or(crate::error::Errno::Corrupt)?;
    if attr.payload.len() != 8 {
        return Err(crate::error::Errno::Corrupt);
    }
    Ok(Pair([
        u32::from_le_bytes(attr.payload[0..4].try_into().unwrap()),
        u32::from_le_bytes(attr.payload[4..8].try_into().unwrap()),
    ]))
}

/// A readdir position: which mdir of the directory's chain is current
/// and how far into its sorted listing. `fs.rs` advances this by
/// calling `sorted_listing` on `pair`; once `index` runs off the end it
/// follows the mdir's `tail` pointer and resets `index` to 0.
#[derive(Clone, Debug)]
pub struct DirCursor {
    pub pair: Pair,
    pub index: usize,
    pub done: bool,
}

impl DirCursor {
    pub fn new(root: Pair) -> Self {
        DirCursor {
            pair: root,
            index: 0,
            done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::bd::Geometry;
    use crate::cache::Caches;
    use crate::config::MountConfig;
    use crate::mdir::AttrOp;
    use crate::tag::Tag;
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
    fn listing_is_sorted_and_typed() {
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
                gdelta: crate::tag::GState::ZERO,
            };
            let r1 = mdir::commit(
                ctx,
                &mut alloc,
                &fresh,
                &[
                    AttrOp::Create { id: 0 },
                    AttrOp::SetAttr {
                        tag: Tag::of(TagType::Dir, 0, 5),
                        payload: b"zebra".to_vec(),
                    },
                ],
            )
            .unwrap();
            let r2 = mdir::commit(
                ctx,
                &mut alloc,
                &r1.mdir,
                &[
                    AttrOp::Create { id: 0 },
                    AttrOp::SetAttr {
                        tag: Tag::of(TagType::Reg, 0, 5),
                        payload: b"alpha".to_vec(),
                    },
                ],
            )
            .unwrap();

            let listing = sorted_listing(ctx, &r2.mdir).unwrap();
            assert_eq!(listing.len(), 2);
            assert_eq!(listing[0].name, b"alpha");
            assert_eq!(listing[0].kind, FileType::Reg);
            assert_eq!(listing[1].name, b"zebra");
            assert_eq!(listing[1].kind, FileType::Dir);

            let found = lookup(ctx, &r2.mdir, b"zebra").unwrap().unwrap();
            assert_eq!(found.kind, FileType::Dir);
        });
    }
}
