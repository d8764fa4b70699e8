//! Tag & pair codec (§4.3): the 32-bit entry tag, block-pair helpers, and
//! the gstate XOR algebra.
//!
//! Bit layout (big-endian on disk, matching
//! `examples/original_source/littlefs/lfs_internal.h`'s `LFS_MKTAG`):
//! bit 31 is the valid flag (0 = valid), bits 30..20 are an 11-bit type,
//! bits 19..10 are a 10-bit id, bits 9..0 are a 10-bit size.

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// `id` value meaning "no file" — used by TAIL, GLOBALS and the
/// delete-all SPLICE chunk.
pub const NO_ID: u16 = 0x3ff;
/// `size` value marking a tag as a tombstone (delete).
pub const DELETE_SIZE: u16 = 0x3ff;
/// Sentinel block value for a null half of a pair.
pub const BLOCK_NULL: u32 = u32::MAX;

/// Top 3 bits of the 11-bit type field: the tag's family.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum TypeFamily {
    Name = 0x0,
    From = 0x1,
    Struct = 0x2,
    UserAttr = 0x3,
    Crc = 0x5,
    Tail = 0x6,
    Globals = 0x7,
    Splice = 0x4,
}

/// Full 11-bit tag types this crate emits or recognizes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TagType {
    Reg,
    Dir,
    Superblock,
    Create,
    Delete,
    DirStruct,
    CtzStruct,
    InlineStruct,
    UserAttr(u8),
    FromNoop,
    FromMove,
    FromUserAttrs,
    SoftTail,
    HardTail,
    Ccrc,
    Fcrc,
    Globals,
}

impl TagType {
    /// The 11-bit wire encoding of this type.
    pub fn wire(self) -> u16 {
        match self {
            TagType::Reg => 0x001,
            TagType::Dir => 0x002,
            TagType::Superblock => 0x0ff,
            TagType::Create => 0x401,
            TagType::Delete => 0x4ff,
            TagType::DirStruct => 0x200,
            TagType::CtzStruct => 0x202,
            TagType::InlineStruct => 0x201,
            TagType::UserAttr(sub) => 0x300 | sub as u16,
            TagType::FromNoop => 0x100,
            TagType::FromMove => 0x101,
            TagType::FromUserAttrs => 0x102,
            TagType::SoftTail => 0x600,
            TagType::HardTail => 0x601,
            TagType::Ccrc => 0x500,
            TagType::Fcrc => 0x5ff,
            TagType::Globals => 0x7ff,
        }
    }

    /// Decodes a wire type back into a `TagType`, when recognized.
    pub fn from_wire(w: u16) -> Option<TagType> {
        Some(match w {
            0x001 => TagType::Reg,
            0x002 => TagType::Dir,
            0x0ff => TagType::Superblock,
            0x401 => TagType::Create,
            0x4ff => TagType::Delete,
            0x200 => TagType::DirStruct,
            0x202 => TagType::CtzStruct,
            0x201 => TagType::InlineStruct,
            0x100 => TagType::FromNoop,
            0x101 => TagType::FromMove,
            0x102 => TagType::FromUserAttrs,
            0x600 => TagType::SoftTail,
            0x601 => TagType::HardTail,
            0x500 => TagType::Ccrc,
            0x5ff => TagType::Fcrc,
            0x7ff => TagType::Globals,
            w if w & 0x700 == 0x300 => TagType::UserAttr((w & 0xff) as u8),
            _ => return None,
        })
    }

    /// Top 3 bits ("type1"), used for coarse family dispatch during
    /// traversal/filtering.
    pub fn family(self) -> u16 {
        (self.wire() & 0x700) >> 8
    }
}

/// User-attribute sub-types for the Phoenix overlay (SPEC_FULL §4.0).
pub mod userattr {
    pub const ATIME: u8 = 0xf6;
    pub const CTIME: u8 = 0xf7;
    pub const MTIME: u8 = 0xf8;
    pub const UID: u8 = 0xf9;
    pub const GID: u8 = 0xfa;
    pub const MODE: u8 = 0xfb;
    pub const PHID_REG: u8 = 0xfc;
    pub const PHID_DIR: u8 = 0xfd;
}

/// A decoded `(type, id, size)` tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    pub valid: bool,
    pub type3: u16,
    pub id: u16,
    pub size: u16,
}

impl Tag {
    pub fn new(type3: u16, id: u16, size: u16) -> Self {
        Tag {
            valid: true,
            type3,
            id,
            size,
        }
    }

    pub fn of(ty: TagType, id: u16, size: u16) -> Self {
        Tag::new(ty.wire(), id, size)
    }

    /// Encodes to the raw 32-bit wire word (pre-XOR).
    pub fn encode(self) -> u32 {
        let valid_bit = if self.valid { 0 } else { 1u32 << 31 };
        valid_bit | ((self.type3 as u32) << 20) | ((self.id as u32) << 10) | (self.size as u32)
    }

    /// Decodes a raw 32-bit wire word.
    pub fn decode(word: u32) -> Tag {
        Tag {
            valid: word & 0x8000_0000 == 0,
            type3: ((word & 0x7ff0_0000) >> 20) as u16,
            id: ((word & 0x000f_fc00) >> 10) as u16,
            size: (word & 0x0000_03ff) as u16,
        }
    }

    pub fn is_delete(self) -> bool {
        self.size == DELETE_SIZE
    }

    pub fn family(self) -> u16 {
        (self.type3 & 0x700) >> 8
    }

    /// Total on-disk size of this entry including the 4-byte tag itself;
    /// a delete tag has no payload regardless of its `size` field.
    pub fn dsize(self) -> u32 {
        4 + if self.is_delete() { 0 } else { self.size as u32 }
    }
}

/// Pure iterator turning an XOR-delta-encoded stream of raw words into
/// tags: `(prev_tag, raw_word) -> (tag, next_prev)` (Design Notes §9).
pub fn decode_delta(prev: u32, raw_word: u32) -> (Tag, u32) {
    let word = prev ^ raw_word;
    (Tag::decode(word), word)
}

/// Encodes `tag` against `prev`, producing the XOR-delta word to write.
pub fn encode_delta(prev: u32, tag: Tag) -> u32 {
    prev ^ tag.encode()
}

/// A block pair addressing one mdir.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pair(pub [u32; 2]);

impl Pair {
    pub const NULL: Pair = Pair([BLOCK_NULL, BLOCK_NULL]);

    pub fn is_null(&self) -> bool {
        self.0[0] == BLOCK_NULL || self.0[1] == BLOCK_NULL
    }

    /// 0 when any half of `self` matches either half of `other` — used to
    /// detect "the same pair" across block re-orderings (§4.3).
    pub fn cmp_loose(&self, other: &Pair) -> bool {
        self.0[0] == other.0[0]
            || self.0[1] == other.0[1]
            || self.0[0] == other.0[1]
            || self.0[1] == other.0[0]
    }

    /// Requires an exact ordered match.
    pub fn issync(&self, other: &Pair) -> bool {
        (self.0[0] == other.0[0] && self.0[1] == other.0[1])
            || (self.0[0] == other.0[1] && self.0[1] == other.0[0])
    }

    pub fn swap(&self) -> Pair {
        Pair([self.0[1], self.0[0]])
    }
}

/// Global state accumulated by XOR across every commit's movestate
/// attribute (§3 "Global state", §4.3).
///
/// Layout: word 0 encodes `(tag, id)` of a pending move's source --
/// `tag` carries the orphan count in its size field and the
/// needs-superblock-rewrite bit in its type, `pair` is the move's source
/// mdir pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct GState {
    pub tag: u32,
    pub pair: [u32; 2],
}

impl GState {
    /// The "nothing outstanding" value: no pending move means the move-id
    /// field holds `NO_ID`, not 0 (`0` is itself a valid local id).
    pub const ZERO: GState = GState {
        tag: (NO_ID as u32) << 10,
        pair: [0, 0],
    };

    pub fn xor(self, other: GState) -> GState {
        GState {
            tag: self.tag ^ other.tag,
            pair: [self.pair[0] ^ other.pair[0], self.pair[1] ^ other.pair[1]],
        }
    }

    pub fn is_zero(self) -> bool {
        self == GState::ZERO
    }

    /// True if a cross-mdir move is outstanding: the tag's id field is
    /// not `NO_ID`.
    pub fn has_move(self) -> bool {
        let id = ((self.tag & 0x000f_fc00) >> 10) as u16;
        id != NO_ID
    }

    pub fn move_id(self) -> u16 {
        ((self.tag & 0x000f_fc00) >> 10) as u16
    }

    pub fn move_pair(self) -> Pair {
        Pair(self.pair)
    }

    /// Outstanding orphan count, carried in the tag's size field.
    pub fn orphans(self) -> i32 {
        let size = (self.tag & 0x0000_03ff) as i16;
        // sign-extend from 10 bits so decrementing past zero is visible
        ((size << 6) as i16 >> 6) as i32
    }

    pub fn needs_superblock(self) -> bool {
        self.tag & 0x8000_0000 != 0
    }

    pub fn has_move_here(self, pair: Pair) -> bool {
        self.has_move() && pair.cmp_loose(&self.move_pair())
    }

    pub fn set_orphans(mut self, n: i32) -> GState {
        let clamped = n.clamp(-512, 511) as i16 as u32 & 0x3ff;
        self.tag = (self.tag & !0x0000_03ff) | clamped;
        self
    }

    pub fn set_move(mut self, id: u16, pair: Pair) -> GState {
        self.tag = (self.tag & !0x000f_fc00) | ((id as u32) << 10);
        self.pair = pair.0;
        self
    }

    pub fn clear_move(mut self) -> GState {
        self.tag = (self.tag & !0x000f_fc00) | ((NO_ID as u32) << 10);
        self.pair = [0, 0];
        self
    }
}

/// Reproduces the original's documented name-comparison quirk: a
/// differing-length candidate can report `Less` before a byte mismatch
/// is found. Preserved for on-disk binary-search compatibility, not
/// because the ordering is otherwise meaningful (Design Notes §9, open
/// question 1).
pub fn name_cmp(candidate: &[u8], target: &[u8]) -> std::cmp::Ordering {
    let n = candidate.len().min(target.len());
    match candidate[..n].cmp(&target[..n]) {
        std::cmp::Ordering::Equal => candidate.len().cmp(&target.len()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip_is_total() {
        for type3 in [0x000u16, 0x1ff, 0x200, 0x2ff, 0x3fc, 0x600, 0x601, 0x7ff] {
            for id in [0u16, 1, 42, NO_ID] {
                for size in [0u16, 1, 511, DELETE_SIZE] {
                    let t = Tag::new(type3, id, size);
                    let decoded = Tag::decode(t.encode());
                    assert_eq!(t, decoded, "type3={type3:#x} id={id} size={size}");
                }
            }
        }
    }

    #[test]
    fn delta_roundtrip() {
        let mut prev = 0u32;
        let tags = [
            Tag::of(TagType::Create, 0, 0),
            Tag::of(TagType::Reg, 0, 0),
            Tag::of(TagType::InlineStruct, 0, 5),
        ];
        let mut words = Vec::new();
        for t in tags {
            let w = encode_delta(prev, t);
            words.push(w);
            prev = prev ^ w;
        }
        let mut prev = 0u32;
        for (i, w) in words.iter().enumerate() {
            let (decoded, next) = decode_delta(prev, *w);
            assert_eq!(decoded, tags[i]);
            prev = next;
        }
    }

    #[test]
    fn pair_cmp_semantics() {
        let a = Pair([1, 2]);
        let b = Pair([2, 3]);
        let c = Pair([4, 5]);
        assert!(a.cmp_loose(&b));
        assert!(!a.cmp_loose(&c));
        assert!(a.issync(&Pair([2, 1])));
        assert!(!a.issync(&b));
    }

    #[test]
    fn gstate_zero_iff_no_outstanding_work() {
        let g = GState::ZERO;
        assert!(g.is_zero());
        assert!(!g.has_move());
        let g = g.set_move(3, Pair([5, 6]));
        assert!(!g.is_zero());
        assert!(g.has_move());
        assert_eq!(g.move_id(), 3);
        let g = g.clear_move();
        assert!(!g.has_move());
        assert!(g.is_zero());
    }

    #[test]
    fn gstate_orphan_roundtrip() {
        let g = GState::ZERO.set_orphans(3);
        assert_eq!(g.orphans(), 3);
        let g = g.set_orphans(0);
        assert_eq!(g.orphans(), 0);
    }
}
