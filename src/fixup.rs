//! Fix-up engine (§4.9): repairs every cross-reference to an mdir pair
//! that changed identity.
//!
//! Ordinary compaction never needs this — [`crate::tag::Pair::cmp_loose`]
//! makes which half is "active" invisible to anything outside `mdir.rs`,
//! so a plain compact-in-place or active-half-flip is already reflected
//! the next time a caller re-fetches the pair. Only a true *relocation*
//! (repeated corruption forces abandoning the old pair for a brand new
//! one, [`crate::mdir::CommitResult::relocated_from`]) changes the pair
//! value itself, and that has to be walked out to every place a pair is
//! remembered: the parent's `DirStruct` attribute, any cached object
//! stub, and any open directory cursor.

use crate::dirent::DirCursor;
use crate::lru::ObjectTable;
use crate::mdir::AttrOp;
use crate::tag::Pair;
use crate::tag::Tag;
use crate::tag::TagType;

/// One pair's old identity replaced by its new one.
#[derive(Copy, Clone, Debug)]
pub struct Remap {
    pub old: Pair,
    pub new: Pair,
}

impl Remap {
    pub fn matches(&self, pair: Pair) -> bool {
        pair.cmp_loose(&self.old)
    }
}

/// Rewrites every cached object whose `parent` is `remap.old`.
pub fn apply_to_table(table: &mut ObjectTable, remap: &Remap) {
    table.fixup(|parent, id| {
        if remap.matches(parent) {
            Some((remap.new, id))
        } else {
            None
        }
    });
}

/// Rewrites an open readdir cursor if it was positioned on the
/// relocated pair.
pub fn apply_to_cursor(cursor: &mut DirCursor, remap: &Remap) {
    if remap.matches(cursor.pair) {
        cursor.pair = remap.new;
    }
}

/// Builds the `SetAttr` op a caller commits into the *parent* mdir to
/// repoint a child directory's `DirStruct` attribute at its new pair
/// after relocation. `id` is the child's local id within the parent.
pub fn dirstruct_update_op(id: u16, new_pair: Pair) -> AttrOp {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&new_pair.0[0].to_le_bytes());
    payload.extend_from_slice(&new_pair.0[1].to_le_bytes());
    AttrOp::SetAttr {
        tag: Tag::of(TagType::DirStruct, id, 8),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lru::ObjectState;

    #[test]
    fn table_entries_under_relocated_parent_are_rewritten() {
        let mut table = ObjectTable::new(8);
        let old = Pair([1, 2]);
        table.remember(10, old, 3);
        let remap = Remap { old, new: Pair([9, 10]) };
        apply_to_table(&mut table, &remap);
        assert_eq!(table.get(10).unwrap().parent, remap.new);
    }

    #[test]
    fn unrelated_entries_are_left_alone() {
        let mut table = ObjectTable::new(8);
        let other = Pair([5, 6]);
        table.open(11, other, 0, ObjectState::Stub);
        let remap = Remap {
            old: Pair([1, 2]),
            new: Pair([9, 10]),
        };
        apply_to_table(&mut table, &remap);
        assert_eq!(table.get(11).unwrap().parent, other);
    }

    #[test]
    fn cursor_on_relocated_pair_follows() {
        let mut cursor = DirCursor::new(Pair([1, 2]));
        let remap = Remap { old: Pair([2, 1]), new: Pair([9, 10]) };
        apply_to_cursor(&mut cursor, &remap);
        assert_eq!(cursor.pair, remap.new);
    }
}
