//! Object LRU and open-handle table (§4.8): one entry per Phoenix-ID
//! that is either open, recently referenced, or pending delete.
//!
//! A `Stub` carries just enough (parent pair + local id) to resolve a
//! PhID to a dirent without re-walking the tree; `OpenFile`/`OpenDir`
//! carry the live handle state. Entries are reference-counted so a file
//! unlinked while still open (`deleted = true`) survives until its last
//! close, matching POSIX delete-on-last-close.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::dirent::DirCursor;
use crate::file::FileHandle;
use crate::phid::Phid;
use crate::tag::Pair;

pub enum ObjectState {
    Stub,
    OpenFile(FileHandle),
    OpenDir(DirCursor),
    /// A reference to an external device/special node; this crate does
    /// not interpret its payload, only keeps it pinned while open.
    DeviceRef(u64),
}

pub struct Object {
    pub parent: Pair,
    pub id: u16,
    pub refcount: u32,
    pub deleted: bool,
    pub state: ObjectState,
}

/// Bound on how many non-open stub entries are retained for fast
/// PhID-to-dirent resolution before the least-recently-used one is
/// dropped (reopen then falls back to a tree scan).
pub struct ObjectTable {
    objects: HashMap<Phid, Object>,
    lru: VecDeque<Phid>,
    max_cached: usize,
}

impl ObjectTable {
    pub fn new(max_cached: usize) -> Self {
        ObjectTable {
            objects: HashMap::new(),
            lru: VecDeque::new(),
            max_cached,
        }
    }

    pub fn get(&self, phid: Phid) -> Option<&Object> {
        self.objects.get(&phid)
    }

    pub fn get_mut(&mut self, phid: Phid) -> Option<&mut Object> {
        self.objects.get_mut(&phid)
    }

    fn touch(&mut self, phid: Phid) {
        self.lru.retain(|&p| p != phid);
        self.lru.push_back(phid);
    }

    /// Inserts or refreshes a stub for `phid` pointing at `(parent, id)`,
    /// without touching refcount/open state.
    pub fn remember(&mut self, phid: Phid, parent: Pair, id: u16) {
        self.objects
            .entry(phid)
            .and_modify(|o| {
                o.parent = parent;
                o.id = id;
            })
            .or_insert(Object {
                parent,
                id,
                refcount: 0,
                deleted: false,
                state: ObjectState::Stub,
            });
        self.touch(phid);
        self.evict_unreferenced();
    }

    /// Opens `phid`, bumping its refcount and installing `state`.
    pub fn open(&mut self, phid: Phid, parent: Pair, id: u16, state: ObjectState) {
        let obj = self.objects.entry(phid).or_insert(Object {
            parent,
            id,
            refcount: 0,
            deleted: false,
            state: ObjectState::Stub,
        });
        obj.parent = parent;
        obj.id = id;
        obj.refcount += 1;
        obj.state = state;
        self.touch(phid);
    }

    /// Drops one reference to `phid`. Returns `true` if this was the
    /// last reference and the object was both deleted and closed (the
    /// caller should reclaim any remaining on-disk content).
    pub fn close(&mut self, phid: Phid) -> bool {
        let Some(obj) = self.objects.get_mut(&phid) else {
            return false;
        };
        obj.refcount = obj.refcount.saturating_sub(1);
        if obj.refcount == 0 {
            let deleted = obj.deleted;
            obj.state = ObjectState::Stub;
            if deleted {
                self.objects.remove(&phid);
                self.lru.retain(|&p| p != phid);
                return true;
            }
            self.evict_unreferenced();
        }
        false
    }

    /// Marks `phid` as unlinked. If nothing has it open, removes it
    /// immediately and reports that its content can be reclaimed.
    pub fn mark_deleted(&mut self, phid: Phid) -> bool {
        match self.objects.get_mut(&phid) {
            Some(obj) if obj.refcount > 0 => {
                obj.deleted = true;
                false
            }
            Some(_) => {
                self.objects.remove(&phid);
                self.lru.retain(|&p| p != phid);
                true
            }
            None => true,
        }
    }

    /// Rewrites every cached `(parent, id)` reference matching
    /// `old_parent` via `remap`, used by the fix-up engine after a
    /// commit/relocation changes local ids or pair identity (§4.9).
    pub fn fixup<F: Fn(Pair, u16) -> Option<(Pair, u16)>>(&mut self, remap: F) {
        for obj in self.objects.values_mut() {
            if let Some((new_parent, new_id)) = remap(obj.parent, obj.id) {
                obj.parent = new_parent;
                obj.id = new_id;
            }
        }
    }

    /// Visits every open directory cursor's `ObjectState::OpenDir`, for
    /// the fix-up engine to rewrite a relocated pair a readdir was
    /// positioned on.
    pub fn for_each_open_dir<F: FnMut(&mut crate::dirent::DirCursor)>(&mut self, mut f: F) {
        for obj in self.objects.values_mut() {
            if let ObjectState::OpenDir(cursor) = &mut obj.state {
                f(cursor);
            }
        }
    }

    fn evict_unreferenced(&mut self) {
        while self.lru.len() > self.max_cached {
            let victim = self
                .lru
                .iter()
                .position(|&p| self.objects.get(&p).is_some_and(|o| o.refcount == 0 && !o.deleted));
            let Some(pos) = victim else { break };
            let phid = self.lru.remove(pos).unwrap();
            self.objects.remove(&phid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_while_open_defers_reclaim_to_last_close() {
        let mut t = ObjectTable::new(8);
        t.open(42, Pair([1, 2]), 0, ObjectState::Stub);
        assert!(!t.mark_deleted(42));
        assert!(t.get(42).is_some());
        assert!(t.close(42));
        assert!(t.get(42).is_none());
    }

    #[test]
    fn delete_with_no_open_handles_reclaims_immediately() {
        let mut t = ObjectTable::new(8);
        t.remember(7, Pair([1, 2]), 3);
        assert!(t.mark_deleted(7));
        assert!(t.get(7).is_none());
    }

    #[test]
    fn eviction_never_drops_open_or_deleted_objects() {
        let mut t = ObjectTable::new(1);
        t.open(1, Pair([1, 2]), 0, ObjectState::Stub);
        t.remember(2, Pair([1, 2]), 1);
        t.remember(3, Pair([1, 2]), 2);
        assert!(t.get(1).is_some(), "open object must never be evicted");
    }
}
