use fnv::{FnvHashMap, FnvHashSet};

use crate::entry::EntryId;
use crate::name::Name;

///
/// The load state of a child list. A `Partial` list has never been fully fetched (individual
/// children may have been materialised by deep resolution); an `Invalidated` list was complete
/// once but must be re-fetched and merged before the next complete read.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListStatus {
    Partial,
    Loaded,
    Invalidated,
}

///
/// The ordered list of a node's child-node entries, with a per-name bucket index.
///
/// Sibling indices are never stored: they are derived from position within a name bucket,
/// filtered to valid entries, at the moment of asking. The bucket vectors always mirror the
/// relative order of `order`.
///
pub(crate) struct ChildList {
    order: Vec<EntryId>,
    buckets: FnvHashMap<Name, Vec<EntryId>>,
    status: ListStatus,
}

impl ChildList {
    pub fn new() -> ChildList {
        ChildList {
            order: Vec::new(),
            buckets: FnvHashMap::default(),
            status: ListStatus::Partial,
        }
    }

    pub fn status(&self) -> ListStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ListStatus) {
        self.status = status;
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.order.iter().copied()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.order.contains(&id)
    }

    pub fn bucket(&self, name: &Name) -> &[EntryId] {
        self.buckets.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Appends at the end of the list.
    pub fn push(&mut self, id: EntryId, name: Name) {
        self.order.push(id);
        self.buckets.entry(name).or_default().push(id);
    }

    /// Inserts immediately before the given sibling, which must be present.
    pub fn insert_before(&mut self, id: EntryId, name: Name, before: EntryId) {
        let pos = self
            .position(before)
            .expect("insert_before anchor is not a member of this child list");
        self.order.insert(pos, id);
        self.buckets.entry(name.clone()).or_default().push(id);
        self.rebuild_bucket(&name);
    }

    pub fn remove(&mut self, id: EntryId, name: &Name) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        self.order.remove(pos);
        if let Some(bucket) = self.buckets.get_mut(name) {
            bucket.retain(|member| *member != id);
            if bucket.is_empty() {
                self.buckets.remove(name);
            }
        }
        true
    }

    ///
    /// Moves the entry immediately before `before` (None = to the end), returning its previous
    /// successor: the sibling it sat immediately before, None if it was last. The return value
    /// is exactly what a later `reorder` needs to undo this one.
    ///
    pub fn reorder(
        &mut self,
        id: EntryId,
        name: &Name,
        before: Option<EntryId>,
    ) -> Option<EntryId> {
        let pos = self
            .position(id)
            .expect("reorder subject is not a member of this child list");
        let previous_successor = self.order.get(pos + 1).copied();
        self.order.remove(pos);
        match before {
            Some(anchor) => {
                let anchor_pos = self
                    .position(anchor)
                    .expect("reorder anchor is not a member of this child list");
                self.order.insert(anchor_pos, id);
            }
            None => self.order.push(id),
        }
        self.rebuild_bucket(name);
        previous_successor
    }

    pub fn successor(&self, id: EntryId) -> Option<EntryId> {
        let pos = self.position(id)?;
        self.order.get(pos + 1).copied()
    }

    /// Replaces the entire order, rebuilding the name buckets. The load status is unchanged.
    pub fn reset(&mut self, members: Vec<(EntryId, Name)>) {
        self.order = members.iter().map(|(id, _)| *id).collect();
        self.buckets.clear();
        for (id, name) in members {
            self.buckets.entry(name).or_default().push(id);
        }
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.order.iter().position(|member| *member == id)
    }

    fn rebuild_bucket(&mut self, name: &Name) {
        if let Some(bucket) = self.buckets.get_mut(name) {
            let members: FnvHashSet<EntryId> = bucket.iter().copied().collect();
            let ordered: Vec<EntryId> = self
                .order
                .iter()
                .copied()
                .filter(|id| members.contains(id))
                .collect();
            debug_assert_eq!(ordered.len(), bucket.len());
            *bucket = ordered;
        }
    }
}

///
/// One parked handle: a child that was transiently moved out of this node, indexed under the
/// name and sibling index it last had on the workspace.
///
#[derive(Clone, Debug)]
pub(crate) struct AtticSlot {
    pub name: Name,
    pub index: u32,
    pub child: EntryId,
}

///
/// Children transiently moved away from a node. Incoming workspace events that target the old
/// position must still resolve to the local entry, so the attic is consulted before the child
/// list during event routing. Slots are dropped when the move is saved or reverted.
///
pub(crate) struct ChildAttic {
    slots: Vec<AtticSlot>,
}

impl ChildAttic {
    pub fn new() -> ChildAttic {
        ChildAttic { slots: Vec::new() }
    }

    pub fn park(&mut self, name: Name, index: u32, child: EntryId) {
        if self.contains(child) {
            return;
        }
        self.slots.push(AtticSlot { name, index, child });
    }

    pub fn remove(&mut self, child: EntryId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.child != child);
        self.slots.len() != before
    }

    pub fn contains(&self, child: EntryId) -> bool {
        self.slots.iter().any(|slot| slot.child == child)
    }

    pub fn get(&self, name: &Name, index: u32) -> Option<EntryId> {
        self.slots
            .iter()
            .find(|slot| &slot.name == name && slot.index == index)
            .map(|slot| slot.child)
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.slots.iter().map(|slot| slot.child)
    }

    pub fn count_for_name(&self, name: &Name) -> usize {
        self.slots.iter().filter(|slot| &slot.name == name).count()
    }
}

#[cfg(test)]
mod child_list_tests {
    use super::{ChildList, EntryId};
    use crate::name::Name;

    fn id(n: u32) -> EntryId {
        EntryId::new(n as usize)
    }

    #[test]
    fn reorder_returns_previous_successor() {
        let mut list = ChildList::new();
        let n = Name::new("c");
        for i in 0..3 {
            list.push(id(i), n.clone());
        }
        // Move the last entry to the front: it had no successor.
        assert_eq!(list.reorder(id(2), &n, Some(id(0))), None);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![id(2), id(0), id(1)]);
        // Undo with the returned value.
        assert_eq!(list.reorder(id(2), &n, None), Some(id(0)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![id(0), id(1), id(2)]);
    }

    #[test]
    fn buckets_track_order() {
        let mut list = ChildList::new();
        let a = Name::new("a");
        let b = Name::new("b");
        list.push(id(0), a.clone());
        list.push(id(1), b.clone());
        list.push(id(2), a.clone());
        assert_eq!(list.bucket(&a), &[id(0), id(2)]);
        list.reorder(id(2), &a, Some(id(0)));
        assert_eq!(list.bucket(&a), &[id(2), id(0)]);
        assert!(list.remove(id(1), &b));
        assert_eq!(list.bucket(&b), &[] as &[EntryId]);
    }
}
