use fixedbitset::FixedBitSet;

use crate::entry::{EntryId, Payload, Status};
use crate::name::Name;
use crate::{Hierarchy, HierarchyError, InnerStore};

///
/// The staged changeset of a subtree: locally-born entries depth-first (parents before their
/// new children), then modifications (including pending moves and reorders), then removals in
/// reverse depth order. Each entry appears at most once.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeLog {
    pub added: Vec<EntryId>,
    pub modified: Vec<EntryId>,
    pub removed: Vec<EntryId>,
}

impl ChangeLog {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// All staged entries in flush order: additions, modifications, removals.
    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
            .copied()
    }
}

impl Hierarchy {
    ///
    /// Walks the subtree below `id` (including moved-away children still parked in attics and
    /// shadowed properties) and returns the staged changeset. With `throw_on_stale`, the walk
    /// aborts with `Stale` as soon as any visited entry has diverged from the workspace.
    ///
    /// The walk order is deterministic for a given sequence of mutations, and each entry is
    /// emitted at most once even when attics make it reachable twice.
    ///
    pub fn collect_changes(
        &self,
        id: EntryId,
        throw_on_stale: bool,
    ) -> Result<ChangeLog, HierarchyError> {
        let inner = self.inner.lock();
        collect(&inner, id, throw_on_stale)
    }
}

fn collect(
    inner: &InnerStore,
    start: EntryId,
    throw_on_stale: bool,
) -> Result<ChangeLog, HierarchyError> {
    let mut visited = FixedBitSet::with_capacity(inner.node_bound());
    let mut log = ChangeLog::default();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if !inner.contains(id) || visited.put(id.index()) {
            continue;
        }
        let entry = inner.entry(id);
        if throw_on_stale && entry.status.is_stale() {
            return Err(HierarchyError::Stale(format!(
                "{} has diverged from the workspace",
                inner.path_of(id, false)
            )));
        }
        if entry.status.is_terminal() {
            continue;
        }
        match entry.status {
            Status::New => log.added.push(id),
            Status::ExistingRemoved => log.removed.push(id),
            Status::ExistingModified | Status::StaleModified => log.modified.push(id),
            Status::Existing | Status::Invalidated => {
                if let Payload::Node(node) = &entry.payload {
                    let pending = node
                        .revert_info
                        .as_ref()
                        .map(|ri| {
                            ri.is_moved(entry.parent, &entry.name) || !ri.reorder_log.is_empty()
                        })
                        .unwrap_or(false);
                    if pending {
                        log.modified.push(id);
                    }
                }
            }
            Status::Removed | Status::StaleDestroyed => {}
        }
        if let Payload::Node(node) = &entry.payload {
            // Deterministic descent order: properties by name, shadowed properties by name,
            // children in list order, then moved-away children in park order.
            let mut to_visit: Vec<EntryId> = Vec::new();
            let mut props: Vec<(Name, EntryId)> = node
                .properties
                .iter()
                .map(|(n, p)| (n.clone(), *p))
                .collect();
            props.sort_by(|a, b| a.0.cmp(&b.0));
            to_visit.extend(props.into_iter().map(|(_, p)| p));
            let mut shadowed: Vec<(Name, EntryId)> = node
                .properties_attic
                .iter()
                .map(|(n, p)| (n.clone(), *p))
                .collect();
            shadowed.sort_by(|a, b| a.0.cmp(&b.0));
            to_visit.extend(shadowed.into_iter().map(|(_, p)| p));
            to_visit.extend(node.children.iter());
            to_visit.extend(node.child_attic.ids());
            // A stack pops in reverse.
            for member in to_visit.into_iter().rev() {
                stack.push(member);
            }
        }
    }
    // Removals flush children before their parents.
    log.removed.reverse();
    Ok(log)
}
