//! The transient hierarchy engine: an in-memory tree of node and property entries shadowing a
//! remote workspace. The tree accumulates uncommitted edits (add, remove, move, reorder,
//! rename), absorbs external change events pushed by the remote, and can revert any uncommitted
//! edit back to the state last observed on the workspace.
//!
//! The workspace view is never materialised as a second tree: every entry with a pending
//! identity change carries a revert ledger recording its pre-transient parent, name and sibling
//! index, and parents with pending reorders carry a reorder log. Unwinding those deltas yields
//! workspace paths and ids on demand.

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

pub mod changes;
mod children;
mod entry;
pub mod name;
pub mod provider;
mod refresh;

pub use crate::changes::ChangeLog;
pub use crate::entry::{EntryId, Status};

use std::fmt;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;

use fnv::FnvHashMap;
use log::{debug, info, trace};
use parking_lot::Mutex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::NodeIndexable;

use crate::children::ListStatus;
use crate::entry::{Entry, Payload, RevertInfo, StatusListener};
use crate::name::{Name, Path, PathElement};
use crate::provider::{
    ChildInfo, ItemId, NodeDefinition, NodeId, NodeInfo, NodeState, PropertyDefinition,
    PropertyId, PropertyState, ProviderError, RemoteProvider, UniqueId,
};

type Arena = StableGraph<Entry, (), petgraph::Directed, u32>;

///
/// The error surface of the engine. `Internal` conditions (invariant violations) are not
/// represented here: they panic, because they are engine defects rather than runtime states.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HierarchyError {
    /// A path or id cannot be resolved locally or remotely.
    NotFound(String),
    /// An add collided with a live same-name entry where same-name siblings are not allowed.
    Exists(String),
    /// Malformed input or an illegal operation (moving the root, cyclic move, indexed
    /// property segment).
    Invalid(String),
    /// The target's local state cannot be reconciled with the workspace any more.
    Stale(String),
    /// A wrapped remote failure; retryable by the session, never masked by the engine.
    Transport(String),
}

impl fmt::Display for HierarchyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HierarchyError::NotFound(m) => write!(f, "not found: {m}"),
            HierarchyError::Exists(m) => write!(f, "already exists: {m}"),
            HierarchyError::Invalid(m) => write!(f, "invalid: {m}"),
            HierarchyError::Stale(m) => write!(f, "stale: {m}"),
            HierarchyError::Transport(m) => write!(f, "transport: {m}"),
        }
    }
}

impl std::error::Error for HierarchyError {}

impl From<ProviderError> for HierarchyError {
    fn from(err: ProviderError) -> HierarchyError {
        match err {
            ProviderError::NotFound => {
                HierarchyError::NotFound("item not found on the workspace".to_owned())
            }
            ProviderError::Transport(m) => HierarchyError::Transport(m),
        }
    }
}

#[derive(Default)]
struct Stats {
    children_loaded: AtomicUsize,
    children_reloaded: AtomicUsize,
    deep_resolutions: AtomicUsize,
    events_applied: AtomicUsize,
}

/// A point-in-time copy of the engine's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub children_loaded: usize,
    pub children_reloaded: usize,
    pub deep_resolutions: usize,
    pub events_applied: usize,
}

///
/// The entry store: an arena that owns every entry of the session and hands out stable
/// `EntryId` handles. Entries are never deleted from the arena; terminal entries are filtered
/// out of every query result instead, so a handle obtained once stays usable.
///
pub(crate) struct InnerStore {
    arena: Arena,
    root: EntryId,
    by_unique_id: FnvHashMap<UniqueId, EntryId>,
}

impl InnerStore {
    pub(crate) fn root(&self) -> EntryId {
        self.root
    }

    pub(crate) fn node_bound(&self) -> usize {
        self.arena.node_bound()
    }

    pub(crate) fn contains(&self, id: EntryId) -> bool {
        self.arena.contains_node(id)
    }

    pub(crate) fn entry(&self, id: EntryId) -> &Entry {
        self.arena
            .node_weight(id)
            .expect("entry handle does not belong to this store")
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        self.arena
            .node_weight_mut(id)
            .expect("entry handle does not belong to this store")
    }

    pub(crate) fn node(&self, id: EntryId) -> &entry::NodePayload {
        match &self.entry(id).payload {
            Payload::Node(n) => n,
            Payload::Property(_) => panic!("entry is a property, not a node"),
        }
    }

    pub(crate) fn node_mut(&mut self, id: EntryId) -> &mut entry::NodePayload {
        match &mut self.entry_mut(id).payload {
            Payload::Node(n) => n,
            Payload::Property(_) => panic!("entry is a property, not a node"),
        }
    }

    pub(crate) fn prop(&self, id: EntryId) -> &entry::PropertyPayload {
        match &self.entry(id).payload {
            Payload::Property(p) => p,
            Payload::Node(_) => panic!("entry is a node, not a property"),
        }
    }

    pub(crate) fn prop_mut(&mut self, id: EntryId) -> &mut entry::PropertyPayload {
        match &mut self.entry_mut(id).payload {
            Payload::Property(p) => p,
            Payload::Node(_) => panic!("entry is a node, not a property"),
        }
    }

    pub(crate) fn is_valid(&self, id: EntryId) -> bool {
        self.contains(id) && self.entry(id).status.is_valid()
    }

    // ------------------------------------------------------------------
    // Status machine.
    // ------------------------------------------------------------------

    ///
    /// The single routine all status changes go through. Panics on an illegal transition, and
    /// fans the `(previous, current)` pair out to the entry's listeners. A listener may
    /// dispose itself; mutation is single-threaded under the store lock.
    ///
    pub(crate) fn set_status(&mut self, id: EntryId, to: Status) {
        let from = self.entry(id).status;
        if from == to {
            return;
        }
        assert!(
            from.can_transition_to(to),
            "illegal status transition {from:?} -> {to:?} for {}",
            self.entry(id).name,
        );
        self.entry_mut(id).status = to;
        trace!("status {:?} -> {:?} for {}", from, to, self.entry(id).name);

        let listeners = self.entry(id).listeners.clone();
        for listener in listeners {
            match listener {
                StatusListener::DisposeRevertInfo => {
                    if to == Status::Existing || to.is_terminal() {
                        self.dispose_revert_info(id);
                    }
                }
            }
        }

        // A terminal entry's workspace identifier is dead: release the index slot.
        if to.is_terminal() {
            if let Payload::Node(n) = &self.entry(id).payload {
                if let Some(uid) = n.unique_id.clone() {
                    if self.by_unique_id.get(&uid) == Some(&id) {
                        self.by_unique_id.remove(&uid);
                    }
                }
            }
        }
    }

    pub(crate) fn mark_modified(&mut self, id: EntryId) {
        if self.entry(id).status == Status::Existing {
            self.set_status(id, Status::ExistingModified);
        }
    }

    // ------------------------------------------------------------------
    // Revert ledger.
    // ------------------------------------------------------------------

    ///
    /// Creates the ledger lazily: a snapshot of the entry's current identity, which at the
    /// moment of the first transient change is also its workspace identity.
    ///
    pub(crate) fn ensure_revert_info(&mut self, id: EntryId) {
        if self.node(id).revert_info.is_some() {
            return;
        }
        let parent = self.entry(id).parent;
        let name = self.entry(id).name.clone();
        let index = self.derived_index(id);
        self.node_mut(id).revert_info = Some(RevertInfo::snapshot(parent, name, index));
        self.entry_mut(id)
            .listeners
            .push(StatusListener::DisposeRevertInfo);
    }

    ///
    /// Drops the ledger, its listener, and the attic slot it pinned in the pre-move parent.
    ///
    pub(crate) fn dispose_revert_info(&mut self, id: EntryId) {
        let taken = self.node_mut(id).revert_info.take();
        let Some(ri) = taken else {
            return;
        };
        self.entry_mut(id)
            .listeners
            .retain(|l| *l != StatusListener::DisposeRevertInfo);
        if let Some(old_parent) = ri.old_parent {
            if self.contains(old_parent) {
                if let Payload::Node(n) = &mut self.entry_mut(old_parent).payload {
                    n.child_attic.remove(id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity: indices, paths, ids.
    // ------------------------------------------------------------------

    ///
    /// The 1-based sibling index, derived from position within the parent's name bucket
    /// filtered to valid entries. Never cached: a cached index would go stale on every
    /// reorder. Detached entries (and the root) report 1.
    ///
    pub(crate) fn derived_index(&self, id: EntryId) -> u32 {
        let Some(parent) = self.entry(id).parent else {
            return 1;
        };
        if !self.entry(id).is_node() {
            return 1;
        }
        let name = &self.entry(id).name;
        let Payload::Node(p) = &self.entry(parent).payload else {
            return 1;
        };
        let mut index = 0u32;
        for member in p.children.bucket(name) {
            if self.entry(*member).status.is_valid() {
                index += 1;
                if *member == id {
                    return index;
                }
            }
        }
        1
    }

    fn view_of(&self, id: EntryId, workspace: bool) -> (Name, u32, Option<EntryId>) {
        let entry = self.entry(id);
        if workspace {
            if let Payload::Node(n) = &entry.payload {
                if let Some(ri) = &n.revert_info {
                    return (ri.old_name.clone(), ri.old_index, ri.old_parent);
                }
            }
        }
        let index = if entry.is_node() {
            self.derived_index(id)
        } else {
            1
        };
        (entry.name.clone(), index, entry.parent)
    }

    ///
    /// The absolute path of the entry: the transient view, or the view the workspace
    /// currently has, obtained by unwinding revert ledgers.
    ///
    pub(crate) fn path_of(&self, id: EntryId, workspace: bool) -> Path {
        let mut elements = Vec::new();
        let mut cur = id;
        loop {
            let (name, index, parent) = self.view_of(cur, workspace);
            let Some(parent) = parent else {
                break;
            };
            elements.push(path_element(name, index));
            cur = parent;
        }
        elements.reverse();
        Path::absolute(elements)
    }

    ///
    /// The opaque node id the remote layer understands: the entry's unique id if it has one,
    /// else a path relative to the nearest unique-id-bearing ancestor, else an absolute path.
    ///
    pub(crate) fn node_item_id(&self, id: EntryId, workspace: bool) -> NodeId {
        let mut elements: Vec<PathElement> = Vec::new();
        let mut cur = id;
        loop {
            if let Some(uid) = &self.node(cur).unique_id {
                elements.reverse();
                return if elements.is_empty() {
                    NodeId::from_unique_id(uid.clone())
                } else {
                    NodeId::relative(uid.clone(), Path::relative(elements))
                };
            }
            let (name, index, parent) = self.view_of(cur, workspace);
            match parent {
                Some(p) => {
                    elements.push(path_element(name, index));
                    cur = p;
                }
                None => {
                    elements.reverse();
                    return NodeId::from_path(Path::absolute(elements));
                }
            }
        }
    }

    pub(crate) fn item_id(&self, id: EntryId, workspace: bool) -> ItemId {
        if self.entry(id).is_node() {
            ItemId::Node(self.node_item_id(id, workspace))
        } else {
            let parent = self
                .entry(id)
                .parent
                .expect("a property always has a parent");
            ItemId::Property(PropertyId {
                parent: self.node_item_id(parent, workspace),
                name: self.entry(id).name.clone(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Structure: allocation, attachment, lookup.
    // ------------------------------------------------------------------

    pub(crate) fn allocate_node(
        &mut self,
        parent: EntryId,
        name: Name,
        status: Status,
        unique_id: Option<UniqueId>,
    ) -> EntryId {
        let id = self
            .arena
            .add_node(Entry::new_node(Some(parent), name, status, unique_id.clone()));
        if let Some(uid) = unique_id {
            self.by_unique_id.insert(uid, id);
        }
        id
    }

    pub(crate) fn allocate_property(
        &mut self,
        parent: EntryId,
        name: Name,
        status: Status,
    ) -> EntryId {
        self.arena
            .add_node(Entry::new_property(parent, name, status))
    }

    pub(crate) fn lookup_unique_id(&self, uid: &UniqueId) -> Option<EntryId> {
        self.by_unique_id
            .get(uid)
            .copied()
            .filter(|id| self.is_valid(*id))
    }

    ///
    /// Rebinds a node's unique id, keeping the store index consistent.
    ///
    pub(crate) fn set_unique_id(&mut self, id: EntryId, uid: Option<UniqueId>) {
        let old = self.node(id).unique_id.clone();
        if old == uid {
            return;
        }
        if let Some(old) = &old {
            if self.by_unique_id.get(old) == Some(&id) {
                self.by_unique_id.remove(old);
            }
        }
        if let Some(new) = &uid {
            self.by_unique_id.insert(new.clone(), id);
        }
        self.node_mut(id).unique_id = uid;
    }

    /// The valid members of the parent's name bucket, in list order.
    pub(crate) fn bucket_valid(&self, parent: EntryId, name: &Name) -> Vec<EntryId> {
        match &self.entry(parent).payload {
            Payload::Node(p) => p
                .children
                .bucket(name)
                .iter()
                .copied()
                .filter(|m| self.entry(*m).status.is_valid())
                .collect(),
            Payload::Property(_) => Vec::new(),
        }
    }

    pub(crate) fn valid_children(&self, parent: EntryId) -> Vec<EntryId> {
        self.node(parent)
            .children
            .iter()
            .filter(|c| self.entry(*c).status.is_valid())
            .collect()
    }

    pub(crate) fn child_by_name_index(
        &self,
        parent: EntryId,
        name: &Name,
        index: u32,
    ) -> Option<EntryId> {
        self.bucket_valid(parent, name)
            .get((index - 1) as usize)
            .copied()
    }

    pub(crate) fn child_by_unique_id(&self, parent: EntryId, uid: &UniqueId) -> Option<EntryId> {
        self.node(parent)
            .children
            .iter()
            .filter(|c| self.entry(*c).status.is_valid())
            .find(|c| self.node(*c).unique_id.as_ref() == Some(uid))
    }

    pub(crate) fn attic_by_unique_id(&self, parent: EntryId, uid: &UniqueId) -> Option<EntryId> {
        self.node(parent)
            .child_attic
            .ids()
            .find(|c| self.node(*c).unique_id.as_ref() == Some(uid))
    }

    ///
    /// Resolves a child in the workspace view: the attic first (moved-away children keep their
    /// old position there), then children whose unwound identity matches.
    ///
    pub(crate) fn workspace_child(
        &self,
        parent: EntryId,
        name: &Name,
        index: u32,
    ) -> Option<EntryId> {
        let node = self.node(parent);
        if let Some(found) = node.child_attic.get(name, index) {
            return Some(found);
        }
        node.children
            .iter()
            .filter(|c| self.entry(*c).status.is_valid())
            .find(|c| {
                let (ws_name, ws_index, ws_parent) = self.view_of(*c, true);
                ws_parent == Some(parent) && &ws_name == name && ws_index == index
            })
    }

    pub(crate) fn property_of(
        &self,
        parent: EntryId,
        name: &Name,
        workspace: bool,
    ) -> Option<EntryId> {
        let node = self.node(parent);
        if workspace {
            if let Some(id) = node.properties_attic.get(name) {
                if self.entry(*id).status.is_valid() {
                    return Some(*id);
                }
            }
        }
        node.properties
            .get(name)
            .copied()
            .filter(|id| self.entry(*id).status.is_valid())
    }

    ///
    /// Attaches a child so that its sibling index within the valid name bucket becomes
    /// `index` (appending when the bucket is shorter).
    ///
    pub(crate) fn attach_child_at_index(
        &mut self,
        parent: EntryId,
        child: EntryId,
        name: Name,
        index: u32,
    ) {
        let anchor = self
            .bucket_valid(parent, &name)
            .get((index - 1) as usize)
            .copied();
        let node = self.node_mut(parent);
        match anchor {
            Some(before) => node.children.insert_before(child, name, before),
            None => node.children.push(child, name),
        }
    }

    /// Detaches a child node from the parent's child list, or failing that from its attic.
    pub(crate) fn detach_child(&mut self, parent: EntryId, child: EntryId) {
        let name = self.entry(child).name.clone();
        let node = self.node_mut(parent);
        if !node.children.remove(child, &name) {
            node.child_attic.remove(child);
        }
    }

    fn detach_property(&mut self, parent: EntryId, prop: EntryId) {
        let name = self.entry(prop).name.clone();
        let node = self.node_mut(parent);
        if node.properties.get(&name) == Some(&prop) {
            node.properties.remove(&name);
        } else if node.properties_attic.get(&name) == Some(&prop) {
            node.properties_attic.remove(&name);
        }
    }

    pub(crate) fn detach_item(&mut self, id: EntryId) {
        let Some(parent) = self.entry(id).parent else {
            return;
        };
        if !self.contains(parent) {
            return;
        }
        if self.entry(id).is_node() {
            self.detach_child(parent, id);
        } else {
            self.detach_property(parent, id);
        }
    }

    // ------------------------------------------------------------------
    // Deep lookup (local half).
    // ------------------------------------------------------------------

    ///
    /// Purely local path resolution: never calls the remote, returns None on any miss. In the
    /// workspace view, attics are consulted and revert ledgers unwound, which is what event
    /// routing needs to find entries by their server-side paths.
    ///
    pub(crate) fn lookup_deep(
        &self,
        anchor: EntryId,
        path: &Path,
        workspace: bool,
    ) -> Option<EntryId> {
        let mut cur = anchor;
        if path.is_absolute() {
            if anchor != self.root {
                return None;
            }
            cur = self.root;
        }
        let elements = path.elements();
        for (i, element) in elements.iter().enumerate() {
            if !self.is_valid(cur) || !self.entry(cur).is_node() {
                return None;
            }
            let is_final = i == elements.len() - 1;
            let name = element.name();
            let index = element.denormalized_index();
            let child = if workspace {
                self.workspace_child(cur, name, index)
            } else {
                self.child_by_name_index(cur, name, index)
            };
            match child {
                Some(c) => cur = c,
                None => {
                    if is_final && element.index().is_none() {
                        return self.property_of(cur, name, workspace);
                    }
                    return None;
                }
            }
        }
        if self.is_valid(cur) {
            Some(cur)
        } else {
            None
        }
    }

    ///
    /// Materialises a chain of remotely-resolved nodes below `anchor`, reusing entries that
    /// raced into existence while the remote call was in flight. Returns the final entry.
    ///
    pub(crate) fn materialize_chain(&mut self, anchor: EntryId, infos: &[NodeInfo]) -> EntryId {
        let mut cur = anchor;
        for info in infos {
            let existing = info
                .unique_id
                .as_ref()
                .and_then(|uid| self.child_by_unique_id(cur, uid))
                .or_else(|| self.child_by_name_index(cur, &info.name, info.index));
            let next = match existing {
                Some(found) => found,
                None => {
                    let id = self.allocate_node(
                        cur,
                        info.name.clone(),
                        Status::Existing,
                        info.unique_id.clone(),
                    );
                    self.attach_child_at_index(cur, id, info.name.clone(), info.index);
                    id
                }
            };
            {
                let node = self.node_mut(next);
                if node.state.is_none() {
                    node.saved_state = Some(info.state.clone());
                    node.state = Some(info.state.clone());
                }
            }
            cur = next;
        }
        cur
    }

    pub(crate) fn materialize_property(
        &mut self,
        parent: EntryId,
        name: &Name,
        state: &PropertyState,
    ) -> EntryId {
        if let Some(found) = self.property_of(parent, name, false) {
            let prop = self.prop_mut(found);
            if prop.state.is_none() {
                prop.saved_state = Some(state.clone());
                prop.state = Some(state.clone());
            }
            return found;
        }
        let id = self.allocate_property(parent, name.clone(), Status::Existing);
        {
            let prop = self.prop_mut(id);
            prop.saved_state = Some(state.clone());
            prop.state = Some(state.clone());
        }
        self.node_mut(parent).properties.insert(name.clone(), id);
        id
    }

    // ------------------------------------------------------------------
    // Child-list reload merge.
    // ------------------------------------------------------------------

    ///
    /// Merges a freshly fetched remote child order into the local list, preserving local
    /// edits: locally-present entries are reordered to the remote order (stably with respect
    /// to local-only entries), remote-only entries are inserted before the next
    /// locally-present remote entry, and local entries absent remotely are left alone.
    ///
    pub(crate) fn merge_children(&mut self, parent: EntryId, infos: &[ChildInfo]) {
        // Match each remote child to a local entry: by unique id (children or attic of this
        // parent), else by transient name and index.
        let mut claimed: fnv::FnvHashSet<EntryId> = fnv::FnvHashSet::default();
        let matches: Vec<Option<EntryId>> = infos
            .iter()
            .map(|info| {
                let by_uid = info.unique_id.as_ref().and_then(|uid| {
                    self.by_unique_id.get(uid).copied().filter(|e| {
                        let node = self.node(parent);
                        node.children.contains(*e) || node.child_attic.contains(*e)
                    })
                });
                let found = by_uid
                    .or_else(|| self.child_by_name_index(parent, &info.name, info.index))
                    .filter(|e| !claimed.contains(e));
                if let Some(e) = found {
                    claimed.insert(e);
                }
                found
            })
            .collect();

        // First pass: rewrite the positions occupied by matched current members so they appear
        // in the remote order. Local-only entries keep their exact slots.
        let order_now: Vec<EntryId> = self.node(parent).children.iter().collect();
        let desired: Vec<EntryId> = matches
            .iter()
            .flatten()
            .copied()
            .filter(|e| self.node(parent).children.contains(*e))
            .collect();
        let member_set: fnv::FnvHashSet<EntryId> = desired.iter().copied().collect();
        let mut desired_iter = desired.iter().copied();
        let new_order: Vec<(EntryId, Name)> = order_now
            .iter()
            .map(|slot| {
                let id = if member_set.contains(slot) {
                    desired_iter
                        .next()
                        .expect("slot count matches desired count")
                } else {
                    *slot
                };
                (id, self.entry(id).name.clone())
            })
            .collect();
        self.node_mut(parent).children.reset(new_order);

        // Second pass: create entries for remote children with no local counterpart, inserting
        // each before the next matched entry that is a current member, else appending.
        for (i, info) in infos.iter().enumerate() {
            if matches[i].is_some() {
                continue;
            }
            let anchor = matches[i + 1..]
                .iter()
                .flatten()
                .copied()
                .find(|e| self.node(parent).children.contains(*e));
            let id = self.allocate_node(
                parent,
                info.name.clone(),
                Status::Existing,
                info.unique_id.clone(),
            );
            debug!(
                "materialized child {} of {} from reload",
                info.name,
                self.entry(parent).name,
            );
            let node = self.node_mut(parent);
            match anchor {
                Some(before) => node.children.insert_before(id, info.name.clone(), before),
                None => node.children.push(id, info.name.clone()),
            }
        }

        self.node_mut(parent).children.set_status(ListStatus::Loaded);
    }

    // ------------------------------------------------------------------
    // Mutation cores.
    // ------------------------------------------------------------------

    ///
    /// The structural half of a move. With `transient`, the first identity change snapshots
    /// the ledger and parks the handle in the pre-move parent's attic; moving back to the
    /// snapshot identity dissolves a ledger that carries nothing else.
    ///
    pub(crate) fn do_move(
        &mut self,
        id: EntryId,
        new_name: Name,
        new_parent: EntryId,
        transient: bool,
    ) {
        let current_parent = self
            .entry(id)
            .parent
            .expect("the root is rejected before a move");
        if transient {
            self.ensure_revert_info(id);
            let ri = self
                .node(id)
                .revert_info
                .clone()
                .expect("ledger was just ensured");
            self.detach_child(current_parent, id);
            if let Some(origin) = ri.old_parent {
                if new_parent == origin {
                    self.node_mut(origin).child_attic.remove(id);
                } else {
                    self.node_mut(origin)
                        .child_attic
                        .park(ri.old_name.clone(), ri.old_index, id);
                }
            }
        } else {
            self.detach_child(current_parent, id);
        }
        self.node_mut(new_parent)
            .children
            .push(id, new_name.clone());
        {
            let entry = self.entry_mut(id);
            entry.parent = Some(new_parent);
            entry.name = new_name;
        }
        if transient {
            let dissolve = {
                let entry = self.entry(id);
                match &self.node(id).revert_info {
                    Some(ri) => {
                        !ri.is_moved(entry.parent, &entry.name)
                            && ri.reorder_log.is_empty()
                            && self.derived_index(id) == ri.old_index
                    }
                    None => false,
                }
            };
            if dissolve {
                // The moves composed to identity: nothing left to revert or to save.
                self.dispose_revert_info(id);
            }
        }
    }

    ///
    /// The structural half of a reorder. Pins the workspace indices of same-name siblings
    /// before the list mutates, then appends to the parent's reorder log.
    ///
    pub(crate) fn do_order_before(&mut self, id: EntryId, before: Option<EntryId>) {
        let parent = self
            .entry(id)
            .parent
            .expect("the root is rejected before a reorder");
        // Already in position: not recorded, no ledgers created.
        if self.node(parent).children.successor(id) == before {
            return;
        }
        let name = self.entry(id).name.clone();
        if self.node(id).unique_id.is_none() {
            let bucket = self.bucket_valid(parent, &name);
            if bucket.len() > 1 {
                // Without a workspace-stable id, a sibling's index is its only identity:
                // every member pins its pre-reorder index now.
                for member in bucket {
                    self.ensure_revert_info(member);
                }
            }
        }
        self.ensure_revert_info(parent);
        let previous = self.node_mut(parent).children.reorder(id, &name, before);
        self.node_mut(parent)
            .revert_info
            .as_mut()
            .expect("ledger was just ensured")
            .reorder_log
            .push((id, previous));
    }

    ///
    /// Discards a locally-born entry: detaches it and drops its subtree to `Removed`. If the
    /// discarded entry was shadowing an attic'd property, the shadowed one is re-installed.
    ///
    pub(crate) fn discard_new(&mut self, id: EntryId) {
        if let Some(parent) = self.entry(id).parent {
            if self.contains(parent) {
                if self.entry(id).is_node() {
                    self.detach_child(parent, id);
                } else {
                    let name = self.entry(id).name.clone();
                    self.detach_property(parent, id);
                    let node = self.node_mut(parent);
                    if !node.properties.contains_key(&name) {
                        if let Some(shadowed) = node.properties_attic.remove(&name) {
                            node.properties.insert(name, shadowed);
                        }
                    }
                }
            }
        }
        self.drop_new_subtree(id);
    }

    fn drop_new_subtree(&mut self, id: EntryId) {
        if self.entry(id).status == Status::Removed {
            return;
        }
        if self.entry(id).is_node() {
            let children: Vec<EntryId> = self.node(id).children.iter().collect();
            for child in children {
                self.drop_new_subtree(child);
            }
            let props: Vec<EntryId> = self.node(id).properties.values().copied().collect();
            for prop in props {
                self.drop_new_subtree(prop);
            }
        }
        self.set_status(id, Status::Removed);
    }

    ///
    /// A local (session-initiated) removal: the subtree transitions toward `ExistingRemoved`,
    /// entries stay attached so the removal can be reverted, and shadowed properties are
    /// re-awakened first so a later revert can still find them.
    ///
    pub(crate) fn transient_remove_entry(&mut self, id: EntryId) {
        let status = self.entry(id).status;
        if status == Status::New {
            self.discard_new(id);
            return;
        }
        if status.is_terminal() {
            return;
        }
        if self.entry(id).is_node() {
            let attic: Vec<(Name, EntryId)> = self.node_mut(id).properties_attic.drain().collect();
            for (name, shadowed) in attic {
                let shadow = self.node_mut(id).properties.insert(name, shadowed);
                if let Some(shadow) = shadow {
                    if shadow != shadowed {
                        self.drop_new_subtree(shadow);
                    }
                }
            }
            let children: Vec<EntryId> = self.node(id).children.iter().collect();
            for child in children {
                self.transient_remove_entry(child);
            }
            let props: Vec<EntryId> = self.node(id).properties.values().copied().collect();
            for prop in props {
                self.transient_remove_entry(prop);
            }
        }
        match self.entry(id).status {
            Status::Existing | Status::ExistingModified | Status::Invalidated => {
                self.set_status(id, Status::ExistingRemoved);
            }
            // ExistingRemoved stays; stale entries are left for save-time conflict handling.
            _ => {}
        }
    }

    ///
    /// A workspace-initiated removal. Clean entries go terminal and are detached; entries with
    /// unsaved local state become `StaleDestroyed` and stay attached so the conflict is
    /// visible to `collect_changes`. Local `New` entries are immune. The walk covers the
    /// workspace subtree: current children except moved-in ones, moved-away children in the
    /// attic, and all properties.
    ///
    pub(crate) fn external_remove_entry(&mut self, id: EntryId) {
        let status = self.entry(id).status;
        if status == Status::New || status.is_terminal() {
            return;
        }
        if self.entry(id).is_node() {
            let children: Vec<EntryId> = self.node(id).children.iter().collect();
            for child in children {
                let moved_in = match &self.entry(child).payload {
                    Payload::Node(n) => n
                        .revert_info
                        .as_ref()
                        .map(|ri| ri.old_parent != Some(id))
                        .unwrap_or(false),
                    Payload::Property(_) => false,
                };
                if moved_in {
                    debug!(
                        "sparing {} from external removal: its workspace home is elsewhere",
                        self.entry(child).name,
                    );
                } else {
                    self.external_remove_entry(child);
                }
            }
            let parked: Vec<EntryId> = self.node(id).child_attic.ids().collect();
            for child in parked {
                self.external_remove_entry(child);
            }
            let mut props: Vec<EntryId> = self.node(id).properties.values().copied().collect();
            props.extend(self.node(id).properties_attic.values().copied());
            for prop in props {
                self.external_remove_entry(prop);
            }
        }
        let dirty = {
            let entry = self.entry(id);
            entry.status.is_transiently_touched()
                || match &entry.payload {
                    Payload::Node(n) => n
                        .revert_info
                        .as_ref()
                        .map(|ri| {
                            ri.is_moved(entry.parent, &entry.name) || !ri.reorder_log.is_empty()
                        })
                        .unwrap_or(false),
                    Payload::Property(_) => false,
                }
        };
        if dirty {
            info!(
                "external destruction conflicts with local changes on {}",
                self.entry(id).name,
            );
            self.set_status(id, Status::StaleDestroyed);
        } else {
            self.detach_item(id);
            self.set_status(id, Status::Removed);
        }
    }

    ///
    /// Reverts the subtree rooted at this entry to the state last observed on the workspace:
    /// shadowed properties come back, the ledger replays (reorders in reverse, then the move),
    /// children revert recursively, and finally payload and status are restored. Entries whose
    /// workspace representation was destroyed independently stay `StaleDestroyed`.
    ///
    pub(crate) fn revert_entry(&mut self, id: EntryId) {
        if !self.contains(id) || self.entry(id).status.is_terminal() {
            return;
        }
        if self.entry(id).is_node() {
            let attic: Vec<(Name, EntryId)> = self.node_mut(id).properties_attic.drain().collect();
            for (name, shadowed) in attic {
                let shadow = self.node_mut(id).properties.insert(name, shadowed);
                if let Some(shadow) = shadow {
                    if shadow != shadowed {
                        self.drop_new_subtree(shadow);
                    }
                }
            }

            let ledger = self.node(id).revert_info.clone();
            if let Some(ri) = ledger {
                for (child, previous) in ri.reorder_log.iter().rev() {
                    // A participant that has since been discarded or moved away replays as a
                    // no-op.
                    let subject_present = self.node(id).children.contains(*child);
                    let anchor_present = previous
                        .map(|p| self.node(id).children.contains(p))
                        .unwrap_or(true);
                    if subject_present && anchor_present {
                        let name = self.entry(*child).name.clone();
                        self.node_mut(id).children.reorder(*child, &name, *previous);
                    }
                }
                let moved = {
                    let entry = self.entry(id);
                    ri.is_moved(entry.parent, &entry.name)
                };
                if moved {
                    let current_parent = self
                        .entry(id)
                        .parent
                        .expect("a moved entry cannot be the root");
                    self.detach_child(current_parent, id);
                    let origin = ri
                        .old_parent
                        .expect("a moved entry records its previous parent");
                    self.node_mut(origin).child_attic.remove(id);
                    self.attach_child_at_index(origin, id, ri.old_name.clone(), ri.old_index);
                    let entry = self.entry_mut(id);
                    entry.parent = Some(origin);
                    entry.name = ri.old_name.clone();
                }
                self.dispose_revert_info(id);
            }

            let mut members: Vec<EntryId> = self.node(id).children.iter().collect();
            members.extend(self.node(id).child_attic.ids());
            members.extend(self.node(id).properties.values().copied());
            for member in members {
                self.revert_entry(member);
            }
        }

        match self.entry(id).status {
            Status::New => self.discard_new(id),
            Status::ExistingModified => {
                self.restore_payload(id);
                self.set_status(id, Status::Existing);
            }
            Status::ExistingRemoved => {
                self.restore_payload(id);
                self.set_status(id, Status::Existing);
            }
            Status::StaleModified => {
                // The last observation is known stale: force a reload on next read.
                self.clear_payload(id);
                self.set_status(id, Status::Invalidated);
            }
            _ => {}
        }
    }

    fn restore_payload(&mut self, id: EntryId) {
        match &mut self.entry_mut(id).payload {
            Payload::Node(n) => n.state = n.saved_state.clone(),
            Payload::Property(p) => p.state = p.saved_state.clone(),
        }
    }

    fn clear_payload(&mut self, id: EntryId) {
        match &mut self.entry_mut(id).payload {
            Payload::Node(n) => {
                n.state = None;
                n.saved_state = None;
                if n.children.status() == ListStatus::Loaded {
                    n.children.set_status(ListStatus::Invalidated);
                }
            }
            Payload::Property(p) => {
                p.state = None;
                p.saved_state = None;
            }
        }
    }

    ///
    /// The external-refresh transition: payload dropped, children list marked stale, identity
    /// preserved. Entries with unsaved local state (and `New` entries) are skipped.
    ///
    pub(crate) fn invalidate_entry(&mut self, id: EntryId, recursive: bool) {
        if !self.is_valid(id) || self.entry(id).status == Status::New {
            return;
        }
        if self.entry(id).is_node() {
            if recursive {
                let mut members: Vec<EntryId> = self.node(id).children.iter().collect();
                members.extend(self.node(id).properties.values().copied());
                for member in members {
                    self.invalidate_entry(member, true);
                }
            }
            // The child list goes stale regardless of local payload edits.
            let children = &mut self.node_mut(id).children;
            if children.status() == ListStatus::Loaded {
                children.set_status(ListStatus::Invalidated);
            }
        }
        match self.entry(id).status {
            Status::Existing => {
                self.clear_payload(id);
                self.set_status(id, Status::Invalidated);
            }
            Status::Invalidated => {
                self.clear_payload(id);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Test support.
    // ------------------------------------------------------------------

    ///
    /// Checks the structural invariants of the whole store: parent consistency, bucket/order
    /// agreement, attic disjointness, property shadowing, and the root.
    ///
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        use fnv::FnvHashSet;
        assert!(self.entry(self.root).parent.is_none());
        assert!(self.entry(self.root).name.is_root());
        for id in self.arena.node_indices() {
            let entry = self.entry(id);
            if entry.status.is_terminal() {
                continue;
            }
            if let Some(parent) = entry.parent {
                let held = match &self.entry(parent).payload {
                    Payload::Node(p) => {
                        if entry.is_node() {
                            p.children.contains(id) || p.child_attic.contains(id)
                        } else {
                            p.properties.get(&entry.name) == Some(&id)
                                || p.properties_attic.get(&entry.name) == Some(&id)
                                || p.properties.values().any(|v| *v == id)
                                || p.properties_attic.values().any(|v| *v == id)
                        }
                    }
                    Payload::Property(_) => false,
                };
                assert!(held, "entry {} is not held by its parent", entry.name);
            } else {
                assert_eq!(id, self.root, "only the root may lack a parent");
            }
            if let Payload::Node(node) = &entry.payload {
                let in_list: FnvHashSet<EntryId> = node.children.iter().collect();
                let mut seen = FnvHashSet::default();
                for child in node.children.iter() {
                    assert!(seen.insert(child), "duplicate child list membership");
                }
                for parked in node.child_attic.ids() {
                    assert!(
                        !in_list.contains(&parked),
                        "attic and child list share an entry"
                    );
                }
                for (name, shadowed) in &node.properties_attic {
                    let shadow = node.properties.get(name);
                    assert!(
                        shadow.is_some() && shadow != Some(shadowed),
                        "shadowed property {name} lacks a live shadow"
                    );
                }
            }
        }
    }
}

///
/// The engine facade: the entry store behind a single writer lock, plus the remote provider.
/// All mutation is serialised on the store lock; the three blocking remote calls (child
/// loading, reloads, deep resolution) always run with the lock released and re-validate after
/// re-acquiring it.
///
pub struct Hierarchy {
    pub(crate) inner: Mutex<InnerStore>,
    pub(crate) provider: Arc<dyn RemoteProvider>,
    pub(crate) stats: Stats,
}

impl Hierarchy {
    pub fn new(provider: Arc<dyn RemoteProvider>, root_unique_id: Option<UniqueId>) -> Hierarchy {
        let mut arena = Arena::with_capacity(16, 0);
        let root = arena.add_node(Entry::new_node(
            None,
            Name::root(),
            Status::Existing,
            root_unique_id.clone(),
        ));
        let mut by_unique_id = FnvHashMap::default();
        if let Some(uid) = root_unique_id {
            by_unique_id.insert(uid, root);
        }
        Hierarchy {
            inner: Mutex::new(InnerStore {
                arena,
                root,
                by_unique_id,
            }),
            provider,
            stats: Stats::default(),
        }
    }

    pub fn root(&self) -> EntryId {
        self.inner.lock().root()
    }

    pub fn status(&self, id: EntryId) -> Status {
        self.inner.lock().entry(id).status
    }

    pub fn name(&self, id: EntryId) -> Name {
        self.inner.lock().entry(id).name.clone()
    }

    pub fn parent(&self, id: EntryId) -> Option<EntryId> {
        self.inner.lock().entry(id).parent
    }

    pub fn is_node(&self, id: EntryId) -> bool {
        self.inner.lock().entry(id).is_node()
    }

    pub fn unique_id(&self, id: EntryId) -> Option<UniqueId> {
        self.inner.lock().node(id).unique_id.clone()
    }

    /// The 1-based sibling index in the transient view, always derived, never cached.
    pub fn index(&self, id: EntryId) -> u32 {
        self.inner.lock().derived_index(id)
    }

    pub fn path(&self, id: EntryId, workspace: bool) -> Path {
        self.inner.lock().path_of(id, workspace)
    }

    /// The transient identity: unique id preferred, else derived from the parent chain.
    pub fn item_id(&self, id: EntryId) -> ItemId {
        self.inner.lock().item_id(id, false)
    }

    /// The identity as the server currently sees it, reconstructed by unwinding revert
    /// ledgers without performing them.
    pub fn workspace_item_id(&self, id: EntryId) -> ItemId {
        self.inner.lock().item_id(id, true)
    }

    pub fn lookup_by_unique_id(&self, uid: &UniqueId) -> Option<EntryId> {
        self.inner.lock().lookup_unique_id(uid)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            children_loaded: self.stats.children_loaded.load(atomic::Ordering::SeqCst),
            children_reloaded: self.stats.children_reloaded.load(atomic::Ordering::SeqCst),
            deep_resolutions: self.stats.deep_resolutions.load(atomic::Ordering::SeqCst),
            events_applied: self.stats.events_applied.load(atomic::Ordering::SeqCst),
        }
    }

    // ------------------------------------------------------------------
    // Reads that may suspend on the remote.
    // ------------------------------------------------------------------

    ///
    /// Ensures the child list is complete, fetching and merging when it is partial or
    /// invalidated. Remote `NotFound` means the node is gone from the workspace: the local
    /// entry transitions toward terminal and the error resurfaces as `Invalid` or `Stale`.
    ///
    pub fn load_children(&self, id: EntryId) -> Result<(), HierarchyError> {
        let ws_id = {
            let inner = self.inner.lock();
            if !inner.is_valid(id) {
                return Err(HierarchyError::NotFound(format!(
                    "{} is no longer part of the tree",
                    inner.path_of(id, false)
                )));
            }
            match inner.node(id).children.status() {
                ListStatus::Loaded => return Ok(()),
                ListStatus::Partial => {
                    self.stats
                        .children_loaded
                        .fetch_add(1, atomic::Ordering::SeqCst);
                }
                ListStatus::Invalidated => {
                    self.stats
                        .children_reloaded
                        .fetch_add(1, atomic::Ordering::SeqCst);
                }
            }
            inner.node_item_id(id, true)
        };
        // Suspension point: the fetch happens without the store lock.
        let infos = match self.provider.child_infos(&ws_id) {
            Ok(infos) => infos,
            Err(ProviderError::NotFound) => return Err(self.reload_not_found(id)),
            Err(err) => return Err(err.into()),
        };
        let mut inner = self.inner.lock();
        if !inner.is_valid(id) {
            return Err(HierarchyError::NotFound(
                "the node was removed while its children were loading".to_owned(),
            ));
        }
        if inner.node(id).children.status() == ListStatus::Loaded {
            // Raced with another load: the merged result is already in place.
            return Ok(());
        }
        inner.merge_children(id, &infos);
        Ok(())
    }

    /// The valid children in list order, loading the list if necessary.
    pub fn children(&self, id: EntryId) -> Result<Vec<EntryId>, HierarchyError> {
        self.load_children(id)?;
        Ok(self.inner.lock().valid_children(id))
    }

    /// The valid properties, sorted by name.
    pub fn properties(&self, id: EntryId) -> Vec<EntryId> {
        let inner = self.inner.lock();
        let mut named: Vec<(Name, EntryId)> = inner
            .node(id)
            .properties
            .iter()
            .filter(|(_, p)| inner.entry(**p).status.is_valid())
            .map(|(n, p)| (n.clone(), *p))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named.into_iter().map(|(_, p)| p).collect()
    }

    pub fn property(&self, parent: EntryId, name: &Name) -> Option<EntryId> {
        self.inner.lock().property_of(parent, name, false)
    }

    /// The children transiently moved away from this node, still parked for event routing.
    pub fn parked_children(&self, id: EntryId) -> Vec<EntryId> {
        self.inner.lock().node(id).child_attic.ids().collect()
    }

    /// The node payload, fetched from the remote on first access or after invalidation.
    pub fn node_state(&self, id: EntryId) -> Result<NodeState, HierarchyError> {
        let ws_id = {
            let inner = self.inner.lock();
            if !inner.is_valid(id) {
                return Err(HierarchyError::NotFound(format!(
                    "{} is no longer part of the tree",
                    inner.path_of(id, false)
                )));
            }
            if let Some(state) = &inner.node(id).state {
                return Ok(state.clone());
            }
            if inner.entry(id).status == Status::New {
                return Err(HierarchyError::Invalid(
                    "a locally-born node has no workspace state to fetch".to_owned(),
                ));
            }
            inner.node_item_id(id, true)
        };
        let state = match self.provider.node_state(&ws_id) {
            Ok(state) => state,
            Err(ProviderError::NotFound) => return Err(self.reload_not_found(id)),
            Err(err) => return Err(err.into()),
        };
        let mut inner = self.inner.lock();
        if !inner.is_valid(id) {
            return Err(HierarchyError::NotFound(
                "the node was removed while its state was loading".to_owned(),
            ));
        }
        if inner.node(id).state.is_none() {
            let node = inner.node_mut(id);
            node.saved_state = Some(state.clone());
            node.state = Some(state.clone());
            if inner.entry(id).status == Status::Invalidated {
                inner.set_status(id, Status::Existing);
            }
            return Ok(state);
        }
        // Raced with another load: return what landed.
        Ok(inner
            .node(id)
            .state
            .clone()
            .expect("presence was just checked"))
    }

    /// The property payload, fetched from the remote on first access or after invalidation.
    pub fn property_state(&self, id: EntryId) -> Result<PropertyState, HierarchyError> {
        let prop_id = {
            let inner = self.inner.lock();
            if !inner.is_valid(id) {
                return Err(HierarchyError::NotFound(format!(
                    "{} is no longer part of the tree",
                    inner.path_of(id, false)
                )));
            }
            if let Some(state) = &inner.prop(id).state {
                return Ok(state.clone());
            }
            if inner.entry(id).status == Status::New {
                return Err(HierarchyError::Invalid(
                    "a locally-born property has no workspace state to fetch".to_owned(),
                ));
            }
            match inner.item_id(id, true) {
                ItemId::Property(pid) => pid,
                ItemId::Node(_) => unreachable!("property entries yield property ids"),
            }
        };
        let state = match self.provider.property_state(&prop_id) {
            Ok(state) => state,
            Err(ProviderError::NotFound) => return Err(self.reload_not_found(id)),
            Err(err) => return Err(err.into()),
        };
        let mut inner = self.inner.lock();
        if !inner.is_valid(id) {
            return Err(HierarchyError::NotFound(
                "the property was removed while its state was loading".to_owned(),
            ));
        }
        if inner.prop(id).state.is_none() {
            let prop = inner.prop_mut(id);
            prop.saved_state = Some(state.clone());
            prop.state = Some(state.clone());
            if inner.entry(id).status == Status::Invalidated {
                inner.set_status(id, Status::Existing);
            }
            return Ok(state);
        }
        // Raced with another load: return what landed.
        Ok(inner
            .prop(id)
            .state
            .clone()
            .expect("presence was just checked"))
    }

    fn reload_not_found(&self, id: EntryId) -> HierarchyError {
        let mut inner = self.inner.lock();
        let path = inner.path_of(id, false);
        let dirty = inner.entry(id).status.is_transiently_touched();
        inner.external_remove_entry(id);
        if dirty {
            HierarchyError::Stale(format!("{path} was destroyed on the workspace"))
        } else {
            HierarchyError::Invalid(format!("{path} no longer exists on the workspace"))
        }
    }

    // ------------------------------------------------------------------
    // Deep lookup.
    // ------------------------------------------------------------------

    ///
    /// Purely local resolution: never calls the remote, `None` on any miss. With `workspace`,
    /// attics are consulted and ledgers unwound, which is the view event routing needs.
    ///
    pub fn lookup_deep_entry(
        &self,
        anchor: EntryId,
        path: &Path,
        workspace: bool,
    ) -> Option<EntryId> {
        self.inner.lock().lookup_deep(anchor, path, workspace)
    }

    ///
    /// Resolves a path relative to `anchor`, materialising unloaded suffixes through a single
    /// deep remote call per attempt. A remote miss on a final segment without a sibling index
    /// retries as a property id below the same chain.
    ///
    pub fn get_deep_entry(&self, anchor: EntryId, path: &Path) -> Result<EntryId, HierarchyError> {
        enum Step {
            Done(EntryId),
            Descend(EntryId),
            Fail(HierarchyError),
            Remote(NodeId, Path),
        }

        let mut cur = anchor;
        let mut i = 0;
        let elements = path.elements().to_vec();
        if path.is_absolute() && anchor != self.root() {
            return Err(HierarchyError::Invalid(format!(
                "absolute path {path} resolved below a non-root entry"
            )));
        }
        loop {
            let step = {
                let inner = self.inner.lock();
                if !inner.is_valid(cur) || !inner.entry(cur).is_node() {
                    Step::Fail(HierarchyError::NotFound(format!(
                        "{path} cannot be resolved: the walk left the tree"
                    )))
                } else if i == elements.len() {
                    Step::Done(cur)
                } else {
                    let element = &elements[i];
                    let is_final = i == elements.len() - 1;
                    let name = element.name();
                    let index = element.denormalized_index();
                    let node = inner.node(cur);
                    if let Some(child) = inner.child_by_name_index(cur, name, index) {
                        Step::Descend(child)
                    } else if is_final
                        && element.index().is_none()
                        && inner.property_of(cur, name, false).is_some()
                    {
                        Step::Done(
                            inner
                                .property_of(cur, name, false)
                                .expect("presence was just checked"),
                        )
                    } else if is_final
                        && element.index().is_some()
                        && inner.property_of(cur, name, false).is_some()
                    {
                        Step::Fail(HierarchyError::Invalid(format!(
                            "{path}: a sibling index cannot denote a property"
                        )))
                    } else if node.child_attic.get(name, index).is_some() {
                        // The workspace still has this position, but the session moved it away.
                        Step::Fail(HierarchyError::NotFound(format!(
                            "{path} was transiently moved away"
                        )))
                    } else if (index as usize)
                        <= inner.bucket_valid(cur, name).len() + node.child_attic.count_for_name(name)
                    {
                        Step::Fail(HierarchyError::NotFound(format!(
                            "{path} does not denote an existing item"
                        )))
                    } else if node.children.status() == ListStatus::Loaded
                        && !(is_final && element.index().is_none())
                    {
                        // A complete child list is authoritative for node segments; a final
                        // segment without an index may still denote a remote property.
                        Step::Fail(HierarchyError::NotFound(format!(
                            "{path} does not denote an existing item"
                        )))
                    } else {
                        Step::Remote(inner.node_item_id(cur, true), path.suffix(i))
                    }
                }
            };
            match step {
                Step::Done(id) => return Ok(id),
                Step::Descend(child) => {
                    cur = child;
                    i += 1;
                }
                Step::Fail(err) => return Err(err),
                Step::Remote(ws_id, remaining) => {
                    return self.resolve_deep_remote(cur, ws_id, remaining, path);
                }
            }
        }
    }

    ///
    /// The remote half of `get_deep_entry`: one call for the whole remaining suffix, with the
    /// property retry on a final segment without an index.
    ///
    fn resolve_deep_remote(
        &self,
        anchor: EntryId,
        ws_id: NodeId,
        remaining: Path,
        full_path: &Path,
    ) -> Result<EntryId, HierarchyError> {
        self.stats
            .deep_resolutions
            .fetch_add(1, atomic::Ordering::SeqCst);
        match self.provider.deep_node_infos(&ws_id, &remaining) {
            Ok(infos) => {
                let mut inner = self.inner.lock();
                if !inner.is_valid(anchor) {
                    return Err(HierarchyError::NotFound(format!(
                        "{full_path} cannot be resolved: the anchor was removed"
                    )));
                }
                Ok(inner.materialize_chain(anchor, &infos))
            }
            Err(err @ ProviderError::Transport(_)) => Err(err.into()),
            Err(ProviderError::NotFound) => {
                let final_element = remaining
                    .last()
                    .expect("a remote resolution always has a suffix")
                    .clone();
                if final_element.index().is_some() {
                    return Err(HierarchyError::NotFound(format!(
                        "{full_path} does not denote an existing item"
                    )));
                }
                let parent_relative = remaining.parent().expect("the suffix is non-empty");
                match self
                    .provider
                    .deep_property_infos(&ws_id, &parent_relative, final_element.name())
                {
                    Ok((infos, state)) => {
                        let mut inner = self.inner.lock();
                        if !inner.is_valid(anchor) {
                            return Err(HierarchyError::NotFound(format!(
                                "{full_path} cannot be resolved: the anchor was removed"
                            )));
                        }
                        let parent = inner.materialize_chain(anchor, &infos);
                        Ok(inner.materialize_property(parent, final_element.name(), &state))
                    }
                    Err(ProviderError::NotFound) => Err(HierarchyError::NotFound(format!(
                        "{full_path} does not denote an existing item"
                    ))),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutators.
    // ------------------------------------------------------------------

    ///
    /// Adds a locally-born child node. An explicit index places it within the name bucket
    /// (used when a server-supplied order carries one); None appends.
    ///
    pub fn add_node(
        &self,
        parent: EntryId,
        name: Name,
        unique_id: Option<UniqueId>,
        index: Option<u32>,
    ) -> Result<EntryId, HierarchyError> {
        self.add_node_inner(parent, name, unique_id, index, None)
    }

    /// Like `add_node`, but also builds and attaches a fresh node payload.
    pub fn add_new_node(
        &self,
        parent: EntryId,
        name: Name,
        unique_id: Option<UniqueId>,
        primary_type: Name,
        definition: NodeDefinition,
    ) -> Result<EntryId, HierarchyError> {
        self.add_node_inner(
            parent,
            name,
            unique_id,
            None,
            Some((primary_type, definition)),
        )
    }

    fn add_node_inner(
        &self,
        parent: EntryId,
        name: Name,
        unique_id: Option<UniqueId>,
        index: Option<u32>,
        new_state: Option<(Name, NodeDefinition)>,
    ) -> Result<EntryId, HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.is_valid(parent) || !inner.entry(parent).is_node() {
            return Err(HierarchyError::NotFound(
                "the parent is no longer part of the tree".to_owned(),
            ));
        }
        let bucket = inner.bucket_valid(parent, &name);
        if !bucket.is_empty() {
            let sibling_allows = bucket.iter().all(|m| inner.node(*m).allows_sns);
            let self_allows = new_state
                .as_ref()
                .map(|(_, d)| d.allows_same_name_siblings)
                .unwrap_or(true);
            if !sibling_allows || !self_allows {
                return Err(HierarchyError::Exists(format!(
                    "{} below {}",
                    name,
                    inner.path_of(parent, false)
                )));
            }
        }
        let id = inner.allocate_node(parent, name.clone(), Status::New, unique_id);
        // A locally-born node has nothing remote to fetch: its child list is complete.
        inner
            .node_mut(id)
            .children
            .set_status(ListStatus::Loaded);
        if let Some((primary_type, definition)) = new_state {
            let node = inner.node_mut(id);
            node.allows_sns = definition.allows_same_name_siblings;
            node.state = Some(NodeState::new(primary_type));
        }
        match index {
            Some(i) => inner.attach_child_at_index(parent, id, name, i),
            None => inner.node_mut(parent).children.push(id, name),
        }
        inner.mark_modified(parent);
        Ok(id)
    }

    ///
    /// Adds a locally-born property. A live same-name property that is `ExistingRemoved` is
    /// parked in the attic first, so a later revert can restore it; any other live entry is a
    /// collision.
    ///
    pub fn add_property(&self, parent: EntryId, name: Name) -> Result<EntryId, HierarchyError> {
        self.add_property_inner(parent, name, None)
    }

    /// Like `add_property`, but also builds and attaches a fresh property payload.
    pub fn add_new_property(
        &self,
        parent: EntryId,
        name: Name,
        definition: PropertyDefinition,
    ) -> Result<EntryId, HierarchyError> {
        self.add_property_inner(parent, name, Some(definition))
    }

    fn add_property_inner(
        &self,
        parent: EntryId,
        name: Name,
        definition: Option<PropertyDefinition>,
    ) -> Result<EntryId, HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.is_valid(parent) || !inner.entry(parent).is_node() {
            return Err(HierarchyError::NotFound(
                "the parent is no longer part of the tree".to_owned(),
            ));
        }
        if let Some(existing) = inner.node(parent).properties.get(&name).copied() {
            match inner.entry(existing).status {
                Status::ExistingRemoved => {
                    // Shadowing: the removed entry moves to the attic; revert restores it.
                    inner.node_mut(parent).properties.remove(&name);
                    inner
                        .node_mut(parent)
                        .properties_attic
                        .insert(name.clone(), existing);
                }
                status if status.is_valid() => {
                    return Err(HierarchyError::Exists(format!(
                        "property {} below {}",
                        name,
                        inner.path_of(parent, false)
                    )));
                }
                _ => {
                    inner.node_mut(parent).properties.remove(&name);
                }
            }
        }
        let id = inner.allocate_property(parent, name.clone(), Status::New);
        if let Some(definition) = definition {
            inner.prop_mut(id).state = Some(PropertyState {
                values: Vec::new(),
                multi_valued: definition.multi_valued,
            });
        }
        inner.node_mut(parent).properties.insert(name, id);
        inner.mark_modified(parent);
        Ok(id)
    }

    /// Sets a property's value, marking the property and its owning node modified.
    pub fn set_property_value(
        &self,
        id: EntryId,
        values: Vec<String>,
    ) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.contains(id) || inner.entry(id).is_node() {
            return Err(HierarchyError::NotFound(
                "the property is no longer part of the tree".to_owned(),
            ));
        }
        match inner.entry(id).status {
            Status::New | Status::ExistingModified => {}
            Status::Existing => {}
            Status::ExistingRemoved => {
                return Err(HierarchyError::Invalid(
                    "the property was transiently removed".to_owned(),
                ));
            }
            Status::Invalidated => {
                return Err(HierarchyError::Invalid(
                    "the property must be re-read before it can be modified".to_owned(),
                ));
            }
            status if status.is_stale() => {
                return Err(HierarchyError::Stale(format!(
                    "{} has diverged from the workspace",
                    inner.path_of(id, false)
                )));
            }
            _ => {
                return Err(HierarchyError::NotFound(
                    "the property is no longer part of the tree".to_owned(),
                ));
            }
        }
        let multi = values.len() != 1;
        {
            let prop = inner.prop_mut(id);
            match &mut prop.state {
                Some(state) => state.values = values,
                None => {
                    prop.state = Some(PropertyState {
                        values,
                        multi_valued: multi,
                    })
                }
            }
        }
        let owner = inner
            .entry(id)
            .parent
            .expect("a property always has a parent");
        if inner.entry(id).status == Status::Existing {
            inner.set_status(id, Status::ExistingModified);
        }
        inner.mark_modified(owner);
        Ok(())
    }

    ///
    /// Moves (or renames) a node. With `transient`, the change is recorded in the revert
    /// ledger and the handle parked in the old parent's attic, so workspace events against the
    /// old position still resolve and `revert` can undo the move.
    ///
    pub fn move_entry(
        &self,
        id: EntryId,
        new_name: Name,
        new_parent: EntryId,
        transient: bool,
    ) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.is_valid(id) || !inner.entry(id).is_node() {
            return Err(HierarchyError::NotFound(
                "the entry is no longer part of the tree".to_owned(),
            ));
        }
        if inner.entry(id).parent.is_none() {
            return Err(HierarchyError::Invalid("the root cannot be moved".to_owned()));
        }
        if !inner.is_valid(new_parent) || !inner.entry(new_parent).is_node() {
            return Err(HierarchyError::NotFound(
                "the destination is no longer part of the tree".to_owned(),
            ));
        }
        // Reject cycles: the destination must not live below the moved entry.
        let mut ancestor = Some(new_parent);
        while let Some(a) = ancestor {
            if a == id {
                return Err(HierarchyError::Invalid(format!(
                    "cannot move {} below itself",
                    inner.path_of(id, false)
                )));
            }
            ancestor = inner.entry(a).parent;
        }
        let others: Vec<EntryId> = inner
            .bucket_valid(new_parent, &new_name)
            .into_iter()
            .filter(|m| *m != id)
            .collect();
        if !others.is_empty() {
            let allowed =
                inner.node(id).allows_sns && others.iter().all(|m| inner.node(*m).allows_sns);
            if !allowed {
                return Err(HierarchyError::Exists(format!(
                    "{} below {}",
                    new_name,
                    inner.path_of(new_parent, false)
                )));
            }
        }
        inner.do_move(id, new_name, new_parent, transient);
        Ok(())
    }

    ///
    /// Reorders this entry immediately before `before` (None = to the end) within its
    /// parent's child list, recording the undo information in the parent's ledger. An entry
    /// already in position is a no-op and records nothing.
    ///
    pub fn order_before(
        &self,
        id: EntryId,
        before: Option<EntryId>,
    ) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.is_valid(id) || !inner.entry(id).is_node() {
            return Err(HierarchyError::NotFound(
                "the entry is no longer part of the tree".to_owned(),
            ));
        }
        let Some(parent) = inner.entry(id).parent else {
            return Err(HierarchyError::Invalid(
                "the root cannot be reordered".to_owned(),
            ));
        };
        if let Some(anchor) = before {
            if anchor == id {
                return Err(HierarchyError::Invalid(
                    "cannot order an entry before itself".to_owned(),
                ));
            }
            if !inner.is_valid(anchor)
                || !inner.entry(anchor).is_node()
                || inner.entry(anchor).parent != Some(parent)
                || !inner.node(parent).children.contains(anchor)
            {
                return Err(HierarchyError::NotFound(
                    "the reorder anchor is not a sibling".to_owned(),
                ));
            }
        }
        inner.do_order_before(id, before);
        Ok(())
    }

    ///
    /// A session-initiated removal: the subtree is marked `ExistingRemoved` (locally-born
    /// entries are discarded outright), stays in place until saved, and can be reverted.
    ///
    pub fn transient_remove(&self, id: EntryId) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.contains(id) || inner.entry(id).status.is_terminal() {
            return Err(HierarchyError::NotFound(
                "the entry is no longer part of the tree".to_owned(),
            ));
        }
        let Some(parent) = inner.entry(id).parent else {
            return Err(HierarchyError::Invalid(
                "the root cannot be removed".to_owned(),
            ));
        };
        inner.transient_remove_entry(id);
        inner.mark_modified(parent);
        Ok(())
    }

    ///
    /// A workspace-initiated removal: clean entries go terminal and detach, entries with
    /// unsaved local state become `StaleDestroyed` and stay visible as conflicts.
    ///
    pub fn remove(&self, id: EntryId) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.contains(id) || inner.entry(id).status.is_terminal() {
            return Err(HierarchyError::NotFound(
                "the entry is no longer part of the tree".to_owned(),
            ));
        }
        if inner.entry(id).parent.is_none() {
            return Err(HierarchyError::Invalid(
                "the root cannot be removed".to_owned(),
            ));
        }
        inner.external_remove_entry(id);
        Ok(())
    }

    ///
    /// Reverts every uncommitted edit below this entry, restoring the subtree to the state
    /// last observed on the workspace.
    ///
    pub fn revert(&self, id: EntryId) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        if !inner.contains(id) {
            return Err(HierarchyError::NotFound(
                "the entry is no longer part of the tree".to_owned(),
            ));
        }
        inner.revert_entry(id);
        Ok(())
    }

    ///
    /// Marks the subtree's payloads stale without touching identity: the external-refresh
    /// transition. Dirty and locally-born entries are skipped; nothing is fetched eagerly.
    ///
    pub fn invalidate(&self, id: EntryId, recursive: bool) {
        let mut inner = self.inner.lock();
        if inner.contains(id) {
            inner.invalidate_entry(id, recursive);
        }
    }

    ///
    /// Applies save completion for a previously collected change log: new and modified
    /// entries settle to `Existing` (their ledgers dispose themselves via the status
    /// listener), removed entries go terminal and detach.
    ///
    pub fn persisted(&self, log: &ChangeLog) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        for id in log.iter() {
            if inner.contains(id) && inner.entry(id).status.is_stale() {
                return Err(HierarchyError::Stale(format!(
                    "{} has diverged from the workspace",
                    inner.path_of(id, false)
                )));
            }
        }
        for &id in &log.added {
            if inner.contains(id) && inner.entry(id).status == Status::New {
                inner.commit_payload(id);
                inner.set_status(id, Status::Existing);
            }
        }
        for &id in &log.modified {
            if !inner.contains(id) {
                continue;
            }
            match inner.entry(id).status {
                Status::ExistingModified => {
                    inner.commit_payload(id);
                    inner.set_status(id, Status::Existing);
                    inner.release_child_pins(id);
                }
                // A pure move or reorder: the status never changed, so the ledger is
                // disposed directly.
                Status::Existing => {
                    inner.dispose_revert_info_if_any(id);
                    inner.release_child_pins(id);
                }
                _ => {}
            }
        }
        for &id in &log.removed {
            if inner.contains(id) && inner.entry(id).status == Status::ExistingRemoved {
                inner.detach_item(id);
                inner.set_status(id, Status::Removed);
            }
        }
        Ok(())
    }
}

impl InnerStore {
    fn commit_payload(&mut self, id: EntryId) {
        match &mut self.entry_mut(id).payload {
            Payload::Node(n) => n.saved_state = n.state.clone(),
            Payload::Property(p) => p.saved_state = p.state.clone(),
        }
    }

    fn dispose_revert_info_if_any(&mut self, id: EntryId) {
        if self.entry(id).is_node() && self.node(id).revert_info.is_some() {
            self.dispose_revert_info(id);
        }
    }

    ///
    /// After a parent's reorders are saved, the sibling ledgers that only pinned workspace
    /// indices for those reorders carry nothing of their own: release them.
    ///
    fn release_child_pins(&mut self, id: EntryId) {
        if !self.entry(id).is_node() {
            return;
        }
        let children: Vec<EntryId> = self.node(id).children.iter().collect();
        for child in children {
            if !self.entry(child).is_node() {
                continue;
            }
            let droppable = {
                let entry = self.entry(child);
                match &self.node(child).revert_info {
                    Some(ri) => {
                        !ri.is_moved(entry.parent, &entry.name) && ri.reorder_log.is_empty()
                    }
                    None => false,
                }
            };
            if droppable {
                self.dispose_revert_info(child);
            }
        }
    }
}

fn path_element(name: Name, index: u32) -> PathElement {
    if index > 1 {
        PathElement::indexed(name, index)
    } else {
        PathElement::new(name)
    }
}

#[cfg(test)]
mod tests;
