use fnv::FnvHashMap;
use petgraph::stable_graph;

use crate::children::{ChildAttic, ChildList};
use crate::name::Name;
use crate::provider::{NodeState, PropertyState, UniqueId};

// 2^32 entries ought to be more than enough for one session!
pub type EntryId = stable_graph::NodeIndex<u32>;

///
/// The lifecycle state of an entry with respect to the workspace it shadows.
///
/// `Removed` and `StaleDestroyed` are terminal: an entry reaching either is filtered out of
/// every query result, although outstanding handles to it remain usable.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    /// Created locally; the workspace has never seen it.
    New,
    /// In sync with the last workspace observation.
    Existing,
    /// Observed on the workspace, then modified locally.
    ExistingModified,
    /// Observed on the workspace, then removed locally; the removal is not yet saved.
    ExistingRemoved,
    /// Modified locally, but the workspace view has since diverged incompatibly.
    StaleModified,
    /// Touched locally, but the workspace item has been destroyed externally.
    StaleDestroyed,
    /// Gone: saved-away removal, discarded `New` entry, or clean external destruction.
    Removed,
    /// The payload has been dropped pending a reload; identity is preserved.
    Invalidated,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Removed | Status::StaleDestroyed)
    }

    ///
    /// Valid entries participate in child lists, sibling indexing, and lookups.
    ///
    pub fn is_valid(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_stale(self) -> bool {
        matches!(self, Status::StaleModified | Status::StaleDestroyed)
    }

    ///
    /// True if the entry carries unsaved local state that external destruction would conflict
    /// with. Moves and reorders are tracked separately, via the revert ledger.
    ///
    pub fn is_transiently_touched(self) -> bool {
        matches!(
            self,
            Status::ExistingModified | Status::ExistingRemoved | Status::StaleModified
        )
    }

    ///
    /// The transition legality table. Status changes are only ever applied through
    /// `InnerStore::set_status`, which panics on an illegal pair: those are engine defects,
    /// not runtime conditions.
    ///
    pub(crate) fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            // Save and discard of locally-born entries.
            (New, Existing) | (New, Removed) => true,
            // Local edits and their save/revert.
            (Existing, ExistingModified) | (ExistingModified, Existing) => true,
            (Existing, ExistingRemoved) | (ExistingModified, ExistingRemoved) => true,
            (ExistingRemoved, Removed) | (ExistingRemoved, Existing) => true,
            // External refresh and reload.
            (Existing, Invalidated) | (Invalidated, Existing) => true,
            (Invalidated, ExistingRemoved) | (Invalidated, Removed) => true,
            // External destruction of clean entries.
            (Existing, Removed) => true,
            // Conflicts with external change.
            (ExistingModified, StaleModified) => true,
            (ExistingModified, StaleDestroyed) => true,
            (ExistingRemoved, StaleDestroyed) => true,
            (StaleModified, StaleDestroyed) => true,
            // A reverted stale-modified entry must re-observe the workspace.
            (StaleModified, Invalidated) => true,
            _ => false,
        }
    }
}

///
/// Listeners registered on an entry for `(previous, current)` status pairs. Mutation is
/// single-threaded under the store lock, so a listener is free to dispose itself.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StatusListener {
    /// Installed by the revert ledger: disposes the ledger (and its attic slot) when the owner
    /// reaches `Existing` (save complete) or a terminal state (external destruction).
    DisposeRevertInfo,
}

///
/// The per-entry snapshot of pre-transient identity, plus the per-parent reorder log.
///
/// Created lazily on the first transient identity change of an entry, or on the first reorder
/// performed among its children. The workspace view of the tree is reconstructed by unwinding
/// these snapshots; no second tree is kept.
///
#[derive(Clone, Debug)]
pub(crate) struct RevertInfo {
    /// None only for the root, which can carry a reorder log but cannot move.
    pub old_parent: Option<EntryId>,
    pub old_name: Name,
    pub old_index: u32,
    /// Reorders of this entry's children, oldest first. Each element pairs the reordered child
    /// with its previous successor (the sibling it sat immediately before; None = it was
    /// last). Replayed in reverse on revert.
    pub reorder_log: Vec<(EntryId, Option<EntryId>)>,
}

impl RevertInfo {
    pub fn snapshot(parent: Option<EntryId>, name: Name, index: u32) -> RevertInfo {
        RevertInfo {
            old_parent: parent,
            old_name: name,
            old_index: index,
            reorder_log: Vec::new(),
        }
    }

    ///
    /// True if the owning entry's identity differs from the snapshot, i.e. a move or rename is
    /// pending. A ledger that only carries reorders reports false.
    ///
    pub fn is_moved(&self, current_parent: Option<EntryId>, current_name: &Name) -> bool {
        self.old_parent != current_parent || &self.old_name != current_name
    }
}

///
/// The node-specific half of an entry.
///
pub(crate) struct NodePayload {
    pub unique_id: Option<UniqueId>,
    pub allows_sns: bool,
    /// The payload as last observed on the workspace; the revert target.
    pub saved_state: Option<NodeState>,
    /// The payload as the session sees it.
    pub state: Option<NodeState>,
    pub children: ChildList,
    pub child_attic: ChildAttic,
    pub properties: FnvHashMap<Name, EntryId>,
    /// Properties that were transiently removed and then shadowed by a same-name replacement.
    pub properties_attic: FnvHashMap<Name, EntryId>,
    pub revert_info: Option<RevertInfo>,
}

impl NodePayload {
    pub fn new(unique_id: Option<UniqueId>) -> NodePayload {
        NodePayload {
            unique_id,
            allows_sns: true,
            saved_state: None,
            state: None,
            children: ChildList::new(),
            child_attic: ChildAttic::new(),
            properties: FnvHashMap::default(),
            properties_attic: FnvHashMap::default(),
            revert_info: None,
        }
    }
}

///
/// The property-specific half of an entry.
///
pub(crate) struct PropertyPayload {
    pub saved_state: Option<PropertyState>,
    pub state: Option<PropertyState>,
}

impl PropertyPayload {
    pub fn new() -> PropertyPayload {
        PropertyPayload {
            saved_state: None,
            state: None,
        }
    }
}

pub(crate) enum Payload {
    Node(NodePayload),
    Property(PropertyPayload),
}

///
/// An entry in the shadow tree: the fields common to nodes and properties, plus the payload
/// variant. All references between entries are `EntryId` handles into the store's arena;
/// ownership is the arena's alone.
///
pub(crate) struct Entry {
    pub parent: Option<EntryId>,
    pub name: Name,
    pub status: Status,
    pub listeners: Vec<StatusListener>,
    pub payload: Payload,
}

impl Entry {
    pub fn new_node(
        parent: Option<EntryId>,
        name: Name,
        status: Status,
        unique_id: Option<UniqueId>,
    ) -> Entry {
        Entry {
            parent,
            name,
            status,
            listeners: Vec::new(),
            payload: Payload::Node(NodePayload::new(unique_id)),
        }
    }

    pub fn new_property(parent: EntryId, name: Name, status: Status) -> Entry {
        Entry {
            parent: Some(parent),
            name,
            status,
            listeners: Vec::new(),
            payload: Payload::Property(PropertyPayload::new()),
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self.payload, Payload::Node(_))
    }
}
