//! Applies external workspace events to the local graph. Routing resolves the event's parent
//! path in the workspace view (attics consulted, revert ledgers unwound), so events against
//! positions the session has transiently vacated still find their entries. Local `New` entries
//! are immune to every external event: they cannot be about the same logical item.

use std::sync::atomic;

use log::debug;

use crate::entry::{EntryId, Status};
use crate::name::{Name, JCR_MIXIN_TYPES, JCR_UUID};
use crate::provider::{Event, EventKind, ItemId, PropertyId, ProviderError, UniqueId};
use crate::{Hierarchy, HierarchyError, InnerStore};

impl Hierarchy {
    ///
    /// Applies one incoming server event. Events for subtrees the session has never loaded
    /// are dropped: routing is purely local and never synthesizes entries for them.
    ///
    pub fn refresh(&self, event: &Event) -> Result<(), HierarchyError> {
        if !event.path.is_absolute() {
            return Err(HierarchyError::Invalid(format!(
                "event path {} is not absolute",
                event.path
            )));
        }
        self.stats
            .events_applied
            .fetch_add(1, atomic::Ordering::SeqCst);
        match event.kind {
            EventKind::NodeAdded => self.apply_node_added(event),
            EventKind::NodeRemoved | EventKind::PropertyRemoved => self.apply_removed(event),
            EventKind::PropertyAdded => self.apply_property_added(event),
            EventKind::PropertyChanged => self.apply_property_changed(event),
        }
    }

    fn apply_node_added(&self, event: &Event) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        let Some((parent, name, index)) = resolve_parent(&inner, event) else {
            return Ok(());
        };
        let unique_id = match &event.id {
            ItemId::Node(id) => id.unique_id.clone(),
            ItemId::Property(_) => None,
        };
        // Only a complete list can tell a genuinely new child from one we simply never
        // fetched; partial and invalidated lists pick the child up on their next load.
        if inner.node(parent).children.status() != crate::children::ListStatus::Loaded {
            return Ok(());
        }
        let existing = unique_id
            .as_ref()
            .and_then(|uid| {
                inner
                    .child_by_unique_id(parent, uid)
                    .or_else(|| inner.attic_by_unique_id(parent, uid))
            })
            .or_else(|| inner.child_by_name_index(parent, &name, index));
        match existing {
            Some(found) if inner.entry(found).status == Status::New => {
                // A same-named local entry: left untouched, reconciled at save.
                debug!("dropping NODE_ADDED at {}: a local entry occupies it", event.path);
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                let id = inner.allocate_node(parent, name.clone(), Status::Existing, unique_id);
                inner.attach_child_at_index(parent, id, name, index);
                Ok(())
            }
        }
    }

    fn apply_removed(&self, event: &Event) -> Result<(), HierarchyError> {
        let mut inner = self.inner.lock();
        let Some(found) = locate_target(&inner, event) else {
            return Ok(());
        };
        if inner.entry(found).status == Status::New {
            return Ok(());
        }
        inner.external_remove_entry(found);
        Ok(())
    }

    fn apply_property_added(&self, event: &Event) -> Result<(), HierarchyError> {
        let reload = {
            let mut inner = self.inner.lock();
            let Some((parent, name, _)) = resolve_parent(&inner, event) else {
                return Ok(());
            };
            match inner.property_of(parent, &name, true) {
                None => {
                    let id = inner.allocate_property(parent, name.clone(), Status::Existing);
                    inner.node_mut(parent).properties.insert(name, id);
                    None
                }
                Some(found) => match inner.entry(found).status {
                    // A loaded clean payload is refreshed; anything else waits for its
                    // own read or conflict handling.
                    Status::Existing if inner.prop(found).state.is_some() => {
                        Some((found, property_fetch_id(&inner, found)))
                    }
                    _ => None,
                },
            }
        };
        if let Some((found, prop_id)) = reload {
            self.reload_property(found, &prop_id)?;
        }
        Ok(())
    }

    fn apply_property_changed(&self, event: &Event) -> Result<(), HierarchyError> {
        let plan = {
            let mut inner = self.inner.lock();
            let Some((parent, name, _)) = resolve_parent(&inner, event) else {
                return Ok(());
            };
            let side_effect = name == *JCR_UUID || name == *JCR_MIXIN_TYPES;
            let found = match inner.property_of(parent, &name, true) {
                None => {
                    let id = inner.allocate_property(parent, name.clone(), Status::Existing);
                    inner.node_mut(parent).properties.insert(name.clone(), id);
                    id
                }
                Some(found) => found,
            };
            match inner.entry(found).status {
                Status::New => return Ok(()),
                Status::ExistingModified => {
                    // The workspace changed underneath a local edit: the entry can no
                    // longer be flushed as-is.
                    inner.set_status(found, Status::StaleModified);
                    return Ok(());
                }
                Status::Existing if side_effect || inner.prop(found).state.is_some() => {
                    Some((found, parent, property_fetch_id(&inner, found), side_effect))
                }
                _ => None,
            }
        };
        let Some((found, parent, prop_id, side_effect)) = plan else {
            return Ok(());
        };
        self.reload_property(found, &prop_id)?;
        if side_effect {
            self.propagate_side_effect(found, parent);
        }
        Ok(())
    }

    ///
    /// Re-fetches a property payload and installs it as the new workspace observation.
    ///
    fn reload_property(&self, id: EntryId, prop_id: &PropertyId) -> Result<(), HierarchyError> {
        let state = match self.provider.property_state(prop_id) {
            Ok(state) => state,
            Err(ProviderError::NotFound) => {
                let mut inner = self.inner.lock();
                inner.external_remove_entry(id);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let mut inner = self.inner.lock();
        if !inner.is_valid(id) {
            return Ok(());
        }
        // Only a still-clean entry absorbs the new observation; a conflicting local edit
        // that landed while we fetched wins the race and goes stale on the next event.
        if inner.entry(id).status == Status::Existing {
            let prop = inner.prop_mut(id);
            prop.saved_state = Some(state.clone());
            prop.state = Some(state);
        }
        Ok(())
    }

    ///
    /// `jcr:uuid` and `jcr:mixinTypes` carry node-level facts: rebind the owning node's
    /// unique id (keeping the store index consistent) or replace its mixin set.
    ///
    fn propagate_side_effect(&self, prop: EntryId, owner: EntryId) {
        let mut inner = self.inner.lock();
        if !inner.is_valid(prop) || !inner.is_valid(owner) {
            return;
        }
        let Some(state) = inner.prop(prop).state.clone() else {
            return;
        };
        let name = inner.entry(prop).name.clone();
        if name == *JCR_UUID {
            let uid = state.values.first().map(|v| UniqueId::new(v));
            inner.set_unique_id(owner, uid);
        } else if name == *JCR_MIXIN_TYPES {
            let mut mixins = Vec::new();
            for value in &state.values {
                match Name::parse(value) {
                    Ok(mixin) => mixins.push(mixin),
                    Err(_) => {
                        debug!("ignoring unparseable mixin type {value:?}");
                    }
                }
            }
            let node = inner.node_mut(owner);
            if let Some(node_state) = &mut node.state {
                node_state.mixin_types = mixins.clone();
            }
            if let Some(saved) = &mut node.saved_state {
                saved.mixin_types = mixins;
            }
        }
    }
}

///
/// Resolves the event's parent entry in the workspace view and splits off the final path
/// segment. None when the event concerns a subtree the session has never loaded.
///
fn resolve_parent(inner: &InnerStore, event: &Event) -> Option<(EntryId, Name, u32)> {
    let parent_path = event.path.parent()?;
    let last = event.path.last()?;
    let parent = inner.lookup_deep(inner.root(), &parent_path, true)?;
    if !inner.entry(parent).is_node() {
        return None;
    }
    Some((parent, last.name().clone(), last.denormalized_index()))
}

///
/// Locates the entry a removal event refers to: the attic first (by unique id, then by the
/// old name and index), then the child list (by unique id, then by position), then the
/// property tables (shadowed entries first, since the attic'd property is the workspace one).
///
fn locate_target(inner: &InnerStore, event: &Event) -> Option<EntryId> {
    let (parent, name, index) = resolve_parent(inner, event)?;
    match event.kind {
        EventKind::NodeRemoved => {
            let uid = event.id.unique_id();
            if let Some(uid) = uid {
                if let Some(found) = inner.attic_by_unique_id(parent, uid) {
                    return Some(found);
                }
            }
            if let Some(found) = inner.node(parent).child_attic.get(&name, index) {
                return Some(found);
            }
            if let Some(uid) = uid {
                if let Some(found) = inner.child_by_unique_id(parent, uid) {
                    return Some(found);
                }
            }
            inner.workspace_child(parent, &name, index)
        }
        EventKind::PropertyRemoved => inner.property_of(parent, &name, true),
        _ => None,
    }
}

///
/// The workspace id to fetch a property by, derived outside of any remote call.
///
fn property_fetch_id(inner: &InnerStore, id: EntryId) -> PropertyId {
    match inner.item_id(id, true) {
        ItemId::Property(prop_id) => prop_id,
        ItemId::Node(_) => unreachable!("property entries yield property ids"),
    }
}
