use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::name::{Name, Path, JCR_UUID};
use crate::provider::{
    ChildInfo, Event, EventKind, ItemId, NodeDefinition, NodeId, NodeInfo, NodeState,
    PropertyDefinition, PropertyId, PropertyState, ProviderError, RemoteProvider, UniqueId,
};
use crate::{EntryId, Hierarchy, HierarchyError, Status};

#[test]
fn load_and_list_children() {
    init();
    let remote = workspace();
    remote.add_node("/a", Some("uid-a"));
    remote.add_node("/b", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();

    assert_eq!(child_names(&h, root), vec!["a", "b"]);
    assert_eq!(h.stats().children_loaded, 1);
    // A second read answers from the loaded list.
    assert_eq!(child_names(&h, root), vec!["a", "b"]);
    assert_eq!(h.stats().children_loaded, 1);

    let a = h.children(root).unwrap()[0];
    assert_eq!(h.status(a), Status::Existing);
    assert_eq!(h.unique_id(a), Some(UniqueId::new("uid-a")));
    assert_eq!(h.lookup_by_unique_id(&UniqueId::new("uid-a")), Some(a));
}

#[test]
fn transient_rename_and_save() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let a = h.children(root).unwrap()[0];

    h.move_entry(a, n("b"), root, true).unwrap();

    assert_eq!(child_names(&h, root), vec!["b"]);
    assert_eq!(h.parked_children(root), vec![a]);
    assert_eq!(h.path(a, false).to_string(), "/b");
    assert_eq!(h.path(a, true).to_string(), "/a");
    assert_eq!(
        h.workspace_item_id(a),
        ItemId::Node(NodeId::from_path(p("/a")))
    );
    assert_eq!(h.item_id(a), ItemId::Node(NodeId::from_path(p("/b"))));

    let log = h.collect_changes(root, true).unwrap();
    assert_eq!(log.added, Vec::<EntryId>::new());
    assert_eq!(log.modified, vec![a]);
    h.persisted(&log).unwrap();

    assert!(h.parked_children(root).is_empty());
    assert!(h.collect_changes(root, true).unwrap().is_empty());
    assert_eq!(h.item_id(a), h.workspace_item_id(a));
}

#[test]
fn external_remove_wins_against_local_modify() {
    init();
    let remote = workspace();
    remote.add_node("/x", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let x = h.children(root).unwrap()[0];

    h.add_new_property(x, n("p"), pdef()).unwrap();
    assert_eq!(h.status(x), Status::ExistingModified);

    h.refresh(&node_event(EventKind::NodeRemoved, "/x", None))
        .unwrap();
    assert_eq!(h.status(x), Status::StaleDestroyed);

    match h.collect_changes(root, true) {
        Err(HierarchyError::Stale(_)) => {}
        other => panic!("expected a stale failure, got {other:?}"),
    }
}

#[test]
fn sns_reorder_and_revert() {
    init();
    let remote = workspace();
    remote.add_node("/c", None);
    remote.add_node("/c[2]", None);
    remote.add_node("/c[3]", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let children = h.children(root).unwrap();
    let (c1, c2, c3) = (children[0], children[1], children[2]);

    h.order_before(c3, Some(c1)).unwrap();

    assert_eq!(h.index(c3), 1);
    assert_eq!(h.index(c1), 2);
    assert_eq!(h.index(c2), 3);
    // Every sibling pinned its workspace index.
    assert_eq!(h.path(c1, true).to_string(), "/c");
    assert_eq!(h.path(c2, true).to_string(), "/c[2]");
    assert_eq!(h.path(c3, true).to_string(), "/c[3]");

    h.revert(root).unwrap();

    assert_eq!(h.index(c1), 1);
    assert_eq!(h.index(c2), 2);
    assert_eq!(h.index(c3), 3);
    for c in [c1, c2, c3] {
        assert_eq!(h.path(c, true), h.path(c, false));
    }
    assert!(h.collect_changes(root, true).unwrap().is_empty());
}

#[test]
fn sns_reorder_saves_and_releases_pins() {
    init();
    let remote = workspace();
    remote.add_node("/c", None);
    remote.add_node("/c[2]", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let children = h.children(root).unwrap();
    let (c1, c2) = (children[0], children[1]);

    h.order_before(c2, Some(c1)).unwrap();
    let log = h.collect_changes(root, true).unwrap();
    assert_eq!(log.modified, vec![root]);
    h.persisted(&log).unwrap();

    // The pins are gone: workspace and transient views agree.
    assert_eq!(h.path(c2, true).to_string(), "/c");
    assert_eq!(h.path(c1, true).to_string(), "/c[2]");
    assert!(h.collect_changes(root, true).unwrap().is_empty());
}

#[test]
fn property_shadow_and_revert() {
    init();
    let remote = workspace();
    remote.add_node("/n", None);
    remote.add_property("/n/p", PropertyState::single("v1"));
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let node = h.children(root).unwrap()[0];
    let old = h.get_deep_entry(root, &p("/n/p")).unwrap();
    assert_eq!(h.property_state(old).unwrap(), PropertyState::single("v1"));

    h.transient_remove(old).unwrap();
    assert_eq!(h.status(old), Status::ExistingRemoved);

    let new = h.add_new_property(node, n("p"), pdef()).unwrap();
    assert_eq!(h.property(node, &n("p")), Some(new));
    assert_eq!(h.status(new), Status::New);
    assert_eq!(h.status(old), Status::ExistingRemoved);

    h.revert(node).unwrap();

    assert_eq!(h.property(node, &n("p")), Some(old));
    assert_eq!(h.status(old), Status::Existing);
    assert_eq!(h.status(new), Status::Removed);
    assert_eq!(h.property_state(old).unwrap(), PropertyState::single("v1"));
    assert!(h.inner.lock().node(node).properties_attic.is_empty());
}

#[test]
fn deep_lookup_issues_single_remote_call() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    remote.add_node("/a/b", None);
    remote.add_node("/a/b/c", None);
    remote.add_node("/a/b/c/d", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();

    let d = h.get_deep_entry(root, &p("/a/b/c/d")).unwrap();

    assert_eq!(h.path(d, false).to_string(), "/a/b/c/d");
    let deep_calls: Vec<String> = remote
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("deep"))
        .collect();
    assert_eq!(deep_calls, vec!["deep_node_infos(/a, b/c/d)"]);
    assert_eq!(h.stats().deep_resolutions, 1);
    // The intermediate entries materialized.
    assert!(h.lookup_deep_entry(root, &p("/a/b"), false).is_some());
    assert!(h.lookup_deep_entry(root, &p("/a/b/c"), false).is_some());
}

#[test]
fn deep_lookup_retries_as_property() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    remote.add_node("/a/b", None);
    remote.add_node("/a/b/c", None);
    remote.add_property("/a/b/c/q", PropertyState::single("deep"));
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();

    let q = h.get_deep_entry(root, &p("/a/b/c/q")).unwrap();

    assert!(!h.is_node(q));
    assert_eq!(h.name(q), n("q"));
    assert_eq!(h.status(q), Status::Existing);
    assert_eq!(h.property_state(q).unwrap(), PropertyState::single("deep"));
    let deep_calls: Vec<String> = remote
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("deep"))
        .collect();
    assert_eq!(
        deep_calls,
        vec![
            "deep_node_infos(/a, b/c/q)",
            "deep_property_infos(/a, b/c, q)"
        ]
    );
}

#[test]
fn event_resolves_moved_child_through_attic() {
    init();
    let remote = workspace();
    remote.add_node("/x", Some("uid-x"));
    remote.add_node("/y", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let children = h.children(root).unwrap();
    let (x, y) = (children[0], children[1]);

    h.move_entry(x, n("x"), y, true).unwrap();
    assert_eq!(h.parked_children(root), vec![x]);
    assert_eq!(h.path(x, false).to_string(), "/y/x");

    h.refresh(&node_event(EventKind::NodeRemoved, "/x", Some("uid-x")))
        .unwrap();

    assert_eq!(h.status(x), Status::StaleDestroyed);
}

#[test]
fn add_new_node_then_revert_is_noop() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();

    let z = h
        .add_new_node(root, n("z"), None, n("nt:unstructured"), ndef())
        .unwrap();
    assert_eq!(h.status(z), Status::New);
    assert_eq!(child_names(&h, root), vec!["a", "z"]);

    h.revert(root).unwrap();

    assert_eq!(child_names(&h, root), vec!["a"]);
    assert_eq!(h.status(z), Status::Removed);
    assert!(h.collect_changes(root, true).unwrap().is_empty());
}

#[test]
fn moves_compose_to_identity() {
    init();
    let remote = workspace();
    remote.add_node("/p1", None);
    remote.add_node("/p2", None);
    remote.add_node("/p1/a", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let parents = h.children(root).unwrap();
    let (p1, p2) = (parents[0], parents[1]);
    let a = h.children(p1).unwrap()[0];

    h.move_entry(a, n("a"), p2, true).unwrap();
    assert_eq!(h.path(a, false).to_string(), "/p2/a");
    h.move_entry(a, n("a"), p1, true).unwrap();

    assert_eq!(h.path(a, false).to_string(), "/p1/a");
    assert!(h.parked_children(p1).is_empty());
    assert!(h.collect_changes(root, true).unwrap().is_empty());
}

#[test]
fn property_add_remove_add_yields_single_new_entry() {
    init();
    let remote = workspace();
    remote.add_node("/m", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let m = h.children(root).unwrap()[0];

    let first = h.add_new_property(m, n("q"), pdef()).unwrap();
    h.transient_remove(first).unwrap();
    assert_eq!(h.status(first), Status::Removed);
    let second = h.add_new_property(m, n("q"), pdef()).unwrap();

    assert_eq!(h.properties(m), vec![second]);
    assert_eq!(h.status(second), Status::New);
    assert!(h.inner.lock().node(m).properties_attic.is_empty());
    let log = h.collect_changes(m, true).unwrap();
    assert_eq!(log.added, vec![second]);
    assert_eq!(log.removed, Vec::<EntryId>::new());
}

#[test]
fn root_is_pinned() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let a = h.children(root).unwrap()[0];

    match h.move_entry(root, n("elsewhere"), a, true) {
        Err(HierarchyError::Invalid(_)) => {}
        other => panic!("expected an invalid failure, got {other:?}"),
    }
    match h.transient_remove(root) {
        Err(HierarchyError::Invalid(_)) => {}
        other => panic!("expected an invalid failure, got {other:?}"),
    }
    match h.remove(root) {
        Err(HierarchyError::Invalid(_)) => {}
        other => panic!("expected an invalid failure, got {other:?}"),
    }
}

#[test]
fn reorder_in_singleton_bucket_is_noop() {
    init();
    let remote = workspace();
    remote.add_node("/s", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let s = h.children(root).unwrap()[0];

    h.order_before(s, None).unwrap();

    assert!(h.collect_changes(root, true).unwrap().is_empty());
    assert_eq!(h.path(s, true), h.path(s, false));
    match h.order_before(s, Some(s)) {
        Err(HierarchyError::Invalid(_)) => {}
        other => panic!("expected an invalid failure, got {other:?}"),
    }
}

#[test]
fn sibling_index_on_property_segment_is_invalid() {
    init();
    let remote = workspace();
    remote.add_node("/n", None);
    remote.add_property("/n/p", PropertyState::single("v"));
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();
    h.get_deep_entry(root, &p("/n/p")).unwrap();

    match h.get_deep_entry(root, &p("/n/p[2]")) {
        Err(HierarchyError::Invalid(_)) => {}
        other => panic!("expected an invalid failure, got {other:?}"),
    }
}

#[test]
fn new_entries_are_immune_to_external_events() {
    init();
    let remote = workspace();
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();

    let z = h.add_node(root, n("z"), None, None).unwrap();
    h.refresh(&node_event(EventKind::NodeRemoved, "/z", None))
        .unwrap();
    assert_eq!(h.status(z), Status::New);

    h.refresh(&node_event(EventKind::NodeAdded, "/z", None))
        .unwrap();
    assert_eq!(h.status(z), Status::New);
    assert_eq!(h.children(root).unwrap(), vec![z]);
}

#[test]
fn node_added_event_materializes_into_loaded_list() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();

    remote.add_node("/f", Some("uid-f"));
    h.refresh(&node_event(EventKind::NodeAdded, "/f", Some("uid-f")))
        .unwrap();

    assert_eq!(child_names(&h, root), vec!["a", "f"]);
    let f = h.lookup_by_unique_id(&UniqueId::new("uid-f")).unwrap();
    assert_eq!(h.status(f), Status::Existing);
    // Redelivery is idempotent.
    h.refresh(&node_event(EventKind::NodeAdded, "/f", Some("uid-f")))
        .unwrap();
    assert_eq!(child_names(&h, root), vec!["a", "f"]);
}

#[test]
fn collect_changes_is_deterministic_and_deduplicated() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    remote.add_node("/b", None);
    remote.add_node("/a/c", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let top = h.children(root).unwrap();
    let (a, b) = (top[0], top[1]);
    let c = h.children(a).unwrap()[0];

    h.add_new_node(a, n("fresh"), None, n("nt:unstructured"), ndef())
        .unwrap();
    h.add_new_property(b, n("q"), pdef()).unwrap();
    h.transient_remove(c).unwrap();
    h.move_entry(b, n("b2"), a, true).unwrap();

    let once = h.collect_changes(root, false).unwrap();
    let twice = h.collect_changes(root, false).unwrap();
    assert_eq!(once, twice);

    let mut all: Vec<EntryId> = once.iter().collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), total, "an entry was emitted twice");
}

#[test]
fn workspace_paths_resolve_moved_entries() {
    init();
    let remote = workspace();
    remote.add_node("/x", None);
    remote.add_node("/y", None);
    remote.add_node("/x/inner", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let top = h.children(root).unwrap();
    let (x, y) = (top[0], top[1]);
    let inner = h.children(x).unwrap()[0];

    h.move_entry(x, n("renamed"), y, true).unwrap();
    h.move_entry(inner, n("inner"), root, true).unwrap();

    for moved in [x, inner] {
        let ws_path = h.path(moved, true);
        assert_eq!(
            h.lookup_deep_entry(root, &ws_path, true),
            Some(moved),
            "workspace path {ws_path} did not resolve"
        );
    }
}

#[test]
fn reload_merges_remote_order_and_preserves_local_edits() {
    init();
    let remote = workspace();
    remote.add_node("/m", None);
    remote.add_node("/m/a", None);
    remote.add_node("/m/b", None);
    remote.add_node("/m/c", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let m = h.children(root).unwrap()[0];
    assert_eq!(child_names(&h, m), vec!["a", "b", "c"]);

    remote.set_children("/m", &["c", "a", "q"]);
    h.invalidate(m, false);
    assert_eq!(h.status(m), Status::Invalidated);
    // A local edit against the stale list survives the merge.
    h.add_node(m, n("x"), None, None).unwrap();

    // The reload reorders known remote entries, keeps local-only entries in their slots,
    // and inserts the unknown remote child.
    assert_eq!(child_names(&h, m), vec!["c", "b", "a", "x", "q"]);
    assert_eq!(h.stats().children_reloaded, 1);

    // The remote deletion of `b` arrives as an event.
    h.refresh(&node_event(EventKind::NodeRemoved, "/m/b", None))
        .unwrap();
    assert_eq!(child_names(&h, m), vec!["c", "a", "x", "q"]);
}

#[test]
fn property_changed_reloads_clean_and_conflicts_dirty() {
    init();
    let remote = workspace();
    remote.add_node("/n", None);
    remote.add_property("/n/p", PropertyState::single("v1"));
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();
    let prop = h.get_deep_entry(root, &p("/n/p")).unwrap();
    assert_eq!(h.property_state(prop).unwrap(), PropertyState::single("v1"));

    remote.set_property("/n/p", PropertyState::single("v2"));
    h.refresh(&prop_event(EventKind::PropertyChanged, "/n/p"))
        .unwrap();
    assert_eq!(h.property_state(prop).unwrap(), PropertyState::single("v2"));
    assert_eq!(h.status(prop), Status::Existing);

    h.set_property_value(prop, vec!["local".to_owned()]).unwrap();
    assert_eq!(h.status(prop), Status::ExistingModified);
    remote.set_property("/n/p", PropertyState::single("v3"));
    h.refresh(&prop_event(EventKind::PropertyChanged, "/n/p"))
        .unwrap();
    assert_eq!(h.status(prop), Status::StaleModified);
    // The local value survives for inspection.
    assert_eq!(
        h.property_state(prop).unwrap(),
        PropertyState {
            values: vec!["local".to_owned()],
            multi_valued: false,
        }
    );
}

#[test]
fn uuid_change_rebinds_the_unique_id() {
    init();
    let remote = workspace();
    remote.add_node("/u", Some("uid-1"));
    let uuid_path = format!("/u/{}", &*JCR_UUID);
    remote.add_property(&uuid_path, PropertyState::single("uid-2"));
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let u = h.children(root).unwrap()[0];
    assert_eq!(h.lookup_by_unique_id(&UniqueId::new("uid-1")), Some(u));

    h.refresh(&prop_event(EventKind::PropertyChanged, &uuid_path))
        .unwrap();

    assert_eq!(h.unique_id(u), Some(UniqueId::new("uid-2")));
    assert_eq!(h.lookup_by_unique_id(&UniqueId::new("uid-2")), Some(u));
    assert_eq!(h.lookup_by_unique_id(&UniqueId::new("uid-1")), None);
}

#[test]
fn persisted_applies_removals() {
    init();
    let remote = workspace();
    remote.add_node("/r", None);
    remote.add_node("/keep", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let r = h.children(root).unwrap()[0];

    h.transient_remove(r).unwrap();
    assert_eq!(h.status(r), Status::ExistingRemoved);
    // A transiently removed sibling still occupies its slot.
    assert_eq!(child_names(&h, root), vec!["r", "keep"]);

    let log = h.collect_changes(root, true).unwrap();
    assert_eq!(log.removed, vec![r]);
    h.persisted(&log).unwrap();

    assert_eq!(h.status(r), Status::Removed);
    assert_eq!(child_names(&h, root), vec!["keep"]);
}

#[test]
fn same_name_siblings_rejected_when_definition_disallows() {
    init();
    let remote = workspace();
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    h.children(root).unwrap();

    let strict = NodeDefinition {
        allows_same_name_siblings: false,
    };
    h.add_new_node(root, n("only"), None, n("nt:unstructured"), strict)
        .unwrap();
    match h.add_new_node(root, n("only"), None, n("nt:unstructured"), strict) {
        Err(HierarchyError::Exists(_)) => {}
        other => panic!("expected an exists failure, got {other:?}"),
    }
    match h.add_node(root, n("only"), None, None) {
        Err(HierarchyError::Exists(_)) => {}
        other => panic!("expected an exists failure, got {other:?}"),
    }
}

#[test]
fn moved_away_child_is_not_found_at_its_old_path() {
    init();
    let remote = workspace();
    remote.add_node("/x", None);
    remote.add_node("/y", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let top = h.children(root).unwrap();
    let (x, y) = (top[0], top[1]);

    h.move_entry(x, n("x"), y, true).unwrap();

    match h.get_deep_entry(root, &p("/x")) {
        Err(HierarchyError::NotFound(_)) => {}
        other => panic!("expected a not-found failure, got {other:?}"),
    }
    assert_eq!(h.get_deep_entry(root, &p("/y/x")).unwrap(), x);
}

#[test]
fn cyclic_move_is_invalid() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    remote.add_node("/a/b", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let a = h.children(root).unwrap()[0];
    let b = h.children(a).unwrap()[0];

    match h.move_entry(a, n("a"), b, true) {
        Err(HierarchyError::Invalid(_)) => {}
        other => panic!("expected an invalid failure, got {other:?}"),
    }
}

#[test]
fn sibling_indices_stay_contiguous() {
    init();
    let remote = workspace();
    remote.add_node("/a", None);
    remote.add_node("/a[2]", None);
    remote.add_node("/a[3]", None);
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let siblings = h.children(root).unwrap();

    let indices: Vec<u32> = siblings.iter().map(|s| h.index(*s)).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    // A transient removal keeps the slot until saved.
    h.transient_remove(siblings[1]).unwrap();
    let indices: Vec<u32> = siblings.iter().map(|s| h.index(*s)).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    let log = h.collect_changes(root, true).unwrap();
    h.persisted(&log).unwrap();
    assert_eq!(h.index(siblings[0]), 1);
    assert_eq!(h.index(siblings[2]), 2);
}

#[test]
fn transient_removal_survives_revert() {
    init();
    let remote = workspace();
    remote.add_node("/t", None);
    remote.add_node("/t/kid", None);
    remote.add_property("/t/p", PropertyState::single("v"));
    let h = Hierarchy::new(remote.clone(), None);
    let root = h.root();
    let t = h.children(root).unwrap()[0];
    let kid = h.children(t).unwrap()[0];
    let prop = h.get_deep_entry(root, &p("/t/p")).unwrap();

    h.transient_remove(t).unwrap();
    assert_eq!(h.status(t), Status::ExistingRemoved);
    assert_eq!(h.status(kid), Status::ExistingRemoved);
    assert_eq!(h.status(prop), Status::ExistingRemoved);

    h.revert(root).unwrap();
    assert_eq!(h.status(t), Status::Existing);
    assert_eq!(h.status(kid), Status::Existing);
    assert_eq!(h.status(prop), Status::Existing);
}

#[test]
fn revert_round_trips_random_edit_sequences() {
    init();
    for seed in 0..8u64 {
        let remote = workspace();
        remote.add_node("/a", Some("uid-a"));
        remote.add_node("/b", None);
        remote.add_node("/a/c", None);
        remote.add_node("/a/d", None);
        remote.add_node("/b/e", None);
        remote.add_property("/a/p", PropertyState::single("v"));
        let h = Hierarchy::new(remote.clone(), None);
        let root = h.root();
        h.get_deep_entry(root, &p("/a/p")).unwrap();

        let mut before = Vec::new();
        snapshot(&h, root, &mut before);
        before.sort();

        let mut rng = StdRng::seed_from_u64(seed);
        let names = ["x", "y", "z"];
        for _ in 0..30 {
            let (nodes, props) = live_entries(&h, root);
            let op = rng.random_range(0..6);
            let pick = |rng: &mut StdRng, pool: &[EntryId]| pool[rng.random_range(0..pool.len())];
            let result: Result<(), HierarchyError> = match op {
                0 => h
                    .add_node(root, n(names[rng.random_range(0..names.len())]), None, None)
                    .map(|_| ()),
                1 => {
                    let target = pick(&mut rng, &nodes);
                    h.add_new_property(target, n(names[rng.random_range(0..names.len())]), pdef())
                        .map(|_| ())
                }
                2 => {
                    let subject = pick(&mut rng, &nodes);
                    let target = pick(&mut rng, &nodes);
                    h.move_entry(
                        subject,
                        n(names[rng.random_range(0..names.len())]),
                        target,
                        true,
                    )
                }
                3 => {
                    let subject = pick(&mut rng, &nodes);
                    let anchor = if rng.random_range(0..2) == 0 {
                        None
                    } else {
                        Some(pick(&mut rng, &nodes))
                    };
                    h.order_before(subject, anchor)
                }
                4 => {
                    let subject = pick(&mut rng, &nodes);
                    h.transient_remove(subject)
                }
                _ => {
                    if props.is_empty() {
                        Ok(())
                    } else {
                        h.set_property_value(pick(&mut rng, &props), vec!["w".to_owned()])
                    }
                }
            };
            // Rejected operations (cycles, collisions, non-siblings) are part of the
            // sequence space.
            let _ignored = result;
            h.inner.lock().assert_consistent();
        }

        h.revert(root).unwrap();
        h.inner.lock().assert_consistent();

        let mut after = Vec::new();
        snapshot(&h, root, &mut after);
        after.sort();
        assert_eq!(before, after, "revert did not round-trip for seed {seed}");
    }
}

// ----------------------------------------------------------------------
// Helpers.
// ----------------------------------------------------------------------

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn n(name: &str) -> Name {
    Name::new(name)
}

fn p(path: &str) -> Path {
    Path::parse(path).unwrap()
}

fn ndef() -> NodeDefinition {
    NodeDefinition::residual()
}

fn pdef() -> PropertyDefinition {
    PropertyDefinition { multi_valued: false }
}

fn node_event(kind: EventKind, path: &str, uid: Option<&str>) -> Event {
    let path = p(path);
    let id = ItemId::Node(match uid {
        Some(uid) => NodeId::from_unique_id(UniqueId::new(uid)),
        None => NodeId::from_path(path.clone()),
    });
    Event { kind, id, path }
}

fn prop_event(kind: EventKind, path: &str) -> Event {
    let path = p(path);
    let parent = path.parent().expect("property events carry a parent");
    let name = path.last().expect("property events carry a name").name().clone();
    Event {
        kind,
        id: ItemId::Property(PropertyId {
            parent: NodeId::from_path(parent),
            name,
        }),
        path,
    }
}

fn child_names(h: &Hierarchy, id: EntryId) -> Vec<String> {
    h.children(id)
        .unwrap()
        .into_iter()
        .map(|c| h.name(c).to_string())
        .collect()
}

fn snapshot(h: &Hierarchy, id: EntryId, out: &mut Vec<String>) {
    out.push(format!(
        "{} {:?} uid={:?}",
        h.path(id, false),
        h.status(id),
        if h.is_node(id) { h.unique_id(id) } else { None },
    ));
    if h.is_node(id) {
        for prop in h.properties(id) {
            out.push(format!(
                "{}#{} {:?}",
                h.path(id, false),
                h.name(prop),
                h.status(prop)
            ));
        }
        for child in h.children(id).unwrap() {
            snapshot(h, child, out);
        }
    }
}

fn live_entries(h: &Hierarchy, root: EntryId) -> (Vec<EntryId>, Vec<EntryId>) {
    let mut nodes = Vec::new();
    let mut props = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        nodes.push(id);
        props.extend(h.properties(id));
        stack.extend(h.children(id).unwrap_or_default());
    }
    (nodes, props)
}

fn workspace() -> Arc<MockRemote> {
    Arc::new(MockRemote::new())
}

// ----------------------------------------------------------------------
// A scripted remote: a flat map of absolute paths to nodes and properties,
// recording the calls made against it.
// ----------------------------------------------------------------------

struct MockRemote {
    state: Mutex<MockWorkspace>,
    calls: Mutex<Vec<String>>,
}

#[derive(Default)]
struct MockWorkspace {
    nodes: HashMap<String, MockNode>,
    properties: HashMap<String, PropertyState>,
}

#[derive(Default)]
struct MockNode {
    unique_id: Option<UniqueId>,
    children: Vec<String>,
}

impl MockRemote {
    fn new() -> MockRemote {
        let mut workspace = MockWorkspace::default();
        workspace.nodes.insert("/".to_owned(), MockNode::default());
        MockRemote {
            state: Mutex::new(workspace),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn add_node(&self, path: &str, unique_id: Option<&str>) {
        let mut state = self.state.lock();
        let (parent, segment) = split_path(path);
        let name = strip_index(&segment);
        state.nodes.insert(
            path.to_owned(),
            MockNode {
                unique_id: unique_id.map(UniqueId::new),
                children: Vec::new(),
            },
        );
        state
            .nodes
            .get_mut(&parent)
            .expect("parent must be registered first")
            .children
            .push(name);
    }

    fn set_children(&self, path: &str, names: &[&str]) {
        let mut state = self.state.lock();
        for name in names {
            let key = join(path, name);
            state.nodes.entry(key).or_default();
        }
        state
            .nodes
            .get_mut(path)
            .expect("node must be registered first")
            .children = names.iter().map(|n| (*n).to_owned()).collect();
    }

    fn add_property(&self, path: &str, state_value: PropertyState) {
        self.state
            .lock()
            .properties
            .insert(path.to_owned(), state_value);
    }

    fn set_property(&self, path: &str, state_value: PropertyState) {
        self.add_property(path, state_value);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn resolve(&self, state: &MockWorkspace, id: &NodeId) -> Result<String, ProviderError> {
        let base = match &id.unique_id {
            Some(uid) => state
                .nodes
                .iter()
                .find(|(_, node)| node.unique_id.as_ref() == Some(uid))
                .map(|(path, _)| path.clone())
                .ok_or(ProviderError::NotFound)?,
            None => String::new(),
        };
        match &id.path {
            Some(path) if id.unique_id.is_some() => Ok(join(&base, &path.to_string())),
            Some(path) => Ok(path.to_string()),
            None => Ok(base),
        }
    }
}

impl RemoteProvider for MockRemote {
    fn child_infos(&self, id: &NodeId) -> Result<Vec<ChildInfo>, ProviderError> {
        let state = self.state.lock();
        let path = self.resolve(&state, id)?;
        self.record(format!("child_infos({path})"));
        let node = state.nodes.get(&path).ok_or(ProviderError::NotFound)?;
        let mut seen: HashMap<&str, u32> = HashMap::new();
        Ok(node
            .children
            .iter()
            .map(|child| {
                let index = seen.entry(child.as_str()).or_insert(0);
                *index += 1;
                let key = child_key(&path, child, *index);
                ChildInfo {
                    name: Name::new(child),
                    unique_id: state
                        .nodes
                        .get(&key)
                        .and_then(|n| n.unique_id.clone()),
                    index: *index,
                }
            })
            .collect())
    }

    fn node_state(&self, id: &NodeId) -> Result<NodeState, ProviderError> {
        let state = self.state.lock();
        let path = self.resolve(&state, id)?;
        self.record(format!("node_state({path})"));
        if state.nodes.contains_key(&path) {
            Ok(NodeState::new(Name::new("nt:unstructured")))
        } else {
            Err(ProviderError::NotFound)
        }
    }

    fn property_state(&self, id: &PropertyId) -> Result<PropertyState, ProviderError> {
        let state = self.state.lock();
        let parent = self.resolve(&state, &id.parent)?;
        let key = join(&parent, &id.name.to_string());
        self.record(format!("property_state({key})"));
        state
            .properties
            .get(&key)
            .cloned()
            .ok_or(ProviderError::NotFound)
    }

    fn deep_node_infos(&self, anchor: &NodeId, relative: &Path) -> Result<Vec<NodeInfo>, ProviderError> {
        let state = self.state.lock();
        let anchor_path = self.resolve(&state, anchor)?;
        self.record(format!("deep_node_infos({anchor_path}, {relative})"));
        let mut infos = Vec::new();
        let mut current = anchor_path;
        for element in relative.elements() {
            current = join(&current, &element.to_string());
            let node = state.nodes.get(&current).ok_or(ProviderError::NotFound)?;
            infos.push(NodeInfo {
                name: element.name().clone(),
                unique_id: node.unique_id.clone(),
                index: element.denormalized_index(),
                state: NodeState::new(Name::new("nt:unstructured")),
            });
        }
        Ok(infos)
    }

    fn deep_property_infos(
        &self,
        anchor: &NodeId,
        relative: &Path,
        name: &Name,
    ) -> Result<(Vec<NodeInfo>, PropertyState), ProviderError> {
        let state = self.state.lock();
        let anchor_path = self.resolve(&state, anchor)?;
        self.record(format!("deep_property_infos({anchor_path}, {relative}, {name})"));
        let mut infos = Vec::new();
        let mut current = anchor_path;
        for element in relative.elements() {
            current = join(&current, &element.to_string());
            let node = state.nodes.get(&current).ok_or(ProviderError::NotFound)?;
            infos.push(NodeInfo {
                name: element.name().clone(),
                unique_id: node.unique_id.clone(),
                index: element.denormalized_index(),
                state: NodeState::new(Name::new("nt:unstructured")),
            });
        }
        let key = join(&current, &name.to_string());
        let value = state
            .properties
            .get(&key)
            .cloned()
            .ok_or(ProviderError::NotFound)?;
        Ok((infos, value))
    }
}

fn split_path(path: &str) -> (String, String) {
    let pos = path.rfind('/').expect("mock paths are absolute");
    let parent = if pos == 0 { "/" } else { &path[..pos] };
    (parent.to_owned(), path[pos + 1..].to_owned())
}

fn strip_index(segment: &str) -> String {
    match segment.find('[') {
        Some(pos) => segment[..pos].to_owned(),
        None => segment.to_owned(),
    }
}

fn child_key(parent: &str, name: &str, index: u32) -> String {
    if index > 1 {
        join(parent, &format!("{name}[{index}]"))
    } else {
        join(parent, name)
    }
}

fn join(parent: &str, segment: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{segment}")
    } else {
        format!("{parent}/{segment}")
    }
}
