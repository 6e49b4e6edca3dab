//! Identity map, key assignment and relationship resolution.

mod common;

use std::sync::Arc;

use common::*;
use orm_engine::entity::same_entity;
use orm_engine::key_service::KeyService;
use orm_engine::config::WrappingAction;
use orm_engine::{
    into_handle, CascadeMode, FieldDescriptor, FieldValue, MergeBehavior, OrmError, RelationTypes,
    RowState, ScopeSettings, ServiceScope, ValueKind,
};

fn lines_of(h: &orm_engine::EntityHandle) -> Vec<orm_engine::EntityHandle> {
    match get(h, "lines") {
        FieldValue::Set(set) => set.items(),
        _ => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────

#[test]
fn include_twice_returns_same_record() {
    let s = scope();
    let o = order(0);
    let a = s.include(&o).unwrap();
    let b = s.include(&o).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(s.len(), 1);
}

#[test]
fn released_objects_leave_the_index() {
    let s = scope();
    {
        let o = order(3);
        s.include(&o).unwrap();
        assert_eq!(s.len(), 1);
    }
    s.reconcile_modified_state(None).unwrap();
    assert_eq!(s.len(), 0);
}

#[test]
fn ambient_scope_is_visible_while_guard_lives() {
    let s = scope();
    assert!(ServiceScope::current().is_none());
    {
        let _guard = s.use_ambient();
        let current = ServiceScope::current().unwrap();
        assert!(!current.is_owner());
    }
    assert!(ServiceScope::current().is_none());
}

// ─────────────────────────────────────────────────────────────
// Key assignment
// ─────────────────────────────────────────────────────────────

#[test]
fn surrogate_keys_strictly_increase() {
    let s = scope();
    let mut last = i64::MIN;
    let mut kept = Vec::new();
    for _ in 0..5 {
        let o = order(0);
        s.new_object(&o).unwrap();
        let id = int(&o, "order_id");
        assert!(id > last);
        last = id;
        kept.push(o);
    }
    assert_eq!(int(&kept[0], "order_id"), i32::MIN as i64 + 1);
}

#[test]
fn supplied_key_is_kept_on_new_rows() {
    let s = scope();
    let o = order(500);
    let to = s.new_object(&o).unwrap();
    assert_eq!(int(&o, "order_id"), 500);
    assert_eq!(to.row_state(), RowState::Added);
}

#[test]
fn new_of_type_uses_registered_factory() {
    let s = scope();
    let mut props = orm_engine::PropertyMap::new();
    props.insert("status".to_string(), FieldValue::Text("draft".to_string()));
    let o = s.new_of_type("Order", Some(&props)).unwrap();
    assert_eq!(get(&o, "status"), FieldValue::Text("draft".to_string()));
    assert!(!get(&o, "order_id").is_default());
    assert!(s.new_of_type("Ghost", None).is_err());
}

#[test]
fn shadow_keys_leave_native_field_untouched() {
    let s = scope_with(ScopeSettings { use_shadow_properties_for_new: true, ..Default::default() });
    let o = order(0);
    s.new_object(&o).unwrap();
    assert_eq!(int(&o, "order_id"), 0);

    let keys = KeyService::get_key_values(&s, &o, None).unwrap();
    let (field, shadow) = keys[0].clone();
    assert_eq!(field, "order_id");
    assert!(!shadow.is_default());
    assert!(s.get_tracked_by_pk_value("Order", &[shadow]).unwrap().is_some());

    s.set_property(&o, "order_id", FieldValue::Int(77)).unwrap();
    assert!(s.get_tracked_by_pk_value("Order", &[FieldValue::Int(77)]).unwrap().is_some());
}

// ─────────────────────────────────────────────────────────────
// Primary key re-index
// ─────────────────────────────────────────────────────────────

#[test]
fn key_change_through_scope_reindexes() {
    let s = scope();
    let o = order(10);
    s.include(&o).unwrap();
    s.set_property(&o, "order_id", FieldValue::Int(20)).unwrap();

    assert!(s.get_tracked_by_pk_value("Order", &[FieldValue::Int(20)]).unwrap().is_some());
    assert!(s.get_tracked_by_pk_value("Order", &[FieldValue::Int(10)]).unwrap().is_none());
    assert_eq!(s.get_tracked(&o).unwrap().row_state(), RowState::Modified);
}

#[test]
fn direct_key_change_reindexes_on_reconcile() {
    let s = scope();
    let o = order(10);
    let l = line(1, 10, "bolt");
    s.include(&o).unwrap();
    s.include(&l).unwrap();

    poke(&o, "order_id", FieldValue::Int(11));
    let moved = s.reconcile_modified_state(None).unwrap();
    assert_eq!(moved, 1);
    assert!(s.get_tracked_by_pk_value("Order", &[FieldValue::Int(11)]).unwrap().is_some());
    assert_eq!(int(&l, "order_id"), 11);
}

// ─────────────────────────────────────────────────────────────
// Linking
// ─────────────────────────────────────────────────────────────

#[test]
fn child_before_parent_links_on_parent_arrival() {
    let s = scope();
    let l = line(1, 7, "nut");
    s.include(&l).unwrap();
    assert!(matches!(get(&l, "order"), FieldValue::Null));

    let o = order(7);
    s.include(&o).unwrap();
    let children = s.children_of(&o, RelationTypes::Children);
    assert_eq!(children.len(), 1);
    assert!(lines_of(&o).iter().any(|h| same_entity(h, &l)));
    match get(&l, "order") {
        FieldValue::Ref(parent) => assert!(same_entity(&parent, &o)),
        other => panic!("expected parent reference, got {:?}", other),
    }
    assert_eq!(s.key_state().pending_waits(), 0);
}

#[test]
fn nested_collection_is_tracked_and_keyed() {
    let s = scope();
    let o = order(7);
    let a = line(1, 0, "a");
    let b = line(2, 0, "b");
    poke(&o, "lines", FieldValue::List(vec![a.clone(), b.clone()]));

    s.include(&o).unwrap();
    assert_eq!(s.len(), 3);
    assert!(matches!(get(&o, "lines"), FieldValue::Set(_)));
    assert_eq!(int(&a, "order_id"), 7);
    assert_eq!(int(&b, "order_id"), 7);
    assert_eq!(s.children_of(&o, RelationTypes::Children).len(), 2);
}

#[test]
fn parent_reference_links_and_copies_key() {
    let s = scope();
    let c = customer(4, "Acme");
    let o = order(9);
    poke(&o, "customer", FieldValue::Ref(c.clone()));
    s.include(&o).unwrap();

    assert!(s.get_tracked(&c).is_some());
    assert_eq!(int(&o, "customer_id"), 4);
    let parents = s.parents_of(&o, RelationTypes::Parents);
    assert_eq!(parents.len(), 1);
    assert!(parents[0].is_same_object(&c));
}

#[test]
fn add_and_remove_child_through_scope() {
    let s = scope();
    let o = order(5);
    s.include(&o).unwrap();
    let l = line(8, 0, "washer");
    s.add_child(&o, "lines", &l).unwrap();
    assert_eq!(int(&l, "order_id"), 5);
    assert_eq!(lines_of(&o).len(), 1);

    assert!(s.remove_child(&o, "lines", &l).unwrap());
    assert!(lines_of(&o).is_empty());
    assert!(get(&l, "order_id").is_null());
    assert!(s.add_child(&o, "status", &l).is_err());
}

#[test]
fn self_referencing_tree_resolves_in_reverse_order() {
    let s = scope();
    let root = node(1, 0, "root");
    let mid = node(2, 1, "mid");
    let leaf = node(3, 2, "leaf");
    s.include(&leaf).unwrap();
    s.include(&mid).unwrap();
    s.include(&root).unwrap();

    assert_eq!(s.children_of(&root, RelationTypes::Children).len(), 2);
    assert_eq!(s.children_of(&root, RelationTypes::None).len(), 1);
    assert_eq!(KeyService::object_nest_level(&s, &leaf), 2);
}

#[test]
fn fk_change_moves_child_between_parents() {
    let s = scope();
    let a = order(1);
    let b = order(2);
    let l = line(1, 1, "gear");
    for h in [&a, &b, &l] {
        s.include(h).unwrap();
    }
    assert_eq!(lines_of(&a).len(), 1);

    poke(&l, "order_id", FieldValue::Int(2));
    s.reconcile_modified_state(None).unwrap();
    assert!(lines_of(&a).is_empty());
    assert_eq!(lines_of(&b).len(), 1);
    assert_eq!(s.parents_of(&l, RelationTypes::Parents)[0].id(), s.get_tracked(&b).unwrap().id());
}

// ─────────────────────────────────────────────────────────────
// Order / OrderLine
// ─────────────────────────────────────────────────────────────

#[test]
fn lines_tracked_before_key_change_link_after_reconcile() {
    let s = scope();
    let o = order(0);
    s.new_object(&o).unwrap();
    assert_eq!(int(&o, "order_id"), i32::MIN as i64 + 1);

    // Key assigned by the store, not yet observed by the scope.
    poke(&o, "order_id", FieldValue::Int(100));
    let lines: Vec<_> = (0..3).map(|i| line(0, 100, &format!("part-{}", i))).collect();
    for l in &lines {
        s.new_object(l).unwrap();
    }
    assert!(s.children_of(&o, RelationTypes::Children).is_empty());

    s.reconcile_modified_state(None).unwrap();
    let children = s.children_of(&o, RelationTypes::Children);
    assert_eq!(children.len(), 3);
    for l in &lines {
        assert!(children.iter().any(|c| c.is_same_object(l)));
        assert_eq!(int(l, "order_id"), 100);
    }
    assert_eq!(s.get_tracked(&o).unwrap().row_state(), RowState::Added);
}

// ─────────────────────────────────────────────────────────────
// Deletion
// ─────────────────────────────────────────────────────────────

fn customer_graph(s: &ServiceScope) -> Vec<orm_engine::EntityHandle> {
    let c = customer(1, "Acme");
    let o = order(10);
    poke(&o, "customer_id", FieldValue::Int(1));
    let l1 = line(1, 10, "a");
    let l2 = line(2, 10, "b");
    for h in [&c, &o, &l1, &l2] {
        s.include(h).unwrap();
    }
    vec![c, o, l1, l2]
}

#[test]
fn cascade_delete_reaches_every_descendant() {
    let s = scope();
    let graph = customer_graph(&s);
    s.delete(&graph[0], CascadeMode::Cascade).unwrap();
    for h in &graph {
        assert_eq!(s.get_tracked(h).unwrap().row_state(), RowState::Deleted);
    }
}

#[test]
fn fail_delete_leaves_states_untouched() {
    let s = scope();
    let graph = customer_graph(&s);
    let err = s.delete(&graph[1], CascadeMode::Fail).unwrap_err();
    assert!(matches!(err, OrmError::ConstraintViolation(_)));
    for h in &graph {
        assert_eq!(s.get_tracked(h).unwrap().row_state(), RowState::Unchanged);
    }

    s.delete(&graph[2], CascadeMode::None).unwrap();
    s.delete(&graph[3], CascadeMode::None).unwrap();
    s.delete(&graph[1], CascadeMode::Fail).unwrap();
    assert_eq!(s.get_tracked(&graph[1]).unwrap().row_state(), RowState::Deleted);
}

#[test]
fn set_null_clears_immediate_children_only() {
    let s = scope();
    let graph = customer_graph(&s);
    s.delete(&graph[0], CascadeMode::SetNull).unwrap();

    let o = &graph[1];
    assert!(get(o, "customer_id").is_null());
    assert!(get(o, "customer").is_null());
    assert_eq!(s.get_tracked(o).unwrap().row_state(), RowState::Modified);
    assert_eq!(int(&graph[2], "order_id"), 10);
    assert_eq!(s.children_of(o, RelationTypes::Children).len(), 2);
    assert!(s.children_of(&graph[0], RelationTypes::Children).is_empty());
}

#[test]
fn evicted_rows_drop_out_on_reconcile() {
    let s = scope();
    let graph = customer_graph(&s);
    assert!(s.evict(&graph[2]));
    assert_eq!(s.get_tracked(&graph[2]).unwrap().row_state(), RowState::Unlinked);
    assert_eq!(s.children_of(&graph[1], RelationTypes::Children).len(), 1);
    s.reconcile_modified_state(None).unwrap();
    assert!(s.get_tracked(&graph[2]).is_none());
    assert_eq!(s.len(), 3);
}

// ─────────────────────────────────────────────────────────────
// Merge and acceptance
// ─────────────────────────────────────────────────────────────

#[test]
fn equal_key_merges_silently_by_default() {
    let s = scope();
    let first = order(10);
    let tracked = s.include(&first).unwrap();
    let second = order(10);
    poke(&second, "status", FieldValue::Text("shipped".to_string()));

    let again = s.include(&second).unwrap();
    assert!(Arc::ptr_eq(&tracked, &again));
    assert_eq!(get(&first, "status"), FieldValue::Text("shipped".to_string()));
    assert_eq!(tracked.row_state(), RowState::Unchanged);
    assert_eq!(s.len(), 1);
}

#[test]
fn equal_key_with_different_values_conflicts_when_configured() {
    let s = scope_with(ScopeSettings {
        merge_behavior: MergeBehavior::FailIfDifferent,
        ..Default::default()
    });
    let keep = order(10);
    s.include(&keep).unwrap();
    let other = order(10);
    poke(&other, "status", FieldValue::Text("closed".to_string()));
    match s.include(&other) {
        Err(OrmError::MergeConflict { type_name, field }) => {
            assert_eq!(type_name, "Order");
            assert_eq!(field, "status");
        }
        other => panic!("expected merge conflict, got {:?}", other.map(|t| t.seq())),
    }
    let same = order(10);
    assert!(s.include(&same).is_ok());
}

#[test]
fn accept_all_changes_is_idempotent() {
    let s = scope();
    let graph = customer_graph(&s);
    let extra = order(0);
    s.new_object(&extra).unwrap();
    s.set_property(&graph[1], "status", FieldValue::Text("paid".to_string())).unwrap();

    s.accept_all_changes();
    let states: Vec<_> = s.all_tracked().iter().map(|t| t.row_state()).collect();
    assert!(states.iter().all(|st| *st == RowState::Unchanged));
    s.accept_all_changes();
    let again: Vec<_> = s.all_tracked().iter().map(|t| t.row_state()).collect();
    assert_eq!(states, again);
    assert_eq!(s.reconcile_modified_state(None).unwrap(), 0);
}

// ─────────────────────────────────────────────────────────────
// Services and replacement objects
// ─────────────────────────────────────────────────────────────

static NOTE_FIELDS: [FieldDescriptor; 1] = [FieldDescriptor::scalar("text", ValueKind::Text)];

#[test]
fn unclaimed_type_is_a_tracking_issue() {
    let s = scope();
    let note = into_handle(Row::new("Note", &NOTE_FIELDS));
    match s.include(&note) {
        Err(OrmError::ObjectTrackingIssue(msg)) => assert!(msg.contains("Note")),
        other => panic!("expected tracking issue, got {:?}", other.map(|t| t.seq())),
    }
    assert!(s.is_empty());
}

fn precodegen_scope(register_wrapper: bool, missing_wrapper_allowed: bool) -> ServiceScope {
    let mut r = registry();
    if register_wrapper {
        r.register_factory("OrderWrapped", || into_handle(Row::new("Order", &ORDER_FIELDS)));
    }
    let settings = ScopeSettings {
        wrapping_action: WrappingAction::PreCodeGen,
        missing_wrapper_allowed,
        ..Default::default()
    };
    ServiceScope::new(Arc::new(r), settings)
}

#[test]
fn replacement_object_receives_keys_and_links() {
    let s = precodegen_scope(true, true);
    let o = order(0);
    let tracked = s.new_object(&o).unwrap();
    let facade = tracked.wrapper_target().unwrap();
    assert!(!same_entity(&facade, &o));
    assert_eq!(get(&facade, "status"), FieldValue::Text("open".to_string()));
    assert_eq!(int(&o, "order_id"), 0);
    let key = int(&facade, "order_id");
    assert!(key < 0);
    assert!(s.get_tracked(&facade).is_some_and(|t| Arc::ptr_eq(&t, &tracked)));

    let l = line(1, 0, "bolt");
    s.add_child(&o, "lines", &l).unwrap();
    assert_eq!(int(&l, "order_id"), key);
    assert_eq!(s.children_of(&o, RelationTypes::Children).len(), 1);
}

#[test]
fn missing_replacement_type_fails_when_not_allowed() {
    let s = precodegen_scope(false, false);
    match s.new_object(&order(0)) {
        Err(OrmError::InvalidOperation(msg)) => assert!(msg.contains("OrderWrapped")),
        other => panic!("expected InvalidOperation, got {:?}", other.map(|t| t.seq())),
    }

    let lenient = precodegen_scope(false, true);
    let o = order(0);
    let tracked = lenient.new_object(&o).unwrap();
    assert!(tracked.wrapper_target().is_some_and(|f| same_entity(&f, &o)));
}

// ─────────────────────────────────────────────────────────────
// Parallel paths
// ─────────────────────────────────────────────────────────────

#[test]
fn parallel_traversal_and_reconcile_match_sequential_results() {
    let s = scope_with(ScopeSettings {
        parallel_threshold: 1,
        traversal_fanout_threshold: 1,
        ..Default::default()
    });
    let o = order(7);
    let lines: Vec<_> = (1..=4).map(|i| line(i, 7, "pin")).collect();
    poke(&o, "lines", FieldValue::List(lines.clone()));

    s.include(&o).unwrap();
    assert_eq!(s.len(), 5);
    assert_eq!(s.children_of(&o, RelationTypes::Children).len(), 4);
    for l in &lines {
        match get(l, "order") {
            FieldValue::Ref(parent) => assert!(same_entity(&parent, &o)),
            other => panic!("expected parent reference, got {:?}", other),
        }
    }

    poke(&o, "status", FieldValue::Text("paid".to_string()));
    poke(&lines[2], "qty", FieldValue::Int(9));
    assert_eq!(s.reconcile_modified_state(None).unwrap(), 2);
    assert_eq!(s.get_tracked(&o).unwrap().row_state(), RowState::Modified);
    assert_eq!(s.get_tracked(&lines[2]).unwrap().row_state(), RowState::Modified);
    assert_eq!(s.get_tracked(&lines[0]).unwrap().row_state(), RowState::Unchanged);
}
