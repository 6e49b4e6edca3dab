//! Tracking kernel — key service state.
//!
//! Per-scope indexes owned by the key service:
//!
//! - PK index: composite key → tracked object, plus object → PK record.
//! - FK index: one record per (relationship, parent, child), reachable
//!   from either endpoint.
//! - Waiting lists for links that could not be resolved yet: missing
//!   parent by reference, missing parent by value, missing child linkback.
//!
//! Every structure sits behind its own `parking_lot` lock. Callers get
//! owned snapshots back and act on them after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::composite::CompositeKey;
use crate::entity::{EntityHandle, EntityId, WeakEntity};
use crate::error::Result;
use crate::registry::RelationshipDefinition;
use crate::tracked::{TrackedHandle, TrackedObject};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

struct PkRecord {
    tracked: Weak<TrackedObject>,
    composite: Option<CompositeKey>,
}

/// A realized parent/child link.
pub struct FkRecord {
    relation: Arc<RelationshipDefinition>,
    parent_id: EntityId,
    child_id: EntityId,
    parent: Weak<TrackedObject>,
    child: Weak<TrackedObject>,
    parent_facade: WeakEntity,
}

impl FkRecord {
    pub fn relation(&self) -> &Arc<RelationshipDefinition> {
        &self.relation
    }

    pub fn parent_id(&self) -> EntityId {
        self.parent_id
    }

    pub fn child_id(&self) -> EntityId {
        self.child_id
    }

    pub fn parent(&self) -> Option<TrackedHandle> {
        self.parent.upgrade().filter(|p| p.is_alive())
    }

    pub fn child(&self) -> Option<TrackedHandle> {
        self.child.upgrade().filter(|c| c.is_alive())
    }

    /// Object the child's navigation property should point at.
    pub fn parent_facade(&self) -> Option<EntityHandle> {
        self.parent_facade.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.parent().is_some() && self.child().is_some()
    }
}

/// One queued link attempt. The same entry may sit in two lists; whichever
/// drain claims it first wins.
pub struct WaitingEntry {
    relation: Arc<RelationshipDefinition>,
    child: Weak<TrackedObject>,
    processed: AtomicBool,
}

impl WaitingEntry {
    pub fn new(relation: Arc<RelationshipDefinition>, child: &TrackedHandle) -> Arc<Self> {
        Arc::new(WaitingEntry {
            relation,
            child: Arc::downgrade(child),
            processed: AtomicBool::new(false),
        })
    }

    pub fn relation(&self) -> &Arc<RelationshipDefinition> {
        &self.relation
    }

    pub fn child(&self) -> Option<TrackedHandle> {
        self.child.upgrade().filter(|c| c.is_alive())
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }

    /// Returns true for exactly one caller.
    pub fn claim(&self) -> bool {
        !self.processed.swap(true, Ordering::SeqCst)
    }
}

/// Result of a PK rebuild that changed the indexed composite.
#[derive(Debug, Clone, PartialEq)]
pub struct PkChange {
    pub old: Option<CompositeKey>,
    pub new: Option<CompositeKey>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PkIndex {
    by_composite: HashMap<CompositeKey, EntityId>,
    by_object: HashMap<EntityId, PkRecord>,
}

impl PkIndex {
    fn unindex(&mut self, id: EntityId, composite: &CompositeKey) {
        if self.by_composite.get(composite) == Some(&id) {
            self.by_composite.remove(composite);
        }
    }

    fn index(&mut self, id: EntityId, composite: &CompositeKey) {
        if composite.is_all_null() {
            return;
        }
        if let Some(holder) = self.by_composite.get(composite).copied() {
            if holder == id {
                return;
            }
            let holder_alive = self
                .by_object
                .get(&holder)
                .and_then(|r| r.tracked.upgrade())
                .is_some_and(|t| t.is_alive());
            if holder_alive {
                warn!(key = %composite, "duplicate primary key; first registration kept");
                return;
            }
        }
        self.by_composite.insert(composite.clone(), id);
    }
}

#[derive(Default)]
struct FkIndex {
    records: HashMap<(usize, EntityId, EntityId), Arc<FkRecord>>,
    by_parent: HashMap<EntityId, Vec<Arc<FkRecord>>>,
    by_child: HashMap<EntityId, Vec<Arc<FkRecord>>>,
}

impl FkIndex {
    fn remove(&mut self, key: &(usize, EntityId, EntityId)) -> Option<Arc<FkRecord>> {
        let record = self.records.remove(key)?;
        if let Some(list) = self.by_parent.get_mut(&record.parent_id) {
            list.retain(|r| !Arc::ptr_eq(r, &record));
        }
        if let Some(list) = self.by_child.get_mut(&record.child_id) {
            list.retain(|r| !Arc::ptr_eq(r, &record));
        }
        Some(record)
    }
}

type ValueQueue = HashMap<(usize, CompositeKey), Vec<Arc<WaitingEntry>>>;

#[derive(Default)]
pub struct KeyServiceState {
    pk: RwLock<PkIndex>,
    fk: RwLock<FkIndex>,
    missing_parent_by_ref: Mutex<HashMap<(usize, EntityId), Vec<Arc<WaitingEntry>>>>,
    missing_parent_by_val: Mutex<ValueQueue>,
    /// Keyed by the awaited parent's composite, which carries its type.
    missing_child_linkback: Mutex<HashMap<CompositeKey, Vec<Arc<WaitingEntry>>>>,
}

impl KeyServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    // -- PK index ---

    pub fn add_pk(&self, to: &TrackedHandle, composite: Option<CompositeKey>) {
        let id = to.id();
        let mut pk = self.pk.write();
        if let Some(old) = pk.by_object.get(&id).and_then(|r| r.composite.clone()) {
            pk.unindex(id, &old);
        }
        if let Some(c) = &composite {
            pk.index(id, c);
        }
        pk.by_object.insert(id, PkRecord { tracked: Arc::downgrade(to), composite });
    }

    /// Rebuild the composite for `to`. `compute` runs under the index write
    /// lock, so concurrent rebuilds for one object serialize and the last
    /// one observes the final field values. Returns the change, if any.
    /// A failed `compute` leaves the index untouched.
    pub fn update_pk<F>(&self, to: &TrackedHandle, compute: F) -> Result<Option<PkChange>>
    where
        F: FnOnce() -> Result<Option<CompositeKey>>,
    {
        let id = to.id();
        let mut pk = self.pk.write();
        let new = compute()?;
        let old = pk.by_object.get(&id).and_then(|r| r.composite.clone());
        if old == new {
            return Ok(None);
        }
        if let Some(o) = &old {
            pk.unindex(id, o);
        }
        if let Some(n) = &new {
            pk.index(id, n);
        }
        pk.by_object.insert(id, PkRecord { tracked: Arc::downgrade(to), composite: new.clone() });
        trace!(type_name = to.base_type(), old = ?old, new = ?new, "primary key re-indexed");
        Ok(Some(PkChange { old, new }))
    }

    pub fn remove_pk(&self, id: EntityId) {
        let mut pk = self.pk.write();
        if let Some(record) = pk.by_object.remove(&id) {
            if let Some(c) = record.composite {
                pk.unindex(id, &c);
            }
        }
    }

    pub fn pk_composite(&self, id: EntityId) -> Option<CompositeKey> {
        self.pk.read().by_object.get(&id).and_then(|r| r.composite.clone())
    }

    pub fn tracked_by_composite(&self, key: &CompositeKey) -> Option<TrackedHandle> {
        let pk = self.pk.read();
        let id = pk.by_composite.get(key)?;
        pk.by_object
            .get(id)
            .and_then(|r| r.tracked.upgrade())
            .filter(|t| t.is_alive())
    }

    pub fn pk_count(&self) -> usize {
        self.pk.read().by_composite.len()
    }

    // -- FK index ---

    /// Record a link. Returns false when the same link already exists.
    pub fn add_fk(
        &self,
        relation: &Arc<RelationshipDefinition>,
        parent: &TrackedHandle,
        child: &TrackedHandle,
        parent_facade: &EntityHandle,
    ) -> bool {
        let key = (relation.ordinal(), parent.id(), child.id());
        let mut fk = self.fk.write();
        if fk.records.get(&key).is_some_and(|r| r.is_alive()) {
            return false;
        }
        fk.remove(&key);
        let record = Arc::new(FkRecord {
            relation: relation.clone(),
            parent_id: parent.id(),
            child_id: child.id(),
            parent: Arc::downgrade(parent),
            child: Arc::downgrade(child),
            parent_facade: Arc::downgrade(parent_facade),
        });
        fk.by_parent.entry(parent.id()).or_default().push(record.clone());
        fk.by_child.entry(child.id()).or_default().push(record.clone());
        fk.records.insert(key, record);
        true
    }

    pub fn remove_fk(&self, ordinal: usize, parent: EntityId, child: EntityId) -> Option<Arc<FkRecord>> {
        self.fk.write().remove(&(ordinal, parent, child))
    }

    /// Live links where `id` is the parent, in link order.
    pub fn children_fk(&self, id: EntityId) -> Vec<Arc<FkRecord>> {
        self.fk
            .read()
            .by_parent
            .get(&id)
            .map(|list| list.iter().filter(|r| r.is_alive()).cloned().collect())
            .unwrap_or_default()
    }

    /// Live links where `id` is the child, in link order.
    pub fn parents_fk(&self, id: EntityId) -> Vec<Arc<FkRecord>> {
        self.fk
            .read()
            .by_child
            .get(&id)
            .map(|list| list.iter().filter(|r| r.is_alive()).cloned().collect())
            .unwrap_or_default()
    }

    /// Current parent link of `child` for one relationship.
    pub fn parent_link(&self, ordinal: usize, child: EntityId) -> Option<Arc<FkRecord>> {
        self.parents_fk(child).into_iter().find(|r| r.relation.ordinal() == ordinal)
    }

    /// Drop every link touching `id`.
    pub fn remove_links_of(&self, id: EntityId) -> Vec<Arc<FkRecord>> {
        let mut fk = self.fk.write();
        let keys: Vec<_> = fk
            .by_parent
            .get(&id)
            .into_iter()
            .chain(fk.by_child.get(&id))
            .flatten()
            .map(|r| (r.relation.ordinal(), r.parent_id, r.child_id))
            .collect();
        keys.iter().filter_map(|k| fk.remove(k)).collect()
    }

    /// Drop links whose endpoints were released. Returns the count.
    pub fn prune_links(&self) -> usize {
        let mut fk = self.fk.write();
        let dead: Vec<_> = fk
            .records
            .iter()
            .filter(|(_, r)| !r.is_alive())
            .map(|(k, _)| *k)
            .collect();
        for key in &dead {
            fk.remove(key);
        }
        fk.by_parent.retain(|_, v| !v.is_empty());
        fk.by_child.retain(|_, v| !v.is_empty());
        dead.len()
    }

    pub fn fk_count(&self) -> usize {
        self.fk.read().records.len()
    }

    // -- waiting lists ---

    pub fn queue_parent_by_ref(&self, parent: EntityId, entry: Arc<WaitingEntry>) {
        trace!(relationship = %entry.relation, "parent reference not tracked yet; queued");
        self.missing_parent_by_ref
            .lock()
            .entry((entry.relation.ordinal(), parent))
            .or_default()
            .push(entry);
    }

    pub fn take_parent_by_ref(&self, ordinal: usize, parent: EntityId) -> Vec<Arc<WaitingEntry>> {
        self.missing_parent_by_ref.lock().remove(&(ordinal, parent)).unwrap_or_default()
    }

    pub fn take_all_parent_by_ref(&self) -> Vec<Arc<WaitingEntry>> {
        std::mem::take(&mut *self.missing_parent_by_ref.lock())
            .into_values()
            .flatten()
            .collect()
    }

    pub fn queue_parent_by_value(&self, key: CompositeKey, entry: Arc<WaitingEntry>) {
        trace!(relationship = %entry.relation, key = %key, "parent key not tracked yet; queued");
        self.missing_parent_by_val
            .lock()
            .entry((entry.relation.ordinal(), key))
            .or_default()
            .push(entry);
    }

    pub fn take_parent_by_value(&self, ordinal: usize, key: &CompositeKey) -> Vec<Arc<WaitingEntry>> {
        self.missing_parent_by_val
            .lock()
            .remove(&(ordinal, key.clone()))
            .unwrap_or_default()
    }

    pub fn queue_child_linkback(&self, key: CompositeKey, entry: Arc<WaitingEntry>) {
        trace!(relationship = %entry.relation, key = %key, "child awaiting parent collection; queued");
        self.missing_child_linkback.lock().entry(key).or_default().push(entry);
    }

    pub fn take_child_linkbacks(&self, key: &CompositeKey) -> Vec<Arc<WaitingEntry>> {
        self.missing_child_linkback.lock().remove(key).unwrap_or_default()
    }

    /// Every queued by-value and linkback entry with the key it waits on,
    /// leaving the lists empty.
    pub fn take_all_value_waits(&self) -> Vec<(CompositeKey, Arc<WaitingEntry>)> {
        let by_val = std::mem::take(&mut *self.missing_parent_by_val.lock());
        let linkbacks = std::mem::take(&mut *self.missing_child_linkback.lock());
        by_val
            .into_iter()
            .flat_map(|((_, key), entries)| entries.into_iter().map(move |e| (key.clone(), e)))
            .chain(
                linkbacks
                    .into_iter()
                    .flat_map(|(key, entries)| entries.into_iter().map(move |e| (key.clone(), e))),
            )
            .collect()
    }

    /// Unprocessed entries across all three lists.
    pub fn pending_waits(&self) -> usize {
        let count = |entries: &Vec<Arc<WaitingEntry>>| entries.iter().filter(|e| !e.is_processed()).count();
        self.missing_parent_by_ref.lock().values().map(count).sum::<usize>()
            + self.missing_parent_by_val.lock().values().map(count).sum::<usize>()
            + self.missing_child_linkback.lock().values().map(count).sum::<usize>()
    }

    pub fn clear_waits(&self) {
        self.missing_parent_by_ref.lock().clear();
        self.missing_parent_by_val.lock().clear();
        self.missing_child_linkback.lock().clear();
    }

    pub fn clear(&self) {
        self.clear_waits();
        *self.pk.write() = PkIndex::default();
        *self.fk.write() = FkIndex::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{into_handle, Entity, FieldDescriptor};
    use crate::error::OrmError;
    use crate::registry::KeyRegistry;
    use crate::tracked::ObjectIndex;
    use crate::value::{FieldValue, ValueKind};

    struct Row {
        id: i32,
    }

    static ROW_FIELDS: [FieldDescriptor; 1] = [FieldDescriptor::scalar("id", ValueKind::Int)];

    impl Entity for Row {
        fn type_name(&self) -> &'static str {
            "Row"
        }
        fn fields(&self) -> &'static [FieldDescriptor] {
            &ROW_FIELDS
        }
        fn get_field(&self, name: &str) -> Option<FieldValue> {
            (name == "id").then(|| FieldValue::Int(self.id))
        }
        fn set_field(&mut self, name: &str, value: FieldValue) -> bool {
            match (name, value) {
                ("id", FieldValue::Int(v)) => {
                    self.id = v;
                    true
                }
                _ => false,
            }
        }
    }

    fn tracked(index: &ObjectIndex, h: &EntityHandle) -> TrackedHandle {
        index.add(Arc::new(TrackedObject::new(index.allocate_seq(), h, None, None, "Row", Vec::new())))
    }

    fn key(v: i32) -> CompositeKey {
        CompositeKey::new("Row", &[FieldValue::Int(v)]).unwrap()
    }

    fn self_relation() -> Arc<RelationshipDefinition> {
        let mut registry = KeyRegistry::new();
        registry.register_key("Row", &["id"]).unwrap();
        registry
            .register_relationship("Row", vec![RelationshipDefinition::new("Row").with_role(&["parentId"])])
            .unwrap();
        registry.relations()[0].clone()
    }

    #[test]
    fn test_update_pk_replaces_index_entry() {
        let index = ObjectIndex::new();
        let state = KeyServiceState::new();
        let h = into_handle(Row { id: 1 });
        let to = tracked(&index, &h);
        state.add_pk(&to, Some(key(1)));

        let change = state.update_pk(&to, || Ok(Some(key(2)))).unwrap().unwrap();
        assert_eq!(change.old, Some(key(1)));
        assert!(state.tracked_by_composite(&key(1)).is_none());
        assert!(state.tracked_by_composite(&key(2)).is_some());
        assert!(state.update_pk(&to, || Ok(Some(key(2)))).unwrap().is_none());
    }

    #[test]
    fn test_failed_pk_rebuild_keeps_index_entry() {
        let index = ObjectIndex::new();
        let state = KeyServiceState::new();
        let h = into_handle(Row { id: 1 });
        let to = tracked(&index, &h);
        state.add_pk(&to, Some(key(1)));

        let err = state.update_pk(&to, || Err(OrmError::invalid("bad key"))).unwrap_err();
        assert!(matches!(err, OrmError::InvalidOperation(_)));
        assert!(state.tracked_by_composite(&key(1)).is_some());
    }

    #[test]
    fn test_duplicate_key_keeps_first_live_holder() {
        let index = ObjectIndex::new();
        let state = KeyServiceState::new();
        let a = into_handle(Row { id: 1 });
        let b = into_handle(Row { id: 1 });
        let ta = tracked(&index, &a);
        let tb = tracked(&index, &b);
        state.add_pk(&ta, Some(key(1)));
        state.add_pk(&tb, Some(key(1)));
        let holder = state.tracked_by_composite(&key(1)).unwrap();
        assert!(Arc::ptr_eq(&holder, &ta));
    }

    #[test]
    fn test_fk_records_dedupe_and_remove() {
        let index = ObjectIndex::new();
        let state = KeyServiceState::new();
        let rel = self_relation();
        let p = into_handle(Row { id: 1 });
        let c = into_handle(Row { id: 2 });
        let tp = tracked(&index, &p);
        let tc = tracked(&index, &c);

        assert!(state.add_fk(&rel, &tp, &tc, &p));
        assert!(!state.add_fk(&rel, &tp, &tc, &p));
        assert_eq!(state.children_fk(tp.id()).len(), 1);
        assert_eq!(state.parents_fk(tc.id()).len(), 1);
        assert_eq!(state.remove_links_of(tc.id()).len(), 1);
        assert_eq!(state.fk_count(), 0);
    }

    #[test]
    fn test_shared_entry_is_claimed_once() {
        let index = ObjectIndex::new();
        let state = KeyServiceState::new();
        let rel = self_relation();
        let c = into_handle(Row { id: 2 });
        let tc = tracked(&index, &c);
        let entry = WaitingEntry::new(rel.clone(), &tc);
        state.queue_parent_by_value(key(1), entry.clone());
        state.queue_child_linkback(key(1), entry);
        assert_eq!(state.pending_waits(), 2);

        let first = state.take_parent_by_value(rel.ordinal(), &key(1));
        assert!(first[0].claim());
        let second = state.take_child_linkbacks(&key(1));
        assert!(!second[0].claim());
        assert_eq!(state.pending_waits(), 0);
    }
}
