//! Tracking kernel — tracked objects and the object index.
//!
//! A `TrackedObject` pairs a weak handle to the application object with
//! its infra wrapper. The `ObjectIndex` is unique by target identity,
//! also indexes the replacement object when one exists, and iterates in
//! registration order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entity::{EntityHandle, EntityId, WeakEntity};
use crate::infra::{InfraWrapper, RowState};
use crate::service::ObjectService;
use crate::value::FieldValue;

pub type TrackedHandle = Arc<TrackedObject>;

pub struct TrackedObject {
    seq: u64,
    target_id: EntityId,
    target: WeakEntity,
    /// Engine-created replacement; owned here so it lives exactly as long
    /// as the tracking record.
    replacement: Option<EntityHandle>,
    infra: Option<InfraWrapper>,
    base_type: &'static str,
    services: Vec<Arc<dyn ObjectService>>,
}

impl TrackedObject {
    pub(crate) fn new(
        seq: u64,
        target: &EntityHandle,
        replacement: Option<EntityHandle>,
        infra: Option<InfraWrapper>,
        base_type: &'static str,
        services: Vec<Arc<dyn ObjectService>>,
    ) -> Self {
        TrackedObject {
            seq,
            target_id: EntityId::of(target),
            target: Arc::downgrade(target),
            replacement,
            infra,
            base_type,
            services,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn id(&self) -> EntityId {
        self.target_id
    }

    pub fn base_type(&self) -> &'static str {
        self.base_type
    }

    pub fn target(&self) -> Option<EntityHandle> {
        self.target.upgrade()
    }

    pub fn replacement(&self) -> Option<&EntityHandle> {
        self.replacement.as_ref()
    }

    /// Object presented to the application: the replacement if any,
    /// otherwise the target.
    pub fn wrapper_target(&self) -> Option<EntityHandle> {
        match &self.replacement {
            Some(r) => Some(r.clone()),
            None => self.target(),
        }
    }

    pub fn wrapper_id(&self) -> Option<EntityId> {
        self.replacement.as_ref().map(EntityId::of)
    }

    pub fn infra(&self) -> Option<&InfraWrapper> {
        self.infra.as_ref()
    }

    pub fn services(&self) -> &[Arc<dyn ObjectService>] {
        &self.services
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub fn row_state(&self) -> RowState {
        self.infra.as_ref().map(|w| w.row_state()).unwrap_or(RowState::Unchanged)
    }

    pub fn set_row_state(&self, state: RowState) {
        if let Some(w) = &self.infra {
            w.set_row_state(state);
        }
    }

    /// Field value through the wrapper, falling back to the object itself.
    pub fn get_value(&self, name: &str) -> Option<FieldValue> {
        match &self.infra {
            Some(w) => w.get_value(name),
            None => self.wrapper_target().and_then(|t| t.read().get_field(name)),
        }
    }

    /// Routed write. Returns the previous value when something changed.
    pub fn set_value(&self, name: &str, value: FieldValue) -> Option<FieldValue> {
        match &self.infra {
            Some(w) => w.set_value(name, value),
            None => {
                let target = self.wrapper_target()?;
                let mut guard = target.write();
                let old = guard.get_field(name)?;
                if old == value || !guard.set_field(name, value) {
                    return None;
                }
                Some(old)
            }
        }
    }

    /// Write that leaves the row clean.
    pub fn set_link_value(&self, name: &str, value: FieldValue) {
        match &self.infra {
            Some(w) => w.set_link_value(name, value),
            None => {
                if let Some(target) = self.wrapper_target() {
                    target.write().set_field(name, value);
                }
            }
        }
    }

    pub fn accept_changes(&self) {
        if let Some(w) = &self.infra {
            w.accept_changes();
        }
    }

    /// True when `handle` is this record's target or replacement.
    pub fn is_same_object(&self, handle: &EntityHandle) -> bool {
        let id = EntityId::of(handle);
        id == self.target_id || Some(id) == self.wrapper_id()
    }
}

impl fmt::Debug for TrackedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedObject")
            .field("seq", &self.seq)
            .field("base_type", &self.base_type)
            .field("row_state", &self.row_state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ObjectIndex
// ---------------------------------------------------------------------------

#[derive(Default)]
struct IndexInner {
    by_seq: BTreeMap<u64, TrackedHandle>,
    by_target: HashMap<EntityId, u64>,
    by_wrapper: HashMap<EntityId, u64>,
}

impl IndexInner {
    fn remove(&mut self, seq: u64) -> Option<TrackedHandle> {
        let to = self.by_seq.remove(&seq)?;
        if self.by_target.get(&to.id()) == Some(&seq) {
            self.by_target.remove(&to.id());
        }
        if let Some(wid) = to.wrapper_id() {
            if self.by_wrapper.get(&wid) == Some(&seq) {
                self.by_wrapper.remove(&wid);
            }
        }
        Some(to)
    }
}

#[derive(Default)]
pub struct ObjectIndex {
    next_seq: AtomicU64,
    inner: RwLock<IndexInner>,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert unless a live record for the same target exists, in which
    /// case that record is returned instead.
    pub fn add(&self, to: TrackedHandle) -> TrackedHandle {
        let mut inner = self.inner.write();
        if let Some(seq) = inner.by_target.get(&to.id()).copied() {
            let live = inner.by_seq.get(&seq).filter(|e| e.is_alive()).cloned();
            if let Some(existing) = live {
                return existing;
            }
            inner.remove(seq);
        }
        inner.by_target.insert(to.id(), to.seq());
        if let Some(wid) = to.wrapper_id() {
            inner.by_wrapper.insert(wid, to.seq());
        }
        inner.by_seq.insert(to.seq(), to.clone());
        to
    }

    /// Live record whose target or replacement is `handle`.
    pub fn get(&self, handle: &EntityHandle) -> Option<TrackedHandle> {
        let id = EntityId::of(handle);
        let inner = self.inner.read();
        let seq = inner.by_target.get(&id).or_else(|| inner.by_wrapper.get(&id))?;
        inner
            .by_seq
            .get(seq)
            .filter(|to| to.is_alive() && to.is_same_object(handle))
            .cloned()
    }

    pub fn get_by_id(&self, id: EntityId) -> Option<TrackedHandle> {
        let inner = self.inner.read();
        let seq = inner.by_target.get(&id)?;
        inner.by_seq.get(seq).filter(|to| to.is_alive()).cloned()
    }

    pub fn remove(&self, to: &TrackedObject) -> bool {
        self.inner.write().remove(to.seq()).is_some()
    }

    /// Drop records whose target has been released. Returns the count.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.write();
        let dead: Vec<u64> = inner
            .by_seq
            .iter()
            .filter(|(_, to)| !to.is_alive())
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &dead {
            inner.remove(*seq);
        }
        dead.len()
    }

    /// Live records in registration order.
    pub fn all(&self) -> Vec<TrackedHandle> {
        self.inner
            .read()
            .by_seq
            .values()
            .filter(|to| to.is_alive())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_seq.values().filter(|to| to.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_seq.clear();
        inner.by_target.clear();
        inner.by_wrapper.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{into_handle, Entity, FieldDescriptor};

    struct Blank;

    impl Entity for Blank {
        fn type_name(&self) -> &'static str {
            "Blank"
        }
        fn fields(&self) -> &'static [FieldDescriptor] {
            &[]
        }
        fn get_field(&self, _name: &str) -> Option<FieldValue> {
            None
        }
        fn set_field(&mut self, _name: &str, _value: FieldValue) -> bool {
            false
        }
    }

    fn record(index: &ObjectIndex, h: &EntityHandle) -> TrackedHandle {
        Arc::new(TrackedObject::new(index.allocate_seq(), h, None, None, "Blank", Vec::new()))
    }

    #[test]
    fn test_unique_by_target() {
        let index = ObjectIndex::new();
        let h = into_handle(Blank);
        let first = index.add(record(&index, &h));
        let second = index.add(record(&index, &h));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(index.len(), 1);
        assert!(index.get(&h).is_some());
    }

    #[test]
    fn test_absent_wrappers_never_collide() {
        let index = ObjectIndex::new();
        let a = into_handle(Blank);
        let b = into_handle(Blank);
        index.add(record(&index, &a));
        index.add(record(&index, &b));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_prune_drops_released_targets() {
        let index = ObjectIndex::new();
        let keep = into_handle(Blank);
        index.add(record(&index, &keep));
        {
            let gone = into_handle(Blank);
            index.add(record(&index, &gone));
        }
        assert_eq!(index.len(), 1);
        assert_eq!(index.prune(), 1);
        assert_eq!(index.all().len(), 1);
    }
}
