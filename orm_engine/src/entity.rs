//! Tracking kernel — application object model.
//!
//! Application objects implement [`Entity`] and are shared as
//! [`EntityHandle`]. The scope only ever keeps [`WeakEntity`] handles.
//! Identity is the allocation address.
//!
//! Lock rule: never hold two entity locks at once. All helpers here take
//! the lock for a single read or write and release it before returning.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::value::{FieldValue, ValueKind};

/// Declared shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ValueKind),
    /// Reference to a parent entity of the named type.
    Parent(&'static str),
    /// Collection of child entities of the named type.
    Children(&'static str),
}

/// One row of a type's accessor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub const fn scalar(name: &'static str, kind: ValueKind) -> Self {
        FieldDescriptor { name, kind: FieldKind::Scalar(kind) }
    }

    pub const fn parent(name: &'static str, type_name: &'static str) -> Self {
        FieldDescriptor { name, kind: FieldKind::Parent(type_name) }
    }

    pub const fn children(name: &'static str, type_name: &'static str) -> Self {
        FieldDescriptor { name, kind: FieldKind::Children(type_name) }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar(_))
    }
}

/// A plain data object the engine can track.
pub trait Entity: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    /// Static accessor table, one entry per field.
    fn fields(&self) -> &'static [FieldDescriptor];

    fn get_field(&self, name: &str) -> Option<FieldValue>;

    /// Returns false when the field does not exist on this type.
    fn set_field(&mut self, name: &str, value: FieldValue) -> bool;

    /// True when the object raises its own change notifications.
    fn notifies_changes(&self) -> bool {
        false
    }

    fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields().iter().find(|f| f.name == name)
    }
}

pub type EntityHandle = Arc<RwLock<dyn Entity>>;
pub type WeakEntity = Weak<RwLock<dyn Entity>>;

/// Wrap a concrete entity into a shared handle.
pub fn into_handle<E: Entity>(entity: E) -> EntityHandle {
    Arc::new(RwLock::new(entity))
}

/// Identity of an entity allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

impl EntityId {
    pub fn of(handle: &EntityHandle) -> Self {
        EntityId(Arc::as_ptr(handle) as *const () as usize)
    }

    pub fn of_weak(handle: &WeakEntity) -> Self {
        EntityId(handle.as_ptr() as *const () as usize)
    }
}

pub fn same_entity(a: &EntityHandle, b: &EntityHandle) -> bool {
    EntityId::of(a) == EntityId::of(b)
}

pub fn type_of(handle: &EntityHandle) -> &'static str {
    handle.read().type_name()
}

pub fn read_field(handle: &EntityHandle, name: &str) -> Option<FieldValue> {
    handle.read().get_field(name)
}

pub fn write_field(handle: &EntityHandle, name: &str, value: FieldValue) -> bool {
    handle.write().set_field(name, value)
}

pub fn descriptor_of(handle: &EntityHandle, name: &str) -> Option<&'static FieldDescriptor> {
    handle.read().field(name)
}

// ---------------------------------------------------------------------------
// EntitySet
// ---------------------------------------------------------------------------

struct SetInner {
    owner_type: &'static str,
    property: String,
    items: Vec<EntityHandle>,
}

/// Tracked child collection. Clones share the same storage.
#[derive(Clone)]
pub struct EntitySet {
    inner: Arc<RwLock<SetInner>>,
}

impl EntitySet {
    pub fn new(owner_type: &'static str, property: impl Into<String>) -> Self {
        EntitySet {
            inner: Arc::new(RwLock::new(SetInner {
                owner_type,
                property: property.into(),
                items: Vec::new(),
            })),
        }
    }

    pub fn owner_type(&self) -> &'static str {
        self.inner.read().owner_type
    }

    pub fn property(&self) -> String {
        self.inner.read().property.clone()
    }

    /// Adds the item unless it is already a member. Returns true on insert.
    pub fn add_wrapped_item(&self, item: &EntityHandle) -> bool {
        let mut inner = self.inner.write();
        if inner.items.iter().any(|h| same_entity(h, item)) {
            return false;
        }
        inner.items.push(item.clone());
        true
    }

    pub fn contains(&self, item: &EntityHandle) -> bool {
        self.inner.read().items.iter().any(|h| same_entity(h, item))
    }

    pub fn remove_item(&self, item: &EntityHandle) -> bool {
        let mut inner = self.inner.write();
        let before = inner.items.len();
        inner.items.retain(|h| !same_entity(h, item));
        inner.items.len() != before
    }

    /// Snapshot of the current members.
    pub fn items(&self) -> Vec<EntityHandle> {
        self.inner.read().items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &EntitySet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Current tracked collection behind `property`, if any.
pub fn entity_set_of(handle: &EntityHandle, property: &str) -> Option<EntitySet> {
    match read_field(handle, property) {
        Some(FieldValue::Set(set)) => Some(set),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        id: i32,
    }

    static PROBE_FIELDS: [FieldDescriptor; 1] = [FieldDescriptor::scalar("id", ValueKind::Int)];

    impl Entity for Probe {
        fn type_name(&self) -> &'static str {
            "Probe"
        }
        fn fields(&self) -> &'static [FieldDescriptor] {
            &PROBE_FIELDS
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

    #[test]
    fn test_identity_follows_allocation() {
        let a = into_handle(Probe { id: 1 });
        let b = into_handle(Probe { id: 1 });
        assert_eq!(EntityId::of(&a), EntityId::of(&a.clone()));
        assert_ne!(EntityId::of(&a), EntityId::of(&b));
        assert_eq!(EntityId::of(&a), EntityId::of_weak(&Arc::downgrade(&a)));
    }

    #[test]
    fn test_entity_set_dedupes_by_identity() {
        let set = EntitySet::new("Parent", "items");
        let a = into_handle(Probe { id: 1 });
        assert!(set.add_wrapped_item(&a));
        assert!(!set.add_wrapped_item(&a));
        assert_eq!(set.len(), 1);
        assert!(set.remove_item(&a));
        assert!(set.is_empty());
    }

    #[test]
    fn test_field_helpers_round_trip() {
        let a = into_handle(Probe { id: 1 });
        assert!(write_field(&a, "id", FieldValue::Int(9)));
        assert_eq!(read_field(&a, "id"), Some(FieldValue::Int(9)));
        assert!(!write_field(&a, "missing", FieldValue::Int(1)));
        assert_eq!(type_of(&a), "Probe");
    }
}
