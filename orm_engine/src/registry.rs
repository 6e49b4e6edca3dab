//! Tracking kernel — key registry.
//!
//! Type → ordered key fields, type → relationships, type factories,
//! replacement type map and per-type services. Populated through `&mut`
//! registration calls at startup, then shared read-only as
//! `Arc<KeyRegistry>`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::entity::EntityHandle;
use crate::error::{OrmError, Result};
use crate::key_service::KeyService;
use crate::service::{ChangeTrackingService, ObjectService};

pub type EntityFactory = Arc<dyn Fn() -> EntityHandle + Send + Sync>;

// ---------------------------------------------------------------------------
// Relationship definitions
// ---------------------------------------------------------------------------

/// One parent → child relationship. Built with `new` and the `with_*`
/// setters, completed by `KeyRegistry::register_relationship`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDefinition {
    ordinal: usize,
    parent_type: &'static str,
    parent_key: Vec<&'static str>,
    child_type: &'static str,
    child_role_name: Option<Vec<&'static str>>,
    /// Navigation property on the child pointing at its parent.
    parent_property: Option<&'static str>,
    /// Collection property on the parent holding its children.
    child_property: Option<&'static str>,
}

impl RelationshipDefinition {
    pub fn new(child_type: &'static str) -> Self {
        RelationshipDefinition {
            ordinal: 0,
            parent_type: "",
            parent_key: Vec::new(),
            child_type,
            child_role_name: None,
            parent_property: None,
            child_property: None,
        }
    }

    pub fn with_parent_property(mut self, name: &'static str) -> Self {
        self.parent_property = Some(name);
        self
    }

    pub fn with_child_property(mut self, name: &'static str) -> Self {
        self.child_property = Some(name);
        self
    }

    /// Child-side field names when they differ from the parent key names.
    pub fn with_role(mut self, fields: &[&'static str]) -> Self {
        self.child_role_name = Some(fields.to_vec());
        self
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn parent_type(&self) -> &'static str {
        self.parent_type
    }

    pub fn child_type(&self) -> &'static str {
        self.child_type
    }

    pub fn parent_key(&self) -> &[&'static str] {
        &self.parent_key
    }

    /// Child foreign-key fields, positionally matching `parent_key`.
    pub fn child_resolved_key(&self) -> &[&'static str] {
        self.child_role_name.as_deref().unwrap_or(&self.parent_key)
    }

    pub fn parent_property(&self) -> Option<&'static str> {
        self.parent_property
    }

    pub fn child_property(&self) -> Option<&'static str> {
        self.child_property
    }
}

impl fmt::Display for RelationshipDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] -> {}[{}]",
            self.parent_type,
            self.parent_key.join(","),
            self.child_type,
            self.child_resolved_key().join(",")
        )
    }
}

// ---------------------------------------------------------------------------
// Surrogate counters
// ---------------------------------------------------------------------------

/// Process-wide surrogate key counters, one per integral width. Each
/// starts at the type minimum; the first issued value is MIN + 1.
#[derive(Debug)]
pub struct SurrogateKeys {
    low_int: AtomicI32,
    low_long: AtomicI64,
}

impl Default for SurrogateKeys {
    fn default() -> Self {
        SurrogateKeys {
            low_int: AtomicI32::new(i32::MIN),
            low_long: AtomicI64::new(i64::MIN),
        }
    }
}

impl SurrogateKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_int(&self) -> i32 {
        self.low_int.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub fn next_long(&self) -> i64 {
        self.low_long.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Ensure future int surrogates are strictly greater than `value`.
    pub fn advance_int_past(&self, value: i32) {
        self.low_int.fetch_max(value, Ordering::SeqCst);
    }

    pub fn advance_long_past(&self, value: i64) {
        self.low_long.fetch_max(value, Ordering::SeqCst);
    }

    pub fn last_int(&self) -> i32 {
        self.low_int.load(Ordering::SeqCst)
    }

    pub fn last_long(&self) -> i64 {
        self.low_long.load(Ordering::SeqCst)
    }

    pub fn seed(&self, int_value: i32, long_value: i64) {
        self.low_int.store(int_value, Ordering::SeqCst);
        self.low_long.store(long_value, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.seed(i32::MIN, i64::MIN);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct KeyRegistry {
    keys: HashMap<&'static str, Vec<&'static str>>,
    relations: Vec<Arc<RelationshipDefinition>>,
    by_parent: HashMap<&'static str, Vec<usize>>,
    by_child: HashMap<&'static str, Vec<usize>>,
    /// "Child.parentProperty" → relation
    by_child_parent_prop: HashMap<String, usize>,
    /// "Parent.childProperty" → relation
    by_parent_child_prop: HashMap<String, usize>,
    factories: HashMap<&'static str, EntityFactory>,
    replacements: HashMap<&'static str, &'static str>,
    type_services: HashMap<&'static str, Vec<Arc<dyn ObjectService>>>,
    global_services: Vec<Arc<dyn ObjectService>>,
    surrogates: Arc<SurrogateKeys>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::with_surrogates(Arc::new(SurrogateKeys::new()))
    }
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry sharing an externally owned set of counters.
    pub fn with_surrogates(surrogates: Arc<SurrogateKeys>) -> Self {
        KeyRegistry {
            keys: HashMap::new(),
            relations: Vec::new(),
            by_parent: HashMap::new(),
            by_child: HashMap::new(),
            by_child_parent_prop: HashMap::new(),
            by_parent_child_prop: HashMap::new(),
            factories: HashMap::new(),
            replacements: HashMap::new(),
            type_services: HashMap::new(),
            global_services: vec![Arc::new(KeyService), Arc::new(ChangeTrackingService)],
            surrogates,
        }
    }

    // -- bootstrap ---

    pub fn register_key(&mut self, type_name: &'static str, fields: &[&'static str]) -> Result<()> {
        if fields.is_empty() {
            return Err(OrmError::ArgumentNull("fields"));
        }
        debug!(type_name, ?fields, "register key");
        self.keys.insert(type_name, fields.to_vec());
        Ok(())
    }

    /// Register relationships for a parent type. The parent's key must be
    /// registered first.
    pub fn register_relationship(
        &mut self,
        parent_type: &'static str,
        relations: Vec<RelationshipDefinition>,
    ) -> Result<()> {
        if relations.is_empty() {
            return Err(OrmError::ArgumentNull("relations"));
        }
        let parent_key = self.keys.get(parent_type).cloned().ok_or_else(|| {
            OrmError::invalid(format!(
                "You need to define the primary key for type {} prior to establishing a relationship using it.",
                parent_type
            ))
        })?;

        for mut rel in relations {
            rel.parent_type = parent_type;
            rel.parent_key = parent_key.clone();
            if rel.child_resolved_key().len() != rel.parent_key.len() {
                return Err(OrmError::invalid(format!(
                    "Relationship {} maps {} child field(s) onto a {}-field key.",
                    rel,
                    rel.child_resolved_key().len(),
                    rel.parent_key.len()
                )));
            }
            let idx = self.relations.len();
            rel.ordinal = idx;

            self.by_parent.entry(parent_type).or_default().push(idx);
            self.by_child.entry(rel.child_type).or_default().push(idx);
            if let Some(prop) = rel.parent_property {
                self.by_child_parent_prop.insert(format!("{}.{}", rel.child_type, prop), idx);
            }
            if let Some(prop) = rel.child_property {
                self.by_parent_child_prop.insert(format!("{}.{}", parent_type, prop), idx);
            }
            debug!(relationship = %rel, "register relationship");
            self.relations.push(Arc::new(rel));
        }
        Ok(())
    }

    pub fn register_factory<F>(&mut self, type_name: &'static str, factory: F)
    where
        F: Fn() -> EntityHandle + Send + Sync + 'static,
    {
        self.factories.insert(type_name, Arc::new(factory));
    }

    /// Map a source type onto a replacement type that has a factory.
    pub fn register_replacement(&mut self, source_type: &'static str, replacement_type: &'static str) {
        self.replacements.insert(source_type, replacement_type);
    }

    pub fn register_service(&mut self, type_name: &'static str, service: Arc<dyn ObjectService>) {
        self.type_services.entry(type_name).or_default().push(service);
    }

    pub fn register_global_service(&mut self, service: Arc<dyn ObjectService>) {
        self.global_services.push(service);
    }

    // -- lookups ---

    pub fn surrogates(&self) -> &Arc<SurrogateKeys> {
        &self.surrogates
    }

    /// Ordered key fields, empty for unkeyed types.
    pub fn key_fields(&self, type_name: &str) -> &[&'static str] {
        self.keys.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_key(&self, type_name: &str) -> bool {
        self.keys.contains_key(type_name)
    }

    /// Known through a key, a relationship or a factory.
    pub fn is_known(&self, type_name: &str) -> bool {
        self.keys.contains_key(type_name)
            || self.by_child.contains_key(type_name)
            || self.factories.contains_key(type_name)
    }

    pub fn relations(&self) -> &[Arc<RelationshipDefinition>] {
        &self.relations
    }

    pub fn relations_for_parent(&self, type_name: &str) -> Vec<Arc<RelationshipDefinition>> {
        self.collect(self.by_parent.get(type_name))
    }

    pub fn relations_for_child(&self, type_name: &str) -> Vec<Arc<RelationshipDefinition>> {
        self.collect(self.by_child.get(type_name))
    }

    /// Relationship whose child-side navigation property is `child_type.property`.
    pub fn relation_by_child_parent_property(
        &self,
        child_type: &str,
        property: &str,
    ) -> Option<Arc<RelationshipDefinition>> {
        self.by_child_parent_prop
            .get(&format!("{}.{}", child_type, property))
            .map(|i| self.relations[*i].clone())
    }

    /// Relationship whose parent-side collection is `parent_type.property`.
    pub fn relation_by_parent_child_property(
        &self,
        parent_type: &str,
        property: &str,
    ) -> Option<Arc<RelationshipDefinition>> {
        self.by_parent_child_prop
            .get(&format!("{}.{}", parent_type, property))
            .map(|i| self.relations[*i].clone())
    }

    /// Either navigation direction, parent side first.
    pub fn mapped_property(&self, type_name: &str, property: &str) -> Option<Arc<RelationshipDefinition>> {
        self.relation_by_parent_child_property(type_name, property)
            .or_else(|| self.relation_by_child_parent_property(type_name, property))
    }

    /// Every child-role field name this type uses as a child.
    pub fn child_roles(&self, type_name: &str) -> Vec<&'static str> {
        self.relations_for_child(type_name)
            .iter()
            .flat_map(|r| r.child_resolved_key().to_vec())
            .collect()
    }

    /// Registered spelling of a type name arriving from outside.
    pub fn resolve_type_name(&self, name: &str) -> Option<&'static str> {
        self.keys
            .get_key_value(name)
            .map(|(k, _)| *k)
            .or_else(|| self.factories.get_key_value(name).map(|(k, _)| *k))
            .or_else(|| self.by_child.get_key_value(name).map(|(k, _)| *k))
    }

    pub fn factory(&self, type_name: &str) -> Option<&EntityFactory> {
        self.factories.get(type_name)
    }

    pub fn create(&self, type_name: &str) -> Result<EntityHandle> {
        self.factories
            .get(type_name)
            .map(|f| f())
            .ok_or_else(|| OrmError::invalid(format!("No factory registered for type {}.", type_name)))
    }

    pub fn replacement_for(&self, source_type: &str) -> Option<&'static str> {
        self.replacements.get(source_type).copied()
    }

    /// Registry-held services applicable to `type_name`.
    pub fn services_for(&self, type_name: &str) -> Vec<Arc<dyn ObjectService>> {
        self.global_services
            .iter()
            .chain(self.type_services.get(type_name).into_iter().flatten())
            .filter(|s| s.applies_to(type_name, self))
            .cloned()
            .collect()
    }

    /// Child types reachable from `type_name` with their key fields.
    pub fn child_types(&self, type_name: &str, all: bool) -> BTreeMap<&'static str, Vec<&'static str>> {
        let mut visits = BTreeMap::new();
        self.walk_types(type_name, &mut visits, all, true);
        visits
    }

    /// Parent types reachable from `type_name` with their key fields.
    pub fn parent_types(&self, type_name: &str, all: bool) -> BTreeMap<&'static str, Vec<&'static str>> {
        let mut visits = BTreeMap::new();
        self.walk_types(type_name, &mut visits, all, false);
        visits
    }

    fn walk_types(
        &self,
        type_name: &str,
        visits: &mut BTreeMap<&'static str, Vec<&'static str>>,
        all: bool,
        downward: bool,
    ) {
        let rels = if downward {
            self.relations_for_parent(type_name)
        } else {
            self.relations_for_child(type_name)
        };
        for rel in rels {
            let next = if downward { rel.child_type } else { rel.parent_type };
            if visits.contains_key(next) {
                continue;
            }
            visits.insert(next, self.key_fields(next).to_vec());
            if all {
                self.walk_types(next, visits, all, downward);
            }
        }
    }

    fn collect(&self, idx: Option<&Vec<usize>>) -> Vec<Arc<RelationshipDefinition>> {
        idx.map(|v| v.iter().map(|i| self.relations[*i].clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> KeyRegistry {
        let mut r = KeyRegistry::new();
        r.register_key("Customer", &["customer_id"]).unwrap();
        r.register_key("Order", &["order_id"]).unwrap();
        r.register_key("OrderLine", &["line_id"]).unwrap();
        r.register_relationship(
            "Customer",
            vec![RelationshipDefinition::new("Order").with_child_property("orders")],
        )
        .unwrap();
        r.register_relationship(
            "Order",
            vec![RelationshipDefinition::new("OrderLine")
                .with_parent_property("order")
                .with_child_property("lines")],
        )
        .unwrap();
        r
    }

    #[test]
    fn test_relationship_requires_parent_key() {
        let mut r = KeyRegistry::new();
        let err = r
            .register_relationship("Ghost", vec![RelationshipDefinition::new("Child")])
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidOperation(_)));
    }

    #[test]
    fn test_relationship_indexes() {
        let r = registry();
        let rel = r.relation_by_child_parent_property("OrderLine", "order").unwrap();
        assert_eq!(rel.parent_type(), "Order");
        assert_eq!(rel.child_resolved_key(), &["order_id"]);
        assert!(r.relation_by_parent_child_property("Order", "lines").is_some());
        assert_eq!(r.relations_for_child("Order").len(), 1);
        assert_eq!(r.child_roles("OrderLine"), vec!["order_id"]);
    }

    #[test]
    fn test_type_graph_walk() {
        let r = registry();
        let children = r.child_types("Customer", true);
        assert_eq!(children.keys().copied().collect::<Vec<_>>(), vec!["Order", "OrderLine"]);
        let direct = r.child_types("Customer", false);
        assert_eq!(direct.len(), 1);
        let parents = r.parent_types("OrderLine", true);
        assert!(parents.contains_key("Customer"));
    }

    #[test]
    fn test_surrogates_start_above_minimum() {
        let keys = SurrogateKeys::new();
        assert_eq!(keys.next_int(), i32::MIN + 1);
        assert_eq!(keys.next_int(), i32::MIN + 2);
        keys.advance_int_past(100);
        assert_eq!(keys.next_int(), 101);
        keys.advance_int_past(5);
        assert_eq!(keys.next_int(), 102);
        keys.reset();
        assert_eq!(keys.next_long(), i64::MIN + 1);
    }
}
