//! Tracking kernel — key service.
//!
//! Assigns surrogate keys to new rows, keeps the PK and FK indexes of the
//! scope current, links parents and children as they arrive in any order,
//! and answers graph navigation queries.
//!
//! Linking a newly tracked object runs in this order:
//!
//!   1. As a child: parent reference first, then the FK values probed
//!      against the PK index, else queued on a waiting list.
//!   2. As a parent: items already in its child collections are linked.
//!   3. As a parent: waiting lists keyed by this object are drained.
//!
//! State lives in the scope's `KeyServiceState`; this type is stateless.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::composite::CompositeKey;
use crate::config::{DefaultKeyType, RelationTypes, ScopeSettings};
use crate::entity::{descriptor_of, entity_set_of, EntityHandle, EntityId, EntitySet, FieldKind};
use crate::error::{OrmError, Result};
use crate::infra::{shadow_name, PropertyChange, WrappingSupport};
use crate::key_state::{FkRecord, KeyServiceState, WaitingEntry};
use crate::registry::{KeyRegistry, RelationshipDefinition, SurrogateKeys};
use crate::scope::ServiceScope;
use crate::service::ObjectService;
use crate::tracked::TrackedHandle;
use crate::value::{FieldValue, PropertyMap, ValueKind};

pub struct KeyService;

impl ObjectService for KeyService {
    fn name(&self) -> &'static str {
        "keys"
    }

    fn applies_to(&self, type_name: &str, registry: &KeyRegistry) -> bool {
        registry.has_key(type_name)
            || !registry.relations_for_child(type_name).is_empty()
            || !registry.relations_for_parent(type_name).is_empty()
    }

    fn identify_infra_needs(
        &self,
        object: &EntityHandle,
        replacement: Option<&EntityHandle>,
        registry: &KeyRegistry,
        settings: &ScopeSettings,
        _is_new: bool,
    ) -> WrappingSupport {
        let bag = WrappingSupport::PROPERTY_BAG | WrappingSupport::NOTIFICATIONS;
        if settings.use_shadow_properties_for_new {
            return bag;
        }
        let shape = replacement.unwrap_or(object).read();
        let type_name = shape.type_name();
        let missing = registry
            .key_fields(type_name)
            .iter()
            .copied()
            .chain(registry.child_roles(type_name))
            .any(|f| shape.field(f).is_none());
        if missing {
            bag
        } else {
            WrappingSupport::empty()
        }
    }

    fn finish_setup(
        &self,
        scope: &ServiceScope,
        tracked: &TrackedHandle,
        is_new: bool,
        props: Option<&PropertyMap>,
    ) -> Result<()> {
        if is_new {
            Self::assign_keys(scope, tracked, props)?;
        }
        let fields = scope.registry().key_fields(tracked.base_type());
        if !fields.is_empty() {
            let state = Self::state(scope);
            let composite = Self::own_composite(tracked, fields)?;
            state.add_pk(tracked, composite);
            // Children reached through traversal linked before this key existed.
            for record in state.children_fk(tracked.id()) {
                if let Some(child) = record.child() {
                    Self::copy_parent_keys(record.relation(), tracked, &child);
                }
            }
        }
        Self::link_new(scope, tracked)
    }

    fn cleanup(&self, scope: &ServiceScope) {
        if let Err(err) = Self::cleanup_pass(scope) {
            tracing::warn!(error = %err, "final link resolution failed");
        }
    }
}

impl KeyService {
    pub fn state(scope: &ServiceScope) -> Arc<KeyServiceState> {
        scope.states().get_or_init(KeyServiceState::new)
    }

    // -----------------------------------------------------------------------
    // Key values
    // -----------------------------------------------------------------------

    /// Values of `fields`, each taken from its shadow slot when one exists.
    /// The flag marks values that came from a shadow slot.
    fn key_values(to: &TrackedHandle, fields: &[&'static str]) -> Vec<(FieldValue, bool)> {
        fields
            .iter()
            .map(|f| {
                if let Some(v) = to.infra().and_then(|w| w.core().shadow_value(f)) {
                    return (v, true);
                }
                (to.get_value(f).unwrap_or_default(), false)
            })
            .collect()
    }

    /// Key of `to` for its own PK; `None` while every value is a default.
    fn own_composite(to: &TrackedHandle, fields: &[&'static str]) -> Result<Option<CompositeKey>> {
        let values: Vec<FieldValue> = Self::key_values(to, fields).into_iter().map(|(v, _)| v).collect();
        if values.iter().all(FieldValue::is_default) {
            return Ok(None);
        }
        CompositeKey::new(to.base_type(), &values).map(Some)
    }

    /// Parent key `child` refers to through `rel`.
    fn fk_composite(rel: &RelationshipDefinition, child: &TrackedHandle) -> Result<Option<CompositeKey>> {
        let values: Vec<FieldValue> = Self::key_values(child, rel.child_resolved_key())
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        if values.iter().all(FieldValue::is_default) {
            return Ok(None);
        }
        CompositeKey::new(rel.parent_type(), &values).map(Some)
    }

    /// Named key values of a tracked object; all key fields when `fields`
    /// is `None`.
    pub fn get_key_values(
        scope: &ServiceScope,
        object: &EntityHandle,
        fields: Option<&[&'static str]>,
    ) -> Result<Vec<(&'static str, FieldValue)>> {
        let to = scope
            .get_tracked(object)
            .ok_or_else(|| OrmError::tracking("object is not tracked in this scope"))?;
        let fields: &[&'static str] = match fields {
            Some(f) => f,
            None => scope.registry().key_fields(to.base_type()),
        };
        Ok(fields
            .iter()
            .copied()
            .zip(Self::key_values(&to, fields).into_iter().map(|(v, _)| v))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Key assignment
    // -----------------------------------------------------------------------

    fn assign_keys(scope: &ServiceScope, to: &TrackedHandle, props: Option<&PropertyMap>) -> Result<()> {
        let registry = scope.registry();
        let settings = scope.settings();
        let Some(target) = to.wrapper_target() else {
            return Ok(());
        };
        let shadow_mode = settings.use_shadow_properties_for_new && to.infra().is_some();

        for field in registry.key_fields(to.base_type()) {
            if let Some(shadow) = to.infra().and_then(|w| w.core().shadow_value(field)) {
                if !shadow.is_default() {
                    advance_past(registry.surrogates(), &shadow);
                    continue;
                }
            }
            if props.and_then(|p| p.get(*field)).is_some_and(|v| !v.is_default()) {
                continue;
            }
            let current = to.get_value(field).unwrap_or_default();
            if !current.is_default() {
                continue;
            }

            let kind = match descriptor_of(&target, field).map(|d| d.kind) {
                Some(FieldKind::Scalar(kind)) => kind,
                _ => current.kind().unwrap_or(match settings.default_key_type {
                    DefaultKeyType::Int => ValueKind::Int,
                    DefaultKeyType::Long => ValueKind::Long,
                    DefaultKeyType::Guid => ValueKind::Guid,
                }),
            };
            let value = match kind {
                ValueKind::Int => FieldValue::Int(registry.surrogates().next_int()),
                ValueKind::Long => FieldValue::Long(registry.surrogates().next_long()),
                ValueKind::Guid => FieldValue::Guid(Uuid::new_v4()),
                ValueKind::Text => FieldValue::Text(Uuid::new_v4().to_string()),
                other => {
                    return Err(OrmError::invalid(format!(
                        "Key field {}.{} of kind {:?} cannot take a surrogate value.",
                        to.base_type(),
                        field,
                        other
                    )))
                }
            };
            trace!(type_name = to.base_type(), field, value = ?value, shadow = shadow_mode, "surrogate key assigned");
            if shadow_mode && matches!(kind, ValueKind::Int | ValueKind::Long) {
                to.set_value(&shadow_name(field), value);
            } else {
                to.set_value(field, value);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Linking
    // -----------------------------------------------------------------------

    fn link_new(scope: &ServiceScope, to: &TrackedHandle) -> Result<()> {
        let registry = scope.registry();
        let state = Self::state(scope);

        for rel in registry.relations_for_child(to.base_type()) {
            Self::link_as_child(scope, &state, &rel, to)?;
        }

        for rel in registry.relations_for_parent(to.base_type()) {
            let Some(prop) = rel.child_property() else {
                continue;
            };
            let items = match to.get_value(prop) {
                Some(FieldValue::Set(set)) => set.items(),
                Some(FieldValue::List(_)) => Self::ensure_entity_set(scope, to, prop)?
                    .map(|s| s.items())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            for item in items {
                if let Some(child) = scope.get_tracked(&item) {
                    if child.base_type() == rel.child_type() {
                        Self::link(scope, &rel, to, &child, true)?;
                    }
                }
            }
        }

        Self::drain_as_parent(scope, to)
    }

    fn link_as_child(
        scope: &ServiceScope,
        state: &KeyServiceState,
        rel: &Arc<RelationshipDefinition>,
        to: &TrackedHandle,
    ) -> Result<()> {
        if let Some(prop) = rel.parent_property() {
            if let Some(FieldValue::Ref(handle)) = to.get_value(prop) {
                match scope.get_tracked(&handle) {
                    Some(parent) if parent.base_type() == rel.parent_type() => {
                        Self::link(scope, rel, &parent, to, true)?;
                        return Ok(());
                    }
                    Some(_) => {}
                    None => {
                        state.queue_parent_by_ref(EntityId::of(&handle), WaitingEntry::new(rel.clone(), to));
                        return Ok(());
                    }
                }
            }
        }

        let Some(key) = Self::fk_composite(rel, to)? else {
            return Ok(());
        };
        if let Some(parent) = state.tracked_by_composite(&key) {
            Self::link(scope, rel, &parent, to, false)?;
            return Ok(());
        }
        if !scope.settings().resolve_for_arbitrary_load_order {
            return Ok(());
        }
        Self::queue_by_value(state, rel, to, key);
        Ok(())
    }

    fn queue_by_value(
        state: &KeyServiceState,
        rel: &Arc<RelationshipDefinition>,
        child: &TrackedHandle,
        key: CompositeKey,
    ) {
        let entry = WaitingEntry::new(rel.clone(), child);
        if rel.child_property().is_some() {
            state.queue_child_linkback(key.clone(), entry.clone());
        }
        if rel.parent_property().is_some() || rel.child_property().is_none() {
            state.queue_parent_by_value(key, entry);
        }
    }

    /// Drain every waiting list keyed by `parent`.
    fn drain_as_parent(scope: &ServiceScope, parent: &TrackedHandle) -> Result<()> {
        let registry = scope.registry();
        let state = Self::state(scope);

        for rel in registry.relations_for_parent(parent.base_type()) {
            for entry in state.take_parent_by_ref(rel.ordinal(), parent.id()) {
                let Some(child) = entry.child() else {
                    continue;
                };
                let still_refers = rel
                    .parent_property()
                    .and_then(|p| child.get_value(p))
                    .and_then(|v| v.as_ref_handle().map(|h| parent.is_same_object(h)))
                    .unwrap_or(false);
                if still_refers && entry.claim() {
                    Self::link(scope, &rel, parent, &child, true)?;
                }
            }
        }

        if !scope.settings().resolve_for_arbitrary_load_order {
            return Ok(());
        }
        let Some(key) = state.pk_composite(parent.id()) else {
            return Ok(());
        };
        let mut entries = state.take_child_linkbacks(&key);
        for rel in registry.relations_for_parent(parent.base_type()) {
            entries.extend(state.take_parent_by_value(rel.ordinal(), &key));
        }
        if !entries.is_empty() {
            debug!(key = %key, waiting = entries.len(), "draining deferred links");
        }
        for entry in entries {
            Self::resolve_waiting(scope, &state, parent, &key, &entry)?;
        }
        Ok(())
    }

    fn resolve_waiting(
        scope: &ServiceScope,
        state: &KeyServiceState,
        parent: &TrackedHandle,
        key: &CompositeKey,
        entry: &WaitingEntry,
    ) -> Result<()> {
        let Some(child) = entry.child() else {
            return Ok(());
        };
        let rel = entry.relation();
        if rel.parent_type() != parent.base_type() {
            return Ok(());
        }
        if Self::fk_composite(rel, &child)?.as_ref() != Some(key) {
            return Ok(());
        }
        if !entry.claim() {
            return Ok(());
        }
        if state
            .parent_link(rel.ordinal(), child.id())
            .is_some_and(|r| r.parent_id() == parent.id())
        {
            return Ok(());
        }
        Self::link(scope, rel, parent, &child, false).map(|_| ())
    }

    /// Create the FK record, optionally copy the parent key into the child,
    /// point the child's navigation property at the parent and add the
    /// child to the parent's collection. Returns true for a new record.
    fn link(
        scope: &ServiceScope,
        rel: &Arc<RelationshipDefinition>,
        parent: &TrackedHandle,
        child: &TrackedHandle,
        copy_values: bool,
    ) -> Result<bool> {
        let state = Self::state(scope);
        let Some(facade) = parent.wrapper_target() else {
            return Ok(false);
        };

        if let Some(existing) = state.parent_link(rel.ordinal(), child.id()) {
            if existing.parent_id() != parent.id() {
                state.remove_fk(rel.ordinal(), existing.parent_id(), child.id());
                Self::detach_from_container(&existing, child);
            }
        }

        let added = state.add_fk(rel, parent, child, &facade);
        if copy_values {
            Self::copy_parent_keys(rel, parent, child);
        }
        if let Some(prop) = rel.parent_property() {
            let points_here = child
                .get_value(prop)
                .and_then(|v| v.as_ref_handle().map(|h| parent.is_same_object(h)))
                .unwrap_or(false);
            if !points_here {
                child.set_link_value(prop, FieldValue::Ref(facade.clone()));
            }
        }
        if let Some(prop) = rel.child_property() {
            if let (Some(set), Some(item)) = (Self::ensure_entity_set(scope, parent, prop)?, child.wrapper_target()) {
                set.add_wrapped_item(&item);
            }
        }
        if added {
            debug!(relationship = %rel, "linked");
        }
        Ok(added)
    }

    fn copy_parent_keys(rel: &RelationshipDefinition, parent: &TrackedHandle, child: &TrackedHandle) {
        let values = Self::key_values(parent, rel.parent_key());
        for (field, (value, from_shadow)) in rel.child_resolved_key().iter().zip(values) {
            if from_shadow {
                child.set_value(&shadow_name(field), value);
            } else {
                child.set_value(field, value);
            }
        }
    }

    fn detach_from_container(record: &FkRecord, child: &TrackedHandle) {
        let Some(prop) = record.relation().child_property() else {
            return;
        };
        if let (Some(parent), Some(item)) = (record.parent_facade(), child.wrapper_target()) {
            if let Some(set) = entity_set_of(&parent, prop) {
                set.remove_item(&item);
            }
        }
    }

    /// Remove a link. With `nullify` the child's FK fields and navigation
    /// property are cleared.
    pub fn remove_fk(scope: &ServiceScope, record: &FkRecord, nullify: bool) {
        let state = Self::state(scope);
        state.remove_fk(record.relation().ordinal(), record.parent_id(), record.child_id());
        let Some(child) = record.child() else {
            return;
        };
        Self::detach_from_container(record, &child);
        if nullify {
            for field in record.relation().child_resolved_key() {
                child.set_value(field, FieldValue::Null);
            }
            if let Some(prop) = record.relation().parent_property() {
                child.set_value(prop, FieldValue::Null);
            }
        }
        trace!(relationship = %record.relation(), nullify, "unlinked");
    }

    /// Tracked collection behind `prop`, created or converted on first need.
    /// `None` when the property is not a declared child collection.
    pub fn ensure_entity_set(
        scope: &ServiceScope,
        parent: &TrackedHandle,
        prop: &str,
    ) -> Result<Option<EntitySet>> {
        let Some(target) = parent.wrapper_target() else {
            return Ok(None);
        };
        if !matches!(descriptor_of(&target, prop).map(|d| d.kind), Some(FieldKind::Children(_))) {
            return Ok(None);
        }
        let set = match parent.get_value(prop) {
            Some(FieldValue::Set(set)) => return Ok(Some(set)),
            Some(FieldValue::List(items)) => {
                let set = EntitySet::new(parent.base_type(), prop);
                for item in &items {
                    let tracked = match scope.get_tracked(item) {
                        Some(t) => t.wrapper_target(),
                        None => Some(item.clone()),
                    };
                    if let Some(t) = tracked {
                        set.add_wrapped_item(&t);
                    }
                }
                set
            }
            _ => EntitySet::new(parent.base_type(), prop),
        };
        parent.set_link_value(prop, FieldValue::Set(set.clone()));
        match parent.get_value(prop) {
            Some(FieldValue::Set(stored)) => Ok(Some(stored)),
            _ => Ok(Some(set)),
        }
    }

    /// Link `child` into `parent.prop` through the scope, tracking the
    /// child if needed.
    pub fn link_child_in_parent_container(
        scope: &ServiceScope,
        parent: &EntityHandle,
        prop: &str,
        child: &EntityHandle,
    ) -> Result<()> {
        let parent_to = scope
            .get_tracked(parent)
            .ok_or_else(|| OrmError::tracking("parent is not tracked in this scope"))?;
        let rel = scope
            .registry()
            .relation_by_parent_child_property(parent_to.base_type(), prop)
            .ok_or_else(|| {
                OrmError::invalid(format!(
                    "{}.{} is not a registered child collection.",
                    parent_to.base_type(),
                    prop
                ))
            })?;
        let child_to = match scope.get_tracked(child) {
            Some(t) => t,
            None => scope.include(child)?,
        };
        Self::link(scope, &rel, &parent_to, &child_to, true).map(|_| ())
    }

    /// Remove `child` from `parent.prop`, dropping the link and clearing
    /// the child's foreign key.
    pub fn unlink_child_from_parent_container(
        scope: &ServiceScope,
        parent: &EntityHandle,
        prop: &str,
        child: &EntityHandle,
    ) -> Result<bool> {
        let (Some(parent_to), Some(child_to)) = (scope.get_tracked(parent), scope.get_tracked(child)) else {
            return Ok(false);
        };
        let Some(rel) = scope.registry().relation_by_parent_child_property(parent_to.base_type(), prop) else {
            return Ok(false);
        };
        let state = Self::state(scope);
        match state.parent_link(rel.ordinal(), child_to.id()) {
            Some(record) if record.parent_id() == parent_to.id() => {
                Self::remove_fk(scope, &record, true);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Change handling
    // -----------------------------------------------------------------------

    /// Routed write on `field` of `to` completed.
    pub fn on_property_changed(scope: &ServiceScope, to: &TrackedHandle, field: &str, new: &FieldValue) -> Result<()> {
        if !scope.registry().key_fields(to.base_type()).iter().any(|k| *k == field) {
            return Ok(());
        }
        if !new.is_default() {
            if let Some(w) = to.infra() {
                w.core().remove_property(&shadow_name(field));
            }
        }
        Self::on_key_changed(scope, to)
    }

    /// Change discovered while reconciling: key handling plus bound-key
    /// update for navigation and FK fields.
    pub fn on_reconciled_change(scope: &ServiceScope, to: &TrackedHandle, change: &PropertyChange) -> Result<()> {
        Self::on_property_changed(scope, to, &change.field, &change.new)?;
        Self::update_bound_keys(scope, to, change)
    }

    fn on_key_changed(scope: &ServiceScope, to: &TrackedHandle) -> Result<()> {
        let fields = scope.registry().key_fields(to.base_type());
        if fields.is_empty() {
            return Ok(());
        }
        let state = Self::state(scope);
        let change = state.update_pk(to, || Self::own_composite(to, fields))?;
        let Some(change) = change else {
            return Ok(());
        };
        debug!(type_name = to.base_type(), old = ?change.old, new = ?change.new, "primary key changed");
        for record in state.children_fk(to.id()) {
            if let Some(child) = record.child() {
                Self::copy_parent_keys(record.relation(), to, &child);
            }
        }
        Self::drain_as_parent(scope, to)
    }

    fn update_bound_keys(scope: &ServiceScope, to: &TrackedHandle, change: &PropertyChange) -> Result<()> {
        let registry = scope.registry();
        let state = Self::state(scope);

        if let Some(rel) = registry.relation_by_child_parent_property(to.base_type(), &change.field) {
            match &change.new {
                FieldValue::Ref(handle) => {
                    if let Some(parent) = scope.get_tracked(handle) {
                        Self::link(scope, &rel, &parent, to, true)?;
                    }
                }
                FieldValue::Null => {
                    if let Some(record) = state.parent_link(rel.ordinal(), to.id()) {
                        Self::remove_fk(scope, &record, false);
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        for rel in registry.relations_for_child(to.base_type()) {
            if !rel.child_resolved_key().iter().any(|k| *k == change.field) {
                continue;
            }
            let current = state.parent_link(rel.ordinal(), to.id());
            let parent = match Self::fk_composite(&rel, to)? {
                Some(key) => match state.tracked_by_composite(&key) {
                    Some(parent) => Some(parent),
                    None => {
                        if scope.settings().resolve_for_arbitrary_load_order {
                            Self::queue_by_value(&state, &rel, to, key);
                        }
                        None
                    }
                },
                None => None,
            };
            match (parent, current) {
                (Some(parent), Some(current)) if current.parent_id() == parent.id() => {}
                (Some(parent), _) => {
                    Self::link(scope, &rel, &parent, to, false)?;
                }
                (None, Some(current)) => {
                    Self::remove_fk(scope, &current, false);
                    if let Some(prop) = rel.parent_property() {
                        to.set_link_value(prop, FieldValue::Null);
                    }
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Children of `object`. Descendants are followed when `types`
    /// includes children; parents of every reached child are added when
    /// it includes parents. `None` yields immediate children only.
    pub fn children_of(scope: &ServiceScope, object: &EntityHandle, types: RelationTypes) -> Vec<TrackedHandle> {
        Self::navigate(scope, object, types, true)
    }

    /// Parents of `object`, mirroring `children_of`.
    pub fn parents_of(scope: &ServiceScope, object: &EntityHandle, types: RelationTypes) -> Vec<TrackedHandle> {
        Self::navigate(scope, object, types, false)
    }

    fn navigate(scope: &ServiceScope, object: &EntityHandle, types: RelationTypes, downward: bool) -> Vec<TrackedHandle> {
        let Some(root) = scope.get_tracked(object) else {
            return Vec::new();
        };
        let state = Self::state(scope);
        let mut visited = HashSet::from([root.id()]);
        let mut out = Vec::new();
        let (follow_primary, cross) = if downward {
            (types.includes_children(), types.includes_parents())
        } else {
            (types.includes_parents(), types.includes_children())
        };
        Self::walk(&state, &root, downward, follow_primary, cross, &mut visited, &mut out);
        out
    }

    fn walk(
        state: &KeyServiceState,
        from: &TrackedHandle,
        downward: bool,
        follow: bool,
        cross: bool,
        visited: &mut HashSet<EntityId>,
        out: &mut Vec<TrackedHandle>,
    ) {
        let neighbors: Vec<TrackedHandle> = if downward {
            state.children_fk(from.id()).iter().filter_map(|r| r.child()).collect()
        } else {
            state.parents_fk(from.id()).iter().filter_map(|r| r.parent()).collect()
        };
        for next in neighbors {
            if !visited.insert(next.id()) {
                continue;
            }
            if follow {
                Self::walk(state, &next, downward, true, cross, visited, out);
            }
            out.push(next.clone());
            if cross {
                Self::walk(state, &next, !downward, true, false, visited, out);
            }
        }
    }

    pub fn get_parent_types(registry: &KeyRegistry, type_name: &str, all: bool) -> Vec<&'static str> {
        registry.parent_types(type_name, all).into_keys().collect()
    }

    pub fn get_child_types(registry: &KeyRegistry, type_name: &str, all: bool) -> Vec<&'static str> {
        registry.child_types(type_name, all).into_keys().collect()
    }

    /// Number of tracked ancestors above `object`.
    pub fn object_nest_level(scope: &ServiceScope, object: &EntityHandle) -> usize {
        Self::parents_of(scope, object, RelationTypes::Parents).len()
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// One last resolution attempt for every queued link, then empty the
    /// waiting lists.
    fn cleanup_pass(scope: &ServiceScope) -> Result<()> {
        let state = Self::state(scope);
        let registry = scope.registry();

        for entry in state.take_all_parent_by_ref() {
            let Some(child) = entry.child() else {
                continue;
            };
            let rel = entry.relation().clone();
            let parent = rel
                .parent_property()
                .and_then(|p| child.get_value(p))
                .and_then(|v| v.as_ref_handle().and_then(|h| scope.get_tracked(h)));
            if let Some(parent) = parent {
                if parent.base_type() == rel.parent_type() && entry.claim() {
                    Self::link(scope, &rel, &parent, &child, true)?;
                }
            }
        }

        let waits = state.take_all_value_waits();
        let mut resolved = 0usize;
        for (key, entry) in waits {
            if entry.is_processed() || !registry.has_key(key.base_type()) {
                continue;
            }
            if let Some(parent) = state.tracked_by_composite(&key) {
                Self::resolve_waiting(scope, &state, &parent, &key, &entry)?;
                resolved += 1;
            }
        }
        debug!(resolved, "cleanup pass complete");
        state.clear_waits();
        Ok(())
    }
}

fn advance_past(surrogates: &SurrogateKeys, value: &FieldValue) {
    match value {
        FieldValue::Int(v) => surrogates.advance_int_past(*v),
        FieldValue::Long(v) => surrogates.advance_long_past(*v),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_past_moves_counters_forward_only() {
        let keys = SurrogateKeys::new();
        advance_past(&keys, &FieldValue::Int(-40));
        assert_eq!(keys.next_int(), -39);
        advance_past(&keys, &FieldValue::Int(-100));
        assert_eq!(keys.next_int(), -38);
        advance_past(&keys, &FieldValue::Long(7));
        assert_eq!(keys.next_long(), 8);
        advance_past(&keys, &FieldValue::Text("x".to_string()));
    }
}
