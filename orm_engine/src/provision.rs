//! Tracking kernel — infra wrapper provisioning.
//!
//! Picks the cheapest wrapper kind that satisfies the union of service
//! needs, builds replacement objects for pre-generated types, and walks
//! object graphs registering every reachable related object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::ambient;
use crate::config::WrappingAction;
use crate::entity::{same_entity, type_of, EntityHandle, EntityId, EntitySet, FieldKind};
use crate::error::{OrmError, Result};
use crate::infra::{InfraWrapper, WrapperKind, WrappingSupport};
use crate::scope::ServiceScope;
use crate::value::{FieldValue, PropertyMap};

/// Wrapper kind for a capability request, plus whether it carries
/// per-field error state. `None` when nothing needs to be provisioned.
pub fn decide_wrapping(
    need: WrappingSupport,
    notifies_natively: bool,
    action: WrappingAction,
) -> Option<(WrapperKind, bool)> {
    if action == WrappingAction::NoneOrProvisioned {
        return None;
    }
    let with_errors = need.contains(WrappingSupport::DATA_ERRORS);
    let core = need - WrappingSupport::DATA_ERRORS;
    if core.is_empty() && !with_errors {
        return None;
    }
    let kind = if notifies_natively || !core.contains(WrappingSupport::NOTIFICATIONS) {
        if core.contains(WrappingSupport::ORIGINAL_VALUES) {
            WrapperKind::ValuesAndBag
        } else {
            WrapperKind::Bag
        }
    } else {
        WrapperKind::Full
    };
    Some((kind, with_errors))
}

/// Build the wrapper for `facade`. Property overrides that are not native
/// fields land in the wrapper's bag.
pub fn create_infra_wrapper(
    need: WrappingSupport,
    facade: &EntityHandle,
    base_type: &'static str,
    action: WrappingAction,
    props: Option<&PropertyMap>,
) -> Option<InfraWrapper> {
    let notifies = facade.read().notifies_changes();
    let (kind, with_errors) = decide_wrapping(need, notifies, action)?;
    let wrapper = InfraWrapper::new(kind, Arc::downgrade(facade), base_type, with_errors);
    if let Some(props) = props {
        let guard = facade.read();
        let extended: Vec<_> = props.iter().filter(|(k, _)| guard.field(k).is_none()).collect();
        drop(guard);
        for (name, value) in extended {
            wrapper.set_link_value(name, value.clone());
        }
    }
    trace!(base_type, ?kind, with_errors, "infra wrapper provisioned");
    Some(wrapper)
}

// ---------------------------------------------------------------------------
// Visits
// ---------------------------------------------------------------------------

/// Source identity → the object registered for it (`None` when nothing
/// could be registered). One map per top-level traversal.
#[derive(Default)]
pub struct Visits {
    map: Mutex<HashMap<EntityId, Option<EntityHandle>>>,
}

impl Visits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &EntityHandle) -> Option<Option<EntityHandle>> {
        self.map.lock().get(&EntityId::of(source)).cloned()
    }

    pub fn insert(&self, source: &EntityHandle, registered: Option<EntityHandle>) {
        self.map.lock().insert(EntityId::of(source), registered);
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Replacement objects
// ---------------------------------------------------------------------------

/// Replacement for `source`: the registered replacement type, else the
/// name pattern. Shared fields are copied across; key fields are left for
/// key assignment on new rows.
pub fn create_wrapper(
    scope: &ServiceScope,
    source: &EntityHandle,
    is_new: bool,
    visits: &Visits,
) -> Result<Option<EntityHandle>> {
    if let Some(done) = visits.get(source) {
        return Ok(done);
    }
    let registry = scope.registry();
    let settings = scope.settings();
    let source_type = type_of(source);
    let name = registry
        .replacement_for(source_type)
        .map(str::to_string)
        .unwrap_or_else(|| settings.wrapper_name_for(source_type));

    let Some(factory) = registry.factory(&name) else {
        if settings.missing_wrapper_allowed {
            return Ok(None);
        }
        return Err(OrmError::invalid(format!(
            "Failed to create wrapper object of type {} for object of type {}.",
            name, source_type
        )));
    };
    let replacement = factory();
    visits.insert(source, Some(replacement.clone()));

    let keys = registry.key_fields(source_type);
    let values: Vec<(&'static str, FieldValue)> = {
        let guard = source.read();
        guard
            .fields()
            .iter()
            .filter(|d| !(is_new && keys.contains(&d.name)))
            .filter_map(|d| guard.get_field(d.name).map(|v| (d.name, v)))
            .collect()
    };
    let mut guard = replacement.write();
    for (name, value) in values {
        if guard.field(name).is_some() {
            guard.set_field(name, value);
        }
    }
    drop(guard);
    debug!(source_type, replacement = %name, "replacement object created");
    Ok(Some(replacement))
}

// ---------------------------------------------------------------------------
// Graph traversal
// ---------------------------------------------------------------------------

static TRAVERSAL_NESTING: AtomicUsize = AtomicUsize::new(0);

struct NestingGuard;

impl NestingGuard {
    /// Claims a parallel nesting slot if one is free.
    fn try_enter(max: usize) -> Option<Self> {
        let claimed = TRAVERSAL_NESTING
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok();
        claimed.then_some(NestingGuard)
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        TRAVERSAL_NESTING.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A declared child collection that is not yet in tracked form.
pub fn is_wrappable_collection(kind: FieldKind, value: &FieldValue) -> bool {
    matches!(kind, FieldKind::Children(_)) && !matches!(value, FieldValue::Set(_))
}

/// Walk the fields of `source`, registering related objects and copying
/// values onto `target`. With `just_traverse`, plain values are not copied.
pub fn traverse_and_track(
    scope: &ServiceScope,
    props: Option<&PropertyMap>,
    source: &EntityHandle,
    target: &EntityHandle,
    is_new: bool,
    visits: &Visits,
    just_traverse: bool,
) -> Result<()> {
    let registry = scope.registry();
    let settings = scope.settings();
    let same_object = same_entity(source, target);
    let owner_type = type_of(source);

    let fields: Vec<_> = {
        let guard = source.read();
        guard
            .fields()
            .iter()
            .map(|d| {
                let value = props
                    .and_then(|p| p.get(d.name).cloned())
                    .or_else(|| guard.get_field(d.name))
                    .unwrap_or_default();
                (d, value)
            })
            .collect()
    };

    for (desc, value) in fields {
        match desc.kind {
            FieldKind::Children(_) => {
                let set = match &value {
                    FieldValue::Set(set) => Some(set.clone()),
                    FieldValue::List(_) => Some(EntitySet::new(owner_type, desc.name)),
                    FieldValue::Null if settings.initialize_null_collections => {
                        Some(EntitySet::new(owner_type, desc.name))
                    }
                    _ => None,
                };
                let Some(set) = set else {
                    continue;
                };
                let items = match &value {
                    FieldValue::List(items) => items.clone(),
                    FieldValue::Set(existing) => existing.items(),
                    _ => Vec::new(),
                };
                let registered = register_all(scope, &items, is_new, visits)?;
                for item in registered.iter().flatten() {
                    set.add_wrapped_item(item);
                }
                if is_wrappable_collection(desc.kind, &value) || !same_object {
                    target.write().set_field(desc.name, FieldValue::Set(set));
                }
            }
            FieldKind::Parent(_) => {
                let FieldValue::Ref(parent) = &value else {
                    if !just_traverse && !same_object {
                        target.write().set_field(desc.name, value);
                    }
                    continue;
                };
                if !registry.is_known(type_of(parent)) {
                    if !just_traverse && !same_object {
                        target.write().set_field(desc.name, value.clone());
                    }
                    continue;
                }
                let overridden = props.is_some_and(|p| p.contains_key(desc.name));
                let registered = register_one(scope, parent, is_new, visits)?;
                if let Some(facade) = registered {
                    if !same_entity(&facade, parent) || !same_object || overridden {
                        target.write().set_field(desc.name, FieldValue::Ref(facade));
                    }
                }
            }
            FieldKind::Scalar(kind) => {
                if just_traverse {
                    continue;
                }
                let overridden = props.is_some_and(|p| p.contains_key(desc.name));
                if !same_object || overridden {
                    target.write().set_field(desc.name, value.coerce(kind));
                }
            }
        }
    }
    Ok(())
}

fn register_one(
    scope: &ServiceScope,
    item: &EntityHandle,
    is_new: bool,
    visits: &Visits,
) -> Result<Option<EntityHandle>> {
    if let Some(done) = visits.get(item) {
        return Ok(done);
    }
    let tracked = scope.include_visiting(item, is_new, visits)?;
    let facade = tracked.wrapper_target();
    visits.insert(item, facade.clone());
    Ok(facade)
}

fn register_all(
    scope: &ServiceScope,
    items: &[EntityHandle],
    is_new: bool,
    visits: &Visits,
) -> Result<Vec<Option<EntityHandle>>> {
    let settings = scope.settings();
    let threshold = settings.traversal_fanout_threshold;
    if threshold > 0 && items.len() > threshold {
        if let Some(_slot) = NestingGuard::try_enter(settings.max_traversal_nesting) {
            trace!(items = items.len(), "parallel traversal");
            return items
                .par_iter()
                .map(|item| {
                    let _ambient = ambient::push(scope.clone());
                    register_one(scope, item, is_new, visits)
                })
                .collect();
        }
    }
    items.iter().map(|item| register_one(scope, item, is_new, visits)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice_never_over_provisions() {
        let d = WrappingAction::Dynamic;
        assert_eq!(decide_wrapping(WrappingSupport::empty(), false, d), None);
        assert_eq!(
            decide_wrapping(WrappingSupport::PROPERTY_BAG, false, d),
            Some((WrapperKind::Bag, false))
        );
        assert_eq!(
            decide_wrapping(WrappingSupport::ORIGINAL_VALUES | WrappingSupport::PROPERTY_BAG, false, d),
            Some((WrapperKind::ValuesAndBag, false))
        );
        assert_eq!(
            decide_wrapping(WrappingSupport::ALL, false, d),
            Some((WrapperKind::Full, false))
        );
    }

    #[test]
    fn test_native_notifiers_skip_full_wrapper() {
        let d = WrappingAction::Dynamic;
        assert_eq!(
            decide_wrapping(WrappingSupport::ALL, true, d),
            Some((WrapperKind::ValuesAndBag, false))
        );
        assert_eq!(
            decide_wrapping(WrappingSupport::NOTIFICATIONS | WrappingSupport::PROPERTY_BAG, true, d),
            Some((WrapperKind::Bag, false))
        );
    }

    #[test]
    fn test_error_bit_is_orthogonal() {
        let d = WrappingAction::Dynamic;
        assert_eq!(
            decide_wrapping(WrappingSupport::DATA_ERRORS, false, d),
            Some((WrapperKind::Bag, true))
        );
        assert_eq!(
            decide_wrapping(WrappingSupport::ALL | WrappingSupport::DATA_ERRORS, false, d),
            Some((WrapperKind::Full, true))
        );
    }

    #[test]
    fn test_no_wrapping_action_provisions_nothing() {
        assert_eq!(
            decide_wrapping(WrappingSupport::ALL, false, WrappingAction::NoneOrProvisioned),
            None
        );
    }

    #[test]
    fn test_nesting_guard_is_bounded() {
        let a = NestingGuard::try_enter(usize::MAX);
        assert!(a.is_some());
        assert!(NestingGuard::try_enter(0).is_none());
    }
}
