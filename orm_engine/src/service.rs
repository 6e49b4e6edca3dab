//! Tracking kernel — object services.
//!
//! A service declares which types it applies to and what wrapper
//! capabilities it needs, then finishes setup once the tracked record
//! exists. Per-scope service state lives in `ServiceStates`, keyed by
//! state type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::collaborators::ValidationHost;
use crate::config::ScopeSettings;
use crate::entity::EntityHandle;
use crate::error::Result;
use crate::infra::WrappingSupport;
use crate::registry::KeyRegistry;
use crate::scope::ServiceScope;
use crate::tracked::TrackedHandle;
use crate::value::PropertyMap;

pub trait ObjectService: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, _type_name: &str, _registry: &KeyRegistry) -> bool {
        true
    }

    fn identify_infra_needs(
        &self,
        object: &EntityHandle,
        replacement: Option<&EntityHandle>,
        registry: &KeyRegistry,
        settings: &ScopeSettings,
        is_new: bool,
    ) -> WrappingSupport;

    fn finish_setup(
        &self,
        _scope: &ServiceScope,
        _tracked: &TrackedHandle,
        _is_new: bool,
        _props: Option<&PropertyMap>,
    ) -> Result<()> {
        Ok(())
    }

    /// Final pass over per-scope state before teardown.
    fn cleanup(&self, _scope: &ServiceScope) {}

    fn disposing(&self, _scope: &ServiceScope) {}
}

/// Requests the scope's default wrapping support for every known type.
pub struct ChangeTrackingService;

impl ObjectService for ChangeTrackingService {
    fn name(&self) -> &'static str {
        "change-tracking"
    }

    fn applies_to(&self, type_name: &str, registry: &KeyRegistry) -> bool {
        registry.is_known(type_name)
    }

    fn identify_infra_needs(
        &self,
        _object: &EntityHandle,
        _replacement: Option<&EntityHandle>,
        _registry: &KeyRegistry,
        settings: &ScopeSettings,
        _is_new: bool,
    ) -> WrappingSupport {
        settings.default_support
    }
}

/// Scope-local service attached with a validation collaborator. Asks for
/// per-field error state on every wrapper.
pub struct ValidationService {
    host: Arc<dyn ValidationHost>,
}

impl ValidationService {
    pub fn new(host: Arc<dyn ValidationHost>) -> Self {
        ValidationService { host }
    }

    pub fn host(&self) -> &Arc<dyn ValidationHost> {
        &self.host
    }
}

impl ObjectService for ValidationService {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn identify_infra_needs(
        &self,
        _object: &EntityHandle,
        _replacement: Option<&EntityHandle>,
        _registry: &KeyRegistry,
        _settings: &ScopeSettings,
        _is_new: bool,
    ) -> WrappingSupport {
        WrappingSupport::DATA_ERRORS
    }
}

// ---------------------------------------------------------------------------
// Per-scope state
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ServiceStates {
    map: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of type `T`, created on first access.
    pub fn get_or_init<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }
        let mut map = self.map.write();
        let entry = map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>)
            .clone();
        drop(map);
        match entry.downcast::<T>() {
            Ok(state) => state,
            Err(_) => unreachable!("service state keyed by its own TypeId"),
        }
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entry = self.map.read().get(&TypeId::of::<T>()).cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[test]
    fn test_state_created_once() {
        let states = ServiceStates::new();
        let a = states.get_or_init(Counter::default);
        a.0.fetch_add(1, Ordering::SeqCst);
        let b = states.get_or_init(|| Counter(AtomicUsize::new(99)));
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(states.len(), 1);
        states.clear();
        assert!(states.get::<Counter>().is_none());
    }
}
