//! Tracking kernel — service scope.
//!
//! The session: identity map, per-scope service state and the save
//! pipeline. A scope built with `new` owns its shared state; `clone` and
//! `shallow_child` hand out views over the same state that never tear it
//! down.
//!
//! Save pipeline:
//!
//!   candidates → reconcile → saveable filter → validate → persist
//!
//! Persistence runs inline or as a background unit of work registered
//! with the collaborator's completion registry.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::ambient::{self, AmbientGuard};
use crate::collaborators::{PersistenceHost, SaveResult, ValidationHost};
use crate::composite::CompositeKey;
use crate::config::{CascadeMode, MergeBehavior, RelationTypes, SaveSettings, ScopeSettings, WrappingAction};
use crate::entity::{read_field, type_of, EntityHandle};
use crate::error::{OrmError, Result, ValidationMessage};
use crate::infra::{ChangeListener, PropertyChange, RowState, WrappingSupport};
use crate::key_service::KeyService;
use crate::key_state::KeyServiceState;
use crate::provision::{create_infra_wrapper, create_wrapper, traverse_and_track, Visits};
use crate::registry::KeyRegistry;
use crate::service::{ObjectService, ServiceStates, ValidationService};
use crate::tracked::{ObjectIndex, TrackedHandle, TrackedObject};
use crate::value::{FieldValue, PropertyMap};

struct ScopeShared {
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
    objects: ObjectIndex,
    states: ServiceStates,
    local_services: RwLock<Vec<Arc<dyn ObjectService>>>,
    persistence: Option<Arc<dyn PersistenceHost>>,
    validator: Option<Arc<dyn ValidationHost>>,
    disposed: AtomicBool,
}

pub struct ServiceScope {
    shared: Arc<ScopeShared>,
    owner: bool,
}

impl ServiceScope {
    pub fn new(registry: Arc<KeyRegistry>, settings: ScopeSettings) -> Self {
        Self::with_collaborators(registry, settings, None, None)
    }

    pub fn with_collaborators(
        registry: Arc<KeyRegistry>,
        settings: ScopeSettings,
        persistence: Option<Arc<dyn PersistenceHost>>,
        validator: Option<Arc<dyn ValidationHost>>,
    ) -> Self {
        let mut local: Vec<Arc<dyn ObjectService>> = Vec::new();
        if let Some(host) = &validator {
            local.push(Arc::new(ValidationService::new(host.clone())));
        }
        ServiceScope {
            shared: Arc::new(ScopeShared {
                registry,
                settings,
                objects: ObjectIndex::new(),
                states: ServiceStates::new(),
                local_services: RwLock::new(local),
                persistence,
                validator,
                disposed: AtomicBool::new(false),
            }),
            owner: true,
        }
    }

    /// View over the same index, service state and collaborators. Never
    /// disposes shared state.
    pub fn shallow_child(&self) -> ServiceScope {
        ServiceScope { shared: self.shared.clone(), owner: false }
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.shared.registry
    }

    pub fn settings(&self) -> &ScopeSettings {
        &self.shared.settings
    }

    pub fn objects(&self) -> &ObjectIndex {
        &self.shared.objects
    }

    pub fn states(&self) -> &ServiceStates {
        &self.shared.states
    }

    pub fn key_state(&self) -> Arc<KeyServiceState> {
        KeyService::state(self)
    }

    pub fn persistence(&self) -> Option<&Arc<dyn PersistenceHost>> {
        self.shared.persistence.as_ref()
    }

    pub fn validator(&self) -> Option<&Arc<dyn ValidationHost>> {
        self.shared.validator.as_ref()
    }

    pub fn add_local_service(&self, service: Arc<dyn ObjectService>) {
        self.shared.local_services.write().push(service);
    }

    /// Make this scope the ambient one on the current thread.
    pub fn use_ambient(&self) -> AmbientGuard<ServiceScope> {
        ambient::push(self.shallow_child())
    }

    pub fn current() -> Option<ServiceScope> {
        ambient::current::<ServiceScope>()
    }

    fn services_for(&self, type_name: &str) -> Vec<Arc<dyn ObjectService>> {
        let mut services = self.registry().services_for(type_name);
        services.extend(
            self.shared
                .local_services
                .read()
                .iter()
                .filter(|s| s.applies_to(type_name, self.registry()))
                .cloned(),
        );
        services
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn include(&self, object: &EntityHandle) -> Result<TrackedHandle> {
        self.include_with(object, None, None)
    }

    /// Track `object`. `state` overrides the row state the object enters
    /// with (`Unchanged` when absent); `props` overrides field values.
    pub fn include_with(
        &self,
        object: &EntityHandle,
        state: Option<RowState>,
        props: Option<&PropertyMap>,
    ) -> Result<TrackedHandle> {
        let visits = Visits::new();
        self.include_inner(object, state, props, &visits)
    }

    pub(crate) fn include_visiting(&self, object: &EntityHandle, is_new: bool, visits: &Visits) -> Result<TrackedHandle> {
        let state = is_new.then_some(RowState::Added);
        self.include_inner(object, state, None, visits)
    }

    /// Track a template object as a new row.
    pub fn new_object(&self, template: &EntityHandle) -> Result<TrackedHandle> {
        self.include_with(template, Some(RowState::Added), None)
    }

    /// Build an object of `type_name` from its registered factory and track
    /// it as a new row. The caller owns the returned handle.
    pub fn new_of_type(&self, type_name: &str, props: Option<&PropertyMap>) -> Result<EntityHandle> {
        let object = self.registry().create(type_name)?;
        self.include_with(&object, Some(RowState::Added), props)?;
        Ok(object)
    }

    fn include_inner(
        &self,
        object: &EntityHandle,
        state: Option<RowState>,
        props: Option<&PropertyMap>,
        visits: &Visits,
    ) -> Result<TrackedHandle> {
        if let Some(existing) = self.objects().get(object) {
            return Ok(existing);
        }
        let is_new = state == Some(RowState::Added);
        let type_name = type_of(object);

        if let Some(existing) = self.find_by_incoming_key(object, type_name, props)? {
            self.merge_into(&existing, object, props, state)?;
            visits.insert(object, existing.wrapper_target());
            return Ok(existing);
        }

        let services = self.services_for(type_name);
        if services.is_empty() {
            return Err(OrmError::tracking(format!(
                "No service can track objects of type {}.",
                type_name
            )));
        }

        let registry = self.registry();
        let settings = self.settings();
        let replacement = match settings.wrapping_action {
            WrappingAction::PreCodeGen => create_wrapper(self, object, is_new, visits)?,
            _ => None,
        };
        let facade = replacement.clone().unwrap_or_else(|| object.clone());
        let need = services.iter().fold(WrappingSupport::empty(), |acc, s| {
            acc | s.identify_infra_needs(object, replacement.as_ref(), registry, settings, is_new)
        });
        let infra = create_infra_wrapper(need, &facade, type_name, settings.wrapping_action, props);
        if is_new {
            if let Some(w) = &infra {
                w.set_row_state(RowState::Added);
            }
        }

        let seq = self.objects().allocate_seq();
        let candidate = Arc::new(TrackedObject::new(seq, object, replacement.clone(), infra, type_name, services.clone()));
        let tracked = self.objects().add(candidate);
        if tracked.seq() != seq {
            return Ok(tracked);
        }
        visits.insert(object, Some(facade.clone()));
        debug!(type_name, seq, is_new, "object tracked");

        let just_traverse = props.is_none() && replacement.is_none();
        traverse_and_track(self, props, object, &facade, is_new, visits, just_traverse)?;

        for service in &services {
            service.finish_setup(self, &tracked, is_new, props)?;
        }

        match state {
            Some(RowState::Added) => {
                if let Some(w) = tracked.infra() {
                    w.snapshot_originals();
                }
            }
            Some(other) => {
                tracked.accept_changes();
                tracked.set_row_state(other);
            }
            None => tracked.accept_changes(),
        }
        Ok(tracked)
    }

    /// Tracked object with the same primary key as the incoming values.
    fn find_by_incoming_key(
        &self,
        object: &EntityHandle,
        type_name: &'static str,
        props: Option<&PropertyMap>,
    ) -> Result<Option<TrackedHandle>> {
        let fields = self.registry().key_fields(type_name);
        if fields.is_empty() {
            return Ok(None);
        }
        let values: Vec<FieldValue> = fields
            .iter()
            .map(|f| {
                props
                    .and_then(|p| p.get(*f).cloned())
                    .or_else(|| read_field(object, f))
                    .unwrap_or_default()
            })
            .collect();
        if values.iter().all(FieldValue::is_default) {
            return Ok(None);
        }
        let key = CompositeKey::new(type_name, &values)?;
        Ok(self.key_state().tracked_by_composite(&key).filter(|t| !t.is_same_object(object)))
    }

    fn merge_into(
        &self,
        existing: &TrackedHandle,
        incoming: &EntityHandle,
        props: Option<&PropertyMap>,
        state: Option<RowState>,
    ) -> Result<()> {
        let keys = self.registry().key_fields(existing.base_type());
        let mut values: PropertyMap = {
            let guard = incoming.read();
            guard
                .fields()
                .iter()
                .filter(|d| d.is_scalar() && !keys.contains(&d.name))
                .filter_map(|d| guard.get_field(d.name).map(|v| (d.name.to_string(), v)))
                .collect()
        };
        if let Some(props) = props {
            for (k, v) in props {
                if v.is_scalar() && !keys.iter().any(|key| key == k) {
                    values.insert(k.clone(), v.clone());
                }
            }
        }
        let diffs: Vec<(String, FieldValue)> = values
            .into_iter()
            .filter(|(f, v)| existing.get_value(f).unwrap_or_default() != *v)
            .collect();
        if diffs.is_empty() {
            return Ok(());
        }
        if self.settings().merge_behavior == MergeBehavior::FailIfDifferent {
            return Err(OrmError::MergeConflict {
                type_name: existing.base_type().to_string(),
                field: diffs[0].0.clone(),
            });
        }

        let was_clean = existing.row_state() == RowState::Unchanged;
        debug!(type_name = existing.base_type(), fields = diffs.len(), "merging incoming values");
        for (field, value) in diffs {
            existing.set_value(&field, value);
        }
        if was_clean && matches!(state, None | Some(RowState::Unchanged)) {
            existing.accept_changes();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    pub fn delete(&self, object: &EntityHandle, mode: CascadeMode) -> Result<()> {
        let tracked = self.tracked_or_err(object)?;
        let state = self.key_state();
        match mode {
            CascadeMode::None => tracked.set_row_state(RowState::Deleted),
            CascadeMode::Fail => {
                let live = state
                    .children_fk(tracked.id())
                    .iter()
                    .filter_map(|r| r.child())
                    .filter(|c| !matches!(c.row_state(), RowState::Deleted | RowState::Unlinked))
                    .count();
                if live > 0 {
                    let key = state
                        .pk_composite(tracked.id())
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| tracked.base_type().to_string());
                    return Err(OrmError::ConstraintViolation(format!(
                        "Cannot delete {}: {} live child row(s) depend on it.",
                        key, live
                    )));
                }
                tracked.set_row_state(RowState::Deleted);
            }
            CascadeMode::Cascade => {
                let mut visited = HashSet::new();
                self.cascade_delete(&state, &tracked, &mut visited);
            }
            CascadeMode::SetNull => {
                for record in state.children_fk(tracked.id()) {
                    KeyService::remove_fk(self, &record, true);
                }
                tracked.set_row_state(RowState::Deleted);
            }
        }
        debug!(type_name = tracked.base_type(), ?mode, "row deleted");
        Ok(())
    }

    fn cascade_delete(&self, state: &KeyServiceState, tracked: &TrackedHandle, visited: &mut HashSet<u64>) {
        if !visited.insert(tracked.seq()) {
            return;
        }
        tracked.set_row_state(RowState::Deleted);
        for record in state.children_fk(tracked.id()) {
            if let Some(child) = record.child() {
                self.cascade_delete(state, &child, visited);
            }
        }
    }

    /// Mark `object` for silent removal and drop its links. Objects without
    /// a wrapper leave the index immediately.
    pub fn evict(&self, object: &EntityHandle) -> bool {
        let Some(tracked) = self.get_tracked(object) else {
            return false;
        };
        let state = self.key_state();
        for record in state.remove_links_of(tracked.id()) {
            KeyService::remove_fk(self, &record, false);
        }
        match tracked.infra() {
            Some(w) => w.set_row_state(RowState::Unlinked),
            None => {
                state.remove_pk(tracked.id());
                self.objects().remove(&tracked);
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Property changes
    // -----------------------------------------------------------------------

    /// Routed write. Returns false when the value did not change.
    pub fn set_property(&self, object: &EntityHandle, field: &str, value: FieldValue) -> Result<bool> {
        let tracked = self.tracked_or_err(object)?;
        if tracked.set_value(field, value.clone()).is_none() {
            return Ok(false);
        }
        KeyService::on_property_changed(self, &tracked, field, &value)?;
        Ok(true)
    }

    /// Entry point for objects that raise their own notifications, called
    /// after the object changed `field` from `old`.
    pub fn property_changed(&self, object: &EntityHandle, field: &str, old: FieldValue) -> Result<()> {
        let tracked = self.tracked_or_err(object)?;
        let new = tracked.get_value(field).unwrap_or_default();
        if new == old {
            return Ok(());
        }
        if tracked.row_state() == RowState::Unchanged {
            tracked.set_row_state(RowState::Modified);
        }
        let change = PropertyChange { field: field.to_string(), old, new };
        KeyService::on_reconciled_change(self, &tracked, &change)
    }

    pub fn subscribe(&self, object: &EntityHandle, listener: ChangeListener) -> Result<bool> {
        let tracked = self.tracked_or_err(object)?;
        Ok(tracked.infra().is_some_and(|w| w.subscribe(listener)))
    }

    pub fn add_child(&self, parent: &EntityHandle, property: &str, child: &EntityHandle) -> Result<()> {
        KeyService::link_child_in_parent_container(self, parent, property, child)
    }

    pub fn remove_child(&self, parent: &EntityHandle, property: &str, child: &EntityHandle) -> Result<bool> {
        KeyService::unlink_child_from_parent_container(self, parent, property, child)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn get_tracked(&self, object: &EntityHandle) -> Option<TrackedHandle> {
        self.objects().get(object)
    }

    fn tracked_or_err(&self, object: &EntityHandle) -> Result<TrackedHandle> {
        self.get_tracked(object).ok_or_else(|| {
            OrmError::tracking(format!("{} is not tracked in this scope.", type_of(object)))
        })
    }

    pub fn get_tracked_by_pk_value(
        &self,
        type_name: &'static str,
        values: &[FieldValue],
    ) -> Result<Option<TrackedHandle>> {
        let key = CompositeKey::new(type_name, values)?;
        Ok(self.key_state().tracked_by_composite(&key))
    }

    pub fn children_of(&self, object: &EntityHandle, types: RelationTypes) -> Vec<TrackedHandle> {
        KeyService::children_of(self, object, types)
    }

    pub fn parents_of(&self, object: &EntityHandle, types: RelationTypes) -> Vec<TrackedHandle> {
        KeyService::parents_of(self, object, types)
    }

    pub fn all_tracked(&self) -> Vec<TrackedHandle> {
        self.objects().all()
    }

    pub fn tracked_by_type(&self, type_name: &str) -> Vec<TrackedHandle> {
        self.objects()
            .all()
            .into_iter()
            .filter(|t| t.base_type() == type_name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    pub fn accept_all_changes(&self) {
        for tracked in self.objects().all() {
            tracked.accept_changes();
        }
    }

    /// Drop `Unlinked` rows, then diff every remaining row (or those
    /// passing `filter`) against its baseline. Returns how many rows moved
    /// from `Unchanged` to `Modified`.
    pub fn reconcile_modified_state(&self, filter: Option<&(dyn Fn(&TrackedHandle) -> bool + Sync)>) -> Result<usize> {
        let state = self.key_state();
        for tracked in self.objects().all() {
            if tracked.row_state() == RowState::Unlinked {
                state.remove_links_of(tracked.id());
                state.remove_pk(tracked.id());
                self.objects().remove(&tracked);
            }
        }
        let pruned = self.objects().prune() + state.prune_links();
        if pruned > 0 {
            debug!(pruned, "released objects dropped from scope");
        }
        let rows: Vec<TrackedHandle> = self
            .objects()
            .all()
            .into_iter()
            .filter(|t| filter.map_or(true, |f| f(t)))
            .collect();
        self.reconcile_rows(&rows)
    }

    fn reconcile_rows(&self, rows: &[TrackedHandle]) -> Result<usize> {
        let work = |tracked: &TrackedHandle| -> Result<bool> {
            let Some(wrapper) = tracked.infra() else {
                return Ok(false);
            };
            if tracked.wrapper_target().is_some_and(|t| t.read().notifies_changes()) {
                return Ok(false);
            }
            let mut changes = Vec::new();
            let moved = wrapper.reconcile(&mut |c| changes.push(c.clone()));
            for change in &changes {
                KeyService::on_reconciled_change(self, tracked, change)?;
            }
            Ok(moved)
        };

        let moved: Vec<bool> = if rows.len() > self.settings().parallel_threshold {
            rows.par_iter()
                .map(|t| {
                    let _ambient = ambient::push(self.shallow_child());
                    work(t)
                })
                .collect::<Result<_>>()?
        } else {
            rows.iter().map(work).collect::<Result<_>>()?
        };
        Ok(moved.into_iter().filter(|m| *m).count())
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    pub fn save(&self, settings: &SaveSettings) -> Result<Vec<SaveResult>> {
        let persistence = self
            .persistence()
            .cloned()
            .ok_or_else(|| OrmError::invalid("Scope has no persistence collaborator."))?;

        let candidates = self.save_candidates(settings)?;
        self.reconcile_rows(&candidates)?;

        let ignore = settings.ignore_type;
        let saveable = |t: &TrackedHandle| t.row_state().is_saveable() && Some(t.base_type()) != ignore;
        let mut rows: Vec<TrackedHandle> = if candidates.len() > self.settings().parallel_threshold {
            candidates
                .par_iter()
                .filter(|t| {
                    let _ambient = ambient::push(self.shallow_child());
                    saveable(*t)
                })
                .cloned()
                .collect()
        } else {
            candidates.iter().filter(|t| saveable(*t)).cloned().collect()
        };
        debug!(candidates = candidates.len(), saveable = rows.len(), "save candidates filtered");

        let mut results = Vec::new();
        let validate = settings
            .validation_checks
            .unwrap_or(self.settings().validation_checks_on_save);
        if validate {
            if let Some(validator) = self.validator() {
                rows = self.validate_rows(validator.as_ref(), rows, settings, &mut results)?;
            }
        }
        if rows.is_empty() {
            return Ok(results);
        }

        let background = settings.use_async.unwrap_or(self.settings().use_async_save);
        if background {
            let scope = self.shallow_child();
            let host = persistence.clone();
            let save_settings = settings.clone();
            let count = rows.len();
            let task = std::thread::spawn(move || {
                let _ambient = ambient::push(scope.shallow_child());
                if let Err(err) = host.save(&rows, &scope, &save_settings) {
                    host.completions().add_completion_exception(err);
                }
            });
            persistence.completions().add_completion_task(task);
            info!(rows = count, "save queued in background");
            return Ok(results);
        }

        let saved = persistence.save(&rows, self, settings)?;
        info!(rows = saved.len(), "save complete");
        results.extend(saved);
        Ok(results)
    }

    fn save_candidates(&self, settings: &SaveSettings) -> Result<Vec<TrackedHandle>> {
        if let Some(list) = &settings.source_list {
            return Ok(list.iter().filter_map(|o| self.get_tracked(o)).collect());
        }
        let Some(root) = &settings.root else {
            return Ok(self.all_tracked());
        };
        let mut rows = vec![self.tracked_or_err(root)?];
        if settings.include_root_children {
            rows.extend(self.children_of(root, RelationTypes::Children));
        }
        if settings.include_root_parents {
            rows.extend(self.parents_of(root, RelationTypes::Parents));
        }
        let mut seen = HashSet::new();
        rows.retain(|t| seen.insert(t.seq()));
        Ok(rows)
    }

    fn validate_rows(
        &self,
        validator: &dyn ValidationHost,
        rows: Vec<TrackedHandle>,
        settings: &SaveSettings,
        results: &mut Vec<SaveResult>,
    ) -> Result<Vec<TrackedHandle>> {
        let mut passed = Vec::with_capacity(rows.len());
        let mut failed: Vec<(TrackedHandle, Vec<ValidationMessage>)> = Vec::new();
        for tracked in rows {
            let Some(item) = tracked.wrapper_target() else {
                continue;
            };
            let messages = validator.classify(&item);
            if messages.is_empty() {
                passed.push(tracked);
            } else {
                failed.push((tracked, messages));
            }
        }
        if failed.is_empty() {
            return Ok(passed);
        }

        let as_error = settings
            .validation_failure_is_error
            .unwrap_or(self.settings().validation_failure_is_error);
        warn!(failures = failed.len(), as_error, "validation failed");
        if as_error {
            let failures: Vec<ValidationMessage> = failed.into_iter().flat_map(|(_, m)| m).collect();
            let summary = match failures.as_slice() {
                [(_, only)] => only.clone(),
                _ => "Multiple validation failures.".to_string(),
            };
            return Err(OrmError::Validation { summary, failures });
        }

        for (tracked, messages) in failed {
            if let Some(w) = tracked.infra() {
                for (code, message) in &messages {
                    w.core().set_field_error(&code.to_string(), message.clone());
                }
            }
            if let Some(item) = tracked.wrapper_target() {
                let status = messages[0].0;
                let text = messages.into_iter().map(|(_, m)| m).collect::<Vec<_>>().join("; ");
                results.push(SaveResult::failed(item, status, text));
            }
        }
        Ok(passed)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn distinct_services(&self) -> Vec<Arc<dyn ObjectService>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let local = self.shared.local_services.read().clone();
        for tracked in self.objects().all() {
            for service in tracked.services().iter().chain(local.iter()) {
                if seen.insert(Arc::as_ptr(service) as *const () as usize) {
                    out.push(service.clone());
                }
            }
        }
        out
    }

    /// Final waiting-list pass of every service.
    pub fn cleanup_service_states(&self) {
        for service in self.distinct_services() {
            service.cleanup(self);
        }
    }

    /// Owner only: run disposal hooks and the cleanup pass, join background
    /// work, then clear shared state. Errors captured by background work
    /// are returned here.
    pub fn dispose(&self) -> Result<()> {
        if !self.owner || self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let services = self.distinct_services();
        for service in &services {
            service.disposing(self);
        }
        for service in &services {
            service.cleanup(self);
        }
        let waited = match self.persistence() {
            Some(p) => p.completions().wait_on_completions(),
            None => Ok(()),
        };
        self.key_state().clear();
        self.states().clear();
        self.objects().clear();
        debug!("scope disposed");
        waited
    }
}

impl Clone for ServiceScope {
    fn clone(&self) -> Self {
        self.shallow_child()
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        if self.owner && !self.is_disposed() {
            if let Err(err) = self.dispose() {
                warn!(error = %err, "scope dropped with failed background work");
            }
        }
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("owner", &self.owner)
            .field("tracked", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
