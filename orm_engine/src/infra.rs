//! Tracking kernel — infrastructure wrappers.
//!
//! Per-object bookkeeping chosen from a capability lattice:
//!
//!   Bag < ValuesAndBag < Full
//!
//! `Bag` holds extended and shadow properties plus row state.
//! `ValuesAndBag` adds original values for dirty diffing.
//! `Full` adds synthesized change notifications on every routed write.
//! Any kind may carry per-field error state (`DATA_ERRORS`).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityHandle, FieldKind, WeakEntity};
use crate::value::FieldValue;

/// Prefix of off-object key slots in the property bag.
pub const SHADOW_PROP_PREFIX: char = '\\';

pub fn shadow_name(field: &str) -> String {
    format!("{}{}", SHADOW_PROP_PREFIX, field)
}

pub fn is_shadow_name(name: &str) -> bool {
    name.starts_with(SHADOW_PROP_PREFIX)
}

bitflags! {
    /// Capability request a service makes of an object's wrapper.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct WrappingSupport: u32 {
        const NOTIFICATIONS = 1;
        const ORIGINAL_VALUES = 2;
        const PROPERTY_BAG = 4;
        const ALL = 7;
        const DATA_ERRORS = 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowState {
    Unchanged,
    Added,
    Modified,
    ModifiedPriority,
    Deleted,
    Unlinked,
}

impl RowState {
    pub fn as_str(self) -> &'static str {
        match self {
            RowState::Unchanged => "Unchanged",
            RowState::Added => "Added",
            RowState::Modified => "Modified",
            RowState::ModifiedPriority => "ModifiedPriority",
            RowState::Deleted => "Deleted",
            RowState::Unlinked => "Unlinked",
        }
    }

    pub fn parse(text: &str) -> Option<RowState> {
        Some(match text {
            "Unchanged" => RowState::Unchanged,
            "Added" => RowState::Added,
            "Modified" => RowState::Modified,
            "ModifiedPriority" => RowState::ModifiedPriority,
            "Deleted" => RowState::Deleted,
            "Unlinked" => RowState::Unlinked,
            _ => return None,
        })
    }

    /// Rows in this state are handed to persistence.
    pub fn is_saveable(self) -> bool {
        !matches!(self, RowState::Unchanged | RowState::Unlinked)
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WrapperKind {
    Bag,
    ValuesAndBag,
    Full,
}

/// One observed field change.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub field: String,
    pub old: FieldValue,
    pub new: FieldValue,
}

pub type ChangeListener = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

/// Capabilities shared by every wrapper kind. Kinds that lack a
/// capability keep the default no-op.
pub trait InfraCapabilities: Send + Sync {
    fn kind(&self) -> WrapperKind;

    fn core(&self) -> &BagWrapper;

    fn base_type(&self) -> &'static str {
        self.core().base_type
    }

    fn target(&self) -> Option<EntityHandle> {
        self.core().target.upgrade()
    }

    fn row_state(&self) -> RowState {
        *self.core().row_state.read()
    }

    fn set_row_state(&self, state: RowState) {
        *self.core().row_state.write() = state;
    }

    fn get_value(&self, name: &str) -> Option<FieldValue> {
        self.core().read(name)
    }

    /// Routed write. Returns the previous value when something changed.
    fn set_value(&self, name: &str, value: FieldValue) -> Option<FieldValue> {
        self.core().write(name, value, true)
    }

    /// Write that leaves the row clean: navigation references set while
    /// linking. The baseline follows the new value.
    fn set_link_value(&self, name: &str, value: FieldValue) {
        if self.core().write(name, value.clone(), false).is_some() {
            self.rebase_original(name, value);
        }
    }

    fn rebase_original(&self, _name: &str, _value: FieldValue) {}

    fn original_value(&self, _name: &str) -> Option<FieldValue> {
        None
    }

    /// Capture the current values as the diff baseline without touching state.
    fn snapshot_originals(&self) {}

    fn accept_changes(&self) {
        self.snapshot_originals();
        self.set_row_state(RowState::Unchanged);
    }

    /// Diff current values against the baseline, reporting each changed
    /// field. Returns true when the row moved from `Unchanged` to `Modified`.
    fn reconcile(&self, _on_change: &mut dyn FnMut(&PropertyChange)) -> bool {
        false
    }

    fn subscribe(&self, _listener: ChangeListener) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Bag
// ---------------------------------------------------------------------------

pub struct BagWrapper {
    target: WeakEntity,
    base_type: &'static str,
    row_state: RwLock<RowState>,
    bag: RwLock<BTreeMap<String, FieldValue>>,
    errors: Option<RwLock<BTreeMap<String, String>>>,
}

impl BagWrapper {
    pub fn new(target: WeakEntity, base_type: &'static str, with_errors: bool) -> Self {
        BagWrapper {
            target,
            base_type,
            row_state: RwLock::new(RowState::Unchanged),
            bag: RwLock::new(BTreeMap::new()),
            errors: with_errors.then(|| RwLock::new(BTreeMap::new())),
        }
    }

    fn read(&self, name: &str) -> Option<FieldValue> {
        if let Some(target) = self.target.upgrade() {
            let guard = target.read();
            if guard.field(name).is_some() {
                return guard.get_field(name);
            }
        }
        self.bag.read().get(name).cloned()
    }

    fn write(&self, name: &str, value: FieldValue, dirty: bool) -> Option<FieldValue> {
        if let Some(target) = self.target.upgrade() {
            let mut guard = target.write();
            if guard.field(name).is_some() {
                let old = guard.get_field(name).unwrap_or_default();
                if old == value {
                    return None;
                }
                guard.set_field(name, value);
                drop(guard);
                if dirty {
                    self.mark_modified();
                }
                return Some(old);
            }
        }

        let mut bag = self.bag.write();
        let old = bag.get(name).cloned();
        if old.as_ref() == Some(&value) {
            return None;
        }
        bag.insert(name.to_string(), value);
        drop(bag);
        if dirty && !is_shadow_name(name) {
            self.mark_modified();
        }
        Some(old.unwrap_or_default())
    }

    fn mark_modified(&self) {
        let mut state = self.row_state.write();
        if *state == RowState::Unchanged {
            *state = RowState::Modified;
        }
    }

    /// Extended properties, shadow slots excluded.
    pub fn extended_fields(&self) -> Vec<(String, FieldValue)> {
        self.bag
            .read()
            .iter()
            .filter(|(k, _)| !is_shadow_name(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Shadow slots keyed by their bag name.
    pub fn shadow_fields(&self) -> Vec<(String, FieldValue)> {
        self.bag
            .read()
            .iter()
            .filter(|(k, _)| is_shadow_name(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn has_shadow_property(&self, field: &str) -> bool {
        self.bag.read().contains_key(&shadow_name(field))
    }

    pub fn shadow_value(&self, field: &str) -> Option<FieldValue> {
        self.bag.read().get(&shadow_name(field)).cloned()
    }

    pub fn remove_property(&self, name: &str) -> Option<FieldValue> {
        self.bag.write().remove(name)
    }

    pub fn supports_errors(&self) -> bool {
        self.errors.is_some()
    }

    pub fn set_field_error(&self, field: &str, message: impl Into<String>) {
        if let Some(errors) = &self.errors {
            errors.write().insert(field.to_string(), message.into());
        }
    }

    pub fn clear_errors(&self) {
        if let Some(errors) = &self.errors {
            errors.write().clear();
        }
    }

    pub fn field_errors(&self) -> Vec<(String, String)> {
        match &self.errors {
            Some(errors) => errors.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => Vec::new(),
        }
    }
}

impl InfraCapabilities for BagWrapper {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Bag
    }

    fn core(&self) -> &BagWrapper {
        self
    }
}

// ---------------------------------------------------------------------------
// Values + bag
// ---------------------------------------------------------------------------

pub struct ValuesWrapper {
    bag: BagWrapper,
    originals: RwLock<BTreeMap<String, FieldValue>>,
}

impl ValuesWrapper {
    pub fn new(target: WeakEntity, base_type: &'static str, with_errors: bool) -> Self {
        ValuesWrapper {
            bag: BagWrapper::new(target, base_type, with_errors),
            originals: RwLock::new(BTreeMap::new()),
        }
    }

    /// Scalar and parent-reference values, collections excluded.
    fn current_values(&self) -> BTreeMap<String, FieldValue> {
        let mut values = BTreeMap::new();
        if let Some(target) = self.bag.target.upgrade() {
            let guard = target.read();
            for desc in guard.fields() {
                if matches!(desc.kind, FieldKind::Children(_)) {
                    continue;
                }
                values.insert(desc.name.to_string(), guard.get_field(desc.name).unwrap_or_default());
            }
        }
        for (k, v) in self.bag.extended_fields() {
            if v.is_scalar() {
                values.insert(k, v);
            }
        }
        values
    }
}

impl InfraCapabilities for ValuesWrapper {
    fn kind(&self) -> WrapperKind {
        WrapperKind::ValuesAndBag
    }

    fn core(&self) -> &BagWrapper {
        &self.bag
    }

    fn original_value(&self, name: &str) -> Option<FieldValue> {
        self.originals.read().get(name).cloned()
    }

    fn rebase_original(&self, name: &str, value: FieldValue) {
        let mut originals = self.originals.write();
        if let Some(slot) = originals.get_mut(name) {
            *slot = value;
        }
    }

    fn snapshot_originals(&self) {
        let current = self.current_values();
        *self.originals.write() = current;
    }

    fn reconcile(&self, on_change: &mut dyn FnMut(&PropertyChange)) -> bool {
        let originals = self.originals.read().clone();
        if originals.is_empty() {
            return false;
        }
        let current = self.current_values();
        let mut changed = false;
        for (field, old) in originals {
            let new = current.get(&field).cloned().unwrap_or_default();
            if new != old {
                changed = true;
                on_change(&PropertyChange { field, old, new });
            }
        }
        if changed {
            let mut state = self.bag.row_state.write();
            if *state == RowState::Unchanged {
                *state = RowState::Modified;
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Full
// ---------------------------------------------------------------------------

pub struct FullWrapper {
    values: ValuesWrapper,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl FullWrapper {
    pub fn new(target: WeakEntity, base_type: &'static str, with_errors: bool) -> Self {
        FullWrapper {
            values: ValuesWrapper::new(target, base_type, with_errors),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl InfraCapabilities for FullWrapper {
    fn kind(&self) -> WrapperKind {
        WrapperKind::Full
    }

    fn core(&self) -> &BagWrapper {
        &self.values.bag
    }

    fn set_value(&self, name: &str, value: FieldValue) -> Option<FieldValue> {
        let old = self.values.bag.write(name, value.clone(), true)?;
        let listeners = self.listeners.read().clone();
        let change = PropertyChange { field: name.to_string(), old: old.clone(), new: value };
        for listener in listeners {
            listener(&change);
        }
        Some(old)
    }

    fn original_value(&self, name: &str) -> Option<FieldValue> {
        self.values.original_value(name)
    }

    fn rebase_original(&self, name: &str, value: FieldValue) {
        self.values.rebase_original(name, value);
    }

    fn snapshot_originals(&self) {
        self.values.snapshot_originals();
    }

    fn reconcile(&self, on_change: &mut dyn FnMut(&PropertyChange)) -> bool {
        self.values.reconcile(on_change)
    }

    fn subscribe(&self, listener: ChangeListener) -> bool {
        self.listeners.write().push(listener);
        true
    }
}

// ---------------------------------------------------------------------------
// Tagged variant
// ---------------------------------------------------------------------------

pub enum InfraWrapper {
    Bag(BagWrapper),
    Values(ValuesWrapper),
    Full(FullWrapper),
}

impl InfraWrapper {
    pub fn new(kind: WrapperKind, target: WeakEntity, base_type: &'static str, with_errors: bool) -> Self {
        match kind {
            WrapperKind::Bag => InfraWrapper::Bag(BagWrapper::new(target, base_type, with_errors)),
            WrapperKind::ValuesAndBag => {
                InfraWrapper::Values(ValuesWrapper::new(target, base_type, with_errors))
            }
            WrapperKind::Full => InfraWrapper::Full(FullWrapper::new(target, base_type, with_errors)),
        }
    }
}

impl Deref for InfraWrapper {
    type Target = dyn InfraCapabilities;

    fn deref(&self) -> &Self::Target {
        match self {
            InfraWrapper::Bag(w) => w as &dyn InfraCapabilities,
            InfraWrapper::Values(w) => w as &dyn InfraCapabilities,
            InfraWrapper::Full(w) => w as &dyn InfraCapabilities,
        }
    }
}

impl fmt::Debug for InfraWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfraWrapper")
            .field("kind", &self.kind())
            .field("base_type", &self.base_type())
            .field("row_state", &self.row_state())
            .finish()
    }
}
