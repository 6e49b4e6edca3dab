//! Tracking kernel — configuration.
//!
//! `ScopeSettings` is fixed for the lifetime of a scope; `SaveSettings`
//! travels with one save call. Both deserialize with per-field defaults
//! so a partial JSON document is enough.

use serde::{Deserialize, Serialize};

use crate::entity::EntityHandle;
use crate::infra::WrappingSupport;

/// What `include` does when an equal-key object is already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeBehavior {
    /// Copy differing incoming values onto the tracked object.
    SilentMerge,
    /// Raise `MergeConflict` on the first differing value.
    FailIfDifferent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeMode {
    None,
    Cascade,
    SetNull,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrappingAction {
    /// Objects are tracked bare; no infra wrapper is provisioned.
    NoneOrProvisioned,
    /// Replacement types registered ahead of time or found by name pattern,
    /// plus an infra wrapper.
    PreCodeGen,
    /// Infra wrappers only.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationTypes {
    None,
    Parents,
    Children,
    Both,
}

impl RelationTypes {
    pub fn includes_parents(self) -> bool {
        matches!(self, RelationTypes::Parents | RelationTypes::Both)
    }

    pub fn includes_children(self) -> bool {
        matches!(self, RelationTypes::Children | RelationTypes::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializationMode {
    /// Every tracked row.
    AllRows,
    /// Only rows whose state is not `Unchanged`, excluding `Deleted`/`Unlinked`.
    OnlyChanged,
}

/// Surrogate key kind used when a type registers no explicit key kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultKeyType {
    Int,
    Long,
    Guid,
}

/// Per-scope configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeSettings {
    pub merge_behavior: MergeBehavior,
    /// Wrapping request of the change tracking service.
    pub default_support: WrappingSupport,
    pub wrapping_action: WrappingAction,
    pub missing_wrapper_allowed: bool,
    /// `{0}` is replaced with the source type name.
    pub wrapper_name_pattern: String,
    pub initialize_null_collections: bool,
    pub use_shadow_properties_for_new: bool,
    pub resolve_for_arbitrary_load_order: bool,
    pub default_key_type: DefaultKeyType,
    pub use_async_save: bool,
    pub validation_checks_on_save: bool,
    pub validation_failure_is_error: bool,
    pub estimated_scope_size: usize,
    pub parallel_threshold: usize,
    pub traversal_fanout_threshold: usize,
    pub max_traversal_nesting: usize,
    pub query_timeout_ms: Option<u64>,
    pub serialization_mode: SerializationMode,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            merge_behavior: MergeBehavior::SilentMerge,
            default_support: WrappingSupport::ORIGINAL_VALUES | WrappingSupport::PROPERTY_BAG,
            wrapping_action: WrappingAction::Dynamic,
            missing_wrapper_allowed: true,
            wrapper_name_pattern: "{0}Wrapped".to_string(),
            initialize_null_collections: true,
            use_shadow_properties_for_new: false,
            resolve_for_arbitrary_load_order: true,
            default_key_type: DefaultKeyType::Int,
            use_async_save: false,
            validation_checks_on_save: true,
            validation_failure_is_error: true,
            estimated_scope_size: 64,
            parallel_threshold: 20_000,
            traversal_fanout_threshold: 0,
            max_traversal_nesting: 4,
            query_timeout_ms: None,
            serialization_mode: SerializationMode::AllRows,
        }
    }
}

impl ScopeSettings {
    pub fn from_json(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply the name pattern to a source type name.
    pub fn wrapper_name_for(&self, source_type: &str) -> String {
        self.wrapper_name_pattern.replace("{0}", source_type)
    }
}

/// Options for one `save` call.
#[derive(Clone, Default)]
pub struct SaveSettings {
    /// Restrict the candidate set to this object and its relatives.
    pub root: Option<EntityHandle>,
    /// Restrict the candidate set to exactly these objects.
    pub source_list: Option<Vec<EntityHandle>>,
    pub include_root_children: bool,
    pub include_root_parents: bool,
    /// Overrides `ScopeSettings::use_async_save`.
    pub use_async: Option<bool>,
    /// Overrides `ScopeSettings::validation_checks_on_save`.
    pub validation_checks: Option<bool>,
    /// Overrides `ScopeSettings::validation_failure_is_error`.
    pub validation_failure_is_error: Option<bool>,
    /// Rows of this type are never handed to persistence.
    pub ignore_type: Option<&'static str>,
}

impl SaveSettings {
    pub fn for_root(root: EntityHandle) -> Self {
        SaveSettings {
            root: Some(root),
            include_root_children: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let s = ScopeSettings::from_json(r#"{"merge_behavior":"FailIfDifferent"}"#).unwrap();
        assert_eq!(s.merge_behavior, MergeBehavior::FailIfDifferent);
        assert_eq!(s.parallel_threshold, 20_000);
        assert!(s.resolve_for_arbitrary_load_order);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ScopeSettings::from_json(r#"{"bogus":1}"#).is_err());
    }

    #[test]
    fn test_wrapper_name_pattern() {
        let s = ScopeSettings::default();
        assert_eq!(s.wrapper_name_for("Order"), "OrderWrapped");
    }
}
