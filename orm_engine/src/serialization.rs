//! Tracking kernel — serialization boundary.
//!
//! Nested key-value form of tracked objects built on `serde_json::Value`.
//! Reserved markers:
//!
//!   "$type"   base type name
//!   "$state"  row state
//!   "$ref"    key-only stub pointing at an object serialized elsewhere
//!
//! Scalar fields map to JSON scalars, parent references to nested objects
//! and child collections to arrays. `serialize_scope` is single level;
//! `serialize_object` nests parents and children.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::SerializationMode;
use crate::entity::{descriptor_of, same_entity, EntityHandle, EntityId, FieldKind};
use crate::error::{OrmError, Result};
use crate::infra::RowState;
use crate::scope::ServiceScope;
use crate::tracked::TrackedHandle;
use crate::value::{FieldValue, PropertyMap, ValueKind};

pub const TYPE_MARKER: &str = "$type";
pub const STATE_MARKER: &str = "$state";
pub const REF_MARKER: &str = "$ref";

// ---------------------------------------------------------------------------
// Value mapping
// ---------------------------------------------------------------------------

/// JSON form of a scalar; `None` for references and collections.
pub fn value_to_json(value: &FieldValue) -> Option<Value> {
    Some(match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Int(v) => Value::from(*v),
        FieldValue::Long(v) => Value::from(*v),
        FieldValue::Double(v) => Value::from(*v),
        FieldValue::Text(s) => Value::String(s.clone()),
        FieldValue::Guid(g) => Value::String(g.to_string()),
        FieldValue::Ref(_) | FieldValue::List(_) | FieldValue::Set(_) => return None,
    })
}

/// Scalar from JSON, coerced to the declared kind when one is known.
pub fn json_to_value(json: &Value, kind: Option<ValueKind>) -> Result<FieldValue> {
    let raw = match json {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(v) => FieldValue::Long(v),
            None => FieldValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => FieldValue::Text(s.clone()),
        other => {
            return Err(OrmError::Serialization(format!("expected a scalar, found {}", other)));
        }
    };
    Ok(match kind {
        Some(kind) => raw.coerce(kind),
        None => raw,
    })
}

fn type_marker(row: &Map<String, Value>) -> Result<&str> {
    row.get(TYPE_MARKER)
        .and_then(Value::as_str)
        .ok_or_else(|| OrmError::Serialization(format!("row without {}", TYPE_MARKER)))
}

fn state_marker(row: &Map<String, Value>) -> Result<RowState> {
    match row.get(STATE_MARKER).and_then(Value::as_str) {
        None => Ok(RowState::Unchanged),
        Some(text) => RowState::parse(text)
            .ok_or_else(|| OrmError::Serialization(format!("unknown row state {}", text))),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Scalars, extended and shadow bag values of one tracked row.
fn scalar_fields(tracked: &TrackedHandle, out: &mut Map<String, Value>) {
    let Some(target) = tracked.wrapper_target() else {
        return;
    };
    let fields = target.read().fields();
    for desc in fields.iter().filter(|d| d.is_scalar()) {
        let value = tracked.get_value(desc.name).unwrap_or_default();
        if let Some(json) = value_to_json(&value) {
            out.insert(desc.name.to_string(), json);
        }
    }
    if let Some(w) = tracked.infra() {
        for (name, value) in w.core().extended_fields().into_iter().chain(w.core().shadow_fields()) {
            if let Some(json) = value_to_json(&value) {
                out.insert(name, json);
            }
        }
    }
}

fn key_stub(scope: &ServiceScope, tracked: &TrackedHandle) -> Value {
    let mut stub = Map::new();
    stub.insert(TYPE_MARKER.to_string(), Value::String(tracked.base_type().to_string()));
    stub.insert(REF_MARKER.to_string(), Value::Bool(true));
    for field in scope.registry().key_fields(tracked.base_type()) {
        let value = tracked.get_value(field).unwrap_or_default();
        if let Some(json) = value_to_json(&value) {
            stub.insert(field.to_string(), json);
        }
    }
    Value::Object(stub)
}

fn header(tracked: &TrackedHandle) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert(TYPE_MARKER.to_string(), Value::String(tracked.base_type().to_string()));
    row.insert(STATE_MARKER.to_string(), Value::String(tracked.row_state().as_str().to_string()));
    row
}

/// Every tracked row, one level deep: parent references become key stubs.
/// Row states are reconciled first.
pub fn serialize_scope(scope: &ServiceScope, mode: SerializationMode) -> Result<Value> {
    scope.reconcile_modified_state(None)?;
    let mut rows = Vec::new();
    for tracked in scope.all_tracked() {
        let state = tracked.row_state();
        if state == RowState::Unlinked {
            continue;
        }
        if mode == SerializationMode::OnlyChanged && matches!(state, RowState::Unchanged | RowState::Deleted) {
            continue;
        }
        let mut row = header(&tracked);
        scalar_fields(&tracked, &mut row);
        for record in scope.key_state().parents_fk(tracked.id()) {
            if let (Some(prop), Some(parent)) = (record.relation().parent_property(), record.parent()) {
                row.insert(prop.to_string(), key_stub(scope, &parent));
            }
        }
        rows.push(Value::Object(row));
    }
    debug!(rows = rows.len(), ?mode, "scope serialized");
    Ok(Value::Array(rows))
}

/// `object` with its parents and children nested. Objects already written
/// elsewhere in the tree appear as key stubs.
pub fn serialize_object(scope: &ServiceScope, object: &EntityHandle) -> Result<Value> {
    let tracked = scope
        .get_tracked(object)
        .ok_or_else(|| OrmError::tracking("object is not tracked in this scope"))?;
    let mut visited = HashSet::new();
    Ok(encode_nested(scope, &tracked, &mut visited))
}

fn encode_nested(scope: &ServiceScope, tracked: &TrackedHandle, visited: &mut HashSet<EntityId>) -> Value {
    if !visited.insert(tracked.id()) {
        return key_stub(scope, tracked);
    }
    let mut row = header(tracked);
    scalar_fields(tracked, &mut row);
    let state = scope.key_state();

    for record in state.parents_fk(tracked.id()) {
        if let (Some(prop), Some(parent)) = (record.relation().parent_property(), record.parent()) {
            row.insert(prop.to_string(), encode_nested(scope, &parent, visited));
        }
    }

    let mut children: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for record in state.children_fk(tracked.id()) {
        let (Some(prop), Some(child)) = (record.relation().child_property(), record.child()) else {
            continue;
        };
        let encoded = encode_nested(scope, &child, visited);
        match children.iter_mut().find(|(p, _)| *p == prop) {
            Some((_, list)) => list.push(encoded),
            None => children.push((prop, vec![encoded])),
        }
    }
    for (prop, list) in children {
        row.insert(prop.to_string(), Value::Array(list));
    }
    Value::Object(row)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Instantiate and track one row. Nested parents resolve to tracked
/// objects; nested child arrays are skipped.
fn decode_row(scope: &ServiceScope, row: &Map<String, Value>, owned: &mut Vec<EntityHandle>) -> Result<EntityHandle> {
    let registry = scope.registry();
    let name = type_marker(row)?;
    let object = registry.create(name)?;
    let state = state_marker(row)?;

    let mut props = PropertyMap::new();
    {
        let guard = object.read();
        for (key, json) in row {
            if key.starts_with('$') {
                continue;
            }
            match guard.field(key).map(|d| d.kind) {
                Some(FieldKind::Scalar(kind)) => {
                    props.insert(key.clone(), json_to_value(json, Some(kind))?);
                }
                Some(FieldKind::Parent(_)) | Some(FieldKind::Children(_)) => {}
                None => {
                    props.insert(key.clone(), json_to_value(json, None)?);
                }
            }
        }
    }

    let parent_fields: Vec<(&'static str, &Map<String, Value>)> = {
        let guard = object.read();
        guard
            .fields()
            .iter()
            .filter(|d| matches!(d.kind, FieldKind::Parent(_)))
            .filter_map(|d| row.get(d.name).and_then(Value::as_object).map(|m| (d.name, m)))
            .collect()
    };
    for (field, nested) in parent_fields {
        if let Some(parent) = resolve_nested(scope, nested, owned)? {
            props.insert(field.to_string(), FieldValue::Ref(parent));
        }
    }

    scope.include_with(&object, Some(state), Some(&props))?;
    owned.push(object.clone());
    Ok(object)
}

fn resolve_nested(
    scope: &ServiceScope,
    nested: &Map<String, Value>,
    owned: &mut Vec<EntityHandle>,
) -> Result<Option<EntityHandle>> {
    if nested.get(REF_MARKER).and_then(Value::as_bool) != Some(true) {
        return decode_nested(scope, nested, owned).map(Some);
    }
    let registry = scope.registry();
    let name = type_marker(nested)?;
    let Some(type_name) = registry.resolve_type_name(name) else {
        return Err(OrmError::Serialization(format!("unknown type {}", name)));
    };
    let probe = registry.create(type_name).ok();
    let kind_of = |field: &str| match probe.as_ref().and_then(|p| descriptor_of(p, field)).map(|d| d.kind) {
        Some(FieldKind::Scalar(kind)) => Some(kind),
        _ => None,
    };
    let values = registry
        .key_fields(type_name)
        .iter()
        .map(|f| json_to_value(nested.get(*f).unwrap_or(&Value::Null), kind_of(f)))
        .collect::<Result<Vec<_>>>()?;
    Ok(scope
        .get_tracked_by_pk_value(type_name, &values)?
        .and_then(|t| t.wrapper_target()))
}

fn decode_nested(scope: &ServiceScope, row: &Map<String, Value>, owned: &mut Vec<EntityHandle>) -> Result<EntityHandle> {
    let object = decode_row(scope, row, owned)?;
    let child_arrays: Vec<&Vec<Value>> = {
        let guard = object.read();
        guard
            .fields()
            .iter()
            .filter(|d| matches!(d.kind, FieldKind::Children(_)))
            .filter_map(|d| row.get(d.name).and_then(Value::as_array))
            .collect()
    };
    for items in child_arrays {
        for item in items {
            if let Some(map) = item.as_object() {
                resolve_nested(scope, map, owned)?;
            }
        }
    }
    Ok(object)
}

/// Recreate every row of a `serialize_scope` document in `scope`. The
/// returned handles own the new objects.
pub fn deserialize_scope(scope: &ServiceScope, document: &Value) -> Result<Vec<EntityHandle>> {
    let rows = document
        .as_array()
        .ok_or_else(|| OrmError::Serialization("scope document must be an array".to_string()))?;
    let mut owned = Vec::with_capacity(rows.len());
    for row in rows {
        let map = row
            .as_object()
            .ok_or_else(|| OrmError::Serialization("row must be an object".to_string()))?;
        decode_row(scope, map, &mut owned)?;
    }
    scope.cleanup_service_states();
    debug!(rows = owned.len(), "scope deserialized");
    Ok(owned)
}

/// Recreate a `serialize_object` tree. The root comes first in the result.
pub fn deserialize_object(scope: &ServiceScope, document: &Value) -> Result<Vec<EntityHandle>> {
    let map = document
        .as_object()
        .ok_or_else(|| OrmError::Serialization("object document must be an object".to_string()))?;
    let mut owned = Vec::new();
    let root = decode_nested(scope, map, &mut owned)?;
    owned.retain(|o| !same_entity(o, &root));
    owned.insert(0, root);
    Ok(owned)
}
