/// Tracking kernel — canonical scope hashing.
///
/// Deterministic canonical serialization + SHA-256 hashing of everything
/// a scope tracks, independent of registration order.
///
/// Rules:
///   - Rows sorted by (base type, primary key, registration seq)
///   - Fields sorted by name; references and collections omitted
///   - Links sorted by (relation ordinal, parent key, child key)
///   - `Unlinked` rows excluded
///   - UTF-8 JSON, no whitespace

use sha2::{Digest, Sha256};
use serde_json::{Map, Value};

use crate::error::{OrmError, Result};
use crate::infra::RowState;
use crate::scope::ServiceScope;
use crate::serialization::value_to_json;
use crate::tracked::TrackedHandle;
use crate::ENGINE_VERSION;

/// Canonical serialization of a scope to UTF-8 JSON bytes.
/// Includes engine_version as the first field for identity binding.
pub fn canonical_serialize(scope: &ServiceScope) -> Result<Vec<u8>> {
    let obj = build_canonical_value(scope);
    serde_json::to_vec(&obj).map_err(|e| OrmError::Serialization(e.to_string()))
}

/// SHA-256 of canonical serialization. Lowercase hex string.
pub fn canonical_hash(scope: &ServiceScope) -> Result<String> {
    let bytes = canonical_serialize(scope)?;
    Ok(hex_digest(&bytes))
}

pub fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

fn key_text(scope: &ServiceScope, tracked: &TrackedHandle) -> String {
    scope
        .key_state()
        .pk_composite(tracked.id())
        .map(|k| k.to_string())
        .unwrap_or_default()
}

fn row_value(tracked: &TrackedHandle, key: &str) -> Value {
    let mut fields: Vec<(String, Value)> = Vec::new();
    if let Some(target) = tracked.wrapper_target() {
        let descriptors = target.read().fields();
        for desc in descriptors.iter().filter(|d| d.is_scalar()) {
            let value = tracked.get_value(desc.name).unwrap_or_default();
            if let Some(json) = value_to_json(&value) {
                fields.push((desc.name.to_string(), json));
            }
        }
    }
    if let Some(w) = tracked.infra() {
        for (name, value) in w.core().extended_fields() {
            if let Some(json) = value_to_json(&value) {
                fields.push((name, json));
            }
        }
    }
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    let mut row = Map::new();
    row.insert("type".to_string(), Value::String(tracked.base_type().to_string()));
    row.insert("key".to_string(), Value::String(key.to_string()));
    row.insert("state".to_string(), Value::String(tracked.row_state().as_str().to_string()));
    row.insert("fields".to_string(), Value::Object(fields.into_iter().collect()));
    Value::Object(row)
}

/// Build the canonical value in strict field order.
///
/// Field order: engine_version, rows, links
fn build_canonical_value(scope: &ServiceScope) -> Value {
    let mut rows: Vec<(&'static str, String, u64, TrackedHandle)> = scope
        .all_tracked()
        .into_iter()
        .filter(|t| t.is_alive() && t.row_state() != RowState::Unlinked)
        .map(|t| (t.base_type(), key_text(scope, &t), t.seq(), t))
        .collect();
    rows.sort_by(|a, b| (a.0, &a.1, a.2).cmp(&(b.0, &b.1, b.2)));

    let state = scope.key_state();
    let mut links: Vec<(usize, String, String)> = Vec::new();
    for (_, _, _, tracked) in &rows {
        for record in state.children_fk(tracked.id()) {
            let (Some(parent), Some(child)) = (record.parent(), record.child()) else {
                continue;
            };
            links.push((
                record.relation().ordinal(),
                key_text(scope, &parent),
                key_text(scope, &child),
            ));
        }
    }
    links.sort();

    let rows_list: Vec<Value> = rows.iter().map(|(_, key, _, t)| row_value(t, key)).collect();
    let links_list: Vec<Value> = links
        .into_iter()
        .map(|(ordinal, parent, child)| {
            let mut link = Map::new();
            link.insert("relation".to_string(), Value::from(ordinal as u64));
            link.insert("parent".to_string(), Value::String(parent));
            link.insert("child".to_string(), Value::String(child));
            Value::Object(link)
        })
        .collect();

    // engine_version MUST be first
    let mut root = Map::new();
    root.insert("engine_version".to_string(), Value::from(ENGINE_VERSION as u64));
    root.insert("rows".to_string(), Value::Array(rows_list));
    root.insert("links".to_string(), Value::Array(links_list));
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digest_is_lowercase_sha256() {
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
