//! Drift detection — determinism verification and scope comparison.
//!
//! Both scopes are reduced to the kernel's canonical form first, so the
//! comparison ignores registration order and object identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use orm_engine::hashing::{canonical_serialize, hex_digest};
use orm_engine::{KeyRegistry, ScopeSettings, ServiceScope};

use crate::proto_types::ProtoRowChange;
use crate::replay;
use crate::snapshot_codec::{encode_snapshot, restore_snapshot};
use crate::{RuntimeError, RuntimeResult};

/// Structured difference between two scopes. Rows are named by their
/// composite key text, e.g. `Order(10)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDrift {
    pub row_count_a: usize,
    pub row_count_b: usize,
    pub row_count_delta: i64,
    pub link_count_a: usize,
    pub link_count_b: usize,
    pub link_count_delta: i64,
    /// Present in b only.
    pub added_rows: Vec<String>,
    /// Present in a only.
    pub removed_rows: Vec<String>,
    /// Present in both with a different state or different values.
    pub changed_rows: Vec<String>,
    pub hash_a: String,
    pub hash_b: String,
}

impl ScopeDrift {
    pub fn is_clean(&self) -> bool {
        self.hash_a == self.hash_b
    }
}

struct Canonical {
    rows: BTreeMap<String, Value>,
    links: usize,
    hash: String,
}

fn canonical(scope: &ServiceScope) -> RuntimeResult<Canonical> {
    let bytes = canonical_serialize(scope)?;
    let hash = hex_digest(&bytes);
    let value: Value = serde_json::from_slice(&bytes)?;

    let mut rows = BTreeMap::new();
    for (i, row) in value["rows"].as_array().into_iter().flatten().enumerate() {
        let key = row["key"].as_str().unwrap_or_default();
        let name = if key.is_empty() {
            format!("{}#{}", row["type"].as_str().unwrap_or_default(), i)
        } else {
            key.to_string()
        };
        rows.insert(name, row.clone());
    }
    let links = value["links"].as_array().map_or(0, Vec::len);
    Ok(Canonical { rows, links, hash })
}

/// Structured scope comparison.
pub fn compare_scopes(a: &ServiceScope, b: &ServiceScope) -> RuntimeResult<ScopeDrift> {
    let ca = canonical(a)?;
    let cb = canonical(b)?;

    let added_rows = cb.rows.keys().filter(|k| !ca.rows.contains_key(*k)).cloned().collect();
    let removed_rows = ca.rows.keys().filter(|k| !cb.rows.contains_key(*k)).cloned().collect();
    let changed_rows = ca
        .rows
        .iter()
        .filter(|(k, row)| cb.rows.get(*k).is_some_and(|other| other != *row))
        .map(|(k, _)| k.clone())
        .collect();

    Ok(ScopeDrift {
        row_count_a: ca.rows.len(),
        row_count_b: cb.rows.len(),
        row_count_delta: cb.rows.len() as i64 - ca.rows.len() as i64,
        link_count_a: ca.links,
        link_count_b: cb.links,
        link_count_delta: cb.links as i64 - ca.links as i64,
        added_rows,
        removed_rows,
        changed_rows,
        hash_a: ca.hash,
        hash_b: cb.hash,
    })
}

/// Encode `scope`, restore the document into a fresh scope and compare
/// the two.
pub fn verify_round_trip(
    scope: &ServiceScope,
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
) -> RuntimeResult<ScopeDrift> {
    let json = encode_snapshot(scope)?;
    let copy = ServiceScope::new(registry, settings);
    let owned = restore_snapshot(&copy, &json)?;
    let drift = compare_scopes(scope, &copy);
    drop(owned);
    drift
}

/// Replay the same changes twice and require identical hashes.
pub fn verify_determinism(
    changes: &[ProtoRowChange],
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
) -> RuntimeResult<String> {
    let first = replay::rebuild_hash(changes, registry.clone(), settings.clone())?;
    let second = replay::rebuild_hash(changes, registry, settings)?;
    if first != second {
        return Err(RuntimeError::Drift(format!(
            "two replays produced different hashes: {} vs {}",
            first, second
        )));
    }
    Ok(first)
}
