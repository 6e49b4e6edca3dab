//! Replay orchestrator — rebuild a store and a scope from a row log.
//!
//! Changes are applied in log order to a fresh store without being
//! re-logged; the scope is then loaded from the store the way any
//! caller would load it.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use orm_engine::collaborators::PersistenceHost;
use orm_engine::hashing::canonical_hash;
use orm_engine::{EntityHandle, KeyRegistry, OrmError, ScopeSettings, ServiceScope};

use crate::proto_bridge::proto_to_change;
use crate::proto_types::ProtoRowChange;
use crate::row_log::RowLog;
use crate::store::RowStore;
use crate::RuntimeResult;

/// A scope loaded from a store, with the handles that keep its rows alive.
pub struct Rebuilt {
    pub scope: ServiceScope,
    pub owned: Vec<EntityHandle>,
    pub hash: String,
}

/// Apply `changes` in order to an empty store.
pub fn rebuild_store(changes: &[ProtoRowChange]) -> RuntimeResult<RowStore> {
    let store = RowStore::new();
    for proto in changes {
        let change = proto_to_change(proto)?;
        store.restore_change(&change)?;
    }
    info!(changes = changes.len(), "store rebuilt");
    Ok(store)
}

/// Read the log at `path` and rebuild its store.
pub fn rebuild_store_from_log(path: &Path) -> RuntimeResult<RowStore> {
    let changes = RowLog::read_all_from_file(path)?;
    rebuild_store(&changes)
}

/// Load every stored row into a fresh scope backed by `store`.
pub fn load_scope(
    store: Arc<RowStore>,
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
) -> RuntimeResult<Rebuilt> {
    let host: Arc<dyn PersistenceHost> = store.clone();
    let scope = ServiceScope::with_collaborators(registry, settings, Some(host), None);
    let mut owned = Vec::new();
    for table in store.table_names() {
        let type_name = scope
            .registry()
            .resolve_type_name(&table)
            .ok_or_else(|| OrmError::invalid(format!("stored type {} is not registered", table)))?;
        owned.extend(store.retrieve_all(&scope, type_name)?);
    }
    scope.cleanup_service_states();
    let hash = canonical_hash(&scope)?;
    Ok(Rebuilt { scope, owned, hash })
}

/// Rebuild from a change list and return only the canonical hash.
pub fn rebuild_hash(
    changes: &[ProtoRowChange],
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
) -> RuntimeResult<String> {
    let store = Arc::new(rebuild_store(changes)?);
    Ok(load_scope(store, registry, settings)?.hash)
}
