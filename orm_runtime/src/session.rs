//! Session manager — a scope bound to a logged store.
//!
//! Each session gets its own directory with a row log and snapshots.
//! Concurrency: Mutex for write serialization, no global mutable state.
//!
//! Save-then-snapshot order:
//!   1. scope.save(): the store logs every row it applies
//!   2. drop Unlinked rows: deleted rows leave the scope
//!   3. snapshot if interval reached

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use orm_engine::collaborators::SaveResult;
use orm_engine::hashing::canonical_hash;
use orm_engine::{EntityHandle, KeyRegistry, SaveSettings, ScopeSettings, ServiceScope};

use crate::proto_bridge::proto_to_change;
use crate::replay;
use crate::row_log::RowLog;
use crate::snapshot::{self, Snapshot};
use crate::store::RowStore;
use crate::RuntimeResult;

const LOG_FILE: &str = "rows.log";
const SNAPSHOT_DIR: &str = "snapshots";

/// An isolated unit of work with its own row log and scope.
pub struct Session {
    session_id: String,
    dir: PathBuf,
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
    store: Arc<RowStore>,
    scope: ServiceScope,
    owned: Vec<EntityHandle>,
    snapshot_interval: u64,
    saves: u64,
}

impl Session {
    /// Open or create a session in the given base directory.
    ///
    /// Directory structure:
    ///   <base_dir>/<session_id>/rows.log
    ///   <base_dir>/<session_id>/snapshots/
    ///
    /// Existing log entries are replayed into the store and every stored
    /// row is loaded into the session scope.
    pub fn open(
        base_dir: &Path,
        session_id: &str,
        registry: Arc<KeyRegistry>,
        settings: ScopeSettings,
        snapshot_interval: u64,
    ) -> RuntimeResult<Self> {
        let dir = base_dir.join(session_id);
        let log = RowLog::open(&dir.join(LOG_FILE))?;
        let existing = log.load_all_changes()?;

        let store = RowStore::with_log(log);
        for proto in &existing {
            store.restore_change(&proto_to_change(proto)?)?;
        }
        let store = Arc::new(store);
        let loaded = replay::load_scope(store.clone(), registry.clone(), settings.clone())?;
        info!(session_id, replayed = existing.len(), rows = loaded.owned.len(), "session opened");

        Ok(Self {
            session_id: session_id.to_string(),
            dir,
            registry,
            settings,
            store,
            scope: loaded.scope,
            owned: loaded.owned,
            snapshot_interval,
            saves: 0,
        })
    }

    pub fn scope(&self) -> &ServiceScope {
        &self.scope
    }

    pub fn store(&self) -> &Arc<RowStore> {
        &self.store
    }

    /// Rows loaded when the session opened.
    pub fn loaded(&self) -> &[EntityHandle] {
        &self.owned
    }

    /// Keep `object` alive for the lifetime of the session.
    pub fn hold(&mut self, object: EntityHandle) {
        self.owned.push(object);
    }

    /// Save every dirty row inline, then snapshot at the interval.
    pub fn save(&mut self) -> RuntimeResult<Vec<SaveResult>> {
        let settings = SaveSettings { use_async: Some(false), ..Default::default() };
        let results = self.scope.save(&settings)?;
        self.scope.reconcile_modified_state(None)?;
        self.saves += 1;

        if self.snapshot_interval > 0 && self.saves % self.snapshot_interval == 0 {
            let sequence = self.store.last_sequence();
            snapshot::save_snapshot(&self.dir.join(SNAPSHOT_DIR), sequence, &self.scope)?;
        }
        Ok(results)
    }

    /// Rebuild a store from the log file alone and hash the scope it
    /// loads into.
    pub fn replay_hash(&self) -> RuntimeResult<String> {
        let rebuilt = replay::rebuild_store_from_log(&self.dir.join(LOG_FILE))?;
        let loaded = replay::load_scope(Arc::new(rebuilt), self.registry.clone(), self.settings.clone())?;
        Ok(loaded.hash)
    }

    /// Canonical hash of the session scope.
    pub fn current_hash(&self) -> RuntimeResult<String> {
        Ok(canonical_hash(&self.scope)?)
    }

    pub fn latest_snapshot(&self) -> RuntimeResult<Option<Snapshot>> {
        Ok(snapshot::load_latest_snapshot(&self.dir.join(SNAPSHOT_DIR))?)
    }

    /// Sequence of the last logged change.
    pub fn current_sequence(&self) -> u64 {
        self.store.last_sequence()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Dispose the scope, surfacing background failures.
    pub fn close(self) -> RuntimeResult<()> {
        Ok(self.scope.dispose()?)
    }
}

/// Thread-safe session handle.
pub struct SharedSession {
    inner: Mutex<Session>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Mutex::new(session),
        }
    }

    /// Run `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.inner.lock();
        f(&mut session)
    }

    /// Save under lock.
    pub fn save(&self) -> RuntimeResult<Vec<SaveResult>> {
        self.inner.lock().save()
    }

    /// Current hash under lock.
    pub fn current_hash(&self) -> RuntimeResult<String> {
        self.inner.lock().current_hash()
    }

    /// Current sequence under lock.
    pub fn current_sequence(&self) -> u64 {
        self.inner.lock().current_sequence()
    }

    pub fn into_inner(self) -> Session {
        self.inner.into_inner()
    }
}
