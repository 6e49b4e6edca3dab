//! Connection scope — ambient access to a row store.
//!
//! Opening a connection scope makes its store the current one on this
//! thread until the scope is disposed or dropped. Disposal joins every
//! background save the store accepted and re-raises what they captured.

use std::sync::Arc;

use tracing::{debug, warn};

use orm_engine::ambient::{self, AmbientGuard};
use orm_engine::collaborators::PersistenceHost;
use orm_engine::Result;

use crate::store::RowStore;

/// Handle kept on the ambient stack.
#[derive(Clone)]
pub struct CurrentConnection {
    store: Arc<RowStore>,
}

impl CurrentConnection {
    pub fn store(&self) -> &Arc<RowStore> {
        &self.store
    }
}

pub struct ConnectionScope {
    store: Arc<RowStore>,
    guard: Option<AmbientGuard<CurrentConnection>>,
}

impl ConnectionScope {
    pub fn open(store: Arc<RowStore>) -> Self {
        let guard = ambient::push(CurrentConnection { store: store.clone() });
        debug!(depth = ambient::depth::<CurrentConnection>(), "connection scope opened");
        ConnectionScope { store, guard: Some(guard) }
    }

    /// Innermost open connection on this thread.
    pub fn current() -> Option<CurrentConnection> {
        ambient::current::<CurrentConnection>()
    }

    pub fn store(&self) -> &Arc<RowStore> {
        &self.store
    }

    /// Wait for outstanding background saves, then restore the previous
    /// ambient connection.
    pub fn dispose(mut self) -> Result<()> {
        let waited = self.store.completions().wait_on_completions();
        self.guard.take();
        waited
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if self.guard.is_some() {
            if let Err(err) = self.store.completions().wait_on_completions() {
                warn!(error = %err, "connection scope dropped with failed background work");
            }
        }
    }
}
