//! Tracking kernel — external collaborators.
//!
//! The kernel never talks to storage or validation rules directly. A
//! scope is handed a `PersistenceHost` and optionally a `ValidationHost`;
//! background work the persistence side starts is joined through its
//! `CompletionRegistry`.

use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::SaveSettings;
use crate::entity::EntityHandle;
use crate::error::{OrmError, Result, ValidationMessage};
use crate::scope::ServiceScope;
use crate::tracked::TrackedHandle;
use crate::value::{FieldValue, PropertyMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// A named, registered command.
    Procedure,
    /// Command text interpreted by the collaborator.
    Text,
}

/// Per-row outcome of a save.
#[derive(Clone)]
pub struct SaveResult {
    pub item: EntityHandle,
    pub message: Option<String>,
    /// Zero on success; collaborator-defined otherwise.
    pub status: i32,
}

impl SaveResult {
    pub fn ok(item: EntityHandle) -> Self {
        SaveResult { item, message: None, status: 0 }
    }

    pub fn failed(item: EntityHandle, status: i32, message: impl Into<String>) -> Self {
        SaveResult { item, message: Some(message.into()), status }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

impl std::fmt::Debug for SaveResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveResult")
            .field("type", &self.item.read().type_name())
            .field("message", &self.message)
            .field("status", &self.status)
            .finish()
    }
}

/// Callback invoked for every column of every materialized row.
pub type ColumnCallback<'a> = &'a (dyn Fn(&str, &FieldValue) + Sync);

pub trait PersistenceHost: Send + Sync {
    /// Persist `rows` (all saveable) and report one result per row.
    fn save(
        &self,
        rows: &[TrackedHandle],
        scope: &ServiceScope,
        settings: &SaveSettings,
    ) -> Result<Vec<SaveResult>>;

    fn retrieve_all(&self, scope: &ServiceScope, type_name: &'static str) -> Result<Vec<EntityHandle>>;

    fn retrieve_by_key(
        &self,
        scope: &ServiceScope,
        type_name: &'static str,
        key: &[FieldValue],
    ) -> Result<Vec<EntityHandle>>;

    fn retrieve_by_query(
        &self,
        scope: &ServiceScope,
        type_name: &'static str,
        kind: QueryKind,
        text: &str,
        on_column: Option<ColumnCallback<'_>>,
        params: &PropertyMap,
    ) -> Result<Vec<EntityHandle>>;

    fn execute_no_result_set(&self, kind: QueryKind, text: &str, params: &PropertyMap) -> Result<usize>;

    fn completions(&self) -> &CompletionRegistry;
}

pub trait ValidationHost: Send + Sync {
    /// Empty when the object may be saved.
    fn classify(&self, object: &EntityHandle) -> Vec<ValidationMessage>;
}

// ---------------------------------------------------------------------------
// Completion registry
// ---------------------------------------------------------------------------

/// Outstanding background work plus the errors it raised.
#[derive(Default)]
pub struct CompletionRegistry {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    errors: Mutex<Vec<OrmError>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_completion_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub fn add_completion_exception(&self, err: OrmError) {
        warn!(error = %err, "background unit of work failed");
        self.errors.lock().push(err);
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Join every outstanding task, then re-raise what they captured.
    pub fn wait_on_completions(&self) -> Result<()> {
        loop {
            let batch: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                break;
            }
            for task in batch {
                if task.join().is_err() {
                    self.errors
                        .lock()
                        .push(OrmError::Persistence("background unit of work panicked".to_string()));
                }
            }
        }

        let mut errors = std::mem::take(&mut *self.errors.lock());
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            n => Err(OrmError::Persistence(format!(
                "{} background failures: {}",
                n,
                errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_rethrows_captured_error() {
        let registry = Arc::new(CompletionRegistry::new());
        let r = registry.clone();
        registry.add_completion_task(std::thread::spawn(move || {
            r.add_completion_exception(OrmError::Persistence("disk full".to_string()));
        }));
        let err = registry.wait_on_completions().unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(registry.pending(), 0);
        assert!(registry.wait_on_completions().is_ok());
    }

    #[test]
    fn test_multiple_failures_are_combined() {
        let registry = CompletionRegistry::new();
        registry.add_completion_exception(OrmError::Persistence("a".to_string()));
        registry.add_completion_exception(OrmError::Persistence("b".to_string()));
        let err = registry.wait_on_completions().unwrap_err();
        assert!(err.to_string().starts_with("Persistence: 2 background failures"));
    }
}
