//! In-memory row store — the reference persistence collaborator.
//!
//! Rows live in keyed tables, one per base type. A save applies rows in
//! a fixed order:
//!
//!   ModifiedPriority → Added (parents first) → Modified → Deleted (children first)
//!
//! Added rows holding a surrogate (negative) integral key receive the
//! table's next identity through the scope, so the kernel re-indexes the
//! row and copies the key onto its children before they are inserted.
//!
//! Retrieval materializes stored rows into the calling scope as
//! `Unchanged` rows; an equal-key row already tracked absorbs the values.
//! Every applied change is appended to the row log when one is attached.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use orm_engine::cancel::{CancellationToken, TimeoutWatch};
use orm_engine::collaborators::{ColumnCallback, CompletionRegistry, PersistenceHost, QueryKind, SaveResult};
use orm_engine::composite::{CompositeItem, CompositeKey};
use orm_engine::key_service::KeyService;
use orm_engine::tracked::TrackedHandle;
use orm_engine::{
    EntityHandle, FieldValue, OrmError, PropertyMap, Result, RowState, SaveSettings, ServiceScope,
};

use crate::proto_bridge::change_to_proto;
use crate::row_log::RowLog;

/// Status reported for an insert whose key is already stored.
pub const STATUS_DUPLICATE_KEY: i32 = 1;
/// Status reported for a delete whose row is not stored.
pub const STATUS_MISSING_ROW: i32 = 2;
/// Status reported for a row the store could not describe or write.
pub const STATUS_STORE_ERROR: i32 = 3;

/// Predicate over a stored row and the query parameters.
pub type NamedQuery = Arc<dyn Fn(&PropertyMap, &PropertyMap) -> bool + Send + Sync>;

/// One row operation as applied to a table and written to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub type_name: String,
    pub state: RowState,
    /// Key fields in registration order.
    pub key: Vec<(String, FieldValue)>,
    /// Every persisted column, keys included. Empty for deletes.
    pub fields: PropertyMap,
}

impl RowChange {
    fn key_items(&self) -> Result<Vec<CompositeItem>> {
        self.key.iter().map(|(_, v)| CompositeItem::from_value(v)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Table {
    key_names: Vec<String>,
    rows: BTreeMap<Vec<CompositeItem>, PropertyMap>,
    next_identity: i64,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &PropertyMap> {
        self.rows.values()
    }

    pub fn get(&self, key: &[CompositeItem]) -> Option<&PropertyMap> {
        self.rows.get(key)
    }

    fn contains(&self, key: &[CompositeItem]) -> bool {
        self.rows.contains_key(key)
    }

    fn upsert(&mut self, change: &RowChange, key: Vec<CompositeItem>) {
        if self.key_names.is_empty() {
            self.key_names = change.key.iter().map(|(n, _)| n.clone()).collect();
        }
        if let [CompositeItem::Whole(k)] = key.as_slice() {
            if *k >= self.next_identity {
                self.next_identity = k + 1;
            }
        }
        self.rows.insert(key, change.fields.clone());
    }

    fn allocate_identity(&mut self) -> i64 {
        let id = self.next_identity.max(1);
        self.next_identity = id + 1;
        id
    }

    fn key_of(&self, row: &PropertyMap) -> Vec<(String, FieldValue)> {
        self.key_names
            .iter()
            .map(|n| (n.clone(), row.get(n).cloned().unwrap_or_default()))
            .collect()
    }
}

enum Applied {
    Done,
    Rejected(i32, String),
}

struct NamedCommand {
    type_name: String,
    predicate: NamedQuery,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Keyed tables plus the named queries and commands run against them.
pub struct RowStore {
    tables: RwLock<BTreeMap<String, Table>>,
    queries: RwLock<HashMap<String, NamedQuery>>,
    commands: RwLock<HashMap<String, NamedCommand>>,
    log: Option<Mutex<RowLog>>,
    completions: CompletionRegistry,
}

impl Default for RowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore {
    pub fn new() -> Self {
        RowStore {
            tables: RwLock::new(BTreeMap::new()),
            queries: RwLock::new(HashMap::new()),
            commands: RwLock::new(HashMap::new()),
            log: None,
            completions: CompletionRegistry::new(),
        }
    }

    /// Store whose applied changes are appended to `log`.
    pub fn with_log(log: RowLog) -> Self {
        RowStore { log: Some(Mutex::new(log)), ..Self::new() }
    }

    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    /// Sequence of the last logged change, zero without a log.
    pub fn last_sequence(&self) -> u64 {
        self.log.as_ref().map_or(0, |l| l.lock().last_sequence())
    }

    pub fn register_query<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&PropertyMap, &PropertyMap) -> bool + Send + Sync + 'static,
    {
        self.queries.write().insert(name.into(), Arc::new(predicate));
    }

    /// Register a named command that deletes the rows of `type_name`
    /// matching `predicate`.
    pub fn register_command<F>(&self, name: impl Into<String>, type_name: impl Into<String>, predicate: F)
    where
        F: Fn(&PropertyMap, &PropertyMap) -> bool + Send + Sync + 'static,
    {
        let command = NamedCommand { type_name: type_name.into(), predicate: Arc::new(predicate) };
        self.commands.write().insert(name.into(), command);
    }

    pub fn row_count(&self, type_name: &str) -> usize {
        self.tables.read().get(type_name).map_or(0, Table::len)
    }

    pub fn rows(&self, type_name: &str) -> Vec<PropertyMap> {
        self.tables
            .read()
            .get(type_name)
            .map(|t| t.rows().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, type_name: &str, key: &[FieldValue]) -> Result<Option<PropertyMap>> {
        let items = key.iter().map(CompositeItem::from_value).collect::<Result<Vec<_>>>()?;
        Ok(self.tables.read().get(type_name).and_then(|t| t.get(&items).cloned()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Copy of every table, for comparisons.
    pub fn tables(&self) -> BTreeMap<String, Table> {
        self.tables.read().clone()
    }

    /// Apply a change read back from a log. Nothing is re-logged.
    pub fn restore_change(&self, change: &RowChange) -> Result<()> {
        match self.apply(change, false)? {
            Applied::Done => Ok(()),
            Applied::Rejected(_, message) => Err(OrmError::Persistence(message)),
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn apply(&self, change: &RowChange, log: bool) -> Result<Applied> {
        // Lock order: log, then tables.
        let mut log_guard = if log { self.log.as_ref().map(|l| l.lock()) } else { None };
        let mut tables = self.tables.write();
        let table = tables.entry(change.type_name.clone()).or_default();
        let key = change.key_items()?;

        match change.state {
            RowState::Added if table.contains(&key) => {
                return Ok(Applied::Rejected(
                    STATUS_DUPLICATE_KEY,
                    format!("{} {:?} is already stored", change.type_name, key),
                ));
            }
            RowState::Deleted if !table.contains(&key) => {
                return Ok(Applied::Rejected(
                    STATUS_MISSING_ROW,
                    format!("{} {:?} is not stored", change.type_name, key),
                ));
            }
            RowState::Unchanged | RowState::Unlinked => return Ok(Applied::Done),
            _ => {}
        }

        if let Some(log) = log_guard.as_mut() {
            let sequence = log
                .append_next(change_to_proto(0, change))
                .map_err(|e| OrmError::Persistence(format!("row log append failed: {}", e)))?;
            debug!(sequence, type_name = %change.type_name, state = %change.state, "row change logged");
        }

        match change.state {
            RowState::Deleted => {
                table.rows.remove(&key);
            }
            _ => table.upsert(change, key),
        }
        Ok(Applied::Done)
    }

    /// Give an added row with a surrogate key the table's next identity.
    fn assign_identity(&self, scope: &ServiceScope, tracked: &TrackedHandle, item: &EntityHandle) -> Result<()> {
        let type_name = tracked.base_type();
        let [field] = scope.registry().key_fields(type_name) else {
            return Ok(());
        };
        let current = tracked.get_value(field).unwrap_or_default();
        if !current.as_i64().is_some_and(|v| v < 0) {
            return Ok(());
        }
        let id = self.tables.write().entry(type_name.to_string()).or_default().allocate_identity();
        let assigned = match current {
            FieldValue::Int(_) => FieldValue::Int(
                i32::try_from(id).map_err(|_| OrmError::Persistence(format!("{} identity overflow", type_name)))?,
            ),
            _ => FieldValue::Long(id),
        };
        debug!(type_name, field, id, "identity assigned");
        scope.set_property(item, field, assigned)?;
        Ok(())
    }

    fn change_for(&self, scope: &ServiceScope, tracked: &TrackedHandle, state: RowState) -> Result<RowChange> {
        let type_name = tracked.base_type();
        let key_fields = scope.registry().key_fields(type_name);
        if key_fields.is_empty() {
            return Err(OrmError::invalid(format!("{} has no registered key to store by.", type_name)));
        }
        let key = key_fields
            .iter()
            .map(|f| (f.to_string(), tracked.get_value(f).unwrap_or_default()))
            .collect();
        let fields = if state == RowState::Deleted { PropertyMap::new() } else { row_values(tracked) };
        Ok(RowChange { type_name: type_name.to_string(), state, key, fields })
    }

    fn store_row(
        &self,
        scope: &ServiceScope,
        tracked: &TrackedHandle,
        item: &EntityHandle,
        state: RowState,
    ) -> Result<Applied> {
        if state == RowState::Added {
            self.assign_identity(scope, tracked, item)?;
        }
        let change = self.change_for(scope, tracked, state)?;
        self.apply(&change, true)
    }

    fn delete_matching(
        &self,
        type_name: &str,
        predicate: &dyn Fn(&PropertyMap) -> bool,
    ) -> Result<usize> {
        let doomed: Vec<RowChange> = {
            let tables = self.tables.read();
            let Some(table) = tables.get(type_name) else {
                return Ok(0);
            };
            table
                .rows()
                .filter(|row| predicate(row))
                .map(|row| RowChange {
                    type_name: type_name.to_string(),
                    state: RowState::Deleted,
                    key: table.key_of(row),
                    fields: PropertyMap::new(),
                })
                .collect()
        };
        let mut deleted = 0;
        for change in &doomed {
            if let Applied::Done = self.apply(change, true)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn matching_rows(
        &self,
        type_name: &str,
        token: &CancellationToken,
        predicate: &dyn Fn(&PropertyMap) -> bool,
    ) -> Result<Vec<PropertyMap>> {
        let candidates = self.rows(type_name);
        let mut rows = Vec::new();
        for row in candidates {
            token.check(type_name)?;
            if predicate(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn materialize(
        &self,
        scope: &ServiceScope,
        type_name: &'static str,
        rows: Vec<PropertyMap>,
        token: &CancellationToken,
        on_column: Option<ColumnCallback<'_>>,
    ) -> Result<Vec<EntityHandle>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            token.check(type_name)?;
            if let Some(callback) = on_column {
                for (name, value) in &row {
                    callback(name, value);
                }
            }
            let object = scope.registry().create(type_name)?;
            let tracked = scope.include_with(&object, Some(RowState::Unchanged), Some(&row))?;
            out.push(tracked.wrapper_target().unwrap_or(object));
        }
        debug!(type_name, rows = out.len(), "rows materialized");
        Ok(out)
    }

    fn read_with<P>(
        &self,
        scope: &ServiceScope,
        type_name: &'static str,
        on_column: Option<ColumnCallback<'_>>,
        predicate: P,
    ) -> Result<Vec<EntityHandle>>
    where
        P: Fn(&PropertyMap) -> bool,
    {
        let token = CancellationToken::new();
        let _watch = scope
            .settings()
            .query_timeout_ms
            .map(|ms| TimeoutWatch::start(token.clone(), Duration::from_millis(ms)));
        let rows = self.matching_rows(type_name, &token, &predicate)?;
        self.materialize(scope, type_name, rows, &token, on_column)
    }
}

/// Scalar and extended values of a tracked row.
fn row_values(tracked: &TrackedHandle) -> PropertyMap {
    let mut values = PropertyMap::new();
    if let Some(target) = tracked.wrapper_target() {
        let fields = target.read().fields();
        for desc in fields.iter().filter(|d| d.is_scalar()) {
            values.insert(desc.name.to_string(), tracked.get_value(desc.name).unwrap_or_default());
        }
    }
    if let Some(w) = tracked.infra() {
        for (name, value) in w.core().extended_fields() {
            if value.is_scalar() {
                values.insert(name, value);
            }
        }
    }
    values
}

/// Rows grouped into the order they are applied in.
fn save_order(scope: &ServiceScope, rows: &[TrackedHandle]) -> Vec<TrackedHandle> {
    let level = |t: &TrackedHandle| {
        t.wrapper_target()
            .map_or(0, |o| KeyService::object_nest_level(scope, &o))
    };
    let mut priority = Vec::new();
    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    for row in rows {
        match row.row_state() {
            RowState::ModifiedPriority => priority.push(row.clone()),
            RowState::Added => inserts.push((level(row), row.clone())),
            RowState::Modified => updates.push(row.clone()),
            RowState::Deleted => deletes.push((level(row), row.clone())),
            RowState::Unchanged | RowState::Unlinked => {}
        }
    }
    inserts.sort_by_key(|(l, _)| *l);
    deletes.sort_by_key(|(l, _)| Reverse(*l));

    priority
        .into_iter()
        .chain(inserts.into_iter().map(|(_, r)| r))
        .chain(updates)
        .chain(deletes.into_iter().map(|(_, r)| r))
        .collect()
}

// ---------------------------------------------------------------------------
// Command text
// ---------------------------------------------------------------------------

/// `field = @param [and field = @param ...]`; empty text matches every row.
fn parse_clauses(text: &str) -> Result<Vec<(String, String)>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(" and ")
        .map(|clause| {
            let (field, param) = clause
                .split_once('=')
                .ok_or_else(|| OrmError::invalid(format!("expected `field = @param`, got `{}`", clause.trim())))?;
            let field = field.trim();
            let param = param
                .trim()
                .strip_prefix('@')
                .ok_or_else(|| OrmError::invalid(format!("parameter expected in `{}`", clause.trim())))?;
            if field.is_empty() || param.is_empty() {
                return Err(OrmError::invalid(format!("incomplete clause `{}`", clause.trim())));
            }
            Ok((field.to_string(), param.to_string()))
        })
        .collect()
}

fn clause_predicate(
    clauses: Vec<(String, String)>,
    params: &PropertyMap,
) -> Result<impl Fn(&PropertyMap) -> bool> {
    let bound = clauses
        .into_iter()
        .map(|(field, param)| {
            params
                .get(&param)
                .cloned()
                .map(|value| (field, value))
                .ok_or_else(|| OrmError::invalid(format!("missing parameter @{}", param)))
        })
        .collect::<Result<Vec<(String, FieldValue)>>>()?;
    Ok(move |row: &PropertyMap| {
        bound
            .iter()
            .all(|(field, value)| row.get(field).cloned().unwrap_or_default() == *value)
    })
}

/// `delete <Type> [where <clauses>]`
fn parse_delete(text: &str) -> Result<(String, Vec<(String, String)>)> {
    let rest = text
        .trim()
        .strip_prefix("delete ")
        .ok_or_else(|| OrmError::invalid(format!("unsupported command `{}`", text.trim())))?;
    let (type_name, clauses) = match rest.split_once(" where ") {
        Some((t, c)) => (t.trim(), parse_clauses(c)?),
        None => (rest.trim(), Vec::new()),
    };
    if type_name.is_empty() {
        return Err(OrmError::invalid("delete command names no type"));
    }
    Ok((type_name.to_string(), clauses))
}

// ---------------------------------------------------------------------------
// Collaborator
// ---------------------------------------------------------------------------

impl PersistenceHost for RowStore {
    /// Rows are applied one at a time; a batch is not atomic. A row that
    /// fails is reported in its `SaveResult` and the rest of the batch
    /// still runs.
    fn save(&self, rows: &[TrackedHandle], scope: &ServiceScope, _settings: &SaveSettings) -> Result<Vec<SaveResult>> {
        let mut results = Vec::with_capacity(rows.len());
        for tracked in save_order(scope, rows) {
            let Some(item) = tracked.wrapper_target() else {
                continue;
            };
            let state = tracked.row_state();
            match self.store_row(scope, &tracked, &item, state) {
                Ok(Applied::Done) => {
                    if state == RowState::Deleted {
                        tracked.set_row_state(RowState::Unlinked);
                    } else {
                        tracked.accept_changes();
                    }
                    results.push(SaveResult::ok(item));
                }
                Ok(Applied::Rejected(status, message)) => {
                    results.push(SaveResult::failed(item, status, message));
                }
                Err(err) => {
                    warn!(type_name = tracked.base_type(), error = %err, "row not stored");
                    results.push(SaveResult::failed(item, STATUS_STORE_ERROR, err.to_string()));
                }
            }
        }
        info!(rows = results.len(), failed = results.iter().filter(|r| !r.is_ok()).count(), "rows stored");
        Ok(results)
    }

    fn retrieve_all(&self, scope: &ServiceScope, type_name: &'static str) -> Result<Vec<EntityHandle>> {
        self.read_with(scope, type_name, None, |_| true)
    }

    fn retrieve_by_key(
        &self,
        scope: &ServiceScope,
        type_name: &'static str,
        key: &[FieldValue],
    ) -> Result<Vec<EntityHandle>> {
        let wanted = CompositeKey::new(type_name, key)?;
        let names = scope.registry().key_fields(type_name);
        if names.len() != wanted.arity() {
            return Err(OrmError::invalid(format!(
                "{} expects {} key value(s), got {}",
                type_name,
                names.len(),
                wanted.arity()
            )));
        }
        self.read_with(scope, type_name, None, |row| {
            names
                .iter()
                .zip(wanted.items())
                .all(|(n, item)| {
                    row.get(*n)
                        .and_then(|v| CompositeItem::from_value(v).ok())
                        .is_some_and(|stored| stored == *item)
                })
        })
    }

    fn retrieve_by_query(
        &self,
        scope: &ServiceScope,
        type_name: &'static str,
        kind: QueryKind,
        text: &str,
        on_column: Option<ColumnCallback<'_>>,
        params: &PropertyMap,
    ) -> Result<Vec<EntityHandle>> {
        match kind {
            QueryKind::Procedure => {
                let query = self
                    .queries
                    .read()
                    .get(text)
                    .cloned()
                    .ok_or_else(|| OrmError::invalid(format!("no query named `{}`", text)))?;
                self.read_with(scope, type_name, on_column, |row| (*query)(row, params))
            }
            QueryKind::Text => {
                let predicate = clause_predicate(parse_clauses(text)?, params)?;
                self.read_with(scope, type_name, on_column, predicate)
            }
        }
    }

    fn execute_no_result_set(&self, kind: QueryKind, text: &str, params: &PropertyMap) -> Result<usize> {
        let deleted = match kind {
            QueryKind::Procedure => {
                let (type_name, predicate) = {
                    let commands = self.commands.read();
                    let command = commands
                        .get(text)
                        .ok_or_else(|| OrmError::invalid(format!("no command named `{}`", text)))?;
                    (command.type_name.clone(), command.predicate.clone())
                };
                self.delete_matching(&type_name, &|row: &PropertyMap| (*predicate)(row, params))?
            }
            QueryKind::Text => {
                let (type_name, clauses) = parse_delete(text)?;
                let predicate = clause_predicate(clauses, params)?;
                self.delete_matching(&type_name, &predicate)?
            }
        };
        info!(command = text, deleted, "command executed");
        Ok(deleted)
    }

    fn completions(&self) -> &CompletionRegistry {
        &self.completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clause_parsing() {
        let clauses = parse_clauses("status = @s and customer_id = @c").unwrap();
        assert_eq!(
            clauses,
            vec![
                ("status".to_string(), "s".to_string()),
                ("customer_id".to_string(), "c".to_string())
            ]
        );
        assert!(parse_clauses("").unwrap().is_empty());
        assert!(parse_clauses("status = open").is_err());
        assert!(parse_clauses("status").is_err());
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let clauses = parse_clauses("status = @s").unwrap();
        assert!(clause_predicate(clauses, &PropertyMap::new()).is_err());
    }

    #[test]
    fn test_delete_parsing() {
        let (t, c) = parse_delete("delete Order where status = @s").unwrap();
        assert_eq!(t, "Order");
        assert_eq!(c.len(), 1);
        let (t, c) = parse_delete("delete OrderLine").unwrap();
        assert_eq!(t, "OrderLine");
        assert!(c.is_empty());
        assert!(parse_delete("truncate Order").is_err());
    }

    #[test]
    fn test_identity_follows_stored_keys() {
        let mut table = Table::default();
        let change = RowChange {
            type_name: "Order".to_string(),
            state: RowState::Added,
            key: vec![("order_id".to_string(), FieldValue::Int(7))],
            fields: PropertyMap::new(),
        };
        table.upsert(&change, change.key_items().unwrap());
        assert_eq!(table.allocate_identity(), 8);
        assert_eq!(table.allocate_identity(), 9);
        assert_eq!(Table::default().allocate_identity(), 1);
    }
}
