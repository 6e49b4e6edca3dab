//! Shared fixtures: Customer 1-* Order 1-* OrderLine entities and
//! isolated temp directories.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use orm_engine::collaborators::PersistenceHost;
use orm_engine::{
    into_handle, Entity, EntityHandle, FieldDescriptor, FieldKind, FieldValue, KeyRegistry,
    RelationshipDefinition, ScopeSettings, ServiceScope, ValueKind,
};
use orm_runtime::store::RowStore;

pub static CUSTOMER_FIELDS: [FieldDescriptor; 3] = [
    FieldDescriptor::scalar("customer_id", ValueKind::Int),
    FieldDescriptor::scalar("name", ValueKind::Text),
    FieldDescriptor::children("orders", "Order"),
];

pub static ORDER_FIELDS: [FieldDescriptor; 5] = [
    FieldDescriptor::scalar("order_id", ValueKind::Int),
    FieldDescriptor::scalar("customer_id", ValueKind::Int),
    FieldDescriptor::scalar("status", ValueKind::Text),
    FieldDescriptor::parent("customer", "Customer"),
    FieldDescriptor::children("lines", "OrderLine"),
];

pub static LINE_FIELDS: [FieldDescriptor; 5] = [
    FieldDescriptor::scalar("line_id", ValueKind::Int),
    FieldDescriptor::scalar("order_id", ValueKind::Int),
    FieldDescriptor::scalar("product", ValueKind::Text),
    FieldDescriptor::scalar("qty", ValueKind::Int),
    FieldDescriptor::parent("order", "Order"),
];

/// Keyless type: tracked, but the row store has nothing to store it by.
pub static MEMO_FIELDS: [FieldDescriptor; 1] = [FieldDescriptor::scalar("text", ValueKind::Text)];

pub struct Record {
    type_name: &'static str,
    fields: &'static [FieldDescriptor],
    values: BTreeMap<&'static str, FieldValue>,
}

impl Record {
    pub fn new(type_name: &'static str, fields: &'static [FieldDescriptor]) -> Self {
        Record { type_name, fields, values: BTreeMap::new() }
    }
}

impl Entity for Record {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    fn get_field(&self, name: &str) -> Option<FieldValue> {
        let desc = self.field(name)?;
        Some(self.values.get(desc.name).cloned().unwrap_or_default())
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> bool {
        let Some(desc) = self.field(name) else {
            return false;
        };
        let value = match desc.kind {
            FieldKind::Scalar(kind) => value.coerce(kind),
            _ => value,
        };
        self.values.insert(desc.name, value);
        true
    }
}

fn record(type_name: &'static str, fields: &'static [FieldDescriptor], values: &[(&str, FieldValue)]) -> EntityHandle {
    let mut r = Record::new(type_name, fields);
    for (name, value) in values {
        r.set_field(name, value.clone());
    }
    into_handle(r)
}

pub fn customer(id: i32, name: &str) -> EntityHandle {
    record(
        "Customer",
        &CUSTOMER_FIELDS,
        &[("customer_id", FieldValue::Int(id)), ("name", FieldValue::Text(name.to_string()))],
    )
}

pub fn order(id: i32, customer_id: i32, status: &str) -> EntityHandle {
    record(
        "Order",
        &ORDER_FIELDS,
        &[
            ("order_id", FieldValue::Int(id)),
            ("customer_id", FieldValue::Int(customer_id)),
            ("status", FieldValue::Text(status.to_string())),
        ],
    )
}

pub fn line(id: i32, order_id: i32, product: &str, qty: i32) -> EntityHandle {
    record(
        "OrderLine",
        &LINE_FIELDS,
        &[
            ("line_id", FieldValue::Int(id)),
            ("order_id", FieldValue::Int(order_id)),
            ("product", FieldValue::Text(product.to_string())),
            ("qty", FieldValue::Int(qty)),
        ],
    )
}

pub fn memo(text: &str) -> EntityHandle {
    record("Memo", &MEMO_FIELDS, &[("text", FieldValue::Text(text.to_string()))])
}

pub fn registry() -> Arc<KeyRegistry> {
    let mut r = KeyRegistry::new();
    r.register_key("Customer", &["customer_id"]).unwrap();
    r.register_key("Order", &["order_id"]).unwrap();
    r.register_key("OrderLine", &["line_id"]).unwrap();
    r.register_relationship(
        "Customer",
        vec![RelationshipDefinition::new("Order")
            .with_parent_property("customer")
            .with_child_property("orders")],
    )
    .unwrap();
    r.register_relationship(
        "Order",
        vec![RelationshipDefinition::new("OrderLine")
            .with_parent_property("order")
            .with_child_property("lines")],
    )
    .unwrap();
    r.register_factory("Customer", || into_handle(Record::new("Customer", &CUSTOMER_FIELDS)));
    r.register_factory("Order", || into_handle(Record::new("Order", &ORDER_FIELDS)));
    r.register_factory("OrderLine", || into_handle(Record::new("OrderLine", &LINE_FIELDS)));
    r.register_factory("Memo", || into_handle(Record::new("Memo", &MEMO_FIELDS)));
    Arc::new(r)
}

/// Scope whose persistence collaborator is `store`.
pub fn scope_over(store: &Arc<RowStore>, registry: &Arc<KeyRegistry>, settings: ScopeSettings) -> ServiceScope {
    let host: Arc<dyn PersistenceHost> = store.clone();
    ServiceScope::with_collaborators(registry.clone(), settings, Some(host), None)
}

pub fn get(h: &EntityHandle, field: &str) -> FieldValue {
    h.read().get_field(field).unwrap_or_default()
}

pub fn int(h: &EntityHandle, field: &str) -> i64 {
    get(h, field).as_i64().unwrap_or_default()
}

pub fn text(h: &EntityHandle, field: &str) -> String {
    get(h, field).as_str().unwrap_or_default().to_string()
}

/// Create a temp directory for a test.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("orm_runtime_tests")
        .join(name);
    if dir.exists() {
        fs::remove_dir_all(&dir).ok();
    }
    fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}
