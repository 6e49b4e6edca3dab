//! Shared test entities: Customer 1-* Order 1-* OrderLine, and a
//! self-referencing Node tree.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use orm_engine::{
    into_handle, Entity, EntityHandle, FieldDescriptor, FieldKind, FieldValue, KeyRegistry,
    RelationshipDefinition, ScopeSettings, ServiceScope, ValueKind,
};

pub static CUSTOMER_FIELDS: [FieldDescriptor; 3] = [
    FieldDescriptor::scalar("customer_id", ValueKind::Int),
    FieldDescriptor::scalar("name", ValueKind::Text),
    FieldDescriptor::children("orders", "Order"),
];

pub static ORDER_FIELDS: [FieldDescriptor; 6] = [
    FieldDescriptor::scalar("order_id", ValueKind::Int),
    FieldDescriptor::scalar("customer_id", ValueKind::Int),
    FieldDescriptor::scalar("status", ValueKind::Text),
    FieldDescriptor::scalar("total", ValueKind::Double),
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

pub static NODE_FIELDS: [FieldDescriptor; 5] = [
    FieldDescriptor::scalar("node_id", ValueKind::Long),
    FieldDescriptor::scalar("parent_node_id", ValueKind::Long),
    FieldDescriptor::scalar("label", ValueKind::Text),
    FieldDescriptor::parent("parent", "Node"),
    FieldDescriptor::children("children", "Node"),
];

/// Map-backed entity; scalar writes are coerced to the declared kind.
pub struct Row {
    type_name: &'static str,
    fields: &'static [FieldDescriptor],
    values: BTreeMap<&'static str, FieldValue>,
}

impl Row {
    pub fn new(type_name: &'static str, fields: &'static [FieldDescriptor]) -> Self {
        Row { type_name, fields, values: BTreeMap::new() }
    }
}

impl Entity for Row {
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

fn row(type_name: &'static str, fields: &'static [FieldDescriptor], values: &[(&str, FieldValue)]) -> EntityHandle {
    let mut r = Row::new(type_name, fields);
    for (name, value) in values {
        r.set_field(name, value.clone());
    }
    into_handle(r)
}

pub fn customer(id: i32, name: &str) -> EntityHandle {
    row(
        "Customer",
        &CUSTOMER_FIELDS,
        &[("customer_id", FieldValue::Int(id)), ("name", FieldValue::Text(name.to_string()))],
    )
}

pub fn order(id: i32) -> EntityHandle {
    row(
        "Order",
        &ORDER_FIELDS,
        &[("order_id", FieldValue::Int(id)), ("status", FieldValue::Text("open".to_string()))],
    )
}

pub fn line(id: i32, order_id: i32, product: &str) -> EntityHandle {
    row(
        "OrderLine",
        &LINE_FIELDS,
        &[
            ("line_id", FieldValue::Int(id)),
            ("order_id", FieldValue::Int(order_id)),
            ("product", FieldValue::Text(product.to_string())),
            ("qty", FieldValue::Int(1)),
        ],
    )
}

pub fn node(id: i64, parent_id: i64, label: &str) -> EntityHandle {
    row(
        "Node",
        &NODE_FIELDS,
        &[
            ("node_id", FieldValue::Long(id)),
            ("parent_node_id", FieldValue::Long(parent_id)),
            ("label", FieldValue::Text(label.to_string())),
        ],
    )
}

pub fn registry() -> KeyRegistry {
    let mut r = KeyRegistry::new();
    r.register_key("Customer", &["customer_id"]).unwrap();
    r.register_key("Order", &["order_id"]).unwrap();
    r.register_key("OrderLine", &["line_id"]).unwrap();
    r.register_key("Node", &["node_id"]).unwrap();
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
    r.register_relationship(
        "Node",
        vec![RelationshipDefinition::new("Node")
            .with_role(&["parent_node_id"])
            .with_parent_property("parent")
            .with_child_property("children")],
    )
    .unwrap();
    r.register_factory("Customer", || into_handle(Row::new("Customer", &CUSTOMER_FIELDS)));
    r.register_factory("Order", || into_handle(Row::new("Order", &ORDER_FIELDS)));
    r.register_factory("OrderLine", || into_handle(Row::new("OrderLine", &LINE_FIELDS)));
    r.register_factory("Node", || into_handle(Row::new("Node", &NODE_FIELDS)));
    r
}

pub fn scope() -> ServiceScope {
    ServiceScope::new(Arc::new(registry()), ScopeSettings::default())
}

pub fn scope_with(settings: ScopeSettings) -> ServiceScope {
    ServiceScope::new(Arc::new(registry()), settings)
}

pub fn get(h: &EntityHandle, field: &str) -> FieldValue {
    h.read().get_field(field).unwrap_or_default()
}

pub fn int(h: &EntityHandle, field: &str) -> i64 {
    get(h, field).as_i64().unwrap_or_default()
}

/// Direct write that bypasses the scope, as application code would.
pub fn poke(h: &EntityHandle, field: &str, value: FieldValue) {
    h.write().set_field(field, value);
}
