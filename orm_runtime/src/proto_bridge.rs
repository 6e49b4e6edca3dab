//! Proto ↔ store conversion bridge.
//!
//! Converts between the protobuf wire types (proto_types.rs) and the
//! store's `RowChange`. Only scalar field values cross the wire;
//! references and collections never reach the store.

use orm_engine::{FieldValue, PropertyMap, RowState};
use uuid::Uuid;

use crate::proto_types::*;
use crate::store::RowChange;
use crate::{RuntimeError, RuntimeResult};

// ── Values ─────────────────────────────────────────────────────

/// `None` for references and collections.
pub fn value_to_proto(value: &FieldValue) -> Option<ProtoFieldValue> {
    let kind = match value {
        FieldValue::Null => ValueKind::Null(true),
        FieldValue::Bool(b) => ValueKind::BoolValue(*b),
        FieldValue::Int(v) => ValueKind::IntValue(*v),
        FieldValue::Long(v) => ValueKind::LongValue(*v),
        FieldValue::Double(v) => ValueKind::DoubleValue(*v),
        FieldValue::Text(s) => ValueKind::TextValue(s.clone()),
        FieldValue::Guid(g) => ValueKind::GuidValue(g.to_string()),
        FieldValue::Ref(_) | FieldValue::List(_) | FieldValue::Set(_) => return None,
    };
    Some(ProtoFieldValue { kind: Some(kind) })
}

/// A missing oneof decodes as `Null`.
pub fn proto_to_value(proto: &ProtoFieldValue) -> RuntimeResult<FieldValue> {
    Ok(match &proto.kind {
        None | Some(ValueKind::Null(_)) => FieldValue::Null,
        Some(ValueKind::BoolValue(b)) => FieldValue::Bool(*b),
        Some(ValueKind::IntValue(v)) => FieldValue::Int(*v),
        Some(ValueKind::LongValue(v)) => FieldValue::Long(*v),
        Some(ValueKind::DoubleValue(v)) => FieldValue::Double(*v),
        Some(ValueKind::TextValue(s)) => FieldValue::Text(s.clone()),
        Some(ValueKind::GuidValue(s)) => FieldValue::Guid(
            Uuid::parse_str(s).map_err(|e| RuntimeError::CorruptLog(format!("bad guid `{}`: {}", s, e)))?,
        ),
    })
}

// ── Row state ──────────────────────────────────────────────────

pub fn row_state_to_proto(state: RowState) -> ProtoRowState {
    match state {
        RowState::Unchanged => ProtoRowState::Unchanged,
        RowState::Added => ProtoRowState::Added,
        RowState::Modified => ProtoRowState::Modified,
        RowState::ModifiedPriority => ProtoRowState::ModifiedPriority,
        RowState::Deleted => ProtoRowState::Deleted,
        RowState::Unlinked => ProtoRowState::Unlinked,
    }
}

pub fn proto_to_row_state(raw: i32) -> RuntimeResult<RowState> {
    let state = ProtoRowState::try_from(raw)
        .map_err(|_| RuntimeError::CorruptLog(format!("unknown row state {}", raw)))?;
    Ok(match state {
        ProtoRowState::Unchanged => RowState::Unchanged,
        ProtoRowState::Added => RowState::Added,
        ProtoRowState::Modified => RowState::Modified,
        ProtoRowState::ModifiedPriority => RowState::ModifiedPriority,
        ProtoRowState::Deleted => RowState::Deleted,
        ProtoRowState::Unlinked => RowState::Unlinked,
    })
}

// ── Row change ─────────────────────────────────────────────────

fn fields_to_proto<'a>(fields: impl Iterator<Item = (&'a String, &'a FieldValue)>) -> Vec<ProtoField> {
    fields
        .filter_map(|(name, value)| {
            value_to_proto(value).map(|v| ProtoField { name: name.clone(), value: Some(v) })
        })
        .collect()
}

fn field_from_proto(field: &ProtoField) -> RuntimeResult<(String, FieldValue)> {
    let value = match &field.value {
        Some(v) => proto_to_value(v)?,
        None => FieldValue::Null,
    };
    Ok((field.name.clone(), value))
}

pub fn change_to_proto(sequence: u64, change: &RowChange) -> ProtoRowChange {
    ProtoRowChange {
        sequence,
        type_name: change.type_name.clone(),
        row_state: row_state_to_proto(change.state) as i32,
        key: fields_to_proto(change.key.iter().map(|(n, v)| (n, v))),
        fields: fields_to_proto(change.fields.iter()),
    }
}

pub fn proto_to_change(proto: &ProtoRowChange) -> RuntimeResult<RowChange> {
    if proto.type_name.is_empty() {
        return Err(RuntimeError::CorruptLog(format!(
            "change {} names no type",
            proto.sequence
        )));
    }
    if proto.key.is_empty() {
        return Err(RuntimeError::CorruptLog(format!(
            "change {} carries no key",
            proto.sequence
        )));
    }
    let key = proto
        .key
        .iter()
        .map(field_from_proto)
        .collect::<RuntimeResult<Vec<_>>>()?;
    let fields = proto
        .fields
        .iter()
        .map(field_from_proto)
        .collect::<RuntimeResult<PropertyMap>>()?;
    Ok(RowChange {
        type_name: proto.type_name.clone(),
        state: proto_to_row_state(proto.row_state)?,
        key,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RowChange {
        let mut fields = PropertyMap::new();
        fields.insert("order_id".to_string(), FieldValue::Int(10));
        fields.insert("total".to_string(), FieldValue::Double(12.5));
        fields.insert("note".to_string(), FieldValue::Null);
        fields.insert("ref".to_string(), FieldValue::Guid(Uuid::nil()));
        RowChange {
            type_name: "Order".to_string(),
            state: RowState::Modified,
            key: vec![("order_id".to_string(), FieldValue::Int(10))],
            fields,
        }
    }

    #[test]
    fn test_change_survives_wire_format() {
        let change = sample();
        let proto = change_to_proto(3, &change);
        assert_eq!(proto.sequence, 3);
        assert_eq!(proto.row_state, ProtoRowState::Modified as i32);
        assert_eq!(proto_to_change(&proto).unwrap(), change);
    }

    #[test]
    fn test_unknown_row_state_rejected() {
        let mut proto = change_to_proto(1, &sample());
        proto.row_state = 42;
        assert!(matches!(proto_to_change(&proto), Err(RuntimeError::CorruptLog(_))));
    }

    #[test]
    fn test_bad_guid_rejected() {
        let proto = ProtoFieldValue { kind: Some(ValueKind::GuidValue("not-a-guid".to_string())) };
        assert!(proto_to_value(&proto).is_err());
    }
}
