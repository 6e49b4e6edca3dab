//! Tracking kernel — field values.
//!
//! Closed set of values an entity field can hold. Scalars compare by
//! value (Int/Long widened), references and collections by identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityHandle, EntityId, EntitySet};

/// Named values supplied alongside an object: overrides on `include`,
/// extended properties, query parameters.
pub type PropertyMap = BTreeMap<String, FieldValue>;

/// Scalar kinds a field descriptor can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Long,
    Double,
    Text,
    Guid,
}

/// A single field value.
#[derive(Clone)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Guid(Uuid),
    /// Parent reference.
    Ref(EntityHandle),
    /// Raw child collection, not yet tracked.
    List(Vec<EntityHandle>),
    /// Tracked child collection.
    Set(EntitySet),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Null, zero, empty text or the nil GUID.
    pub fn is_default(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Int(v) => *v == 0,
            FieldValue::Long(v) => *v == 0,
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Guid(g) => g.is_nil(),
            _ => false,
        }
    }

    /// True for values that are not references or collections.
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            FieldValue::Ref(_) | FieldValue::List(_) | FieldValue::Set(_)
        )
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            FieldValue::Bool(_) => Some(ValueKind::Bool),
            FieldValue::Int(_) => Some(ValueKind::Int),
            FieldValue::Long(_) => Some(ValueKind::Long),
            FieldValue::Double(_) => Some(ValueKind::Double),
            FieldValue::Text(_) => Some(ValueKind::Text),
            FieldValue::Guid(_) => Some(ValueKind::Guid),
            _ => None,
        }
    }

    /// Integral value widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v as i64),
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<&EntityHandle> {
        match self {
            FieldValue::Ref(h) => Some(h),
            _ => None,
        }
    }

    /// Coerce into the declared kind. Used when values arrive from
    /// a boundary (JSON, protobuf, property maps) with a looser type.
    pub fn coerce(self, kind: ValueKind) -> FieldValue {
        match (kind, self) {
            (_, FieldValue::Null) => FieldValue::Null,
            (ValueKind::Int, FieldValue::Long(v)) => match i32::try_from(v) {
                Ok(i) => FieldValue::Int(i),
                Err(_) => FieldValue::Long(v),
            },
            (ValueKind::Long, FieldValue::Int(v)) => FieldValue::Long(v as i64),
            (ValueKind::Double, FieldValue::Int(v)) => FieldValue::Double(v as f64),
            (ValueKind::Double, FieldValue::Long(v)) => FieldValue::Double(v as f64),
            (ValueKind::Guid, FieldValue::Text(s)) => match Uuid::parse_str(&s) {
                Ok(g) => FieldValue::Guid(g),
                Err(_) => FieldValue::Text(s),
            },
            (ValueKind::Text, FieldValue::Guid(g)) => FieldValue::Text(g.to_string()),
            (_, other) => other,
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Null
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(_) | Long(_), Int(_) | Long(_)) => self.as_i64() == other.as_i64(),
            (Double(a), Double(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Guid(a), Guid(b)) => a == b,
            (Ref(a), Ref(b)) => EntityId::of(a) == EntityId::of(b),
            (List(a), List(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| EntityId::of(x) == EntityId::of(y))
            }
            (Set(a), Set(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "Null"),
            FieldValue::Bool(v) => write!(f, "Bool({})", v),
            FieldValue::Int(v) => write!(f, "Int({})", v),
            FieldValue::Long(v) => write!(f, "Long({})", v),
            FieldValue::Double(v) => write!(f, "Double({})", v),
            FieldValue::Text(v) => write!(f, "Text({:?})", v),
            FieldValue::Guid(v) => write!(f, "Guid({})", v),
            FieldValue::Ref(h) => write!(f, "Ref({:?})", EntityId::of(h)),
            FieldValue::List(items) => write!(f, "List(len={})", items.len()),
            FieldValue::Set(set) => write!(f, "Set(len={})", set.len()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Guid(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_values_compare_widened() {
        assert_eq!(FieldValue::Int(7), FieldValue::Long(7));
        assert_ne!(FieldValue::Int(7), FieldValue::Text("7".to_string()));
    }

    #[test]
    fn test_default_detection() {
        assert!(FieldValue::Int(0).is_default());
        assert!(FieldValue::Guid(Uuid::nil()).is_default());
        assert!(FieldValue::Text(String::new()).is_default());
        assert!(!FieldValue::Long(-5).is_default());
    }

    #[test]
    fn test_coerce_long_to_int_when_in_range() {
        assert!(matches!(FieldValue::Long(12).coerce(ValueKind::Int), FieldValue::Int(12)));
        assert!(matches!(
            FieldValue::Long(i64::MAX).coerce(ValueKind::Int),
            FieldValue::Long(_)
        ));
    }
}
