//! Tracking kernel — composite keys.
//!
//! Ordered tuple of key values tagged with the owning base type. Equality
//! and hashing are structural; one or two items stay inline.

use std::fmt;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::{OrmError, Result};
use crate::value::FieldValue;

/// One positional key value. Integral widths are widened to i64 so an
/// `Int(5)` and a `Long(5)` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompositeItem {
    Null,
    Whole(i64),
    Guid(Uuid),
    Text(String),
}

impl CompositeItem {
    pub fn from_value(value: &FieldValue) -> Result<Self> {
        match value {
            FieldValue::Null => Ok(CompositeItem::Null),
            FieldValue::Int(v) => Ok(CompositeItem::Whole(*v as i64)),
            FieldValue::Long(v) => Ok(CompositeItem::Whole(*v)),
            FieldValue::Guid(g) => Ok(CompositeItem::Guid(*g)),
            FieldValue::Text(s) => Ok(CompositeItem::Text(s.clone())),
            other => Err(OrmError::invalid(format!(
                "unsupported key value {:?}; keys must be integral, GUID or text",
                other
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CompositeItem::Null)
    }
}

impl fmt::Display for CompositeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositeItem::Null => write!(f, "null"),
            CompositeItem::Whole(v) => write!(f, "{}", v),
            CompositeItem::Guid(g) => write!(f, "{}", g),
            CompositeItem::Text(s) => write!(f, "'{}'", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    base_type: &'static str,
    items: SmallVec<[CompositeItem; 2]>,
}

impl CompositeKey {
    pub fn new(base_type: &'static str, values: &[FieldValue]) -> Result<Self> {
        let items = values
            .iter()
            .map(CompositeItem::from_value)
            .collect::<Result<SmallVec<[CompositeItem; 2]>>>()?;
        Ok(CompositeKey { base_type, items })
    }

    pub fn base_type(&self) -> &'static str {
        self.base_type
    }

    pub fn items(&self) -> &[CompositeItem] {
        &self.items
    }

    pub fn arity(&self) -> usize {
        self.items.len()
    }

    /// A key whose every item is null identifies nothing.
    pub fn is_all_null(&self) -> bool {
        self.items.iter().all(CompositeItem::is_null)
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.base_type)?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, ")")
    }
}
