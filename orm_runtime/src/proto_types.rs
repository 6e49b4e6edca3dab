//! Hand-written protobuf types for the row log.
//!
//! Uses prost derive macros for encode/decode without prost-build.
//! Field numbers are part of the on-disk format; never renumber.

use prost::Message;

// ── Row change ─────────────────────────────────────────────────

/// One persisted row operation. `sequence` is strictly increasing
/// within a log.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoRowChange {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(string, tag = "2")]
    pub type_name: String,
    #[prost(enumeration = "ProtoRowState", tag = "3")]
    pub row_state: i32,
    #[prost(message, repeated, tag = "4")]
    pub key: Vec<ProtoField>,
    #[prost(message, repeated, tag = "5")]
    pub fields: Vec<ProtoField>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtoRowState {
    Unchanged = 0,
    Added = 1,
    Modified = 2,
    ModifiedPriority = 3,
    Deleted = 4,
    Unlinked = 5,
}

// ── Fields ─────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoField {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<ProtoFieldValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoFieldValue {
    #[prost(oneof = "ValueKind", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub kind: Option<ValueKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum ValueKind {
    #[prost(bool, tag = "1")]
    Null(bool),
    #[prost(bool, tag = "2")]
    BoolValue(bool),
    #[prost(int32, tag = "3")]
    IntValue(i32),
    #[prost(int64, tag = "4")]
    LongValue(i64),
    #[prost(double, tag = "5")]
    DoubleValue(f64),
    #[prost(string, tag = "6")]
    TextValue(String),
    /// Hyphenated lowercase UUID text.
    #[prost(string, tag = "7")]
    GuidValue(String),
}
