//! Snapshot codec — scope ⇄ JSON document.
//!
//! Pure codec layer over the kernel's serialization boundary. No
//! timestamps, no envelope.
//!
//! - `encode_snapshot`:  scope → JSON string (every row, key-stub parents)
//! - `decode_snapshot`:  JSON string → rows tracked in a target scope
//! - `restore_snapshot`: decode + consistency checks
//! - `export_snapshot_to_file` / `import_snapshot_from_file`: file I/O
//! - `snapshot_hash`:    SHA-256 of the encoded JSON (lowercase hex)

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;

use orm_engine::hashing::hex_digest;
use orm_engine::serialization::{deserialize_scope, serialize_scope};
use orm_engine::{EntityHandle, SerializationMode, ServiceScope};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// All possible snapshot codec failures.
#[derive(Debug)]
pub enum SnapshotError {
    /// The scope could not be encoded.
    SerializationError(String),
    /// Malformed JSON or rows the kernel rejected.
    DeserializationError(String),
    /// Rows decoded but the result is inconsistent.
    InvariantViolation(String),
    /// File I/O error.
    IoError(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::SerializationError(msg) => {
                write!(f, "SerializationError: {}", msg)
            }
            SnapshotError::DeserializationError(msg) => {
                write!(f, "DeserializationError: {}", msg)
            }
            SnapshotError::InvariantViolation(msg) => {
                write!(f, "InvariantViolation: {}", msg)
            }
            SnapshotError::IoError(msg) => {
                write!(f, "IoError: {}", msg)
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(err: io::Error) -> Self {
        SnapshotError::IoError(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encode every tracked row of `scope` to a JSON string.
///
/// Row order follows registration order; use the kernel's canonical hash
/// for order-independent comparisons.
pub fn encode_snapshot(scope: &ServiceScope) -> Result<String, SnapshotError> {
    let document = serialize_scope(scope, SerializationMode::AllRows)
        .map_err(|e| SnapshotError::SerializationError(e.to_string()))?;
    serde_json::to_string(&document).map_err(|e| SnapshotError::SerializationError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decode a JSON string into `scope`. The returned handles own the rows;
/// the scope only tracks them while they are held.
pub fn decode_snapshot(scope: &ServiceScope, json: &str) -> Result<Vec<EntityHandle>, SnapshotError> {
    let document: Value =
        serde_json::from_str(json).map_err(|e| SnapshotError::DeserializationError(e.to_string()))?;
    deserialize_scope(scope, &document).map_err(|e| SnapshotError::DeserializationError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Restore (decode + validate)
// ---------------------------------------------------------------------------

/// Decode into an empty scope and check that every document row became
/// its own tracked row. Two rows sharing a key merge into one, which is
/// reported as `InvariantViolation("duplicate_keys ...")`.
pub fn restore_snapshot(scope: &ServiceScope, json: &str) -> Result<Vec<EntityHandle>, SnapshotError> {
    if !scope.is_empty() {
        return Err(SnapshotError::InvariantViolation(format!(
            "target_not_empty: scope already tracks {} row(s)",
            scope.len()
        )));
    }
    let owned = decode_snapshot(scope, json)?;
    if scope.len() != owned.len() {
        return Err(SnapshotError::InvariantViolation(format!(
            "duplicate_keys: {} row(s) decoded into {} tracked row(s)",
            owned.len(),
            scope.len()
        )));
    }
    Ok(owned)
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

/// Export a scope to a file as JSON. Creates parent directories if needed.
pub fn export_snapshot_to_file(scope: &ServiceScope, path: &Path) -> Result<(), SnapshotError> {
    let json = encode_snapshot(scope)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, json.as_bytes())?;
    Ok(())
}

/// Import a file written by `export_snapshot_to_file` into an empty scope.
pub fn import_snapshot_from_file(
    scope: &ServiceScope,
    path: &Path,
) -> Result<Vec<EntityHandle>, SnapshotError> {
    let content = fs::read_to_string(path)?;
    restore_snapshot(scope, &content)
}

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

/// SHA-256 of the encoded JSON. Lowercase hex string.
///
/// NOTE: this hashes the document as encoded, which depends on
/// registration order. It guards snapshot files against tampering; the
/// kernel's `canonical_hash` is the one to compare scopes with.
pub fn snapshot_hash(scope: &ServiceScope) -> Result<String, SnapshotError> {
    let json = encode_snapshot(scope)?;
    Ok(hex_digest(json.as_bytes()))
}
