//! Snapshot layer — numbered on-disk scope snapshots.
//!
//! A snapshot holds the scope document plus two hashes: one over the
//! document bytes (file integrity) and the kernel's canonical hash of
//! the scope it was taken from (state identity). No timestamps.
//!
//! If a snapshot fails verification, fall back to a full replay.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use orm_engine::hashing::{canonical_hash, hex_digest};
use orm_engine::{EntityHandle, KeyRegistry, ScopeSettings, ServiceScope, ENGINE_VERSION};

use crate::snapshot_codec::{encode_snapshot, restore_snapshot};
use crate::RuntimeResult;

/// Snapshot on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    /// Row log sequence at which this snapshot was taken.
    pub sequence: u64,
    /// Scope document (JSON text).
    pub document: String,
    /// SHA-256 of `document`.
    pub document_hash: String,
    /// Canonical hash of the scope the document was taken from.
    pub canonical_hash: String,
    /// Engine version at snapshot time.
    pub engine_version: u32,
}

fn file_name(sequence: u64) -> String {
    format!("snapshot_{:06}.json", sequence)
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Capture `scope` without writing it anywhere.
pub fn take_snapshot(scope: &ServiceScope, sequence: u64) -> RuntimeResult<Snapshot> {
    let document = encode_snapshot(scope)?;
    Ok(Snapshot {
        sequence,
        document_hash: hex_digest(document.as_bytes()),
        document,
        canonical_hash: canonical_hash(scope)?,
        engine_version: ENGINE_VERSION,
    })
}

/// Save a snapshot of the current scope.
pub fn save_snapshot(dir: &Path, sequence: u64, scope: &ServiceScope) -> RuntimeResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let snap = take_snapshot(scope, sequence)?;
    let path = dir.join(file_name(sequence));

    let content = serde_json::to_string(&snap)?;
    let mut file = File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    debug!(sequence, path = %path.display(), "snapshot saved");
    Ok(path)
}

/// Load a snapshot at a specific sequence number.
/// Returns None if no snapshot exists at that sequence.
pub fn load_snapshot(dir: &Path, sequence: u64) -> io::Result<Option<Snapshot>> {
    let path = dir.join(file_name(sequence));

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path)?;
    let snap: Snapshot = serde_json::from_str(&content)
        .map_err(|e| invalid_data(format!("Bad snapshot: {}", e)))?;

    Ok(Some(snap))
}

/// Sequence numbers of every snapshot in `dir`, ascending.
pub fn list_snapshots(dir: &Path) -> io::Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut sequences = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if let Some(seq) = name_str
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".json"))
            .and_then(|s| s.parse::<u64>().ok())
        {
            sequences.push(seq);
        }
    }
    sequences.sort_unstable();
    Ok(sequences)
}

/// Load the snapshot with the highest sequence in a directory.
pub fn load_latest_snapshot(dir: &Path) -> io::Result<Option<Snapshot>> {
    match list_snapshots(dir)?.last() {
        Some(seq) => load_snapshot(dir, *seq),
        None => Ok(None),
    }
}

/// Verify a snapshot's internal hash consistency.
/// Returns true if the document hash matches the document content.
pub fn verify_snapshot_hash(snap: &Snapshot) -> bool {
    hex_digest(snap.document.as_bytes()) == snap.document_hash
}

/// Restore a snapshot into a fresh scope and check that the rebuilt
/// scope hashes to the recorded canonical hash. Returns the scope with
/// the handles that keep its rows alive.
pub fn restore_verified(
    snap: &Snapshot,
    registry: Arc<KeyRegistry>,
    settings: ScopeSettings,
) -> RuntimeResult<(ServiceScope, Vec<EntityHandle>)> {
    if snap.engine_version != ENGINE_VERSION {
        return Err(invalid_data(format!(
            "snapshot {} was taken by engine v{}, this is v{}",
            snap.sequence, snap.engine_version, ENGINE_VERSION
        ))
        .into());
    }
    if !verify_snapshot_hash(snap) {
        warn!(sequence = snap.sequence, "snapshot document hash mismatch");
        return Err(invalid_data(format!("snapshot {} document hash mismatch", snap.sequence)).into());
    }

    let scope = ServiceScope::new(registry, settings);
    let owned = restore_snapshot(&scope, &snap.document)?;
    let rebuilt = canonical_hash(&scope)?;
    if rebuilt != snap.canonical_hash {
        warn!(sequence = snap.sequence, "snapshot canonical hash mismatch");
        return Err(invalid_data(format!(
            "snapshot {} restores to {}, recorded {}",
            snap.sequence, rebuilt, snap.canonical_hash
        ))
        .into());
    }
    Ok((scope, owned))
}
