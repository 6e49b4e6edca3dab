//! Append-only row log — binary protobuf frames.
//!
//! Storage format: length-prefixed protobuf frames.
//!   [4-byte LE length][protobuf bytes][4-byte LE length][protobuf bytes]...
//!
//! Rules:
//!   - Strict append only: no mutation, no deletion, no reordering
//!   - fsync after every write
//!   - Sequence strictly increasing (validated on append)
//!   - A zero-length, oversized or truncated frame fails the whole read

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::debug;

use crate::proto_types::ProtoRowChange;

/// Largest frame accepted on read.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Append-only log of persisted row changes backed by a binary file.
pub struct RowLog {
    path: PathBuf,
    last_sequence: u64,
}

impl RowLog {
    /// Open or create a row log at the given path.
    /// Reads existing frames to determine the last sequence number.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let last_sequence = if path.exists() {
            let changes = Self::read_all_from_file(path)?;
            changes.last().map(|c| c.sequence).unwrap_or(0)
        } else {
            0
        };
        debug!(path = %path.display(), last_sequence, "row log opened");

        Ok(Self {
            path: path.to_path_buf(),
            last_sequence,
        })
    }

    /// Append a single change to the log.
    ///
    /// Validates strict sequence ordering.
    /// Writes length-prefixed protobuf and fsyncs.
    pub fn append_change(&mut self, change: &ProtoRowChange) -> io::Result<()> {
        let expected = self.last_sequence + 1;
        if change.sequence != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Sequence violation in row log: expected {}, got {}",
                    expected, change.sequence
                ),
            ));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let buf = change.encode_to_vec();
        let len = buf.len() as u32;

        {
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&buf)?;
            writer.flush()?;
        }
        file.sync_all()?;

        self.last_sequence = change.sequence;
        Ok(())
    }

    /// Stamp `change` with the next sequence number and append it.
    pub fn append_next(&mut self, mut change: ProtoRowChange) -> io::Result<u64> {
        change.sequence = self.last_sequence + 1;
        self.append_change(&change)?;
        Ok(change.sequence)
    }

    /// Load all changes from the log in sequence order.
    pub fn load_all_changes(&self) -> io::Result<Vec<ProtoRowChange>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Self::read_all_from_file(&self.path)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all changes from a file, validating frame integrity and
    /// sequence order.
    pub fn read_all_from_file(path: &Path) -> io::Result<Vec<ProtoRowChange>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut changes: Vec<ProtoRowChange> = Vec::new();
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid frame length: {}", len),
                ));
            }

            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Truncated frame after sequence {}: {}", changes.len(), e),
                )
            })?;

            let change = ProtoRowChange::decode(frame.as_slice()).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Protobuf decode error: {}", e),
                )
            })?;

            let expected = changes.last().map_or(1, |c| c.sequence + 1);
            if change.sequence != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Out-of-order frame: expected sequence {}, got {}",
                        expected, change.sequence
                    ),
                ));
            }

            changes.push(change);
        }

        Ok(changes)
    }
}
