//! Line-based input sharding
//!
//! Splits the job's input files into [`FileShard`]s of roughly
//! `map_kilobytes` each. A shard never splits a line: each line is charged
//! its length plus one byte for the newline, and the current shard is closed
//! before a line that would push it over capacity. Consecutive lines from the
//! same file collapse into one [`FilePiece`].

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{ErrorCategory, MapredErrorTrait};

/// A byte range `[start, end)` of one input file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePiece {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
}

impl FilePiece {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// One Map work item's input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileShard {
    pub pieces: Vec<FilePiece>,
}

impl FileShard {
    /// Total bytes covered by this shard
    pub fn size(&self) -> u64 {
        self.pieces.iter().map(FilePiece::len).sum()
    }

    fn push_line(&mut self, path: &Path, offset: u64, line_size: u64) {
        match self.pieces.last_mut() {
            Some(last) if last.path == path => last.end += line_size,
            _ => self.pieces.push(FilePiece {
                path: path.to_path_buf(),
                start: offset,
                end: offset + line_size,
            }),
        }
    }
}

/// Errors raised while sharding input files
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("failed to open input file {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    #[error("failed to read input file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("shard size must be greater than 0")]
    ZeroCapacity,
}

impl MapredErrorTrait for ShardError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Open { .. } | Self::Read { .. } => ErrorCategory::Storage,
            Self::ZeroCapacity => ErrorCategory::Config,
        }
    }
}

/// Split `input_files` into shards of at most `map_kilobytes * 1024` bytes
///
/// A single line larger than the capacity becomes its own shard.
pub fn shard_files<P: AsRef<Path>>(
    input_files: &[P],
    map_kilobytes: u64,
) -> Result<Vec<FileShard>, ShardError> {
    if map_kilobytes == 0 {
        return Err(ShardError::ZeroCapacity);
    }
    let capacity = map_kilobytes * 1024;

    let mut shards = Vec::new();
    let mut current = FileShard::default();
    let mut current_bytes = 0u64;

    for path in input_files {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ShardError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| ShardError::Read {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            if read == 0 {
                break;
            }

            // A final line without a newline is still charged for one.
            let content_len = if buf.last() == Some(&b'\n') { read - 1 } else { read };
            let line_size = content_len as u64 + 1;

            if current_bytes + line_size > capacity && !current.pieces.is_empty() {
                shards.push(std::mem::take(&mut current));
                current_bytes = 0;
            }

            current.push_line(path, offset, line_size);
            offset += line_size;
            current_bytes += line_size;
        }
    }

    if !current.pieces.is_empty() {
        shards.push(current);
    }

    tracing::debug!(
        files = input_files.len(),
        shards = shards.len(),
        capacity,
        "Sharded input files"
    );

    Ok(shards)
}
