//! Map and reduce execution on local files
//!
//! Map output for mapper `m` lives in the request's directory as
//! `mapper_<m>_reducer_<n>.txt`, one line per pair formatted `key, value`.
//! Reduce reads every `*_reducer_<r>.txt` across its input directories and
//! writes `output_<r>.txt` with lines `key value`, keys in sorted order.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{MapTaskRequest, ReduceTaskRequest};
use crate::shard::FilePiece;
use crate::tasks::{Emitter, TaskFactory, UserTask};

/// Task-level failures reported back to the coordinator as application errors
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("n_output must be greater than 0")]
    NoPartitions,

    #[error("failed to read {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Intermediate file name for one mapper/partition pair
pub fn intermediate_file_name(mapper_id: usize, partition: usize) -> String {
    format!("mapper_{mapper_id}_reducer_{partition}.txt")
}

/// Final output file name for one reducer
pub fn output_file_name(reducer_id: usize) -> String {
    format!("output_{reducer_id}.txt")
}

/// Stable partition of `key` among `n_output` reducers
///
/// Uses the first eight bytes of the key's SHA-256 so every worker agrees
/// regardless of platform or process.
pub fn partition_for(key: &str, n_output: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % n_output as u64) as usize
}

fn lookup<'a>(factory: &'a TaskFactory, name: &str) -> Result<&'a UserTask, ExecutorError> {
    factory
        .get(name)
        .ok_or_else(|| ExecutorError::UnknownTask(name.to_string()))
}

// ============================================================================
// Map
// ============================================================================

/// Run the mapper over every piece and write one file per partition
pub fn execute_map(
    factory: &TaskFactory,
    request: &MapTaskRequest,
) -> Result<Vec<PathBuf>, ExecutorError> {
    let task = lookup(factory, &request.task)?;
    if request.n_output == 0 {
        return Err(ExecutorError::NoPartitions);
    }

    fs::create_dir_all(&request.output_dir).map_err(|source| ExecutorError::Output {
        path: request.output_dir.clone(),
        source,
    })?;

    let mut partitions: Vec<Vec<(String, String)>> = vec![Vec::new(); request.n_output];
    let mut emitter = Emitter::new();

    for piece in &request.pieces {
        for_each_line(piece, |line| {
            task.mapper.map(line, &mut emitter);
            for (key, value) in emitter.drain() {
                let p = partition_for(&key, request.n_output);
                partitions[p].push((key, value));
            }
        })?;
    }

    let mut output_files = Vec::with_capacity(request.n_output);
    for (partition, pairs) in partitions.into_iter().enumerate() {
        let path = request
            .output_dir
            .join(intermediate_file_name(request.task_id, partition));
        write_lines(&path, pairs.iter().map(|(k, v)| format!("{k}, {v}")))?;
        output_files.push(path);
    }

    tracing::debug!(
        task_id = request.task_id,
        pieces = request.pieces.len(),
        dir = %request.output_dir.display(),
        "Map task finished"
    );

    Ok(output_files)
}

/// Feed every line starting inside `[start, end)` to `f`, without its newline
fn for_each_line(piece: &FilePiece, mut f: impl FnMut(&str)) -> Result<(), ExecutorError> {
    let input_err = |source| ExecutorError::Input {
        path: piece.path.clone(),
        source,
    };

    let mut file = File::open(&piece.path).map_err(input_err)?;
    file.seek(SeekFrom::Start(piece.start)).map_err(input_err)?;
    let mut reader = BufReader::new(file);

    let mut offset = piece.start;
    let mut buf = Vec::new();
    while offset < piece.end {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).map_err(input_err)?;
        if read == 0 {
            break;
        }
        offset += read as u64;

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        f(&String::from_utf8_lossy(&buf));
    }
    Ok(())
}

// ============================================================================
// Reduce
// ============================================================================

/// Group this partition's intermediate pairs by key and run the reducer
pub fn execute_reduce(
    factory: &TaskFactory,
    request: &ReduceTaskRequest,
) -> Result<PathBuf, ExecutorError> {
    let task = lookup(factory, &request.task)?;
    let suffix = format!("_reducer_{}.txt", request.task_id);

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for dir in &request.input_dirs {
        for path in matching_files(dir, &suffix)? {
            read_pairs(&path, &mut groups)?;
        }
    }

    fs::create_dir_all(&request.output_dir).map_err(|source| ExecutorError::Output {
        path: request.output_dir.clone(),
        source,
    })?;

    let mut emitter = Emitter::new();
    for (key, values) in &groups {
        task.reducer.reduce(key, values, &mut emitter);
    }

    let path = request.output_dir.join(output_file_name(request.task_id));
    write_atomically(
        &path,
        emitter.into_pairs().into_iter().map(|(k, v)| format!("{k} {v}")),
    )?;

    tracing::debug!(
        task_id = request.task_id,
        keys = groups.len(),
        output = %path.display(),
        "Reduce task finished"
    );

    Ok(path)
}

fn matching_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, ExecutorError> {
    let entries = fs::read_dir(dir).map_err(|source| ExecutorError::Input {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ExecutorError::Input {
            path: dir.to_path_buf(),
            source,
        })?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && entry.file_name().to_string_lossy().ends_with(suffix) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn read_pairs(
    path: &Path,
    groups: &mut BTreeMap<String, Vec<String>>,
) -> Result<(), ExecutorError> {
    let input_err = |source| ExecutorError::Input {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(input_err)?);

    for line in reader.lines() {
        let line = line.map_err(input_err)?;
        let Some((key, value)) = line.split_once(',') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        groups
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    Ok(())
}

// ============================================================================
// Output Helpers
// ============================================================================

fn write_lines(path: &Path, lines: impl Iterator<Item = String>) -> Result<(), ExecutorError> {
    let output_err = |source| ExecutorError::Output {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(output_err)?);
    for line in lines {
        writeln!(writer, "{line}").map_err(output_err)?;
    }
    writer.flush().map_err(output_err)
}

/// Write to a sibling temp file and rename over `path`
///
/// Two attempts of the same reducer may race; each rename replaces the whole
/// file, so readers never observe an interleaving.
fn write_atomically(path: &Path, lines: impl Iterator<Item = String>) -> Result<(), ExecutorError> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{suffix}.tmp"));

    write_lines(&tmp, lines)?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        ExecutorError::Output {
            path: path.to_path_buf(),
            source,
        }
    })
}
