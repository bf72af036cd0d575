//! Checkpoint files on disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::search::state::SearchState;
use crate::store::{check_run_id, CheckpointStore, StoreError, FORMAT};

#[derive(Serialize)]
struct RecordRef<'a> {
    format: &'a str,
    saved_at_ms: u64,
    state: &'a SearchState,
}

#[derive(Deserialize)]
struct Record {
    format: String,
    state: SearchState,
}

/// Stores each checkpoint as `<dir>/<run_id>.<sequence>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    keep: usize,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileStore {
    /// Open (creating if needed) a store directory keeping the newest
    /// `keep` checkpoints per run.
    pub fn open(dir: impl Into<PathBuf>, keep: usize) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self {
            dir,
            keep: keep.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}.{:010}.json", run_id, sequence))
    }

    /// Checkpoint files of `run_id`, oldest first.
    pub fn checkpoints(&self, run_id: &str) -> Result<Vec<(u64, PathBuf)>, StoreError> {
        check_run_id(run_id)?;
        let prefix = format!("{}.", run_id);
        let mut found = Vec::new();

        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let sequence = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|seq| seq.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                found.push((sequence, entry.path()));
            }
        }

        found.sort_by_key(|(sequence, _)| *sequence);
        Ok(found)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
        file.write_all(bytes).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, path).map_err(io_error(path))?;
        // Make the rename itself durable.
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(io_error(&self.dir))?;
        Ok(())
    }

    fn prune(&self, run_id: &str) -> Result<(), StoreError> {
        let checkpoints = self.checkpoints(run_id)?;
        let excess = checkpoints.len().saturating_sub(self.keep);
        for (sequence, path) in checkpoints.into_iter().take(excess) {
            fs::remove_file(&path).map_err(io_error(&path))?;
            tracing::debug!(run_id, sequence, "Pruned checkpoint");
        }
        Ok(())
    }
}

impl CheckpointStore for FileStore {
    fn save(&mut self, state: &SearchState) -> Result<(), StoreError> {
        check_run_id(&state.run_id)?;
        state.check_partition()?;

        let saved_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let record = RecordRef {
            format: FORMAT,
            saved_at_ms,
            state,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(StoreError::Encode)?;

        let path = self.path_for(&state.run_id, state.sequence);
        self.write_atomic(&path, &bytes)?;
        tracing::debug!(
            run_id = %state.run_id,
            sequence = state.sequence,
            path = %path.display(),
            "Checkpoint saved"
        );

        self.prune(&state.run_id)
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<SearchState>, StoreError> {
        let Some((_, path)) = self.checkpoints(run_id)?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        let record: Record = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            path: path.clone(),
            source,
        })?;
        if record.format != FORMAT {
            return Err(StoreError::Format {
                path,
                found: record.format,
            });
        }
        if let Err(source) = record.state.check_partition() {
            return Err(StoreError::Corrupt { path, source });
        }
        Ok(Some(record.state))
    }

    fn discard(&mut self, run_id: &str) -> Result<usize, StoreError> {
        let checkpoints = self.checkpoints(run_id)?;
        let count = checkpoints.len();
        for (_, path) in checkpoints {
            fs::remove_file(&path).map_err(io_error(&path))?;
        }
        tracing::info!(run_id, removed = count, "Discarded checkpoints");
        Ok(count)
    }
}
