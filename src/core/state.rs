use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

pub const CURRENT_VERSION: &str = "2";
pub const CHECKPOINT_INTERVAL: usize = 100;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown version: '{0}'")]
    UnknownVersion(String),
    #[error("state file has no version: {0}")]
    MissingVersion(PathBuf),
    #[error("unable to load state version '{version}': {source}")]
    Decode {
        version: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("state io error: {0}")]
    Io(#[from] io::Error),
}

/// Persisted progress of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub remaining_count: usize,
    #[serde(default, alias = "paths")]
    pub remaining_paths: Vec<PathBuf>,
}

impl ExecutionState {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            version: CURRENT_VERSION.to_string(),
            create_time: now,
            update_time: now,
            roots,
            total_count: 0,
            remaining_count: 0,
            remaining_paths: Vec::new(),
        }
    }

    pub fn completed(&self) -> usize {
        self.total_count.saturating_sub(self.remaining_paths.len())
    }
}

#[derive(Debug, Deserialize)]
struct StateV1 {
    #[serde(default)]
    roots: Vec<PathBuf>,
}

struct Migration {
    from: &'static str,
    to: &'static str,
    apply: fn(Value) -> Result<Value, serde_json::Error>,
}

const MIGRATIONS: &[Migration] = &[Migration {
    from: "1",
    to: "2",
    apply: migrate_v1_to_v2,
}];

// only the roots survive; the old checkpoint path has no v2 counterpart
fn migrate_v1_to_v2(old: Value) -> Result<Value, serde_json::Error> {
    let old: StateV1 = serde_json::from_value(old)?;
    serde_json::to_value(ExecutionState::new(old.roots))
}

pub fn state_file_path(base_dir: &Path, op_name: &str) -> PathBuf {
    base_dir.join(format!(".repofleet.state-{op_name}.json"))
}

/// File-backed execution state with its own lock, separate from the output lock.
pub struct StateStore {
    path: PathBuf,
    persistent: bool,
    state: Mutex<ExecutionState>,
}

impl StateStore {
    pub fn load_or_create(
        base_dir: &Path,
        op_name: &str,
        roots: &[PathBuf],
    ) -> Result<Self, StateError> {
        let path = state_file_path(base_dir, op_name);
        let state = match load_migrated(&path)? {
            Some(state) => {
                tracing::info!(
                    path = %path.display(),
                    remaining = state.remaining_paths.len(),
                    total = state.total_count,
                    "loaded execution state"
                );
                state
            }
            None => ExecutionState::new(roots.to_vec()),
        };

        Ok(Self {
            path,
            persistent: true,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Stops all writes and deletes; used for single-repository runs.
    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn snapshot(&self) -> ExecutionState {
        self.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock().remaining_paths.len()
    }

    pub fn restart(&self, roots: &[PathBuf]) {
        *self.lock() = ExecutionState::new(roots.to_vec());
    }

    pub fn set_paths(&self, paths: Vec<PathBuf>) {
        let mut state = self.lock();
        state.total_count = paths.len();
        state.remaining_count = paths.len();
        state.remaining_paths = paths;
    }

    pub fn save(&self) -> Result<(), StateError> {
        let mut state = self.lock();
        self.write(&mut state)
    }

    /// Writes the state when `index` falls on the checkpoint interval.
    pub fn save_checkpoint(&self, index: usize) -> Result<(), StateError> {
        let mut state = self.lock();
        self.checkpoint(&mut state, index)
    }

    /// Removes a finished path; `completed` is the run-wide completion count.
    pub fn complete(&self, path: &Path, completed: usize) -> Result<(), StateError> {
        let mut state = self.lock();
        state.remaining_paths.retain(|remaining| remaining != path);
        self.checkpoint(&mut state, completed)
    }

    pub fn clear(&self) -> Result<(), StateError> {
        if !self.persistent {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "cleared execution state");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists unfinished work, or removes the file once nothing remains.
    pub fn finish(&self) -> Result<(), StateError> {
        let mut state = self.lock();
        if state.remaining_paths.is_empty() {
            drop(state);
            return self.clear();
        }
        self.write(&mut state)
    }

    fn checkpoint(&self, state: &mut ExecutionState, index: usize) -> Result<(), StateError> {
        if index % CHECKPOINT_INTERVAL != 0 {
            return Ok(());
        }
        tracing::debug!(index, remaining = state.remaining_paths.len(), "checkpoint");
        self.write(state)
    }

    fn write(&self, state: &mut ExecutionState) -> Result<(), StateError> {
        state.update_time = OffsetDateTime::now_utc();
        state.remaining_count = state.remaining_paths.len();
        if !self.persistent {
            return Ok(());
        }
        write_atomic(&self.path, state)
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_migrated(path: &Path) -> Result<Option<ExecutionState>, StateError> {
    loop {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value: Value = serde_json::from_str(&contents).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let version = value
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StateError::MissingVersion(path.to_path_buf()))?;

        if version == CURRENT_VERSION {
            return serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StateError::Decode { version, source });
        }

        let migration = MIGRATIONS
            .iter()
            .find(|migration| migration.from == version)
            .ok_or_else(|| StateError::UnknownVersion(version.clone()))?;
        tracing::info!(
            path = %path.display(),
            from = migration.from,
            to = migration.to,
            "migrating execution state"
        );
        let migrated =
            (migration.apply)(value).map_err(|source| StateError::Decode { version, source })?;
        write_atomic(path, &migrated)?;
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let data = serde_json::to_vec_pretty(value).map_err(StateError::Encode)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&data)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
