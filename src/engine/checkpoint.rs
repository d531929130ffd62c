//! Checkpoint persistence for suspend/resume
//!
//! Provides:
//! - The `Checkpoint` snapshot and its JSON / MessagePack encodings
//! - The `CheckpointStore` trait shared by all backends
//! - In-memory and file-based stores (SQLite lives in `checkpoint_sqlite`)
//!
//! Stores never lock across calls. Two concurrent operations on the same
//! checkpoint id are the caller's problem; operations on distinct ids are safe.
//! The exception is `claim`, which is a single compare-and-set in every backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::engine::state::StateRecord;
use crate::error::{FlowError, FlowResult};

/// Durable snapshot of a suspended traversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique key
    pub checkpoint_id: String,

    /// Step that suspended the traversal; resume follows its outgoing edge
    pub step: String,

    /// Record at the moment of suspension
    pub state: StateRecord,

    /// Indexed copy of the lifecycle label
    pub status: String,

    /// Time of first write for this id
    pub created_at: DateTime<Utc>,

    /// Time of the most recent write
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint for `state`, suspended by `step`
    pub fn new(checkpoint_id: impl Into<String>, step: impl Into<String>, state: StateRecord) -> Self {
        let now = Utc::now();
        Self {
            checkpoint_id: checkpoint_id.into(),
            step: step.into(),
            status: state.status.clone(),
            state,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the indexed status
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Lightweight listing entry
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            step: self.step.clone(),
            status: self.status.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Serialize to bytes (MessagePack, field names kept)
    pub fn to_bytes(&self) -> FlowResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from bytes (MessagePack)
    pub fn from_bytes(bytes: &[u8]) -> FlowResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> FlowResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> FlowResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Checkpoint metadata without the state payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub step: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence backend for suspended records
pub trait CheckpointStore: Send + Sync {
    /// Upsert a checkpoint, fully replacing any previous record for its id
    ///
    /// `created_at` of an existing record is kept; everything else is replaced.
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<()>;

    /// Load a checkpoint, failing with `FlowError::NotFound` when absent
    fn load(&self, checkpoint_id: &str) -> FlowResult<Checkpoint>;

    /// Update only the indexed status
    fn set_status(&self, checkpoint_id: &str, status: &str) -> FlowResult<()>;

    /// Atomically set the indexed status to `status` unless it already is
    ///
    /// Returns `false` when another caller got there first, `NotFound` when
    /// the checkpoint is absent.
    fn claim(&self, checkpoint_id: &str, status: &str) -> FlowResult<bool>;

    /// List checkpoints, optionally filtered by status, oldest first
    fn list(&self, status: Option<&str>) -> FlowResult<Vec<CheckpointSummary>>;

    /// Delete a checkpoint; returns whether one existed
    fn delete(&self, checkpoint_id: &str) -> FlowResult<bool>;

    /// Load only the suspended record
    fn load_state(&self, checkpoint_id: &str) -> FlowResult<StateRecord> {
        self.load(checkpoint_id).map(|checkpoint| checkpoint.state)
    }
}

fn sort_summaries(summaries: &mut [CheckpointSummary]) {
    summaries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
    });
}

/// In-memory store for testing
pub struct MemoryCheckpointStore {
    checkpoints: parking_lot::RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            checkpoints: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<()> {
        let mut checkpoints = self.checkpoints.write();
        let mut record = checkpoint.clone();
        if let Some(existing) = checkpoints.get(&checkpoint.checkpoint_id) {
            record.created_at = existing.created_at;
        }
        checkpoints.insert(record.checkpoint_id.clone(), record);
        Ok(())
    }

    fn load(&self, checkpoint_id: &str) -> FlowResult<Checkpoint> {
        self.checkpoints
            .read()
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))
    }

    fn set_status(&self, checkpoint_id: &str, status: &str) -> FlowResult<()> {
        let mut checkpoints = self.checkpoints.write();
        let checkpoint = checkpoints
            .get_mut(checkpoint_id)
            .ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))?;
        checkpoint.status = status.to_string();
        checkpoint.updated_at = Utc::now();
        Ok(())
    }

    fn claim(&self, checkpoint_id: &str, status: &str) -> FlowResult<bool> {
        let mut checkpoints = self.checkpoints.write();
        let checkpoint = checkpoints
            .get_mut(checkpoint_id)
            .ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))?;
        if checkpoint.status == status {
            return Ok(false);
        }
        checkpoint.status = status.to_string();
        checkpoint.updated_at = Utc::now();
        Ok(true)
    }

    fn list(&self, status: Option<&str>) -> FlowResult<Vec<CheckpointSummary>> {
        let mut summaries: Vec<_> = self
            .checkpoints
            .read()
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .map(Checkpoint::summary)
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    fn delete(&self, checkpoint_id: &str) -> FlowResult<bool> {
        Ok(self.checkpoints.write().remove(checkpoint_id).is_some())
    }
}

/// On-disk encoding for `FileCheckpointStore`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Json,
    Msgpack,
}

impl FileFormat {
    fn extension(self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Msgpack => "msgpack",
        }
    }
}

/// File-based store: one file per checkpoint id
///
/// Writes go to a temporary file in the same directory which is synced and
/// then renamed over the target, so a crash leaves either the old or the new
/// record, never a torn one. `claim` holds an exclusively created
/// `<id>.claim` lock file for the duration of its read-modify-write.
pub struct FileCheckpointStore {
    /// Directory for checkpoint files
    dir: PathBuf,

    format: FileFormat,
}

impl FileCheckpointStore {
    /// Create a store writing JSON files
    pub fn new<P: AsRef<Path>>(dir: P) -> FlowResult<Self> {
        Self::with_format(dir, FileFormat::Json)
    }

    /// Create a store writing MessagePack files
    pub fn msgpack<P: AsRef<Path>>(dir: P) -> FlowResult<Self> {
        Self::with_format(dir, FileFormat::Msgpack)
    }

    pub fn with_format<P: AsRef<Path>>(dir: P, format: FileFormat) -> FlowResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir, format })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get checkpoint file path, rejecting ids that would escape the directory
    fn checkpoint_path(&self, checkpoint_id: &str) -> FlowResult<PathBuf> {
        let valid = !checkpoint_id.is_empty()
            && checkpoint_id != "."
            && checkpoint_id != ".."
            && !checkpoint_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(FlowError::Storage(format!(
                "invalid checkpoint id for file store: {:?}",
                checkpoint_id
            )));
        }
        Ok(self
            .dir
            .join(format!("{}.{}", checkpoint_id, self.format.extension())))
    }

    fn encode(&self, checkpoint: &Checkpoint) -> FlowResult<Vec<u8>> {
        match self.format {
            FileFormat::Json => Ok(checkpoint.to_json()?.into_bytes()),
            FileFormat::Msgpack => checkpoint.to_bytes(),
        }
    }

    fn decode(&self, bytes: &[u8]) -> FlowResult<Checkpoint> {
        match self.format {
            FileFormat::Json => Ok(serde_json::from_slice(bytes)?),
            FileFormat::Msgpack => Checkpoint::from_bytes(bytes),
        }
    }

    fn read(&self, path: &Path) -> FlowResult<Option<Checkpoint>> {
        match fs::read(path) {
            Ok(bytes) => self.decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, path: &Path, checkpoint: &Checkpoint) -> FlowResult<()> {
        let bytes = self.encode(checkpoint)?;
        let tmp = path.with_extension(format!(
            "{}.tmp-{}",
            self.format.extension(),
            uuid::Uuid::new_v4().simple()
        ));

        let result = (|| -> FlowResult<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<()> {
        let path = self.checkpoint_path(&checkpoint.checkpoint_id)?;

        let mut record = checkpoint.clone();
        match self.read(&path) {
            Ok(Some(existing)) => record.created_at = existing.created_at,
            Ok(None) => {}
            Err(err) => warn!(
                checkpoint_id = %checkpoint.checkpoint_id,
                error = %err,
                "Overwriting unreadable checkpoint file"
            ),
        }

        self.write_atomic(&path, &record)
    }

    fn load(&self, checkpoint_id: &str) -> FlowResult<Checkpoint> {
        let path = self.checkpoint_path(checkpoint_id)?;
        self.read(&path)?
            .ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))
    }

    fn set_status(&self, checkpoint_id: &str, status: &str) -> FlowResult<()> {
        let path = self.checkpoint_path(checkpoint_id)?;
        let mut checkpoint = self
            .read(&path)?
            .ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))?;

        checkpoint.status = status.to_string();
        checkpoint.updated_at = Utc::now();
        self.write_atomic(&path, &checkpoint)
    }

    fn claim(&self, checkpoint_id: &str, status: &str) -> FlowResult<bool> {
        let path = self.checkpoint_path(checkpoint_id)?;
        let Some(_lock) = ClaimLock::acquire(path.with_extension("claim"))? else {
            return Ok(false);
        };

        let mut checkpoint = self
            .read(&path)?
            .ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))?;
        if checkpoint.status == status {
            return Ok(false);
        }

        checkpoint.status = status.to_string();
        checkpoint.updated_at = Utc::now();
        self.write_atomic(&path, &checkpoint)?;
        Ok(true)
    }

    fn list(&self, status: Option<&str>) -> FlowResult<Vec<CheckpointSummary>> {
        let ext = self.format.extension();
        let mut summaries = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();

            if path.extension().map_or(false, |e| e == ext) {
                if let Some(checkpoint) = self.read(&path)? {
                    if status.map_or(true, |s| checkpoint.status == s) {
                        summaries.push(checkpoint.summary());
                    }
                }
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    fn delete(&self, checkpoint_id: &str) -> FlowResult<bool> {
        let path = self.checkpoint_path(checkpoint_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Lock file removed on drop
struct ClaimLock(PathBuf);

impl ClaimLock {
    /// `None` when another claim holds the lock
    fn acquire(path: PathBuf) -> FlowResult<Option<Self>> {
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self(path))),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ClaimLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}
