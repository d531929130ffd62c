//! Runtime configuration
//!
//! Loaded from YAML:
//!
//! ```yaml
//! max_steps: 500
//! checkpoint:
//!   backend: sqlite
//!   path: ./checkpoints.db
//! ```
//!
//! Every field has a default, so an empty document is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::checkpoint::{
    CheckpointStore, FileCheckpointStore, FileFormat, MemoryCheckpointStore,
};
use crate::engine::checkpoint_sqlite::SqliteCheckpointStore;
use crate::engine::executor::{ExecutionOptions, DEFAULT_MAX_STEPS};
use crate::error::{FlowError, FlowResult};

/// Environment variable selecting a SQLite database path
pub const ENV_DB: &str = "INVOICE_FLOW_DB";

/// Environment variable overriding `max_steps`
pub const ENV_MAX_STEPS: &str = "INVOICE_FLOW_MAX_STEPS";

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

fn default_db_path() -> PathBuf {
    PathBuf::from("checkpoints.db")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Checkpoint backend
    #[serde(default)]
    pub checkpoint: StoreConfig,

    /// Step execution bound per run/resume call
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            checkpoint: StoreConfig::default(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// Checkpoint backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local; lost on exit
    Memory,

    /// One file per checkpoint under `dir`
    File {
        #[serde(default = "default_checkpoint_dir")]
        dir: PathBuf,
        #[serde(default)]
        format: FileFormat,
    },

    /// SQLite database file
    Sqlite {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: default_db_path(),
        }
    }
}

impl StoreConfig {
    /// Open the configured backend
    pub fn open(&self) -> FlowResult<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryCheckpointStore::new()),
            StoreConfig::File { dir, format } => {
                Arc::new(FileCheckpointStore::with_format(dir, *format)?)
            }
            StoreConfig::Sqlite { path } => Arc::new(SqliteCheckpointStore::open(path)?),
        };
        Ok(store)
    }
}

impl FlowConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> FlowResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: FlowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Apply `INVOICE_FLOW_DB` and `INVOICE_FLOW_MAX_STEPS` from the process environment
    pub fn with_env_overrides(self) -> FlowResult<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(mut self, lookup: F) -> FlowResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB).filter(|p| !p.is_empty()) {
            self.checkpoint = StoreConfig::Sqlite {
                path: PathBuf::from(path),
            };
        }

        if let Some(raw) = lookup(ENV_MAX_STEPS) {
            self.max_steps = raw.trim().parse().map_err(|_| {
                FlowError::Config(format!("{} must be a positive integer, got {:?}", ENV_MAX_STEPS, raw))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> FlowResult<()> {
        if self.max_steps == 0 {
            return Err(FlowError::Config("max_steps must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Open the configured checkpoint store
    pub fn open_store(&self) -> FlowResult<Arc<dyn CheckpointStore>> {
        self.checkpoint.open()
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            max_steps: self.max_steps,
        }
    }
}
