//! Error types for invoice-flow

use thiserror::Error;

use crate::engine::checkpoint::Checkpoint;

/// Main error type for the workflow engine
#[derive(Error, Debug)]
pub enum FlowError {
    // Graph construction errors
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    // Routing errors
    #[error("Routing error: router on '{from}' returned unknown destination '{target}'")]
    Routing { from: String, target: String },

    // Checkpoint errors
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The checkpoint could not be persisted while suspending. The unsaved
    /// checkpoint is returned so the caller can retry against any store.
    #[error("Failed to persist checkpoint '{}': {}", .checkpoint.checkpoint_id, .reason)]
    SuspendFailed {
        checkpoint: Box<Checkpoint>,
        reason: String,
    },

    // Execution errors
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("Step limit ({0}) exceeded. Possible infinite loop.")]
    StepLimitExceeded(usize),

    // Config errors
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Invalid graph topology detected by `GraphBuilder::build`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("No entry point defined")]
    NoEntryPoint,

    #[error("Multiple entry points defined: {0:?}")]
    MultipleEntryPoints(Vec<String>),

    #[error("Entry point '{0}' is not a registered step")]
    UnknownEntry(String),

    #[error("Step '{0}' registered more than once")]
    DuplicateStep(String),

    #[error("'{0}' is reserved for the terminal marker")]
    ReservedName(String),

    #[error("Edge {from} -> {to} references an unregistered step")]
    DanglingEdge { from: String, to: String },

    #[error("Step '{0}' has more than one outgoing edge")]
    AmbiguousEdge(String),

    #[error("Step '{0}' has no outgoing edge")]
    MissingEdge(String),
}

impl FlowError {
    /// Build a step failure for collaborator code
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether the failure came from a checkpoint backend
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            FlowError::Storage(_) | FlowError::SuspendFailed { .. }
        )
    }
}

/// Result type alias for invoice-flow
pub type FlowResult<T> = Result<T, FlowError>;

// Conversion implementations
impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Storage(format!("encoding: {err}"))
    }
}

impl From<rmp_serde::encode::Error> for FlowError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        FlowError::Storage(format!("encoding: {err}"))
    }
}

impl From<rmp_serde::decode::Error> for FlowError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        FlowError::Storage(format!("decoding: {err}"))
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(err: rusqlite::Error) -> Self {
        FlowError::Storage(format!("sqlite: {err}"))
    }
}

impl From<r2d2::Error> for FlowError {
    fn from(err: r2d2::Error) -> Self {
        FlowError::Storage(format!("connection pool: {err}"))
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(err: serde_yaml::Error) -> Self {
        FlowError::Config(err.to_string())
    }
}
