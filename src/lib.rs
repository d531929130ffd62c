//! invoice-flow - Suspendable Step Graph Engine
//!
//! A small workflow engine for partially automated pipelines: a graph of named
//! steps over a shared record, with conditional routing and the ability to
//! durably suspend at any step for human review and resume from exactly that
//! point later, possibly in another process.
//!
//! # Features
//!
//! - Graph construction with full topology validation at `build()`
//! - Suspend/resume through a pluggable checkpoint store
//! - In-memory, file (JSON or MessagePack) and SQLite checkpoint backends
//! - Concurrent batch runs via rayon
//! - A reference invoice-matching pipeline with a human review step
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use invoice_flow::prelude::*;
//!
//! let graph = Arc::new(invoice_flow::invoice::build_graph()?);
//! let store = Arc::new(SqliteCheckpointStore::open("checkpoints.db")?);
//! let executor = Executor::new(graph, store);
//!
//! let invoice = serde_json::json!({"invoice_id": "INV-001", "amount": 1200});
//! match executor.run(StateRecord::from_payload(invoice))? {
//!     Outcome::Completed(state) => println!("done: {}", state.status),
//!     Outcome::Suspended(handle) => println!("review: {}", handle.checkpoint_id),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod engine;
pub mod invoice;
mod error;

// Re-exports
pub use config::{FlowConfig, StoreConfig};
pub use engine::checkpoint::{
    Checkpoint, CheckpointStore, CheckpointSummary, FileCheckpointStore, FileFormat,
    MemoryCheckpointStore,
};
pub use engine::checkpoint_sqlite::SqliteCheckpointStore;
pub use engine::executor::{ExecutionOptions, Executor, Outcome, SuspendedHandle};
pub use engine::graph::{CompiledGraph, Edge, GraphBuilder, Next, Router, Step};
pub use engine::state::{StateRecord, Trace, TraceMark};
pub use error::{ConstructionError, FlowError, FlowResult};

/// Terminal marker: an edge to `END` finishes the traversal
pub const END: &str = "__end__";

/// Synthetic start node used in graph diagrams
pub const START: &str = "__start__";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Checkpoint, CheckpointStore, CompiledGraph, ConstructionError, ExecutionOptions,
        Executor, FileCheckpointStore, FlowConfig, FlowError, FlowResult, GraphBuilder,
        MemoryCheckpointStore, Next, Outcome, SqliteCheckpointStore, StateRecord,
        SuspendedHandle, END, START,
    };
}
