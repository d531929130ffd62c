//! Core engine components

pub mod state;
pub mod graph;
pub mod executor;
pub mod checkpoint;
pub mod checkpoint_sqlite;
