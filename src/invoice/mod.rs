//! Invoice matching pipeline
//!
//! ```text
//! INTAKE -> UNDERSTAND -> PREPARE -> RETRIEVE -> MATCH_TWO_WAY
//!     MATCH_TWO_WAY --FAILED--> CHECKPOINT_HITL (suspends) -> FINALIZE
//!     MATCH_TWO_WAY --else----> FINALIZE
//! FINALIZE -> END
//! ```
//!
//! The step bodies are placeholders: they copy fields around and compare the
//! invoice amount with the purchase order amount so that routing has
//! something to observe. A reviewer resumes a paused invoice by setting
//! `decision` to `APPROVED` or `REJECTED`.

mod steps;

pub use steps::{
    checkpoint_hitl, finalize, intake, match_two_way, prepare, retrieve, route_after_match,
    understand,
};

use crate::engine::graph::{CompiledGraph, GraphBuilder};
use crate::error::FlowResult;
use crate::END;

// Step names
pub const INTAKE: &str = "INTAKE";
pub const UNDERSTAND: &str = "UNDERSTAND";
pub const PREPARE: &str = "PREPARE";
pub const RETRIEVE: &str = "RETRIEVE";
pub const MATCH_TWO_WAY: &str = "MATCH_TWO_WAY";
pub const CHECKPOINT_HITL: &str = "CHECKPOINT_HITL";
pub const FINALIZE: &str = "FINALIZE";

// Decisions
pub const MATCHED: &str = "MATCHED";
pub const FAILED: &str = "FAILED";
pub const APPROVED: &str = "APPROVED";
pub const REJECTED: &str = "REJECTED";

// Statuses
pub const STATUS_INGESTED: &str = "INGESTED";
pub const STATUS_PAUSED: &str = "PAUSED_FOR_HITL";
pub const STATUS_CLAIMED: &str = "CLAIMED";
pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_REJECTED: &str = "REJECTED";
pub const STATUS_UNRESOLVED: &str = "UNRESOLVED";

/// Minimum two-way match score accepted without review
pub const MATCH_THRESHOLD: f64 = 0.9;

/// Build the invoice pipeline graph
pub fn build_graph() -> FlowResult<CompiledGraph> {
    let mut builder = GraphBuilder::with_name("invoice");
    builder
        .register_step(INTAKE, intake)
        .register_step(UNDERSTAND, understand)
        .register_step(PREPARE, prepare)
        .register_step(RETRIEVE, retrieve)
        .register_step(MATCH_TWO_WAY, match_two_way)
        .register_step(CHECKPOINT_HITL, checkpoint_hitl)
        .register_step(FINALIZE, finalize)
        .set_entry(INTAKE)
        .add_edge(INTAKE, UNDERSTAND)
        .add_edge(UNDERSTAND, PREPARE)
        .add_edge(PREPARE, RETRIEVE)
        .add_edge(RETRIEVE, MATCH_TWO_WAY)
        .add_conditional_edge_with_targets(
            MATCH_TWO_WAY,
            route_after_match,
            [CHECKPOINT_HITL, FINALIZE],
        )
        .add_edge(CHECKPOINT_HITL, FINALIZE)
        .add_edge(FINALIZE, END);

    builder.build()
}

/// Checkpoint id used when `invoice_id` pauses for review
pub fn checkpoint_id_for(invoice_id: &str) -> String {
    format!("hitl_{}", invoice_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_builds_fully_declared() {
        let graph = build_graph().unwrap();
        assert_eq!(graph.entry(), INTAKE);
        assert_eq!(graph.step_count(), 7);
        assert!(graph.is_fully_declared());
        assert_eq!(graph.reachable_steps().len(), 7);
    }

    #[test]
    fn test_mermaid_shows_review_branch() {
        let mermaid = build_graph().unwrap().to_mermaid();
        assert!(mermaid.contains("MATCH_TWO_WAY-.->|MATCH_TWO_WAY_router|CHECKPOINT_HITL"));
        assert!(mermaid.contains("CHECKPOINT_HITL-->FINALIZE"));
    }
}
