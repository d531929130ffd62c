//! Graph executor with suspend/resume
//!
//! Drives a `CompiledGraph` one step at a time. After every step the record is
//! inspected: a non-empty `checkpoint_id` halts the traversal and persists the
//! record, otherwise the step's outgoing edge picks the successor. Resuming
//! re-enters at that edge, so the suspending step never runs twice.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::engine::checkpoint::{Checkpoint, CheckpointStore};
use crate::engine::graph::{CompiledGraph, Edge, Next};
use crate::engine::state::{StateRecord, TraceMark};
use crate::error::{FlowError, FlowResult};

/// Default bound on step executions per `run`/`resume` call
pub const DEFAULT_MAX_STEPS: usize = 1000;

/// Execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum step executions per call before failing with `StepLimitExceeded`
    pub max_steps: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// Handle returned when a traversal halts awaiting external action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedHandle {
    pub checkpoint_id: String,

    /// Step that requested the suspension
    pub step: String,

    pub status: String,
}

/// Result of a `run` or `resume` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The traversal reached the terminal marker
    Completed(StateRecord),

    /// The record was persisted and the traversal halted
    Suspended(SuspendedHandle),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Outcome::Suspended(_))
    }

    /// Final record, if the traversal completed
    pub fn into_completed(self) -> Option<StateRecord> {
        match self {
            Outcome::Completed(state) => Some(state),
            Outcome::Suspended(_) => None,
        }
    }

    /// Suspension handle, if the traversal halted
    pub fn suspended(&self) -> Option<&SuspendedHandle> {
        match self {
            Outcome::Suspended(handle) => Some(handle),
            Outcome::Completed(_) => None,
        }
    }
}

/// Executes a compiled graph against a checkpoint store
///
/// Holds no per-run state, so one executor can serve many threads.
#[derive(Clone)]
pub struct Executor {
    graph: Arc<CompiledGraph>,
    store: Arc<dyn CheckpointStore>,
    options: ExecutionOptions,
}

impl Executor {
    /// Create an executor with default options
    pub fn new(graph: Arc<CompiledGraph>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            graph,
            store,
            options: ExecutionOptions::default(),
        }
    }

    /// Replace the execution options
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn options(&self) -> ExecutionOptions {
        self.options
    }

    /// Run a fresh record from the entry step
    pub fn run(&self, mut state: StateRecord) -> FlowResult<Outcome> {
        let span = info_span!("run", run_id = %Uuid::new_v4(), graph = self.graph.name());
        let _guard = span.enter();

        if state.checkpoint_id.take().is_some() {
            warn!("Discarding checkpoint_id on a record passed to run()");
        }

        info!(entry = self.graph.entry(), "Starting traversal");
        self.drive(state, Next::step(self.graph.entry()))
    }

    /// Resume a suspended traversal along the suspending step's edge
    pub fn resume(&self, checkpoint_id: &str) -> FlowResult<Outcome> {
        self.resume_with(checkpoint_id, |_| {})
    }

    /// Resume after applying an external decision to the loaded record
    ///
    /// `checkpoint_id` is already cleared when `review` runs. The record's
    /// checkpoint stays in the store; retention is the caller's concern.
    pub fn resume_with<F>(&self, checkpoint_id: &str, review: F) -> FlowResult<Outcome>
    where
        F: FnOnce(&mut StateRecord),
    {
        let span = info_span!(
            "resume",
            run_id = %Uuid::new_v4(),
            graph = self.graph.name(),
            checkpoint_id
        );
        let _guard = span.enter();

        let checkpoint = self.store.load(checkpoint_id)?;
        if !self.graph.has_step(&checkpoint.step) {
            return Err(FlowError::Routing {
                from: format!("checkpoint {}", checkpoint_id),
                target: checkpoint.step,
            });
        }

        let mut state = checkpoint.state;
        state.checkpoint_id = None;
        review(&mut state);
        if state.checkpoint_id.take().is_some() {
            warn!("Review callback set checkpoint_id; cleared before resuming");
        }

        info!(step = %checkpoint.step, "Resuming after suspended step");
        let next = self.next_after(&checkpoint.step, &state)?;
        self.drive(state, next)
    }

    /// Run independent records concurrently
    ///
    /// Results keep the input order. Records must use distinct checkpoint ids
    /// if they can suspend.
    pub fn run_batch(&self, records: Vec<StateRecord>) -> Vec<FlowResult<Outcome>> {
        records
            .into_par_iter()
            .map(|record| self.run(record))
            .collect()
    }

    fn drive(&self, mut state: StateRecord, mut next: Next) -> FlowResult<Outcome> {
        let mut executed = 0usize;

        loop {
            let name = match next {
                Next::End => {
                    info!(steps = executed, status = %state.status, "Traversal completed");
                    return Ok(Outcome::Completed(state));
                }
                Next::Step(name) => name,
            };

            if executed >= self.options.max_steps {
                return Err(FlowError::StepLimitExceeded(self.options.max_steps));
            }

            let step = self.graph.step(&name).ok_or_else(|| FlowError::Routing {
                from: "executor".to_string(),
                target: name.clone(),
            })?;

            let before = state.trace.mark();
            debug!(step = %name, "Executing step");
            state = step.run(state)?;
            executed += 1;

            check_trace(&name, &before, &state)?;

            if state.is_suspended() {
                return self.suspend(name, state);
            }

            next = self.next_after(&name, &state)?;
        }
    }

    /// Successor of `from` for the post-step `state`
    fn next_after(&self, from: &str, state: &StateRecord) -> FlowResult<Next> {
        let edge = self.graph.edge(from).ok_or_else(|| FlowError::Routing {
            from: from.to_string(),
            target: "<no edge>".to_string(),
        })?;

        match edge {
            Edge::Fixed(next) => Ok(next.clone()),
            Edge::Conditional(router) => {
                let next = router.route(state);
                let registered = match &next {
                    Next::End => true,
                    Next::Step(name) => self.graph.has_step(name),
                };

                if !registered || !router.permits(&next) {
                    return Err(FlowError::Routing {
                        from: from.to_string(),
                        target: next.to_string(),
                    });
                }

                debug!(router = %router.name, from, to = %next, "Routed");
                Ok(next)
            }
        }
    }

    fn suspend(&self, step: String, state: StateRecord) -> FlowResult<Outcome> {
        let checkpoint_id = state.checkpoint_id.clone().unwrap_or_default();
        let checkpoint = Checkpoint::new(checkpoint_id.as_str(), step.as_str(), state);

        if let Err(err) = self.store.save(&checkpoint) {
            warn!(checkpoint_id = %checkpoint_id, error = %err, "Suspension not persisted");
            return Err(FlowError::SuspendFailed {
                checkpoint: Box::new(checkpoint),
                reason: err.to_string(),
            });
        }

        info!(checkpoint_id = %checkpoint_id, step = %step, status = %checkpoint.status, "Traversal suspended");
        Ok(Outcome::Suspended(SuspendedHandle {
            checkpoint_id,
            step,
            status: checkpoint.status,
        }))
    }
}

/// Enforce the append-only trace contract for one step execution
fn check_trace(step: &str, before: &TraceMark, state: &StateRecord) -> FlowResult<()> {
    if !state.trace.extends(before) {
        return Err(FlowError::step(step, "trace entries were removed or rewritten"));
    }

    let added = state.trace.len() - before.len();
    if added != 1 {
        warn!(step, added, "Step should append exactly one trace entry");
    }
    Ok(())
}
