//! Step registry, routers and graph construction
//!
//! A `GraphBuilder` records steps, edges and the entry point without checking
//! anything. `GraphBuilder::build` validates the whole topology at once and
//! produces an immutable `CompiledGraph` that can be shared across threads.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::engine::state::StateRecord;
use crate::error::{ConstructionError, FlowResult};
use crate::{END, START};

/// Type alias for the step function signature
pub type StepFn = Arc<dyn Fn(StateRecord) -> FlowResult<StateRecord> + Send + Sync>;

/// Type alias for the router function signature
pub type RouterFn = Arc<dyn Fn(&StateRecord) -> Next + Send + Sync>;

/// Successor of a step: another registered step or the terminal marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Next {
    Step(String),
    End,
}

impl Next {
    /// Successor naming a step
    pub fn step(name: impl Into<String>) -> Self {
        Next::Step(name.into())
    }

    /// Name as used in edges and diagrams (`END` for the terminal marker)
    pub fn as_str(&self) -> &str {
        match self {
            Next::Step(name) => name,
            Next::End => END,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Next::End)
    }
}

impl From<&str> for Next {
    fn from(name: &str) -> Self {
        if name == END {
            Next::End
        } else {
            Next::Step(name.to_string())
        }
    }
}

impl From<String> for Next {
    fn from(name: String) -> Self {
        if name == END {
            Next::End
        } else {
            Next::Step(name)
        }
    }
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered step
#[derive(Clone)]
pub struct Step {
    /// Unique name of the step
    pub name: String,

    run: StepFn,
}

impl Step {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StateRecord) -> FlowResult<StateRecord> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(f),
        }
    }

    /// Hand the record to the step and take back the updated one
    pub fn run(&self, state: StateRecord) -> FlowResult<StateRecord> {
        (self.run)(state)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// A named routing decision bound to one conditional edge
#[derive(Clone)]
pub struct Router {
    /// Router name (used in logs and diagrams)
    pub name: String,

    route: RouterFn,

    /// Destinations the router may return, when declared
    targets: Option<BTreeSet<Next>>,
}

impl Router {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StateRecord) -> Next + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            route: Arc::new(f),
            targets: None,
        }
    }

    /// Declare the destinations this router can return
    ///
    /// Declared destinations are checked by `build()`, and any other result
    /// is a routing error at runtime.
    pub fn with_targets<I, T>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Next>,
    {
        self.targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Decide the successor for `state`
    pub fn route(&self, state: &StateRecord) -> Next {
        (self.route)(state)
    }

    pub fn targets(&self) -> Option<&BTreeSet<Next>> {
        self.targets.as_ref()
    }

    /// Whether `next` is allowed by the declared targets (always true when undeclared)
    pub fn permits(&self, next: &Next) -> bool {
        self.targets.as_ref().map_or(true, |t| t.contains(next))
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("targets", &self.targets)
            .finish()
    }
}

/// Outgoing edge of a step
#[derive(Debug, Clone)]
pub enum Edge {
    /// Always proceed to the given successor
    Fixed(Next),

    /// Successor chosen by a router on the post-step state
    Conditional(Router),
}

/// Label of an edge in the topology view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeLabel {
    Entry,
    Fixed,
    Routed(String),
}

/// Graph under construction
#[must_use = "GraphBuilder must be built before it can be executed"]
pub struct GraphBuilder {
    name: String,
    steps: Vec<Step>,
    edges: Vec<(String, Edge)>,
    entries: Vec<String>,
}

impl GraphBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            name: String::from("unnamed"),
            steps: Vec::new(),
            edges: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Create an empty builder with a graph name
    pub fn with_name(name: impl Into<String>) -> Self {
        let mut builder = Self::new();
        builder.name = name.into();
        builder
    }

    /// Register a step under a unique name
    pub fn register_step<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(StateRecord) -> FlowResult<StateRecord> + Send + Sync + 'static,
    {
        self.steps.push(Step::new(name, f));
        self
    }

    /// Add a fixed edge; `to` may be `END`
    pub fn add_edge(&mut self, from: &str, to: impl Into<Next>) -> &mut Self {
        self.edges.push((from.to_string(), Edge::Fixed(to.into())));
        self
    }

    /// Add a conditional edge whose successor is decided by `f`
    pub fn add_conditional_edge<F>(&mut self, from: &str, f: F) -> &mut Self
    where
        F: Fn(&StateRecord) -> Next + Send + Sync + 'static,
    {
        let router = Router::new(format!("{}_router", from), f);
        self.add_router(from, router)
    }

    /// Add a conditional edge with declared destinations
    pub fn add_conditional_edge_with_targets<F, I, T>(
        &mut self,
        from: &str,
        f: F,
        targets: I,
    ) -> &mut Self
    where
        F: Fn(&StateRecord) -> Next + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        T: Into<Next>,
    {
        let router = Router::new(format!("{}_router", from), f).with_targets(targets);
        self.add_router(from, router)
    }

    /// Bind a prepared router to the outgoing edge of `from`
    pub fn add_router(&mut self, from: &str, router: Router) -> &mut Self {
        self.edges
            .push((from.to_string(), Edge::Conditional(router)));
        self
    }

    /// Designate the entry step
    pub fn set_entry(&mut self, name: &str) -> &mut Self {
        if !self.entries.iter().any(|e| e == name) {
            self.entries.push(name.to_string());
        }
        self
    }

    /// Get the number of registered steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Validate the topology and freeze the graph
    pub fn build(self) -> FlowResult<CompiledGraph> {
        let mut steps: HashMap<String, Step> = HashMap::with_capacity(self.steps.len());
        let mut order = Vec::with_capacity(self.steps.len());

        for step in self.steps {
            if step.name == END || step.name == START {
                return Err(ConstructionError::ReservedName(step.name).into());
            }
            if steps.contains_key(&step.name) {
                return Err(ConstructionError::DuplicateStep(step.name).into());
            }
            order.push(step.name.clone());
            steps.insert(step.name.clone(), step);
        }

        let entry = match self.entries.as_slice() {
            [] => return Err(ConstructionError::NoEntryPoint.into()),
            [entry] => entry.clone(),
            many => return Err(ConstructionError::MultipleEntryPoints(many.to_vec()).into()),
        };
        if !steps.contains_key(&entry) {
            return Err(ConstructionError::UnknownEntry(entry).into());
        }

        let mut edges: HashMap<String, Edge> = HashMap::with_capacity(self.edges.len());
        for (from, edge) in self.edges {
            let dangling = |to: &str| ConstructionError::DanglingEdge {
                from: from.clone(),
                to: to.to_string(),
            };

            if !steps.contains_key(&from) {
                let to = match &edge {
                    Edge::Fixed(next) => next.as_str().to_string(),
                    Edge::Conditional(router) => router.name.clone(),
                };
                return Err(dangling(&to).into());
            }

            match &edge {
                Edge::Fixed(Next::Step(to)) if !steps.contains_key(to) => {
                    return Err(dangling(to.as_str()).into());
                }
                Edge::Conditional(router) => {
                    if let Some(targets) = router.targets() {
                        for target in targets {
                            if let Next::Step(to) = target {
                                if !steps.contains_key(to) {
                                    return Err(dangling(to.as_str()).into());
                                }
                            }
                        }
                    }
                }
                _ => {}
            }

            if edges.contains_key(&from) {
                return Err(ConstructionError::AmbiguousEdge(from).into());
            }
            edges.insert(from, edge);
        }

        for name in &order {
            if !edges.contains_key(name) {
                return Err(ConstructionError::MissingEdge(name.clone()).into());
            }
        }

        let graph = CompiledGraph::new(self.name, steps, edges, entry, order);
        graph.warn_unreachable();
        Ok(graph)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("name", &self.name)
            .field("step_count", &self.steps.len())
            .field("edge_count", &self.edges.len())
            .field("entries", &self.entries)
            .finish()
    }
}

/// A validated graph ready for execution
///
/// Read-only after construction; share it between executors with `Arc`.
#[must_use = "CompiledGraph should be passed to Executor for execution"]
pub struct CompiledGraph {
    name: String,
    steps: HashMap<String, Step>,
    edges: HashMap<String, Edge>,
    entry: String,

    /// Registration order
    order: Vec<String>,

    /// Topology view over fixed edges and declared router targets
    topology: DiGraph<String, EdgeLabel>,
    node_indices: HashMap<String, NodeIndex>,
}

impl CompiledGraph {
    fn new(
        name: String,
        steps: HashMap<String, Step>,
        edges: HashMap<String, Edge>,
        entry: String,
        order: Vec<String>,
    ) -> Self {
        let mut topology = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node in [START, END].iter().copied().chain(order.iter().map(String::as_str)) {
            let idx = topology.add_node(node.to_string());
            node_indices.insert(node.to_string(), idx);
        }

        topology.add_edge(node_indices[START], node_indices[entry.as_str()], EdgeLabel::Entry);
        for name in &order {
            let from = node_indices[name.as_str()];
            match &edges[name.as_str()] {
                Edge::Fixed(next) => {
                    topology.add_edge(from, node_indices[next.as_str()], EdgeLabel::Fixed);
                }
                Edge::Conditional(router) => {
                    for target in router.targets().into_iter().flatten() {
                        topology.add_edge(
                            from,
                            node_indices[target.as_str()],
                            EdgeLabel::Routed(router.name.clone()),
                        );
                    }
                }
            }
        }

        Self {
            name,
            steps,
            edges,
            entry,
            order,
            topology,
            node_indices,
        }
    }

    /// Get graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get entry step name
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Check if graph has a step
    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Get the outgoing edge of a step
    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.get(name)
    }

    /// Step names in registration order
    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    /// Get the number of registered steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Whether every conditional edge declares its destinations
    pub fn is_fully_declared(&self) -> bool {
        self.edges.values().all(|edge| match edge {
            Edge::Fixed(_) => true,
            Edge::Conditional(router) => router.targets().is_some(),
        })
    }

    /// Steps reachable from the entry point in the topology view
    ///
    /// Only exact when `is_fully_declared()`; undeclared routers contribute no
    /// outgoing edges.
    pub fn reachable_steps(&self) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&self.topology, self.node_indices[START]);
        while let Some(idx) = dfs.next(&self.topology) {
            let name = &self.topology[idx];
            if self.steps.contains_key(name) {
                reachable.insert(name.clone());
            }
        }
        reachable
    }

    fn warn_unreachable(&self) {
        if !self.is_fully_declared() {
            return;
        }
        let reachable = self.reachable_steps();
        for name in &self.order {
            if !reachable.contains(name) {
                tracing::warn!(graph = %self.name, step = %name, "step is unreachable from entry");
            }
        }
    }

    /// Generate Mermaid graph syntax for the topology
    ///
    /// Conditional edges with declared targets render as dotted edges labelled
    /// with the router name; undeclared routers render as a decision node.
    pub fn to_mermaid(&self) -> String {
        fn escape_node_id(name: &str) -> String {
            name.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect()
        }

        let mut lines = vec!["graph TD".to_string()];
        lines.push(format!("    {}((Start))", escape_node_id(START)));
        for name in &self.order {
            lines.push(format!("    {}[{}]", escape_node_id(name), name.replace('"', "'")));
        }
        lines.push(format!("    {}((End))", escape_node_id(END)));

        let start = self.node_indices[START];
        for edge in self.topology.edges_directed(start, Direction::Outgoing) {
            lines.push(format!(
                "    {}-->{}",
                escape_node_id(START),
                escape_node_id(&self.topology[edge.target()])
            ));
        }

        for name in &self.order {
            let from = escape_node_id(name);
            match &self.edges[name.as_str()] {
                Edge::Fixed(next) => {
                    lines.push(format!("    {}-->{}", from, escape_node_id(next.as_str())));
                }
                Edge::Conditional(router) => match router.targets() {
                    Some(targets) => {
                        for target in targets {
                            lines.push(format!(
                                "    {}-.->|{}|{}",
                                from,
                                router.name,
                                escape_node_id(target.as_str())
                            ));
                        }
                    }
                    None => {
                        let decision = escape_node_id(&router.name);
                        lines.push(format!("    {}-.->{}{{{}}}", from, decision, router.name));
                    }
                },
            }
        }

        lines.join("\n")
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("steps", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;

    fn passthrough(state: StateRecord) -> FlowResult<StateRecord> {
        Ok(state)
    }

    fn construction_error(builder: GraphBuilder) -> ConstructionError {
        match builder.build() {
            Err(FlowError::Construction(err)) => err,
            other => panic!("expected construction error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_next_from_str() {
        assert_eq!(Next::from(END), Next::End);
        assert_eq!(Next::from("B"), Next::step("B"));
        assert_eq!(Next::End.as_str(), END);
    }

    #[test]
    fn test_build_linear_graph() {
        let mut builder = GraphBuilder::with_name("linear");
        builder
            .register_step("a", passthrough)
            .register_step("b", passthrough)
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_entry("a");

        let graph = builder.build().unwrap();
        assert_eq!(graph.name(), "linear");
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.step_names(), ["a".to_string(), "b".to_string()]);
        assert!(matches!(graph.edge("a"), Some(Edge::Fixed(Next::Step(s))) if s == "b"));
    }

    #[test]
    fn test_missing_entry() {
        let mut builder = GraphBuilder::new();
        builder.register_step("a", passthrough).add_edge("a", END);
        assert_eq!(construction_error(builder), ConstructionError::NoEntryPoint);
    }

    #[test]
    fn test_reserved_name() {
        let mut builder = GraphBuilder::new();
        builder.register_step(END, passthrough).set_entry(END);
        assert_eq!(
            construction_error(builder),
            ConstructionError::ReservedName(END.to_string())
        );
    }

    #[test]
    fn test_router_permits_declared_targets_only() {
        let router = Router::new("r", |_| Next::End).with_targets(["b", END]);
        assert!(router.permits(&Next::End));
        assert!(router.permits(&Next::step("b")));
        assert!(!router.permits(&Next::step("c")));

        let open = Router::new("open", |_| Next::End);
        assert!(open.permits(&Next::step("anything")));
    }

    #[test]
    fn test_reachable_steps() {
        let mut builder = GraphBuilder::new();
        builder
            .register_step("a", passthrough)
            .register_step("b", passthrough)
            .register_step("orphan", passthrough)
            .add_conditional_edge_with_targets("a", |_| Next::step("b"), ["b"])
            .add_edge("b", END)
            .add_edge("orphan", END)
            .set_entry("a");

        let graph = builder.build().unwrap();
        assert!(graph.is_fully_declared());
        let reachable = graph.reachable_steps();
        assert!(reachable.contains("a"));
        assert!(reachable.contains("b"));
        assert!(!reachable.contains("orphan"));
    }
}
