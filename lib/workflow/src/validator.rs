//! Static checks run before a graph is executed.
//!
//! The validator never mutates the graph. It returns every fatal
//! [`StructuralError`] it finds, plus advisory [`ValidationWarning`]s the
//! engine logs and otherwise ignores. Container bodies are checked
//! recursively with their own rules: the body's root is its start marker and
//! its terminal is its end marker.

use crate::edge::Handle;
use crate::error::StructuralError;
use crate::graph::WorkflowGraph;
use crate::node::{Capability, ContainerBody, Node, NodeKind};
use crate::selector::{PathSegment, RESERVED_NAMESPACES, Selector};
use petgraph::algo::toposort;
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tidewater_core::NodeId;

/// A problem that does not stop a run from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// No path from the entry node reaches this node.
    UnreachableNode { node_id: NodeId },
    /// A branch handle with no outgoing edge; choosing it ends the branch.
    UnwiredHandle { node_id: NodeId, handle: Handle },
    /// Choosing this branch handle can never reach a terminal node.
    BranchWithoutTerminal { node_id: NodeId, handle: Handle },
    StartWithoutVariables { node_id: NodeId },
    EndWithoutOutputs { node_id: NodeId },
    TaskWithoutOutputs { node_id: NodeId },
    EmptyAggregator { node_id: NodeId },
    EmptyCase { node_id: NodeId, case_id: String },
    /// A warning found inside a container body.
    InContainer {
        container: NodeId,
        warning: Box<ValidationWarning>,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreachableNode { node_id } => {
                write!(f, "node {node_id} is unreachable from the start node")
            }
            Self::UnwiredHandle { node_id, handle } => {
                write!(f, "handle '{handle}' of node {node_id} has no outgoing edge")
            }
            Self::BranchWithoutTerminal { node_id, handle } => write!(
                f,
                "handle '{handle}' of node {node_id} never reaches an end node"
            ),
            Self::StartWithoutVariables { node_id } => {
                write!(f, "start node {node_id} declares no variables")
            }
            Self::EndWithoutOutputs { node_id } => {
                write!(f, "end node {node_id} declares no outputs")
            }
            Self::TaskWithoutOutputs { node_id } => {
                write!(f, "task node {node_id} declares no outputs")
            }
            Self::EmptyAggregator { node_id } => {
                write!(f, "aggregator {node_id} has no variables")
            }
            Self::EmptyCase { node_id, case_id } => {
                write!(f, "case '{case_id}' of node {node_id} has no conditions")
            }
            Self::InContainer { container, warning } => {
                write!(f, "in container {container}: {warning}")
            }
        }
    }
}

/// Everything the validator found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<StructuralError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// Returns true if the graph may be executed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Fields a node exposes to selectors; `None` accepts any field.
type Visible = HashMap<NodeId, Option<HashSet<String>>>;

/// Which rules apply to the graph being checked.
#[derive(Clone, Copy)]
enum Scope<'a> {
    Workflow,
    Body {
        container: &'a Node,
        body: &'a ContainerBody,
    },
}

/// Validates workflow graphs.
pub struct GraphValidator;

impl GraphValidator {
    /// Validates a top-level workflow graph.
    #[must_use]
    pub fn validate(graph: &WorkflowGraph) -> ValidationReport {
        let mut visible: Visible = RESERVED_NAMESPACES
            .iter()
            .map(|ns| (NodeId::new(*ns), None))
            .collect();
        add_visible(&mut visible, graph);

        let mut report = ValidationReport::default();
        check_graph(graph, Scope::Workflow, &visible, &mut report);
        report
    }
}

fn add_visible(visible: &mut Visible, graph: &WorkflowGraph) {
    for node in graph.nodes() {
        let fields = node
            .output_names()
            .map(|names| names.into_iter().collect::<HashSet<_>>());
        visible.insert(node.id.clone(), fields);
    }
}

/// Fields a container exposes to its own body.
fn container_fields(container: &Node) -> HashSet<String> {
    let mut fields: HashSet<String> = HashSet::from(["index".to_owned()]);
    match &container.kind {
        NodeKind::Iteration(_) => {
            fields.insert("item".to_owned());
        }
        NodeKind::Loop(config) => {
            fields.extend(config.loop_variables.iter().map(|v| v.name.clone()));
        }
        _ => {}
    }
    fields
}

fn check_graph(graph: &WorkflowGraph, scope: Scope<'_>, visible: &Visible, report: &mut ValidationReport) {
    let errors = &mut report.errors;

    for node_id in graph.duplicate_nodes() {
        errors.push(StructuralError::DuplicateNode {
            node_id: node_id.clone(),
        });
    }
    for edge_id in graph.duplicate_edges() {
        errors.push(StructuralError::DuplicateEdge {
            edge_id: edge_id.clone(),
        });
    }
    for edge in graph.unresolved_edges() {
        let missing = if graph.contains_node(&edge.source) {
            &edge.target
        } else {
            &edge.source
        };
        errors.push(StructuralError::DanglingEdge {
            edge_id: edge.id.clone(),
            node_id: missing.clone(),
        });
    }

    let root = check_roots(graph, scope, errors);
    check_edges(graph, scope, errors);
    check_nodes(graph, scope, visible, report);

    let skeleton = graph.forward_skeleton();
    if let Err(cycle) = toposort(&skeleton, None) {
        report.errors.push(StructuralError::CycleDetected {
            node_id: skeleton[cycle.node_id()].clone(),
        });
    }

    if let Some(root) = root {
        check_reachability(graph, scope, &root, report);
    }

    for node in graph.nodes() {
        if let Some(body) = node.kind.body() {
            check_body(node, body, visible, report);
        }
    }
}

/// Checks the entry node, returning it if there is exactly one.
fn check_roots(
    graph: &WorkflowGraph,
    scope: Scope<'_>,
    errors: &mut Vec<StructuralError>,
) -> Option<NodeId> {
    match scope {
        Scope::Workflow => {
            for node in graph.nodes() {
                if node.capability() == Capability::Marker {
                    errors.push(StructuralError::MisplacedNode {
                        node_id: node.id.clone(),
                        kind: node.kind.name(),
                    });
                }
            }
            let roots = graph.root_nodes();
            match roots.as_slice() {
                [] => {
                    errors.push(StructuralError::NoRootNode);
                    None
                }
                [root] => {
                    if !graph.incoming(&root.id).is_empty() {
                        errors.push(StructuralError::RootHasIncomingEdges {
                            node_id: root.id.clone(),
                        });
                    }
                    Some(root.id.clone())
                }
                many => {
                    errors.push(StructuralError::MultipleRootNodes {
                        node_ids: many.iter().map(|n| n.id.clone()).collect(),
                    });
                    None
                }
            }
        }
        Scope::Body { container, body } => {
            for node in graph.nodes() {
                let misplaced = match &node.kind {
                    NodeKind::Start(_) | NodeKind::End(_) => true,
                    NodeKind::ContainerStart => node.id != body.start_node_id,
                    NodeKind::ContainerEnd(_) => node.id != body.end_node_id,
                    _ => false,
                };
                if misplaced {
                    errors.push(StructuralError::MisplacedNode {
                        node_id: node.id.clone(),
                        kind: node.kind.name(),
                    });
                }
            }

            let start_ok = graph
                .get_node(&body.start_node_id)
                .is_some_and(|n| matches!(n.kind, NodeKind::ContainerStart));
            if !start_ok {
                errors.push(StructuralError::InvalidContainerMarker {
                    container: container.id.clone(),
                    marker: body.start_node_id.clone(),
                });
            }
            let end_ok = graph
                .get_node(&body.end_node_id)
                .is_some_and(|n| matches!(n.kind, NodeKind::ContainerEnd(_)));
            if !end_ok {
                errors.push(StructuralError::InvalidContainerMarker {
                    container: container.id.clone(),
                    marker: body.end_node_id.clone(),
                });
            }
            if !start_ok {
                return None;
            }

            let has_forward_incoming = graph
                .incoming(&body.start_node_id)
                .iter()
                .any(|e| !e.is_loop());
            if has_forward_incoming {
                errors.push(StructuralError::RootHasIncomingEdges {
                    node_id: body.start_node_id.clone(),
                });
            }
            Some(body.start_node_id.clone())
        }
    }
}

fn check_edges(graph: &WorkflowGraph, scope: Scope<'_>, errors: &mut Vec<StructuralError>) {
    for edge in graph.edges() {
        if let Some(source) = graph.get_node(&edge.source)
            && !source.declared_handles().contains(&edge.source_handle)
        {
            errors.push(StructuralError::InvalidSourceHandle {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
                handle: edge.source_handle.clone(),
            });
        }

        if !edge.is_loop() {
            continue;
        }
        match scope {
            Scope::Workflow => errors.push(StructuralError::StrayLoopEdge {
                edge_id: edge.id.clone(),
            }),
            Scope::Body { body, .. } => {
                if edge.target != body.start_node_id {
                    errors.push(StructuralError::LoopEdgeTarget {
                        edge_id: edge.id.clone(),
                        target: edge.target.clone(),
                        expected: body.start_node_id.clone(),
                    });
                }
            }
        }
    }
}

fn check_nodes(graph: &WorkflowGraph, scope: Scope<'_>, visible: &Visible, report: &mut ValidationReport) {
    for node in graph.nodes() {
        let uses_strategy = !node.error_strategy.is_abort() || node.retry.is_some();
        if uses_strategy && !matches!(node.kind, NodeKind::Task(_)) {
            report.errors.push(StructuralError::StrategyNotAllowed {
                node_id: node.id.clone(),
                kind: node.kind.name(),
            });
        }
        if matches!(node.kind, NodeKind::HumanInput(_)) && matches!(scope, Scope::Body { .. }) {
            report.errors.push(StructuralError::PauseInsideContainer {
                node_id: node.id.clone(),
            });
        }

        for selector in node.kind.referenced_selectors() {
            check_selector(&node.id, selector, visible, &mut report.errors);
        }

        let warning = match &node.kind {
            NodeKind::Start(config) if config.variables.is_empty() => {
                Some(ValidationWarning::StartWithoutVariables {
                    node_id: node.id.clone(),
                })
            }
            NodeKind::End(config) | NodeKind::ContainerEnd(config) if config.outputs.is_empty() => {
                Some(ValidationWarning::EndWithoutOutputs {
                    node_id: node.id.clone(),
                })
            }
            NodeKind::Task(config) if config.outputs.is_empty() => {
                Some(ValidationWarning::TaskWithoutOutputs {
                    node_id: node.id.clone(),
                })
            }
            NodeKind::VariableAggregator(config) if config.variables.is_empty() => {
                Some(ValidationWarning::EmptyAggregator {
                    node_id: node.id.clone(),
                })
            }
            _ => None,
        };
        report.warnings.extend(warning);

        match &node.kind {
            NodeKind::IfElse(config) => {
                for case in config.cases.iter().filter(|c| c.conditions.is_empty()) {
                    report.warnings.push(ValidationWarning::EmptyCase {
                        node_id: node.id.clone(),
                        case_id: case.case_id.clone(),
                    });
                }
            }
            NodeKind::Loop(config) => {
                if config.loop_count == 0 {
                    report.errors.push(StructuralError::ZeroLoopCount {
                        node_id: node.id.clone(),
                    });
                }
                // Break conditions see the loop's own variables.
                let mut loop_visible = visible.clone();
                loop_visible.insert(node.id.clone(), Some(container_fields(node)));
                for condition in &config.break_conditions {
                    check_selector(
                        &node.id,
                        &condition.variable_selector,
                        &loop_visible,
                        &mut report.errors,
                    );
                }
            }
            _ => {}
        }
    }
}

fn check_selector(
    node_id: &NodeId,
    selector: &Selector,
    visible: &Visible,
    errors: &mut Vec<StructuralError>,
) {
    match visible.get(selector.node_id()) {
        None => errors.push(StructuralError::UnknownSelectorSource {
            node_id: node_id.clone(),
            selector: selector.clone(),
        }),
        Some(Some(fields)) => {
            if let PathSegment::Key(field) = selector.root_field()
                && !fields.contains(field)
            {
                errors.push(StructuralError::UnknownOutputField {
                    node_id: node_id.clone(),
                    selector: selector.clone(),
                });
            }
        }
        Some(None) => {}
    }
}

fn is_terminal(scope: Scope<'_>, node: &Node) -> bool {
    match scope {
        Scope::Workflow => node.is_response(),
        Scope::Body { body, .. } => node.id == body.end_node_id,
    }
}

/// Nodes reachable from `from` over forward edges.
fn reachable_from(graph: &WorkflowGraph, from: &[&NodeId]) -> HashSet<NodeId> {
    let skeleton = graph.forward_skeleton();
    let index: HashMap<&NodeId, _> = skeleton
        .node_indices()
        .map(|i| (&skeleton[i], i))
        .collect();

    let mut seen = HashSet::new();
    for start in from {
        let Some(&start) = index.get(start) else {
            continue;
        };
        let mut bfs = Bfs::new(&skeleton, start);
        while let Some(next) = bfs.next(&skeleton) {
            seen.insert(skeleton[next].clone());
        }
    }
    seen
}

fn check_reachability(
    graph: &WorkflowGraph,
    scope: Scope<'_>,
    root: &NodeId,
    report: &mut ValidationReport,
) {
    let reachable = reachable_from(graph, &[root]);

    let has_terminal = graph.nodes().any(|n| is_terminal(scope, n));
    if matches!(scope, Scope::Workflow) && !has_terminal {
        report.errors.push(StructuralError::NoTerminalNode);
        return;
    }
    let terminal_reachable = graph
        .nodes()
        .any(|n| is_terminal(scope, n) && reachable.contains(&n.id));
    if has_terminal && !terminal_reachable {
        report.errors.push(StructuralError::TerminalUnreachable);
    }

    let mut unreachable: Vec<&NodeId> = graph
        .nodes()
        .map(|n| &n.id)
        .filter(|id| !reachable.contains(*id))
        .collect();
    unreachable.sort();
    for node_id in unreachable {
        report.warnings.push(ValidationWarning::UnreachableNode {
            node_id: node_id.clone(),
        });
    }

    let mut branches: Vec<&Node> = graph
        .nodes()
        .filter(|n| n.capability() == Capability::Branch && reachable.contains(&n.id))
        .collect();
    branches.sort_by(|a, b| a.id.cmp(&b.id));
    for branch in branches {
        let groups = graph.outgoing_by_handle(&branch.id);
        for handle in branch.declared_handles() {
            let Some(edges) = groups.get(&handle) else {
                report.warnings.push(ValidationWarning::UnwiredHandle {
                    node_id: branch.id.clone(),
                    handle,
                });
                continue;
            };
            let targets: Vec<&NodeId> = edges.iter().map(|e| &e.target).collect();
            let downstream = reachable_from(graph, &targets);
            let reaches_terminal = graph
                .nodes()
                .any(|n| is_terminal(scope, n) && downstream.contains(&n.id));
            if !reaches_terminal {
                report.warnings.push(ValidationWarning::BranchWithoutTerminal {
                    node_id: branch.id.clone(),
                    handle,
                });
            }
        }
    }
}

fn check_body(container: &Node, body: &ContainerBody, outer: &Visible, report: &mut ValidationReport) {
    let mut visible = outer.clone();
    add_visible(&mut visible, &body.graph);
    visible.insert(container.id.clone(), Some(container_fields(container)));

    let mut inner = ValidationReport::default();
    check_graph(&body.graph, Scope::Body { container, body }, &visible, &mut inner);

    report
        .errors
        .extend(inner.errors.into_iter().map(|error| StructuralError::InContainer {
            container: container.id.clone(),
            error: Box::new(error),
        }));
    report
        .warnings
        .extend(inner.warnings.into_iter().map(|warning| ValidationWarning::InContainer {
            container: container.id.clone(),
            warning: Box::new(warning),
        }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ComparisonOperator, Condition, LogicalOperator};
    use crate::edge::Edge;
    use crate::node::{
        HumanInputConfig, IfElseConfig, LoopConfig, LoopValue, LoopVariable, RetryConfig,
        StartVariable, TaskConfig, VariableBinding,
    };
    use crate::schema::VarType;
    use serde_json::json;
    use std::time::Duration;

    fn start() -> Node {
        Node::start("start", vec![StartVariable::required("x", VarType::String)])
    }

    fn end(selector: Selector) -> Node {
        Node::end("end", vec![VariableBinding::new("result", selector)])
    }

    fn echo(id: &str, input: Selector) -> Node {
        Node::task(
            id,
            TaskConfig::new("echo").input("x", input).output("x", VarType::String),
        )
    }

    fn linear() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(start())
            .with_node(echo("echo", Selector::field("start", "x")))
            .with_node(end(Selector::field("echo", "x")))
            .with_edge(Edge::new("e1", "start", "echo"))
            .with_edge(Edge::new("e2", "echo", "end"))
    }

    fn loop_body() -> ContainerBody {
        let body = WorkflowGraph::new()
            .with_node(Node::container_start("ls"))
            .with_node(echo("inc", Selector::field("loop", "counter")))
            .with_node(Node::container_end(
                "le",
                vec![VariableBinding::new("counter", Selector::field("inc", "x"))],
            ))
            .with_edge(Edge::new("b1", "ls", "inc"))
            .with_edge(Edge::new("b2", "inc", "le"))
            .with_edge(Edge::new("back", "le", "ls").with_handle(Handle::Loop));
        ContainerBody {
            graph: body,
            start_node_id: NodeId::new("ls"),
            end_node_id: NodeId::new("le"),
        }
    }

    fn loop_node(count: u32, body: ContainerBody) -> Node {
        Node::new(
            "loop",
            NodeKind::Loop(LoopConfig {
                loop_count: count,
                break_conditions: vec![Condition::new(
                    Selector::field("loop", "counter"),
                    ComparisonOperator::GreaterOrEqual,
                    json!(3),
                )],
                logical_operator: LogicalOperator::Or,
                loop_variables: vec![LoopVariable {
                    name: "counter".into(),
                    var_type: VarType::Integer,
                    value: LoopValue::Constant { value: json!(0) },
                }],
                body,
            }),
        )
    }

    fn with_loop(count: u32, body: ContainerBody) -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(start())
            .with_node(loop_node(count, body))
            .with_node(end(Selector::field("loop", "counter")))
            .with_edge(Edge::new("e1", "start", "loop"))
            .with_edge(Edge::new("e2", "loop", "end"))
    }

    #[test]
    fn linear_graph_is_valid() {
        let report = GraphValidator::validate(&linear());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn missing_and_duplicate_roots() {
        let no_root = WorkflowGraph::new().with_node(end(Selector::field("sys", "query")));
        let report = GraphValidator::validate(&no_root);
        assert!(report.errors.contains(&StructuralError::NoRootNode));

        let two_roots = linear().with_node(Node::start("start2", vec![]));
        let report = GraphValidator::validate(&two_roots);
        assert!(matches!(
            report.errors.as_slice(),
            [StructuralError::MultipleRootNodes { .. }]
        ));
    }

    #[test]
    fn dangling_and_duplicate_edges() {
        let graph = linear()
            .with_edge(Edge::new("e1", "start", "end"))
            .with_edge(Edge::new("e3", "echo", "ghost"));
        let report = GraphValidator::validate(&graph);
        assert!(report.errors.contains(&StructuralError::DuplicateEdge {
            edge_id: "e1".into()
        }));
        assert!(report.errors.contains(&StructuralError::DanglingEdge {
            edge_id: "e3".into(),
            node_id: "ghost".into()
        }));
    }

    #[test]
    fn cycle_outside_container_is_fatal() {
        let graph = linear()
            .with_node(echo("again", Selector::field("echo", "x")))
            .with_edge(Edge::new("e3", "echo", "again"))
            .with_edge(Edge::new("e4", "again", "echo"));
        let report = GraphValidator::validate(&graph);
        assert!(
            report
                .errors
                .iter()
                .any(|e| matches!(e, StructuralError::CycleDetected { .. }))
        );
    }

    #[test]
    fn unknown_selectors_are_fatal() {
        let graph = WorkflowGraph::new()
            .with_node(start())
            .with_node(echo("echo", Selector::field("nowhere", "x")))
            .with_node(end(Selector::field("echo", "missing")))
            .with_edge(Edge::new("e1", "start", "echo"))
            .with_edge(Edge::new("e2", "echo", "end"));
        let report = GraphValidator::validate(&graph);
        assert!(report.errors.contains(&StructuralError::UnknownSelectorSource {
            node_id: "echo".into(),
            selector: Selector::field("nowhere", "x"),
        }));
        assert!(report.errors.contains(&StructuralError::UnknownOutputField {
            node_id: "end".into(),
            selector: Selector::field("echo", "missing"),
        }));
    }

    #[test]
    fn seeded_namespaces_accept_any_field() {
        let graph = WorkflowGraph::new()
            .with_node(start())
            .with_node(echo("echo", Selector::field("sys", "user_id")))
            .with_node(end(Selector::field("env", "region")))
            .with_edge(Edge::new("e1", "start", "echo"))
            .with_edge(Edge::new("e2", "echo", "end"));
        assert!(GraphValidator::validate(&graph).is_valid());
    }

    #[test]
    fn strategies_only_on_tasks() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(start()).expect("new node");
        graph
            .add_node(
                Node::aggregator("agg", vec![Selector::field("start", "x")])
                    .with_retry(RetryConfig::new(2, Duration::from_millis(10))),
            )
            .expect("new node");
        graph.add_node(end(Selector::field("agg", "output"))).expect("new node");
        graph.add_edge(Edge::new("e1", "start", "agg")).expect("valid edge");
        graph.add_edge(Edge::new("e2", "agg", "end")).expect("valid edge");

        let report = GraphValidator::validate(&graph);
        assert_eq!(
            report.errors,
            vec![StructuralError::StrategyNotAllowed {
                node_id: "agg".into(),
                kind: "variable-aggregator"
            }]
        );
    }

    #[test]
    fn invalid_handle_is_fatal_and_unwired_branch_warns() {
        let branch = Node::if_else(
            "branch",
            IfElseConfig::single(
                LogicalOperator::And,
                vec![Condition::new(
                    Selector::field("start", "x"),
                    ComparisonOperator::Contains,
                    json!("err"),
                )],
            ),
        );
        let graph = WorkflowGraph::new()
            .with_node(start())
            .with_node(branch)
            .with_node(end(Selector::field("start", "x")))
            .with_edge(Edge::new("e1", "start", "branch"))
            .with_edge(Edge::new("e2", "branch", "end").with_handle(Handle::True))
            .with_edge(Edge::new("e3", "start", "end").with_handle(Handle::FailBranch));

        let report = GraphValidator::validate(&graph);
        assert!(report.errors.contains(&StructuralError::InvalidSourceHandle {
            edge_id: "e3".into(),
            node_id: "start".into(),
            handle: Handle::FailBranch,
        }));
        assert!(report.warnings.contains(&ValidationWarning::UnwiredHandle {
            node_id: "branch".into(),
            handle: Handle::False,
        }));
    }

    #[test]
    fn unreachable_nodes_only_warn() {
        let graph = linear().with_node(echo("orphan", Selector::field("start", "x")));
        let report = GraphValidator::validate(&graph);
        assert!(report.is_valid());
        assert!(report.warnings.contains(&ValidationWarning::UnreachableNode {
            node_id: "orphan".into()
        }));
    }

    #[test]
    fn terminal_must_be_reachable() {
        let graph = WorkflowGraph::new()
            .with_node(start())
            .with_node(end(Selector::field("start", "x")));
        let report = GraphValidator::validate(&graph);
        assert!(report.errors.contains(&StructuralError::TerminalUnreachable));
    }

    #[test]
    fn loop_body_back_edge_is_allowed() {
        let report = GraphValidator::validate(&with_loop(5, loop_body()));
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn loop_edge_must_target_start_marker() {
        let mut body = loop_body();
        body.graph = body
            .graph
            .with_edge(Edge::new("bad", "le", "inc").with_handle(Handle::Loop));
        let report = GraphValidator::validate(&with_loop(5, body));
        assert!(report.errors.contains(&StructuralError::InContainer {
            container: "loop".into(),
            error: Box::new(StructuralError::LoopEdgeTarget {
                edge_id: "bad".into(),
                target: "inc".into(),
                expected: "ls".into(),
            }),
        }));
    }

    #[test]
    fn loop_edge_in_workflow_is_stray() {
        let graph = linear().with_edge(Edge::new("back", "end", "start").with_handle(Handle::Loop));
        let report = GraphValidator::validate(&graph);
        assert!(report.errors.contains(&StructuralError::StrayLoopEdge {
            edge_id: "back".into()
        }));
    }

    #[test]
    fn zero_loop_count_and_missing_marker() {
        let mut body = loop_body();
        body.end_node_id = NodeId::new("nope");
        let report = GraphValidator::validate(&with_loop(0, body));
        assert!(report.errors.contains(&StructuralError::ZeroLoopCount {
            node_id: "loop".into()
        }));
        assert!(report.errors.contains(&StructuralError::InContainer {
            container: "loop".into(),
            error: Box::new(StructuralError::InvalidContainerMarker {
                container: "loop".into(),
                marker: "nope".into(),
            }),
        }));
    }

    #[test]
    fn human_input_inside_container_is_fatal() {
        let mut body = loop_body();
        body.graph = body
            .graph
            .with_node(Node::new("ask", NodeKind::HumanInput(HumanInputConfig::default())))
            .with_edge(Edge::new("b3", "inc", "ask"));
        let report = GraphValidator::validate(&with_loop(5, body));
        assert!(report.errors.contains(&StructuralError::InContainer {
            container: "loop".into(),
            error: Box::new(StructuralError::PauseInsideContainer {
                node_id: "ask".into()
            }),
        }));
    }
}
