//! Node definitions.
//!
//! A node is immutable for the life of a run; its runtime status lives in
//! [`crate::execution::NodeRuntimeState`]. Each kind is a variant of the closed
//! [`NodeKind`] enum carrying its own configuration, and exposes the same small
//! interface: which selectors it needs, which handles it can emit, and which
//! capability set it belongs to.

use crate::condition::{Condition, LogicalOperator};
use crate::edge::Handle;
use crate::graph::WorkflowGraph;
use crate::schema::{OutputDecl, VarType};
use crate::selector::Selector;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tidewater_core::NodeId;

/// Output field written for a handled failure.
pub const ERROR_MESSAGE_FIELD: &str = "error_message";
/// Output field written for a handled failure.
pub const ERROR_TYPE_FIELD: &str = "error_type";

/// Broad behaviour class of a node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Entry point. No inputs, one per workflow.
    Root,
    /// Runs once, produces outputs, may fail.
    Executable,
    /// Evaluates conditions and activates a subset of its handles.
    Branch,
    /// Owns an inner sub-graph and runs it repeatedly.
    Container,
    /// Terminal node that produces the run's outputs.
    Response,
    /// Delimits a container body.
    Marker,
}

/// Binds a name to a selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub variable: String,
    pub value_selector: Selector,
}

impl VariableBinding {
    pub fn new(variable: impl Into<String>, value_selector: Selector) -> Self {
        Self {
            variable: variable.into(),
            value_selector,
        }
    }
}

fn default_true() -> bool {
    true
}

/// An input declared on the start node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartVariable {
    pub variable: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
}

impl StartVariable {
    pub fn required(variable: impl Into<String>, var_type: VarType) -> Self {
        Self {
            variable: variable.into(),
            var_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(variable: impl Into<String>, var_type: VarType, default: JsonValue) -> Self {
        Self {
            variable: variable.into(),
            var_type,
            required: false,
            default: Some(default),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    #[serde(default)]
    pub variables: Vec<StartVariable>,
}

/// Configuration shared by `end` and `container-end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndConfig {
    #[serde(default)]
    pub outputs: Vec<VariableBinding>,
}

/// A node whose work is done by an injected executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Registry key of the executor, e.g. `code`, `llm`, `http-request`.
    pub executor: String,
    #[serde(default)]
    pub inputs: Vec<VariableBinding>,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    #[serde(default)]
    pub params: JsonValue,
}

impl TaskConfig {
    pub fn new(executor: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: JsonValue::Null,
        }
    }

    #[must_use]
    pub fn input(mut self, variable: impl Into<String>, selector: Selector) -> Self {
        self.inputs.push(VariableBinding::new(variable, selector));
        self
    }

    #[must_use]
    pub fn output(mut self, name: impl Into<String>, var_type: VarType) -> Self {
        self.outputs.push(OutputDecl::new(name, var_type));
        self
    }
}

/// One if/elif arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfElseConfig {
    pub cases: Vec<Case>,
}

impl IfElseConfig {
    /// A plain if/else whose matching arm leaves through `true`.
    pub fn single(logical_operator: LogicalOperator, conditions: Vec<Condition>) -> Self {
        Self {
            cases: vec![Case {
                case_id: Handle::True.as_str().to_owned(),
                logical_operator,
                conditions,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSpec {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub executor: String,
    pub query_variable_selector: Selector,
    pub classes: Vec<ClassSpec>,
    #[serde(default)]
    pub params: JsonValue,
}

impl ClassifierConfig {
    /// Maps an executor's verdict to a class, by id first and then by name.
    #[must_use]
    pub fn winning_class(&self, outputs: &serde_json::Map<String, JsonValue>) -> Option<&ClassSpec> {
        let by_id = outputs.get("class_id").and_then(JsonValue::as_str);
        let by_name = outputs.get("class_name").and_then(JsonValue::as_str);
        self.classes
            .iter()
            .find(|c| Some(c.id.as_str()) == by_id)
            .or_else(|| self.classes.iter().find(|c| Some(c.name.as_str()) == by_name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub variables: Vec<Selector>,
    #[serde(default)]
    pub output_type: VarType,
}

/// The private sub-graph of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerBody {
    pub graph: WorkflowGraph,
    pub start_node_id: NodeId,
    pub end_node_id: NodeId,
}

/// What happens when an iteration fails without a handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationErrorMode {
    /// The container fails, and with it the run.
    #[default]
    Terminated,
    /// The failed iteration contributes `null`.
    ContinueOnError,
    /// The failed iteration contributes nothing.
    RemoveAbnormalOutput,
}

fn default_parallelism() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    pub iterator_selector: Selector,
    pub body: ContainerBody,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub error_mode: IterationErrorMode,
}

/// Initial value of a loop variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", rename_all = "snake_case")]
pub enum LoopValue {
    Constant { value: JsonValue },
    Variable { selector: Selector },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    pub value: LoopValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub loop_count: u32,
    #[serde(default)]
    pub break_conditions: Vec<Condition>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub loop_variables: Vec<LoopVariable>,
    pub body: ContainerBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumanInputConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub fields: Vec<OutputDecl>,
}

/// Every node kind the engine knows how to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    Start(StartConfig),
    End(EndConfig),
    Task(TaskConfig),
    IfElse(IfElseConfig),
    QuestionClassifier(ClassifierConfig),
    VariableAggregator(AggregatorConfig),
    Iteration(IterationConfig),
    Loop(LoopConfig),
    ContainerStart,
    ContainerEnd(EndConfig),
    HumanInput(HumanInputConfig),
}

impl NodeKind {
    /// Short name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::End(_) => "end",
            Self::Task(_) => "task",
            Self::IfElse(_) => "if-else",
            Self::QuestionClassifier(_) => "question-classifier",
            Self::VariableAggregator(_) => "variable-aggregator",
            Self::Iteration(_) => "iteration",
            Self::Loop(_) => "loop",
            Self::ContainerStart => "container-start",
            Self::ContainerEnd(_) => "container-end",
            Self::HumanInput(_) => "human-input",
        }
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        match self {
            Self::Start(_) => Capability::Root,
            Self::End(_) => Capability::Response,
            Self::Task(_) | Self::VariableAggregator(_) | Self::HumanInput(_) => {
                Capability::Executable
            }
            Self::IfElse(_) | Self::QuestionClassifier(_) => Capability::Branch,
            Self::Iteration(_) | Self::Loop(_) => Capability::Container,
            Self::ContainerStart | Self::ContainerEnd(_) => Capability::Marker,
        }
    }

    /// Selectors that must resolve before the node can run.
    ///
    /// Aggregator variables are alternatives and are not listed; loop break
    /// conditions are evaluated inside the body and are not listed either.
    #[must_use]
    pub fn required_inputs(&self) -> Vec<&Selector> {
        match self {
            Self::Start(_) | Self::ContainerStart | Self::HumanInput(_) => Vec::new(),
            Self::VariableAggregator(_) => Vec::new(),
            Self::End(config) | Self::ContainerEnd(config) => {
                config.outputs.iter().map(|b| &b.value_selector).collect()
            }
            Self::Task(config) => config.inputs.iter().map(|b| &b.value_selector).collect(),
            Self::IfElse(config) => config
                .cases
                .iter()
                .flat_map(|case| case.conditions.iter().map(|c| &c.variable_selector))
                .collect(),
            Self::QuestionClassifier(config) => vec![&config.query_variable_selector],
            Self::Iteration(config) => vec![&config.iterator_selector],
            Self::Loop(config) => config
                .loop_variables
                .iter()
                .filter_map(|v| match &v.value {
                    LoopValue::Variable { selector } => Some(selector),
                    LoopValue::Constant { .. } => None,
                })
                .collect(),
        }
    }

    /// Every selector the node reads, optional ones included.
    #[must_use]
    pub fn referenced_selectors(&self) -> Vec<&Selector> {
        match self {
            Self::VariableAggregator(config) => config.variables.iter().collect(),
            other => other.required_inputs(),
        }
    }

    /// Handles this kind can emit, ignoring error strategy.
    #[must_use]
    pub fn declared_handles(&self) -> Vec<Handle> {
        match self {
            Self::IfElse(config) => config
                .cases
                .iter()
                .map(|case| Handle::from(case.case_id.clone()))
                .chain(std::iter::once(Handle::False))
                .collect(),
            Self::QuestionClassifier(config) => config
                .classes
                .iter()
                .map(|class| Handle::from(class.id.clone()))
                .collect(),
            Self::Iteration(_) | Self::Loop(_) | Self::ContainerEnd(_) => {
                vec![Handle::Source, Handle::Loop]
            }
            _ => vec![Handle::Source],
        }
    }

    /// Names of the outputs the node writes, when they are known statically.
    #[must_use]
    pub fn output_names(&self) -> Option<Vec<String>> {
        let names = match self {
            Self::Start(config) => config.variables.iter().map(|v| v.variable.clone()).collect(),
            Self::End(config) | Self::ContainerEnd(config) => {
                config.outputs.iter().map(|b| b.variable.clone()).collect()
            }
            Self::Task(config) if !config.outputs.is_empty() => {
                config.outputs.iter().map(|o| o.name.clone()).collect()
            }
            Self::Task(_) | Self::ContainerStart => return None,
            Self::IfElse(_) => Vec::new(),
            Self::QuestionClassifier(_) => vec!["class_name".to_owned(), "class_id".to_owned()],
            Self::VariableAggregator(_) => vec!["output".to_owned()],
            Self::Iteration(_) => vec!["output".to_owned()],
            Self::Loop(config) => std::iter::once("output".to_owned())
                .chain(config.loop_variables.iter().map(|v| v.name.clone()))
                .collect(),
            Self::HumanInput(config) => config.fields.iter().map(|f| f.name.clone()).collect(),
        };
        Some(names)
    }

    /// The inner sub-graph of a container.
    #[must_use]
    pub fn body(&self) -> Option<&ContainerBody> {
        match self {
            Self::Iteration(config) => Some(&config.body),
            Self::Loop(config) => Some(&config.body),
            _ => None,
        }
    }

    /// Executor registry key for kinds that run through the worker pool.
    #[must_use]
    pub fn executor_name(&self) -> Option<&str> {
        match self {
            Self::Task(config) => Some(&config.executor),
            Self::QuestionClassifier(config) => Some(&config.executor),
            _ => None,
        }
    }
}

/// What the engine does when an executor fails for the last time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ErrorStrategy {
    /// Fail the run.
    #[default]
    Abort,
    /// Mark the node EXCEPTION and route through `fail-branch`.
    FailBranch,
    /// Substitute preconfigured outputs and continue normally.
    DefaultValue {
        outputs: serde_json::Map<String, JsonValue>,
    },
}

impl ErrorStrategy {
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// Re-run policy for failing executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,
}

impl RetryConfig {
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval_ms: u64::try_from(retry_interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Node {
    /// Creates a node with the default abort strategy and no retries.
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            title: id.to_string(),
            id,
            kind,
            error_strategy: ErrorStrategy::Abort,
            retry: None,
            timeout_secs: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        self.kind.capability()
    }

    /// Handles this node can emit, including error-handling handles.
    #[must_use]
    pub fn declared_handles(&self) -> Vec<Handle> {
        let mut handles = self.kind.declared_handles();
        if matches!(self.error_strategy, ErrorStrategy::FailBranch) {
            handles.push(Handle::SuccessBranch);
            handles.push(Handle::FailBranch);
        }
        handles
    }

    #[must_use]
    pub fn required_inputs(&self) -> Vec<&Selector> {
        self.kind.required_inputs()
    }

    /// Output names, including the synthetic fail-branch fields.
    #[must_use]
    pub fn output_names(&self) -> Option<Vec<String>> {
        let mut names = self.kind.output_names()?;
        match &self.error_strategy {
            ErrorStrategy::FailBranch => {
                names.push(ERROR_MESSAGE_FIELD.to_owned());
                names.push(ERROR_TYPE_FIELD.to_owned());
            }
            ErrorStrategy::DefaultValue { outputs } => {
                for key in outputs.keys() {
                    if !names.contains(key) {
                        names.push(key.clone());
                    }
                }
            }
            ErrorStrategy::Abort => {}
        }
        Some(names)
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Returns true for the run's terminal `end` node.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.capability() == Capability::Response
    }

    // Convenience constructors, mostly used when building graphs in code.

    pub fn start(id: impl Into<NodeId>, variables: Vec<StartVariable>) -> Self {
        Self::new(id, NodeKind::Start(StartConfig { variables }))
    }

    pub fn end(id: impl Into<NodeId>, outputs: Vec<VariableBinding>) -> Self {
        Self::new(id, NodeKind::End(EndConfig { outputs }))
    }

    pub fn task(id: impl Into<NodeId>, config: TaskConfig) -> Self {
        Self::new(id, NodeKind::Task(config))
    }

    pub fn if_else(id: impl Into<NodeId>, config: IfElseConfig) -> Self {
        Self::new(id, NodeKind::IfElse(config))
    }

    pub fn aggregator(id: impl Into<NodeId>, variables: Vec<Selector>) -> Self {
        Self::new(
            id,
            NodeKind::VariableAggregator(AggregatorConfig {
                variables,
                output_type: VarType::Any,
            }),
        )
    }

    pub fn container_start(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::ContainerStart)
    }

    pub fn container_end(id: impl Into<NodeId>, outputs: Vec<VariableBinding>) -> Self {
        Self::new(id, NodeKind::ContainerEnd(EndConfig { outputs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_by_kind() {
        assert_eq!(Node::start("s", vec![]).capability(), Capability::Root);
        assert_eq!(Node::end("e", vec![]).capability(), Capability::Response);
        assert_eq!(
            Node::task("t", TaskConfig::new("code")).capability(),
            Capability::Executable
        );
        assert_eq!(Node::container_start("cs").capability(), Capability::Marker);
    }

    #[test]
    fn fail_branch_adds_handles_and_error_fields() {
        let node = Node::task("code", TaskConfig::new("code").output("result", VarType::Any))
            .with_error_strategy(ErrorStrategy::FailBranch);
        let handles = node.declared_handles();
        assert!(handles.contains(&Handle::SuccessBranch));
        assert!(handles.contains(&Handle::FailBranch));

        let names = node.output_names().expect("declared");
        assert!(names.contains(&"error_type".to_owned()));
        assert!(names.contains(&"result".to_owned()));
    }

    #[test]
    fn if_else_handles_cover_cases_and_else() {
        let config = IfElseConfig {
            cases: vec![
                Case {
                    case_id: "true".into(),
                    logical_operator: LogicalOperator::And,
                    conditions: vec![],
                },
                Case {
                    case_id: "case_b".into(),
                    logical_operator: LogicalOperator::Or,
                    conditions: vec![],
                },
            ],
        };
        let handles = Node::if_else("branch", config).declared_handles();
        assert_eq!(
            handles,
            vec![Handle::True, Handle::label("case_b"), Handle::False]
        );
    }

    #[test]
    fn classifier_matches_by_id_then_name() {
        let config = ClassifierConfig {
            executor: "llm".into(),
            query_variable_selector: Selector::field("start", "q"),
            classes: vec![
                ClassSpec { id: "c1".into(), name: "billing".into() },
                ClassSpec { id: "c2".into(), name: "refund".into() },
            ],
            params: JsonValue::Null,
        };

        let mut outputs = serde_json::Map::new();
        outputs.insert("class_name".into(), json!("refund"));
        assert_eq!(config.winning_class(&outputs).map(|c| c.id.as_str()), Some("c2"));

        outputs.insert("class_id".into(), json!("c1"));
        assert_eq!(config.winning_class(&outputs).map(|c| c.id.as_str()), Some("c1"));

        assert!(config.winning_class(&serde_json::Map::new()).is_none());
    }

    #[test]
    fn node_deserializes_from_flat_json() {
        let node: Node = serde_json::from_value(json!({
            "id": "code_1",
            "title": "Parse",
            "type": "task",
            "executor": "code",
            "inputs": [{"variable": "raw", "value_selector": ["start", "payload"]}],
            "outputs": [{"name": "parsed", "type": "object"}],
            "error_strategy": {"type": "default-value", "outputs": {"parsed": {}}},
            "retry": {"max_retries": 2, "retry_interval_ms": 100}
        }))
        .expect("valid node");

        assert_eq!(node.id.as_str(), "code_1");
        assert_eq!(node.kind.executor_name(), Some("code"));
        assert_eq!(node.required_inputs().len(), 1);
        assert!(matches!(node.error_strategy, ErrorStrategy::DefaultValue { .. }));
        assert_eq!(
            node.retry.map(|r| r.retry_interval()),
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn loop_requires_only_selector_backed_variables() {
        let body = ContainerBody {
            graph: WorkflowGraph::new(),
            start_node_id: NodeId::new("ls"),
            end_node_id: NodeId::new("le"),
        };
        let kind = NodeKind::Loop(LoopConfig {
            loop_count: 3,
            break_conditions: vec![],
            logical_operator: LogicalOperator::Or,
            loop_variables: vec![
                LoopVariable {
                    name: "counter".into(),
                    var_type: VarType::Integer,
                    value: LoopValue::Constant { value: json!(0) },
                },
                LoopVariable {
                    name: "seed".into(),
                    var_type: VarType::String,
                    value: LoopValue::Variable {
                        selector: Selector::field("start", "seed"),
                    },
                },
            ],
            body,
        });
        assert_eq!(kind.required_inputs(), vec![&Selector::field("start", "seed")]);
        assert_eq!(
            kind.output_names().expect("static"),
            vec!["output".to_owned(), "counter".to_owned(), "seed".to_owned()]
        );
        assert!(kind.body().is_some());
    }
}
