//! Workflow definition types.
//!
//! A workflow is a named, versioned automation that consists of:
//! - Metadata (name, description, version, timestamps)
//! - A directed graph of nodes
//! - Environment and conversation variables, which seed the read-only
//!   `env` and `conversation` namespaces of every run

use crate::graph::WorkflowGraph;
use crate::schema::VarType;
use crate::validator::{GraphValidator, ValidationReport};
use crate::variable_pool::NamespaceSeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tidewater_core::WorkflowId;

/// Metadata for a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Human-readable name for this workflow.
    pub name: String,
    /// Description of what this workflow does.
    pub description: Option<String>,
    /// Semantic version of this workflow definition.
    pub version: String,
    /// Tags for organization/filtering.
    pub tags: Vec<String>,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMetadata {
    /// Creates new metadata with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            version: "0.1.0".to_string(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A typed variable declared on the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    #[serde(default)]
    pub value: JsonValue,
}

impl WorkflowVariable {
    pub fn new(name: impl Into<String>, var_type: VarType, value: JsonValue) -> Self {
        Self {
            name: name.into(),
            var_type,
            value,
        }
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Workflow metadata.
    pub metadata: WorkflowMetadata,
    /// The workflow graph (nodes and edges).
    pub graph: WorkflowGraph,
    /// Values for the `env` namespace.
    #[serde(default)]
    pub environment_variables: Vec<WorkflowVariable>,
    /// Initial values for the `conversation` namespace.
    #[serde(default)]
    pub conversation_variables: Vec<WorkflowVariable>,
}

impl WorkflowDefinition {
    /// Creates a new workflow with the given name and graph.
    #[must_use]
    pub fn new(name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self {
            id: WorkflowId::new(),
            metadata: WorkflowMetadata::new(name),
            graph,
            environment_variables: Vec::new(),
            conversation_variables: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_environment_variable(mut self, variable: WorkflowVariable) -> Self {
        self.environment_variables.push(variable);
        self
    }

    #[must_use]
    pub fn with_conversation_variable(mut self, variable: WorkflowVariable) -> Self {
        self.conversation_variables.push(variable);
        self
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Runs the graph validator over this workflow's graph.
    #[must_use]
    pub fn validate(&self) -> ValidationReport {
        GraphValidator::validate(&self.graph)
    }

    /// Marks the workflow as updated (bumps updated_at timestamp).
    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }

    /// Builds the seed for one run of this workflow.
    ///
    /// `inputs` feed the start node; `sys` holds caller-supplied facts about
    /// the run such as the user or the query. The engine adds
    /// `sys.workflow_run_id` itself.
    #[must_use]
    pub fn seed(
        &self,
        inputs: serde_json::Map<String, JsonValue>,
        sys: serde_json::Map<String, JsonValue>,
    ) -> RunSeed {
        let mut namespaces = NamespaceSeed {
            sys,
            ..NamespaceSeed::default()
        };
        namespaces.sys.insert(
            "workflow_id".to_owned(),
            JsonValue::String(self.id.to_string()),
        );
        for variable in &self.environment_variables {
            namespaces
                .env
                .insert(variable.name.clone(), variable.value.clone());
        }
        for variable in &self.conversation_variables {
            namespaces
                .conversation
                .insert(variable.name.clone(), variable.value.clone());
        }
        RunSeed { namespaces, inputs }
    }
}

/// Everything a run starts from besides the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSeed {
    #[serde(default)]
    pub namespaces: NamespaceSeed,
    /// Values for the start node's declared variables.
    #[serde(default)]
    pub inputs: serde_json::Map<String, JsonValue>,
}

impl RunSeed {
    /// A seed with start inputs and empty namespaces.
    #[must_use]
    pub fn new(inputs: serde_json::Map<String, JsonValue>) -> Self {
        Self {
            namespaces: NamespaceSeed::default(),
            inputs,
        }
    }

    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_sys(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.namespaces.sys.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.namespaces.env.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.namespaces.conversation.insert(name.into(), value);
        self
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Number of nodes in the graph.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(workflow: &WorkflowDefinition) -> Self {
        Self {
            id: workflow.id,
            name: workflow.metadata.name.clone(),
            description: workflow.metadata.description.clone(),
            tags: workflow.metadata.tags.clone(),
            node_count: workflow.graph.node_count(),
            updated_at: workflow.metadata.updated_at,
        }
    }
}
