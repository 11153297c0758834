use crate::{Value, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

/// A workflow definition as submitted for execution.
///
/// Executions keep an `Arc<Workflow>` snapshot taken at launch, so later
/// edits to the definition never reach a stored run or its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    /// Appends a step and returns its id for wiring.
    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Feeds output `from_port` of one step into input `to_port` of another.
    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node,
            from_port: from_port.into(),
            to_node,
            to_port: to_port.into(),
        });
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_by_label(&self, label: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.label() == label)
    }

    /// Connections that deliver into `node`.
    pub fn incoming(&self, node: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.to_node == node)
    }

    /// Steps with nothing upstream receive the run's start inputs.
    pub fn is_root(&self, node: NodeId) -> bool {
        self.incoming(node).next().is_none()
    }

    /// Structural checks that do not need the node registry.
    ///
    /// Step labels key the run data, so they must be unique. Connections
    /// must join two distinct steps of this workflow. The snapshot is stored
    /// as JSON, so its numbers must be finite.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut labels = HashSet::new();
        for node in &self.nodes {
            if !labels.insert(node.label()) {
                return Err(WorkflowError::DuplicateNodeName(node.label()));
            }
            let finite_position = node
                .position
                .map_or(true, |p| p.x.is_finite() && p.y.is_finite());
            let finite_backoff = node
                .retry_policy
                .as_ref()
                .map_or(true, |r| r.backoff_multiplier.is_finite());
            if !finite_position || !finite_backoff {
                return Err(WorkflowError::Invalid(format!(
                    "step '{}' has a non-finite number",
                    node.label()
                )));
            }
        }
        for conn in &self.connections {
            for end in [conn.from_node, conn.to_node] {
                if self.find_node(end).is_none() {
                    return Err(WorkflowError::NodeNotFound(end.to_string()));
                }
            }
            if conn.from_node == conn.to_node {
                return Err(WorkflowError::Invalid(format!(
                    "step {} is connected to itself",
                    conn.from_node
                )));
            }
        }
        Ok(())
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Editor placement, carried through untouched.
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
            position: None,
            retry_policy: None,
        }
    }

    /// Name used for this step in run data and push events.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    /// Fixed-delay retries of this step within one execution.
    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Per-step retry policy, applied inside a single execution.
///
/// Retrying a whole failed execution is a separate mechanism, see
/// [`ErrorHandling::RetryWorkflow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "RetryPolicy::default_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    fn default_multiplier() -> f64 {
        1.0
    }

    /// Total tries, counting the first one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause before try number `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Per-step timeout.
    pub max_execution_time_ms: Option<u64>,
    pub max_parallel_nodes: usize,
    pub on_error: ErrorHandling,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: None,
            max_parallel_nodes: 10,
            on_error: ErrorHandling::StopWorkflow,
        }
    }
}

/// What a failing step does to its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorHandling {
    StopWorkflow,
    ContinueOnError,
    /// Stop, then retry the failed execution automatically, at most
    /// `max_attempts` times.
    RetryWorkflow { max_attempts: u32 },
}
