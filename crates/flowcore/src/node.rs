use crate::{ExecutionId, NodeError, NodeId, PushEmitter, ResponseSlot, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "debug.log", "time.wait")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Initialize stateful resources (DB connections, etc.)
    async fn initialize(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: Validate configuration at workflow load time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,

    /// Step name as it appears in run data
    pub node_name: String,

    pub execution_id: ExecutionId,

    /// Input values from connected nodes
    pub inputs: HashMap<String, Value>,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Push sender for console output
    pub events: PushEmitter,

    /// Where a first webhook response goes
    pub response: ResponseSlot,

    /// Fires when the execution is being stopped
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.events.console(self.node_name.clone(), message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.events
            .console(self.node_name.clone(), format!("WARNING: {}", message.into()));
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,

    /// Set when the node asks to park the execution until this instant
    pub wait_till: Option<DateTime<Utc>>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn wait_until(mut self, wait_till: DateTime<Utc>) -> Self {
        self.wait_till = Some(wait_till);
        self
    }
}
