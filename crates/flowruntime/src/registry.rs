use flowcore::{Node, NodeError, NodeSpec, Value, Workflow, WorkflowError};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, ports, version)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub version: u32,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory, replacing any factory of the same type
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.factories.remove(node_type).is_some()
    }

    /// Create a node instance for a workflow step
    pub fn create_node(&self, spec: &NodeSpec) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self
            .factories
            .get(&spec.node_type)
            .ok_or_else(|| WorkflowError::UnknownNodeType(spec.node_type.clone()))?;

        factory.create(&spec.config).map_err(|e| {
            WorkflowError::Invalid(format!("Failed to create node '{}': {}", spec.label(), e))
        })
    }

    /// Check that every step of `workflow` can be instantiated
    pub fn validate_workflow(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        workflow.validate()?;
        for spec in &workflow.nodes {
            let node = self.create_node(spec)?;
            node.validate_config(&spec.config).map_err(|e| {
                WorkflowError::Invalid(format!("Step '{}': {}", spec.label(), e))
            })?;
        }
        Ok(())
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
