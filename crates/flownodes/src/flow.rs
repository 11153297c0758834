use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{NodeFactory, NodeMetadata};
use std::collections::HashMap;

/// Fails the execution on purpose with a configured message
pub struct StopAndErrorNode;

#[async_trait]
impl Node for StopAndErrorNode {
    fn node_type(&self) -> &str {
        "flow.stop_error"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .inputs
            .get("message")
            .or_else(|| ctx.config.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("Workflow stopped by stop-and-error step");
        ctx.warn(message);
        Err(NodeError::ExecutionFailed(message.to_string()))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("message") {
            None | Some(Value::String(_)) => Ok(()),
            Some(_) => Err(NodeError::Configuration(
                "message must be a string".to_string(),
            )),
        }
    }
}

pub struct StopAndErrorNodeFactory;

impl NodeFactory for StopAndErrorNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(StopAndErrorNode))
    }

    fn node_type(&self) -> &str {
        "flow.stop_error"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Stops the workflow with an error".to_string(),
            category: "flow".to_string(),
            ..Default::default()
        }
    }
}
