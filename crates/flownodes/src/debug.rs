use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Writes its inputs to the execution's console and passes them on
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .inputs
            .get("message")
            .or_else(|| ctx.config.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)")
            .to_string();

        tracing::debug!("[{}] {}", ctx.execution_id, message);
        ctx.info(message.clone());

        let mut keys: Vec<_> = ctx.inputs.keys().collect();
        keys.sort();
        for key in keys {
            ctx.info(format!("  {}: {}", key, ctx.inputs[key].to_plain_json()));
        }

        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        Ok(output.with_output("message", message))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values to the execution console".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::new("message", "Text to log", false)],
            outputs: vec![PortDefinition::new("message", "The logged text", true)],
            ..Default::default()
        }
    }
}
