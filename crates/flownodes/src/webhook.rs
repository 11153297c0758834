use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value, WebhookResponse};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Answers the webhook caller that started the execution.
///
/// Only the first response of a run reaches the caller. The step succeeds
/// either way and reports whether its payload was taken.
pub struct RespondNode;

#[async_trait]
impl Node for RespondNode {
    fn node_type(&self) -> &str {
        "webhook.respond"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let body = ctx
            .inputs
            .get("body")
            .or_else(|| ctx.config.get("body"))
            .map(Value::to_plain_json)
            .unwrap_or(serde_json::Value::Null);

        let mut response = WebhookResponse::json(body);
        response.response_code = ctx
            .config
            .get("status")
            .and_then(Value::as_f64)
            .map(|code| code as u16);
        if let Some(Value::Object(headers)) = ctx.config.get("headers") {
            response.headers = headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect();
        }

        let delivered = ctx.response.send(response);
        if !delivered {
            ctx.warn("No caller is waiting for a response");
        }

        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        Ok(output.with_output("delivered", delivered))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("status").map(|s| s.as_f64()) {
            None => Ok(()),
            Some(Some(code)) if (100.0..600.0).contains(&code) => Ok(()),
            Some(_) => Err(NodeError::Configuration(
                "status must be an HTTP status code".to_string(),
            )),
        }
    }
}

pub struct RespondNodeFactory;

impl NodeFactory for RespondNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(RespondNode))
    }

    fn node_type(&self) -> &str {
        "webhook.respond"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Respond to the webhook that started the execution".to_string(),
            category: "webhook".to_string(),
            inputs: vec![PortDefinition::new("body", "Response body", false)],
            outputs: vec![PortDefinition::new(
                "delivered",
                "Whether a caller received the response",
                true,
            )],
            ..Default::default()
        }
    }
}
