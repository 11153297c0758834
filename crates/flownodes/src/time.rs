use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

/// Holds the step for a number of milliseconds, in process
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(|v| v.as_f64())
            .unwrap_or(1000.0)
            .max(0.0) as u64;

        ctx.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {}
        }

        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        Ok(output)
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("delay_ms") {
            None => Ok(()),
            Some(v) if v.as_f64().map(|ms| ms >= 0.0).unwrap_or(false) => Ok(()),
            Some(_) => Err(NodeError::Configuration(
                "delay_ms must be a non-negative number".to_string(),
            )),
        }
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            ..Default::default()
        }
    }
}

/// Parks the whole execution until a point in time.
///
/// The wake time is either an RFC 3339 `until` (config or input) or `amount`
/// of `unit` (seconds, minutes, hours, days) from now. The execution is
/// written to the store as waiting and resumed by the scheduler; steps after
/// this one only run after the wake time. A wake time in the past passes
/// straight through.
pub struct WaitNode;

impl WaitNode {
    fn wake_time(ctx: &NodeContext, now: DateTime<Utc>) -> Result<DateTime<Utc>, NodeError> {
        if let Some(until) = ctx.inputs.get("until").or_else(|| ctx.config.get("until")) {
            let text = until.as_str().ok_or_else(|| NodeError::InvalidInputType {
                field: "until".to_string(),
                expected: "RFC 3339 string".to_string(),
                actual: format!("{:?}", until),
            })?;
            return DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| NodeError::Configuration(format!("invalid until '{}': {}", text, e)));
        }

        let amount = ctx.require_config("amount")?.as_f64().ok_or_else(|| {
            NodeError::Configuration("amount must be a number".to_string())
        })?;
        let unit = ctx.get_config_or("unit", Value::from("seconds"));
        let seconds = match unit.as_str().unwrap_or("seconds") {
            "seconds" => amount,
            "minutes" => amount * 60.0,
            "hours" => amount * 3600.0,
            "days" => amount * 86_400.0,
            other => {
                return Err(NodeError::Configuration(format!("unknown unit: {}", other)));
            }
        };
        Ok(now + ChronoDuration::milliseconds((seconds * 1000.0) as i64))
    }
}

#[async_trait]
impl Node for WaitNode {
    fn node_type(&self) -> &str {
        "time.wait"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let now = Utc::now();
        let wake = Self::wake_time(&ctx, now)?;

        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        output
            .outputs
            .insert("resumed_at".to_string(), Value::from(wake.to_rfc3339()));
        if wake <= now {
            return Ok(output);
        }

        ctx.info(format!("Waiting until {}", wake.to_rfc3339()));
        Ok(output.wait_until(wake))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        if let Some(amount) = config.get("amount") {
            if amount.as_f64().is_none() {
                return Err(NodeError::Configuration("amount must be a number".to_string()));
            }
        }
        match config.get("unit").map(|u| u.as_str()) {
            None | Some(Some("seconds" | "minutes" | "hours" | "days")) => Ok(()),
            Some(_) => Err(NodeError::Configuration(
                "unit must be seconds, minutes, hours or days".to_string(),
            )),
        }
    }
}

pub struct WaitNodeFactory;

impl NodeFactory for WaitNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(WaitNode))
    }

    fn node_type(&self) -> &str {
        "time.wait"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Pause the execution and resume it later".to_string(),
            category: "time".to_string(),
            inputs: vec![PortDefinition::new("until", "RFC 3339 wake time", false)],
            outputs: vec![PortDefinition::new(
                "resumed_at",
                "Wake time the execution was parked until",
                true,
            )],
            ..Default::default()
        }
    }
}
