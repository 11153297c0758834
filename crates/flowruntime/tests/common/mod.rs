#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    Config, ExecutionId, Node, NodeContext, NodeError, NodeOutput, NodeSpec, PushBus, PushEmitter,
    ResponseSlot, RunExecutionData, Value, WebhookResponse, Workflow,
};
use flowruntime::{
    EngineContext, ExecutionRuntime, MemoryStore, NodeFactory, NodeRegistry, WorkflowExecutor,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outputs its `value` config on port `out`, or forwards its inputs.
struct Emit;

#[async_trait]
impl Node for Emit {
    fn node_type(&self) -> &str {
        "test.emit"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        output.outputs = ctx.inputs.clone();
        if let Some(value) = ctx.config.get("value") {
            output.outputs.insert("out".to_string(), value.clone());
        }
        Ok(output)
    }
}

struct Fail;

#[async_trait]
impl Node for Fail {
    fn node_type(&self) -> &str {
        "test.fail"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .get_config_or("message", Value::from("boom"))
            .as_str()
            .unwrap_or("boom")
            .to_string();
        Err(NodeError::ExecutionFailed(message))
    }
}

struct Sleep;

#[async_trait]
impl Node for Sleep {
    fn node_type(&self) -> &str {
        "test.sleep"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx
            .get_config_or("ms", Value::Number(10_000.0))
            .as_f64()
            .unwrap_or(10_000.0) as u64;
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(NodeOutput::new().with_output("slept", ms as f64))
            }
        }
    }
}

/// Parks the execution until the RFC 3339 instant in `until`.
struct Park;

#[async_trait]
impl Node for Park {
    fn node_type(&self) -> &str {
        "test.park"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let until = ctx
            .require_config("until")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("until must be a string".into()))?;
        let wait_till = DateTime::parse_from_rfc3339(until)
            .map_err(|e| NodeError::Configuration(e.to_string()))?
            .with_timezone(&Utc);
        Ok(NodeOutput::new()
            .with_output("parked", true)
            .wait_until(wait_till))
    }
}

struct Respond;

#[async_trait]
impl Node for Respond {
    fn node_type(&self) -> &str {
        "test.respond"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let body = ctx
            .get_config_or("body", Value::from("ok"))
            .to_plain_json();
        let delivered = ctx.response.send(WebhookResponse::json(body));
        Ok(NodeOutput::new().with_output("delivered", delivered))
    }
}

struct Panic;

#[async_trait]
impl Node for Panic {
    fn node_type(&self) -> &str {
        "test.panic"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        panic!("step blew up")
    }
}

/// Fails while the shared switch is off. With a `failures` config it only
/// fails that many times.
struct Flaky {
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    failures: Option<usize>,
}

#[async_trait]
impl Node for Flaky {
    fn node_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = !self.healthy.load(Ordering::SeqCst)
            && self.failures.map(|limit| call <= limit).unwrap_or(true);
        if failing {
            return Err(NodeError::ExecutionFailed(format!("flaky call {}", call)));
        }
        Ok(NodeOutput::new().with_output("call", call as f64))
    }
}

#[derive(Clone, Default)]
pub struct Switch {
    pub healthy: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl Switch {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct TestFactory {
    node_type: &'static str,
    switch: Switch,
}

impl NodeFactory for TestFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(match self.node_type {
            "test.emit" => Box::new(Emit),
            "test.fail" => Box::new(Fail),
            "test.sleep" => Box::new(Sleep),
            "test.park" => Box::new(Park),
            "test.respond" => Box::new(Respond),
            "test.panic" => Box::new(Panic),
            _ => Box::new(Flaky {
                healthy: self.switch.healthy.clone(),
                calls: self.switch.calls.clone(),
                failures: config
                    .get("failures")
                    .and_then(Value::as_f64)
                    .map(|n| n as usize),
            }),
        })
    }

    fn node_type(&self) -> &str {
        self.node_type
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn registry(switch: &Switch) -> NodeRegistry {
    init_tracing();
    let mut registry = NodeRegistry::new();
    for node_type in [
        "test.emit",
        "test.fail",
        "test.sleep",
        "test.park",
        "test.respond",
        "test.panic",
        "test.flaky",
    ] {
        registry.register(Arc::new(TestFactory {
            node_type,
            switch: switch.clone(),
        }));
    }
    registry
}

pub fn executor(switch: &Switch) -> WorkflowExecutor {
    WorkflowExecutor::new(Arc::new(registry(switch)), 4)
}

/// Adds a named step and returns its id.
pub fn step(workflow: &mut Workflow, node_type: &str, name: &str) -> Uuid {
    workflow.add_node(NodeSpec::new(node_type).with_name(name))
}

pub fn engine_context(
    workflow: Workflow,
    data: RunExecutionData,
    bus: &PushBus,
) -> EngineContext {
    let execution_id: ExecutionId = Uuid::new_v4();
    EngineContext {
        execution_id,
        mode: flowcore::ExecutionMode::Manual,
        workflow: Arc::new(workflow),
        data,
        events: PushEmitter::new(execution_id, None, bus.clone()),
        response: ResponseSlot::detached(execution_id),
        cancellation: CancellationToken::new(),
    }
}

pub struct Harness {
    pub runtime: ExecutionRuntime,
    pub store: Arc<MemoryStore>,
    pub bus: PushBus,
    pub switch: Switch,
}

pub fn harness(config: Config) -> Harness {
    let switch = Switch::default();
    let store = Arc::new(MemoryStore::new());
    let bus = PushBus::new(config.push.subscriber_capacity, config.push.overflow);
    let runtime = ExecutionRuntime::new(
        &config,
        store.clone(),
        Arc::new(executor(&switch)),
        bus.clone(),
    );
    Harness {
        runtime,
        store,
        bus,
        switch,
    }
}

/// Wait for `condition` to hold, polling every few milliseconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
