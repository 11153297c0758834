//! Standard node library
//!
//! Built-in steps for the reference engine: logging, delays and waits,
//! deliberate failures, webhook responses and JSON transforms.

mod debug;
mod flow;
mod time;
mod transform;
mod webhook;

pub use debug::{DebugNode, DebugNodeFactory};
pub use flow::{StopAndErrorNode, StopAndErrorNodeFactory};
pub use time::{DelayNode, DelayNodeFactory, WaitNode, WaitNodeFactory};
pub use transform::{JsonParseNode, JsonParseNodeFactory, JsonStringifyNode, JsonStringifyNodeFactory};
pub use webhook::{RespondNode, RespondNodeFactory};

use flowruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(DebugNodeFactory));
    registry.register(Arc::new(DelayNodeFactory));
    registry.register(Arc::new(WaitNodeFactory));
    registry.register(Arc::new(StopAndErrorNodeFactory));
    registry.register(Arc::new(RespondNodeFactory));
    registry.register(Arc::new(JsonParseNodeFactory));
    registry.register(Arc::new(JsonStringifyNodeFactory));
}
