mod bus;
mod emitter;
mod message;

pub use bus::{OverflowPolicy, PushBus, Subscription};
pub use emitter::PushEmitter;
pub use message::{
    ConsoleMessage, ExecutionFinished, ExecutionStarted, NodeExecuteAfter, NodeExecuteBefore,
    NodeTypeChange, PushMessage, TestWebhook,
};
