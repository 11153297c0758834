//! Core abstractions for the flow engine
//!
//! Execution records, run data, the flatten codec, push messages and the
//! node contract. Every other crate builds on these types.

mod config;
mod error;
mod execution;
mod filter;
pub mod flatted;
mod node;
pub mod push;
mod run_data;
mod value;
mod workflow;

pub use config::{
    Config, ConfigError, DatabaseConfig, DatabaseKind, EngineConfig, ExecutionsConfig,
    PushConfig, SaveDataPolicy, SchedulerConfig, ServerConfig,
};
pub use error::{FlattenError, FlowError, LifecycleError, NodeError, StoreError, WorkflowError};
pub use execution::{
    CurrentExecutionSummary, ExecutionId, ExecutionMode, ExecutionRecord, ExecutionStatus,
    ExecutionSummary, ExecutionsListResponse, RecordState, ResponseMode, ResponseSink,
    ResponseSlot, RunResult, SubmitRequest, SubmitResponse, WebhookResponse,
};
pub use filter::{DeleteFilter, ExecutionFilter, FilterField, Predicate, PredicateValue};
pub use flatted::{flatten, unflatten};
pub use node::{Node, NodeContext, NodeOutput};
pub use push::{OverflowPolicy, PushBus, PushEmitter, PushMessage, Subscription};
pub use run_data::{
    PinData, PortData, ResultData, ResumeState, RunError, RunExecutionData, StartData, TaskData,
};
pub use value::Value;
pub use workflow::{
    Connection, ErrorHandling, NodeId, NodeSpec, Position, RetryPolicy, Workflow, WorkflowId,
    WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
