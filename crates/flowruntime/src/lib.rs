//! Workflow execution runtime
//!
//! This crate runs workflows and owns everything that happens to an
//! execution after it is accepted: the DAG executor, the active execution
//! registry, persistence, retries and resuming parked runs.

mod active;
mod engine;
mod executor;
mod registry;
mod retry;
mod runtime;
pub mod store;
mod wait;

pub use active::{ActiveExecutions, CompletionHook, ExecutionHandle};
pub use engine::{EngineContext, EngineOutcome, ExecutionEngine};
pub use executor::WorkflowExecutor;
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use retry::RetryCoordinator;
pub use runtime::{ExecutionRuntime, PendingResponse, StopOutcome};
pub use store::{open_store, ExecutionPage, ExecutionStore, MemoryStore, SqliteStore};
pub use wait::{ExecutionResumer, ResumeScheduler};
