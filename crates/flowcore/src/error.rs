use crate::ExecutionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNodeName(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),
}

/// Failures of the flatten/unflatten codec.
#[derive(Error, Debug)]
pub enum FlattenError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("flattened input is empty")]
    Empty,

    #[error("invalid entry reference: {0}")]
    InvalidReference(String),

    #[error("reference cycle through entry {0}")]
    Cycle(usize),
}

/// Errors from execution store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] FlattenError),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("delete aborted at batch {batch} after {deleted} deletions: {reason}")]
    BatchDelete {
        batch: usize,
        deleted: u64,
        reason: String,
    },
}

/// Errors surfaced by the execution lifecycle components.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("execution {0} is already registered")]
    DuplicateExecution(ExecutionId),

    #[error("execution {0} is not active")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} already has a webhook response waiter")]
    WaiterAlreadySet(ExecutionId),

    #[error("execution {id} cannot be retried: {reason}")]
    NotRetryable { id: ExecutionId, reason: String },

    #[error("timed out waiting for execution {0}")]
    WaitTimeout(ExecutionId),

    #[error("engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn not_retryable(id: ExecutionId, reason: impl Into<String>) -> Self {
        Self::NotRetryable {
            id,
            reason: reason.into(),
        }
    }
}

impl From<FlattenError> for LifecycleError {
    fn from(err: FlattenError) -> Self {
        Self::Store(StoreError::Serialization(err))
    }
}
