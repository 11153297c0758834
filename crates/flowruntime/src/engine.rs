//! Contract between the lifecycle core and whatever executes the steps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    ExecutionId, ExecutionMode, PushEmitter, ResponseSlot, RunExecutionData, Workflow,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an engine needs to drive one run.
#[derive(Clone)]
pub struct EngineContext {
    pub execution_id: ExecutionId,
    pub mode: ExecutionMode,
    pub workflow: Arc<Workflow>,
    /// Run data to continue from. Empty for fresh runs.
    pub data: RunExecutionData,
    pub events: PushEmitter,
    pub response: ResponseSlot,
    pub cancellation: CancellationToken,
}

/// How a run ended from the engine's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    /// Ran to the end. A failed run carries its error in `data`.
    Finished(RunExecutionData),
    /// A step asked to be resumed later.
    Waiting {
        wait_till: DateTime<Utc>,
        data: RunExecutionData,
    },
    /// The cancellation token fired before the run ended.
    Canceled(RunExecutionData),
}

impl EngineOutcome {
    pub fn data(&self) -> &RunExecutionData {
        match self {
            Self::Finished(data) | Self::Canceled(data) => data,
            Self::Waiting { data, .. } => data,
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(&self, ctx: EngineContext) -> EngineOutcome;
}
