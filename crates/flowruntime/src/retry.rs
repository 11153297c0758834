//! Retry attempts of failed executions.

use crate::store::ExecutionStore;
use flowcore::{
    ExecutionFilter, ExecutionId, ExecutionMode, ExecutionRecord, ExecutionStatus,
    LifecycleError, RecordState, RunResult, SubmitRequest,
};
use serde_json::json;
use std::sync::Arc;

pub struct RetryCoordinator {
    store: Arc<dyn ExecutionStore>,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Checks that `original` can be retried.
    pub fn check_retryable(original: &ExecutionRecord) -> Result<(), LifecycleError> {
        if original.state() != RecordState::Terminal {
            return Err(LifecycleError::not_retryable(
                original.id,
                "execution has not finished",
            ));
        }
        if original.status != ExecutionStatus::Error {
            return Err(LifecycleError::not_retryable(
                original.id,
                format!("execution ended with status {}", original.status),
            ));
        }
        if let Some(success) = original.retry_success_id {
            return Err(LifecycleError::not_retryable(
                original.id,
                format!("already retried successfully by {}", success),
            ));
        }
        Ok(())
    }

    /// Builds the submission for a new attempt of `original_id`.
    ///
    /// The attempt runs the workflow snapshot stored with the original, never
    /// the current definition, and restarts at the failed step.
    pub async fn prepare_retry(
        &self,
        original_id: ExecutionId,
        user_id: &str,
    ) -> Result<SubmitRequest, LifecycleError> {
        let original = self
            .store
            .load(original_id)
            .await?
            .ok_or(LifecycleError::UnknownExecution(original_id))?;
        Self::check_retryable(&original)?;

        let mut data = original.data.clone();
        data.reset_for_retry();

        let mut request = SubmitRequest::new(
            ExecutionMode::Retry,
            original.workflow_data.clone(),
            user_id,
        );
        request.retry_of = Some(original_id);
        request.execution_data = Some(data);
        tracing::info!("Prepared retry of execution {}", original_id);
        Ok(request)
    }

    /// Links a finished retry attempt to its original. Only the first
    /// successful attempt is recorded.
    pub async fn record_outcome(&self, result: &RunResult) -> Result<bool, LifecycleError> {
        let Some(original) = result.retry_of else {
            return Ok(false);
        };
        if result.status != ExecutionStatus::Success {
            tracing::debug!(
                "Retry {} of {} ended as {}",
                result.execution_id,
                original,
                result.status
            );
            return Ok(false);
        }
        let linked = self
            .store
            .mark_retry_success(original, result.execution_id)
            .await?;
        if linked {
            tracing::info!(
                "Execution {} succeeded as retry of {}",
                result.execution_id,
                original
            );
        } else {
            tracing::info!(
                "Execution {} succeeded but {} was already retried successfully",
                result.execution_id,
                original
            );
        }
        Ok(linked)
    }

    /// Number of attempts already made for `original_id`.
    pub async fn attempts(&self, original_id: ExecutionId) -> Result<u64, LifecycleError> {
        let filter = ExecutionFilter {
            filters: [("retryOf".to_string(), json!(original_id.to_string()))].into(),
            ..Default::default()
        };
        Ok(self.store.list(&filter).await?.total_count)
    }
}
