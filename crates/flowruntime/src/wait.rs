//! Wakes parked executions once their `wait_till` has passed.

use crate::store::ExecutionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    ExecutionId, ExecutionRecord, ExecutionStatus, LifecycleError, RunError, SchedulerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Restarts a claimed execution from its stored run data.
#[async_trait]
pub trait ExecutionResumer: Send + Sync {
    async fn resume(&self, record: ExecutionRecord) -> Result<(), LifecycleError>;
}

pub struct ResumeScheduler {
    store: Arc<dyn ExecutionStore>,
    resumer: Arc<dyn ExecutionResumer>,
    poll_interval: Duration,
}

impl ResumeScheduler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        resumer: Arc<dyn ExecutionResumer>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            resumer,
            poll_interval: config.poll_interval(),
        }
    }

    /// One polling pass. Returns the executions this pass resumed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, LifecycleError> {
        let due = self.store.find_due_waiting(now).await?;
        if !due.is_empty() {
            tracing::debug!("{} waiting executions due", due.len());
        }

        let mut resumed = Vec::new();
        for id in due {
            // Another poller or a stop request got there first.
            let Some(record) = self.store.claim_waiting(id, now).await? else {
                continue;
            };
            match self.resumer.resume(record.clone()).await {
                Ok(()) => {
                    tracing::info!("Resumed waiting execution {}", id);
                    resumed.push(id);
                }
                // A live run already owns the id, leave its record alone.
                Err(LifecycleError::DuplicateExecution(_)) => {
                    tracing::warn!("Execution {} was resumed while already active", id);
                }
                Err(e) => {
                    tracing::error!("Failed to resume execution {}: {}", id, e);
                    self.fail_claimed(record, &e).await?;
                }
            }
        }
        Ok(resumed)
    }

    /// A claimed record is running with no live run behind it. Settle it as
    /// failed so it neither sticks in `running` nor wakes again.
    async fn fail_claimed(
        &self,
        mut record: ExecutionRecord,
        cause: &LifecycleError,
    ) -> Result<(), LifecycleError> {
        let mut data = record.data.clone();
        data.result_data.error = Some(RunError::new(format!("Could not resume: {}", cause)));
        record.finish(ExecutionStatus::Error, data);
        self.store.save(&record).await?;
        Ok(())
    }

    /// Polls until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "Resume scheduler polling every {}ms",
            self.poll_interval.as_millis()
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!("Resume scheduler pass failed: {}", e);
                    }
                }
            }
        }
        tracing::info!("Resume scheduler stopped");
    }
}
