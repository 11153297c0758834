use crate::active::{ActiveExecutions, CompletionHook, ExecutionHandle};
use crate::engine::{EngineContext, EngineOutcome, ExecutionEngine};
use crate::retry::RetryCoordinator;
use crate::store::ExecutionStore;
use crate::wait::ExecutionResumer;
use async_trait::async_trait;
use futures::FutureExt;
use flowcore::push::{ExecutionFinished, ExecutionStarted, TestWebhook};
use flowcore::{
    Config, CurrentExecutionSummary, DeleteFilter, ErrorHandling, ExecutionFilter, ExecutionId,
    ExecutionMode, ExecutionRecord, ExecutionStatus, ExecutionsConfig, ExecutionsListResponse,
    LifecycleError, PushBus, PushEmitter, PushMessage, RecordState, ResponseMode, ResponseSlot,
    RunError, RunResult, SaveDataPolicy, SubmitRequest, SubmitResponse, WebhookResponse,
};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Answer to a stop request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "camelCase")]
pub enum StopOutcome {
    /// Cancellation was signalled. The run settles on its own.
    Cancelling,
    /// The run was already settling when the request arrived.
    Finishing,
    /// A waiting execution was finalized as canceled.
    Stopped(RunResult),
    AlreadyFinished(RunResult),
    /// The record is running but no run in this process owns it. Nothing
    /// was changed.
    RunningElsewhere,
}

const REGISTER_POLLS: usize = 10;
const REGISTER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The first response payload of a run, taken at submission.
pub struct PendingResponse {
    execution_id: ExecutionId,
    rx: oneshot::Receiver<WebhookResponse>,
}

impl PendingResponse {
    /// Timing out only stops this wait. The run carries on.
    pub async fn wait(self, limit: Option<Duration>) -> Result<WebhookResponse, LifecycleError> {
        let id = self.execution_id;
        let received = match limit {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| LifecycleError::WaitTimeout(id))?,
            None => self.rx.await,
        };
        received.map_err(|_| LifecycleError::Engine(format!("execution {} dropped its response", id)))
    }
}

struct AutoRetry {
    root: ExecutionId,
    max_attempts: u32,
}

struct Shared {
    config: ExecutionsConfig,
    store: Arc<dyn ExecutionStore>,
    active: Arc<ActiveExecutions>,
    engine: Arc<dyn ExecutionEngine>,
    push: PushBus,
    retry: Arc<RetryCoordinator>,
    auto_retry: mpsc::UnboundedSender<AutoRetry>,
}

/// Submission, stop, retry and resume on top of the lifecycle components.
#[derive(Clone)]
pub struct ExecutionRuntime {
    shared: Arc<Shared>,
}

impl ExecutionRuntime {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &Config,
        store: Arc<dyn ExecutionStore>,
        engine: Arc<dyn ExecutionEngine>,
        push: PushBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config: config.executions.clone(),
            active: Arc::new(ActiveExecutions::new(store.clone())),
            retry: Arc::new(RetryCoordinator::new(store.clone())),
            store,
            engine,
            push,
            auto_retry: tx,
        });
        tokio::spawn(auto_retry_loop(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.shared.store
    }

    pub fn active(&self) -> &Arc<ActiveExecutions> {
        &self.shared.active
    }

    pub fn push(&self) -> &PushBus {
        &self.shared.push
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, LifecycleError> {
        Ok(self.submit_with_response(request).await?.0)
    }

    /// Like [`submit`](Self::submit), also handing back the response waiter
    /// when the request asked for the first response.
    pub async fn submit_with_response(
        &self,
        request: SubmitRequest,
    ) -> Result<(SubmitResponse, Option<PendingResponse>), LifecycleError> {
        submit(&self.shared, request).await
    }

    /// Resolves with the terminal (or parked) result. Answers from the store
    /// when the execution is no longer active.
    pub async fn wait_for_completion(
        &self,
        id: ExecutionId,
        limit: Option<Duration>,
    ) -> Result<RunResult, LifecycleError> {
        let rx = match self.shared.active.add_completion_waiter(id) {
            Ok(rx) => rx,
            Err(LifecycleError::UnknownExecution(_)) => return self.stored_result(id).await,
            Err(e) => return Err(e),
        };
        let received = match limit {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| LifecycleError::WaitTimeout(id))?,
            None => rx.await,
        };
        match received {
            Ok(result) => Ok(result),
            Err(_) => self.stored_result(id).await,
        }
    }

    async fn stored_result(&self, id: ExecutionId) -> Result<RunResult, LifecycleError> {
        self.shared
            .store
            .load(id)
            .await?
            .map(|record| RunResult::from(&record))
            .ok_or(LifecycleError::UnknownExecution(id))
    }

    pub async fn stop(&self, id: ExecutionId) -> Result<StopOutcome, LifecycleError> {
        if let Some(outcome) = self.cancel_local(id)? {
            return Ok(outcome);
        }

        let record = self
            .shared
            .store
            .load(id)
            .await?
            .ok_or(LifecycleError::UnknownExecution(id))?;

        match record.state() {
            RecordState::Terminal => {
                tracing::info!("Execution {} already finished, nothing to stop", id);
                Ok(StopOutcome::AlreadyFinished(RunResult::from(&record)))
            }
            RecordState::Waiting => {
                let wait_till = record.wait_till.unwrap_or(record.started_at);
                match self.shared.store.claim_waiting(id, wait_till).await? {
                    Some(claimed) => self.finalize_canceled(claimed).await,
                    // The scheduler claimed it first and is resuming it.
                    None => self.stop_unowned(id).await,
                }
            }
            RecordState::Active => self.stop_unowned(id).await,
        }
    }

    fn cancel_local(&self, id: ExecutionId) -> Result<Option<StopOutcome>, LifecycleError> {
        match self.shared.active.cancel(id) {
            Ok(true) => Ok(Some(StopOutcome::Cancelling)),
            Ok(false) => Ok(Some(StopOutcome::Finishing)),
            Err(LifecycleError::UnknownExecution(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The record says running but no entry here owns it. A local launch may
    /// be about to register, so poll briefly. The stored record is never
    /// written from this path.
    async fn stop_unowned(&self, id: ExecutionId) -> Result<StopOutcome, LifecycleError> {
        for _ in 0..REGISTER_POLLS {
            tokio::time::sleep(REGISTER_POLL_INTERVAL).await;
            if let Some(outcome) = self.cancel_local(id)? {
                return Ok(outcome);
            }
        }

        match self.shared.store.load(id).await? {
            Some(record) if record.state() == RecordState::Terminal => {
                Ok(StopOutcome::AlreadyFinished(RunResult::from(&record)))
            }
            Some(_) => {
                tracing::warn!("Execution {} is running outside this process", id);
                Ok(StopOutcome::RunningElsewhere)
            }
            None => Err(LifecycleError::UnknownExecution(id)),
        }
    }

    async fn finalize_canceled(
        &self,
        mut record: ExecutionRecord,
    ) -> Result<StopOutcome, LifecycleError> {
        let mut data = record.data.clone();
        data.result_data.error = Some(RunError::canceled());
        record.finish(ExecutionStatus::Canceled, data);
        self.shared.store.save(&record).await?;

        let result = RunResult::from(&record);
        self.shared
            .push
            .publish(PushMessage::ExecutionFinished(ExecutionFinished {
                execution_id: record.id,
                retry_of: record.retry_of,
                data: result.clone(),
            }));
        tracing::info!("Execution {} stopped", record.id);
        Ok(StopOutcome::Stopped(result))
    }

    /// Starts a new attempt of a failed execution.
    pub async fn retry(
        &self,
        original: ExecutionId,
        user_id: &str,
    ) -> Result<SubmitResponse, LifecycleError> {
        let request = self.shared.retry.prepare_retry(original, user_id).await?;
        self.submit(request).await
    }

    pub async fn load(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, LifecycleError> {
        Ok(self.shared.store.load(id).await?)
    }

    pub async fn list(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<ExecutionsListResponse, LifecycleError> {
        Ok(self.shared.store.list(filter).await?.into_response())
    }

    pub async fn delete(&self, filter: &DeleteFilter) -> Result<u64, LifecycleError> {
        Ok(self.shared.store.delete_matching(filter).await?)
    }

    pub fn current(&self) -> Vec<CurrentExecutionSummary> {
        self.shared.active.current()
    }
}

#[async_trait]
impl ExecutionResumer for ExecutionRuntime {
    async fn resume(&self, record: ExecutionRecord) -> Result<(), LifecycleError> {
        launch(&self.shared, record, None, ResponseMode::OnCompletion)?;
        Ok(())
    }
}

async fn submit(
    shared: &Arc<Shared>,
    request: SubmitRequest,
) -> Result<(SubmitResponse, Option<PendingResponse>), LifecycleError> {
    request
        .workflow_data
        .validate()
        .map_err(|e| LifecycleError::Engine(e.to_string()))?;

    if let Some(original) = request.retry_of {
        let record = shared
            .store
            .load(original)
            .await?
            .ok_or(LifecycleError::UnknownExecution(original))?;
        RetryCoordinator::check_retryable(&record)?;
    }

    let mut record = ExecutionRecord::new(
        Uuid::new_v4(),
        request.execution_mode,
        request.workflow_data.clone(),
        request.initial_data(),
    );
    record.retry_of = request.retry_of;
    shared.store.save(&record).await?;

    tracing::info!(
        "Accepted {} execution {} of workflow {} for {}",
        record.mode,
        record.id,
        record.workflow_id,
        request.user_id
    );
    launch(shared, record, request.session_id, request.response_mode)
}

/// Registers `record` as active and starts the engine on it.
fn launch(
    shared: &Arc<Shared>,
    record: ExecutionRecord,
    session_id: Option<String>,
    response_mode: ResponseMode,
) -> Result<(SubmitResponse, Option<PendingResponse>), LifecycleError> {
    let id = record.id;
    let cancel = CancellationToken::new();
    shared.active.register(
        id,
        ExecutionHandle {
            cancel: cancel.clone(),
            mode: record.mode,
            workflow_id: record.workflow_id,
            retry_of: record.retry_of,
        },
        record.started_at,
    )?;

    let pending = match response_mode {
        ResponseMode::FirstResponse => Some(PendingResponse {
            execution_id: id,
            rx: shared.active.set_webhook_waiter(id)?,
        }),
        ResponseMode::OnCompletion => None,
    };

    for hook in completion_hooks(shared, &record) {
        shared.active.add_completion_hook(id, hook)?;
    }

    let events = PushEmitter::new(id, session_id.clone(), shared.push.clone());
    events.send(PushMessage::ExecutionStarted(ExecutionStarted {
        execution_id: id,
        mode: record.mode,
        started_at: record.started_at,
        retry_of: record.retry_of,
        workflow_id: record.workflow_id,
        workflow_name: Some(record.workflow_data.name.clone()),
    }));
    if record.mode == ExecutionMode::Webhook && session_id.is_some() {
        events.send(PushMessage::TestWebhookReceived(TestWebhook {
            execution_id: id,
            workflow_id: record.workflow_id,
        }));
    }

    tokio::spawn(drive(shared.clone(), record, cancel, events));

    Ok((
        SubmitResponse {
            execution_id: id,
            waiting_for_webhook: pending.is_some(),
        },
        pending,
    ))
}

fn completion_hooks(shared: &Arc<Shared>, record: &ExecutionRecord) -> Vec<CompletionHook> {
    let mut hooks: Vec<CompletionHook> = Vec::new();

    if record.retry_of.is_some() {
        let retry = shared.retry.clone();
        hooks.push(Box::new(move |result: RunResult| {
            async move {
                if let Err(e) = retry.record_outcome(&result).await {
                    tracing::error!(
                        "Failed to link retry {} to its original: {}",
                        result.execution_id,
                        e
                    );
                }
            }
            .boxed()
        }));
    }

    if let ErrorHandling::RetryWorkflow { max_attempts } = record.workflow_data.settings.on_error {
        let tx = shared.auto_retry.clone();
        let root = record.retry_of.unwrap_or(record.id);
        hooks.push(Box::new(move |result: RunResult| {
            async move {
                if result.status == ExecutionStatus::Error {
                    let _ = tx.send(AutoRetry { root, max_attempts });
                }
            }
            .boxed()
        }));
    }

    hooks
}

/// Runs the engine for one execution and settles the result.
async fn drive(
    shared: Arc<Shared>,
    mut record: ExecutionRecord,
    cancel: CancellationToken,
    events: PushEmitter,
) {
    let id = record.id;
    let ctx = EngineContext {
        execution_id: id,
        mode: record.mode,
        workflow: record.workflow_data.clone(),
        data: record.data.clone(),
        events: events.clone(),
        response: ResponseSlot::new(id, shared.active.clone()),
        cancellation: cancel.clone(),
    };
    let engine = shared.engine.clone();
    let mut task = tokio::spawn(async move { engine.run(ctx).await });

    let mut timed_out = None;
    let joined = match shared.config.timeout() {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("Execution {} exceeded {}s, cancelling", id, limit.as_secs());
                timed_out = Some(limit);
                cancel.cancel();
                task.await
            }
        },
        None => task.await,
    };

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Engine task for execution {} failed: {}", id, e);
            let mut data = record.data.clone();
            data.result_data.error = Some(RunError::new(format!("Engine task failed: {}", e)));
            EngineOutcome::Finished(data)
        }
    };

    let settled = match outcome {
        EngineOutcome::Waiting { wait_till, data } => {
            record.park(wait_till, data);
            shared.active.park(id, record.clone()).await
        }
        EngineOutcome::Finished(data) => {
            let status = if data.failed() {
                ExecutionStatus::Error
            } else {
                ExecutionStatus::Success
            };
            record.finish(status, data);
            shared.active.complete(id, record.clone()).await
        }
        EngineOutcome::Canceled(mut data) => {
            if let Some(limit) = timed_out {
                data.result_data.error = Some(RunError::new(format!(
                    "Execution timed out after {}s",
                    limit.as_secs()
                )));
            }
            record.finish(ExecutionStatus::Canceled, data);
            shared.active.complete(id, record.clone()).await
        }
    };

    match settled {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => tracing::error!("Execution {} settled without being stored: {}", id, e),
    }

    events.send(PushMessage::ExecutionFinished(ExecutionFinished {
        execution_id: id,
        retry_of: record.retry_of,
        data: RunResult::from(&record),
    }));

    if record.state() == RecordState::Terminal && !keep_data(&shared.config, &record) {
        match shared.store.delete_matching(&DeleteFilter::ids(vec![id])).await {
            Ok(_) => tracing::debug!("Discarded execution {} per save policy", id),
            Err(e) => tracing::error!("Failed to discard execution {}: {}", id, e),
        }
    }
}

/// Whether a terminal record stays in the store.
fn keep_data(config: &ExecutionsConfig, record: &ExecutionRecord) -> bool {
    // Retry chains must stay linkable.
    if record.retry_of.is_some() || record.mode == ExecutionMode::Retry {
        return true;
    }
    if record.status == ExecutionStatus::Error
        && matches!(
            record.workflow_data.settings.on_error,
            ErrorHandling::RetryWorkflow { .. }
        )
    {
        return true;
    }
    if record.mode == ExecutionMode::Manual && !config.save_manual_executions {
        return false;
    }
    let policy = match record.status {
        ExecutionStatus::Success => config.save_data_on_success,
        _ => config.save_data_on_error,
    };
    policy == SaveDataPolicy::All
}

async fn auto_retry_loop(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<AutoRetry>) {
    while let Some(request) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let attempts = match shared.retry.attempts(request.root).await {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::error!("Cannot count retries of {}: {}", request.root, e);
                continue;
            }
        };
        if attempts >= u64::from(request.max_attempts) {
            tracing::info!(
                "Execution {} failed after {} automatic retries",
                request.root,
                attempts
            );
            continue;
        }
        let submitted = match shared.retry.prepare_retry(request.root, "system").await {
            Ok(retry) => submit(&shared, retry).await.map(|(response, _)| response),
            Err(e) => Err(e),
        };
        match submitted {
            Ok(response) => tracing::info!(
                "Automatic retry {} of execution {} started (attempt {})",
                response.execution_id,
                request.root,
                attempts + 1
            ),
            Err(e) => tracing::info!("Execution {} not retried: {}", request.root, e),
        }
    }
}
