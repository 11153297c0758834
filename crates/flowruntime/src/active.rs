//! Bookkeeping for executions that are currently running.
//!
//! An entry lives from the moment a run is accepted until its terminal (or
//! parked) record has been written and every waiter has been told. The map
//! lock is only held for insert, lookup and removal; waiter state sits
//! behind a per-entry mutex that is never held across an await.

use crate::store::ExecutionStore;
use chrono::{DateTime, Utc};
use flowcore::{
    CurrentExecutionSummary, ExecutionId, ExecutionMode, ExecutionRecord, LifecycleError,
    ResponseSink, RunResult, WebhookResponse, WorkflowId,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Internal listener run once with the final result.
pub type CompletionHook = Box<dyn FnOnce(RunResult) -> BoxFuture<'static, ()> + Send>;

/// What the registry knows about a run it did not start itself.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub cancel: CancellationToken,
    pub mode: ExecutionMode,
    pub workflow_id: WorkflowId,
    pub retry_of: Option<ExecutionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Terminal record is being written; waiters may still be added.
    Settling,
    Done,
}

enum CompletionWaiter {
    Channel(oneshot::Sender<RunResult>),
    Hook(CompletionHook),
}

struct EntryState {
    phase: Phase,
    waiters: Vec<CompletionWaiter>,
    response: Option<oneshot::Sender<WebhookResponse>>,
    response_taken: bool,
}

struct ActiveExecution {
    handle: ExecutionHandle,
    started_at: DateTime<Utc>,
    state: Mutex<EntryState>,
}

impl ActiveExecution {
    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ActiveExecutions {
    store: Arc<dyn ExecutionStore>,
    entries: RwLock<HashMap<ExecutionId, Arc<ActiveExecution>>>,
}

impl ActiveExecutions {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, id: ExecutionId) -> Option<Arc<ActiveExecution>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: ExecutionId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn register(
        &self,
        id: ExecutionId,
        handle: ExecutionHandle,
        started_at: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(LifecycleError::DuplicateExecution(id));
        }
        entries.insert(
            id,
            Arc::new(ActiveExecution {
                handle,
                started_at,
                state: Mutex::new(EntryState {
                    phase: Phase::Running,
                    waiters: Vec::new(),
                    response: None,
                    response_taken: false,
                }),
            }),
        );
        tracing::debug!("Registered active execution {}", id);
        Ok(())
    }

    fn add_waiter(&self, id: ExecutionId, waiter: CompletionWaiter) -> Result<(), LifecycleError> {
        let entry = self.get(id).ok_or(LifecycleError::UnknownExecution(id))?;
        let mut state = entry.state();
        if state.phase == Phase::Done {
            return Err(LifecycleError::UnknownExecution(id));
        }
        state.waiters.push(waiter);
        Ok(())
    }

    /// Resolves once with the terminal (or parked) result.
    pub fn add_completion_waiter(
        &self,
        id: ExecutionId,
    ) -> Result<oneshot::Receiver<RunResult>, LifecycleError> {
        let (tx, rx) = oneshot::channel();
        self.add_waiter(id, CompletionWaiter::Channel(tx))?;
        Ok(rx)
    }

    pub fn add_completion_hook(
        &self,
        id: ExecutionId,
        hook: CompletionHook,
    ) -> Result<(), LifecycleError> {
        self.add_waiter(id, CompletionWaiter::Hook(hook))
    }

    /// At most one per execution.
    pub fn set_webhook_waiter(
        &self,
        id: ExecutionId,
    ) -> Result<oneshot::Receiver<WebhookResponse>, LifecycleError> {
        let entry = self.get(id).ok_or(LifecycleError::UnknownExecution(id))?;
        let mut state = entry.state();
        if state.response.is_some() || state.response_taken {
            return Err(LifecycleError::WaiterAlreadySet(id));
        }
        let (tx, rx) = oneshot::channel();
        state.response = Some(tx);
        Ok(rx)
    }

    /// Hands the first response payload to the webhook waiter. Later payloads
    /// are ignored.
    pub fn resolve_response(&self, id: ExecutionId, response: WebhookResponse) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let sender = {
            let mut state = entry.state();
            let sender = state.response.take();
            if sender.is_some() {
                state.response_taken = true;
            }
            sender
        };
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::debug!("Execution {} has no pending webhook waiter", id);
                false
            }
        }
    }

    /// Persists the terminal record and resolves every waiter exactly once.
    ///
    /// Returns `Ok(false)` when the execution was already settled. Waiters
    /// are released even when the write fails; the store error is returned
    /// afterwards.
    pub async fn complete(
        &self,
        id: ExecutionId,
        record: ExecutionRecord,
    ) -> Result<bool, LifecycleError> {
        debug_assert!(record.status.is_terminal());
        self.settle(id, record, "complete").await
    }

    /// Writes the waiting record and releases the entry. Waiters receive the
    /// waiting result so nobody stays blocked on a parked run.
    pub async fn park(
        &self,
        id: ExecutionId,
        record: ExecutionRecord,
    ) -> Result<bool, LifecycleError> {
        debug_assert!(record.wait_till.is_some());
        self.settle(id, record, "park").await
    }

    async fn settle(
        &self,
        id: ExecutionId,
        record: ExecutionRecord,
        action: &str,
    ) -> Result<bool, LifecycleError> {
        let Some(entry) = self.get(id) else {
            tracing::warn!("Ignoring {} for execution {}: not active", action, id);
            return Ok(false);
        };
        {
            let mut state = entry.state();
            if state.phase != Phase::Running {
                tracing::warn!("Ignoring {} for execution {}: already settled", action, id);
                return Ok(false);
            }
            state.phase = Phase::Settling;
        }

        let saved = self.store.save(&record).await;
        if let Err(e) = &saved {
            tracing::error!("Failed to persist execution {} on {}: {}", id, action, e);
        }

        let (waiters, response) = {
            let mut state = entry.state();
            state.phase = Phase::Done;
            (std::mem::take(&mut state.waiters), state.response.take())
        };
        self.remove(id);

        let result = RunResult::from(&record);
        if let Some(tx) = response {
            let _ = tx.send(WebhookResponse::from_run(&result));
        }
        for waiter in waiters {
            match waiter {
                CompletionWaiter::Channel(tx) => {
                    let _ = tx.send(result.clone());
                }
                CompletionWaiter::Hook(hook) => hook(result.clone()).await,
            }
        }
        tracing::info!("Execution {} settled as {}", id, record.status);

        saved?;
        Ok(true)
    }

    /// Fires the run's cancellation token. The entry stays until the run
    /// reports back.
    pub fn cancel(&self, id: ExecutionId) -> Result<bool, LifecycleError> {
        let entry = self.get(id).ok_or(LifecycleError::UnknownExecution(id))?;
        let state = entry.state();
        if state.phase != Phase::Running {
            tracing::info!("Execution {} is already finishing, nothing to cancel", id);
            return Ok(false);
        }
        entry.handle.cancel.cancel();
        tracing::info!("Cancellation requested for execution {}", id);
        Ok(true)
    }

    pub fn is_active(&self, id: ExecutionId) -> bool {
        self.get(id).is_some()
    }

    pub fn current(&self) -> Vec<CurrentExecutionSummary> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut current: Vec<_> = entries
            .iter()
            .map(|(id, entry)| CurrentExecutionSummary {
                id: *id,
                retry_of: entry.handle.retry_of,
                started_at: entry.started_at,
                mode: entry.handle.mode,
                workflow_id: entry.handle.workflow_id,
            })
            .collect();
        current.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        current
    }
}

impl ResponseSink for ActiveExecutions {
    fn respond(&self, execution_id: ExecutionId, response: WebhookResponse) -> bool {
        self.resolve_response(execution_id, response)
    }
}
