//! In-memory execution store for tests and development.
//!
//! Run data is kept flattened, exactly as the SQLite backend stores it, so
//! codec failures surface the same way in both.

use super::{require_narrowing, ExecutionPage, ExecutionStore, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    flatten, unflatten, DeleteFilter, ExecutionFilter, ExecutionId, ExecutionRecord,
    ExecutionStatus, RunExecutionData, StoreError,
};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct StoredExecution {
    /// Everything but the run data, which lives in `data`.
    record: ExecutionRecord,
    data: String,
}

impl StoredExecution {
    fn decode(&self) -> Result<ExecutionRecord> {
        let mut record = self.record.clone();
        record.data = unflatten(&self.data)?;
        Ok(record)
    }
}

pub struct MemoryStore {
    executions: RwLock<HashMap<ExecutionId, StoredExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ExecutionId, StoredExecution>>> {
        self.executions
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ExecutionId, StoredExecution>>> {
        self.executions
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn matching(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let predicates = filter.predicates()?;
        let executions = self.read()?;
        let mut records = executions
            .values()
            .filter(|stored| filter.matches(&stored.record, &predicates))
            .map(StoredExecution::decode)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let data = flatten(&record.data)?;
        let mut executions = self.write()?;

        let mut stored = record.clone();
        stored.data = RunExecutionData::default();
        if let Some(existing) = executions.get(&record.id) {
            stored.workflow_data = existing.record.workflow_data.clone();
            stored.retry_success_id = existing.record.retry_success_id.or(stored.retry_success_id);
        }
        executions.insert(
            record.id,
            StoredExecution {
                record: stored,
                data,
            },
        );
        Ok(())
    }

    async fn load(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        self.read()?.get(&id).map(StoredExecution::decode).transpose()
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        let mut records = self.matching(filter)?;
        let total_count = records.len() as u64;
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(ExecutionPage {
            records,
            total_count,
            estimated: false,
        })
    }

    async fn delete_matching(&self, filter: &DeleteFilter) -> Result<u64> {
        require_narrowing(filter)?;
        let filter = ExecutionFilter::from(filter);
        let predicates = filter.predicates()?;

        let mut executions = self.write()?;
        let before = executions.len();
        executions.retain(|_, stored| !filter.matches(&stored.record, &predicates));
        let deleted = (before - executions.len()) as u64;
        tracing::debug!("Deleted {} executions from memory store", deleted);
        Ok(deleted)
    }

    async fn find_due_waiting(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let executions = self.read()?;
        let mut due: Vec<_> = executions
            .values()
            .filter(|stored| !stored.record.finished)
            .filter_map(|stored| stored.record.wait_till.map(|t| (t, stored.record.id)))
            .filter(|(wait_till, _)| *wait_till <= now)
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn claim_waiting(
        &self,
        id: ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let mut executions = self.write()?;
        let Some(stored) = executions.get_mut(&id) else {
            return Ok(None);
        };
        let due = !stored.record.finished
            && stored.record.wait_till.map(|t| t <= now).unwrap_or(false);
        if !due {
            return Ok(None);
        }

        let record = stored.decode()?;
        stored.record.wait_till = None;
        stored.record.status = ExecutionStatus::Running;

        let mut claimed = record;
        claimed.wait_till = None;
        claimed.status = ExecutionStatus::Running;
        Ok(Some(claimed))
    }

    async fn mark_retry_success(&self, original: ExecutionId, retry: ExecutionId) -> Result<bool> {
        let mut executions = self.write()?;
        match executions.get_mut(&original) {
            Some(stored) if stored.record.retry_success_id.is_none() => {
                stored.record.retry_success_id = Some(retry);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(original.to_string())),
        }
    }
}
