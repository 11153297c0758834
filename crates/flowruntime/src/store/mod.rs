//! Execution persistence.
//!
//! Records are written with their run data flattened. Both backends answer
//! the same filter shape, so callers never know which one they talk to.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    Config, DatabaseKind, DeleteFilter, ExecutionFilter, ExecutionId, ExecutionRecord,
    ExecutionsListResponse, StoreError,
};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, StoreError>;

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub records: Vec<ExecutionRecord>,
    pub total_count: u64,
    pub estimated: bool,
}

impl ExecutionPage {
    pub fn into_response(self) -> ExecutionsListResponse {
        ExecutionsListResponse {
            count: self.total_count,
            results: self.records.iter().map(ExecutionRecord::summary).collect(),
            estimated: self.estimated,
        }
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or update. A record that cannot be flattened is rejected and
    /// the stored copy stays as it was.
    async fn save(&self, record: &ExecutionRecord) -> Result<()>;

    async fn load(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Matching records, newest first.
    async fn list(&self, filter: &ExecutionFilter) -> Result<ExecutionPage>;

    /// Returns how many records were removed. An empty filter is refused.
    async fn delete_matching(&self, filter: &DeleteFilter) -> Result<u64>;

    /// Waiting executions whose wake time is at or before `now`.
    async fn find_due_waiting(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>>;

    /// Atomically moves a due waiting record back to running. `None` when
    /// the record is gone, not waiting, not yet due, or already claimed.
    async fn claim_waiting(
        &self,
        id: ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>>;

    /// Sets `retry_success_id` on `original` unless it is already set.
    async fn mark_retry_success(&self, original: ExecutionId, retry: ExecutionId) -> Result<bool>;
}

/// Opens the store selected by `config.database`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn ExecutionStore>> {
    match config.database.kind {
        DatabaseKind::Memory => Ok(Arc::new(MemoryStore::new())),
        DatabaseKind::Sqlite => Ok(Arc::new(
            SqliteStore::open(&config.database.path, &config.executions).await?,
        )),
    }
}

fn require_narrowing(filter: &DeleteFilter) -> Result<()> {
    if filter.is_empty() {
        return Err(StoreError::InvalidFilter(
            "refusing to delete without deleteBefore, ids or filters".to_string(),
        ));
    }
    Ok(())
}
