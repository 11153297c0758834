//! SQLite execution store.
//!
//! WAL journal mode, one row per execution. Summary fields get their own
//! indexed columns so filters run in SQL. Run data is stored flattened and
//! the workflow snapshot as plain JSON.

use super::{require_narrowing, ExecutionPage, ExecutionStore, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flowcore::{
    flatten, unflatten, DeleteFilter, ExecutionFilter, ExecutionId, ExecutionRecord,
    ExecutionsConfig, FilterField, FlattenError, Predicate, PredicateValue, StoreError, Workflow,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const COLUMNS: &str = "id, mode, status, finished, started_at, stopped_at, workflow_id, \
                       retry_of, retry_success_id, wait_till, data, workflow_data";

pub struct SqliteStore {
    pool: SqlitePool,
    delete_batch_size: usize,
    estimate_threshold: u64,
}

fn db_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

fn to_nanos(t: DateTime<Utc>) -> Result<i64> {
    t.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::Database(format!("timestamp out of range: {}", t)))
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Database(format!("bad id '{}': {}", raw, e)))
}

fn decode_row(row: &SqliteRow) -> Result<ExecutionRecord> {
    let get_err = |e: sqlx::Error| StoreError::Database(e.to_string());

    let id: String = row.try_get("id").map_err(get_err)?;
    let mode: String = row.try_get("mode").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let finished: bool = row.try_get("finished").map_err(get_err)?;
    let started_at: i64 = row.try_get("started_at").map_err(get_err)?;
    let stopped_at: Option<i64> = row.try_get("stopped_at").map_err(get_err)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(get_err)?;
    let retry_of: Option<String> = row.try_get("retry_of").map_err(get_err)?;
    let retry_success_id: Option<String> = row.try_get("retry_success_id").map_err(get_err)?;
    let wait_till: Option<i64> = row.try_get("wait_till").map_err(get_err)?;
    let data: String = row.try_get("data").map_err(get_err)?;
    let workflow_data: String = row.try_get("workflow_data").map_err(get_err)?;

    let workflow: Workflow = serde_json::from_str(&workflow_data).map_err(FlattenError::from)?;

    Ok(ExecutionRecord {
        id: parse_id(&id)?,
        mode: mode.parse().map_err(StoreError::Database)?,
        status: status.parse().map_err(StoreError::Database)?,
        finished,
        started_at: from_nanos(started_at),
        stopped_at: stopped_at.map(from_nanos),
        workflow_id: parse_id(&workflow_id)?,
        retry_of: retry_of.as_deref().map(parse_id).transpose()?,
        retry_success_id: retry_success_id.as_deref().map(parse_id).transpose()?,
        wait_till: wait_till.map(from_nanos),
        data: unflatten(&data)?,
        workflow_data: Arc::new(workflow),
    })
}

/// Appends ` WHERE ...` for `filter`. Every value is bound, never inlined.
fn push_conditions(
    qb: &mut QueryBuilder<'_, Sqlite>,
    filter: &ExecutionFilter,
    predicates: &[Predicate],
) -> Result<()> {
    qb.push(" WHERE 1 = 1");

    if let Some(after) = filter.started_after {
        qb.push(" AND started_at >= ").push_bind(to_nanos(after)?);
    }
    if let Some(cutoff) = filter.delete_before {
        qb.push(" AND stopped_at IS NOT NULL AND stopped_at < ")
            .push_bind(to_nanos(cutoff)?);
    }
    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            qb.push(" AND 0");
        } else {
            qb.push(" AND id IN (");
            let mut list = qb.separated(", ");
            for id in ids {
                list.push_bind(id.to_string());
            }
            list.push_unseparated(")");
        }
    }

    for predicate in predicates {
        let column = match predicate.field {
            FilterField::Id => "id",
            FilterField::WorkflowId => "workflow_id",
            FilterField::Mode => "mode",
            FilterField::Status => "status",
            FilterField::Finished => "finished",
            FilterField::RetryOf => "retry_of",
            FilterField::RetrySuccessId => "retry_success_id",
            FilterField::Waiting => "wait_till",
        };
        match (predicate.field, &predicate.value) {
            (FilterField::Waiting, PredicateValue::Flag(true)) => {
                qb.push(" AND wait_till IS NOT NULL");
            }
            (FilterField::Waiting, PredicateValue::Flag(false)) => {
                qb.push(" AND wait_till IS NULL");
            }
            (_, PredicateValue::Flag(flag)) => {
                qb.push(format!(" AND {} = ", column)).push_bind(*flag);
            }
            (_, PredicateValue::Text(text)) => {
                qb.push(format!(" AND {} = ", column)).push_bind(text.clone());
            }
            (_, PredicateValue::Null) => {
                qb.push(format!(" AND {} IS NULL", column));
            }
        }
    }
    Ok(())
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub async fn open<P: AsRef<Path>>(path: P, config: &ExecutionsConfig) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_err)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            delete_batch_size: config.delete_batch_size.max(1),
            estimate_threshold: config.estimate_threshold,
        };
        store.create_tables().await?;
        info!("SQLite execution store opened at {}", path_str);
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                finished INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                stopped_at INTEGER,
                workflow_id TEXT NOT NULL,
                retry_of TEXT,
                retry_success_id TEXT,
                wait_till INTEGER,
                data TEXT NOT NULL,
                workflow_data TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at)",
            "CREATE INDEX IF NOT EXISTS idx_executions_stopped ON executions(stopped_at)",
            "CREATE INDEX IF NOT EXISTS idx_executions_wait ON executions(wait_till)",
            "CREATE INDEX IF NOT EXISTS idx_executions_retry_of ON executions(retry_of)",
        ] {
            sqlx::query(index)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn count(&self, filter: &ExecutionFilter, predicates: &[Predicate]) -> Result<(u64, bool)> {
        if filter.is_unfiltered() && predicates.is_empty() {
            let max_rowid: Option<i64> = sqlx::query_scalar("SELECT MAX(rowid) FROM executions")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
            let estimate = max_rowid.unwrap_or(0).max(0) as u64;
            if estimate > self.estimate_threshold {
                return Ok((estimate, true));
            }
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM executions");
        push_conditions(&mut qb, filter, predicates)?;
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok((count.max(0) as u64, false))
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM executions WHERE id IN (");
        let mut list = qb.separated(", ");
        for id in ids {
            list.push_bind(id.clone());
        }
        list.push_unseparated(")");
        let result = qb.build().execute(&mut *tx).await.map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let data = flatten(&record.data)?;
        let workflow_data = serde_json::to_string(&*record.workflow_data).map_err(FlattenError::from)?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, mode, status, finished, started_at, stopped_at,
                workflow_id, retry_of, retry_success_id, wait_till, data, workflow_data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                mode = excluded.mode,
                status = excluded.status,
                finished = excluded.finished,
                started_at = excluded.started_at,
                stopped_at = excluded.stopped_at,
                retry_of = excluded.retry_of,
                retry_success_id = COALESCE(executions.retry_success_id, excluded.retry_success_id),
                wait_till = excluded.wait_till,
                data = excluded.data
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(record.finished)
        .bind(to_nanos(record.started_at)?)
        .bind(record.stopped_at.map(to_nanos).transpose()?)
        .bind(record.workflow_id.to_string())
        .bind(record.retry_of.map(|id| id.to_string()))
        .bind(record.retry_success_id.map(|id| id.to_string()))
        .bind(record.wait_till.map(to_nanos).transpose()?)
        .bind(data)
        .bind(workflow_data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM executions WHERE id = ?", COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        let predicates = filter.predicates()?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM executions", COLUMNS));
        push_conditions(&mut qb, filter, &predicates)?;
        qb.push(" ORDER BY started_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let records = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;

        let (total_count, estimated) = self.count(filter, &predicates).await?;
        Ok(ExecutionPage {
            records,
            total_count,
            estimated,
        })
    }

    async fn delete_matching(&self, filter: &DeleteFilter) -> Result<u64> {
        require_narrowing(filter)?;
        let filter = ExecutionFilter::from(filter);
        let predicates = filter.predicates()?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM executions");
        push_conditions(&mut qb, &filter, &predicates)?;
        qb.push(" ORDER BY started_at");
        let ids: Vec<String> = qb
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut deleted = 0u64;
        for (batch, chunk) in ids.chunks(self.delete_batch_size).enumerate() {
            match self.delete_batch(chunk).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    tracing::error!("Execution delete batch {} failed: {}", batch, e);
                    return Err(StoreError::BatchDelete {
                        batch,
                        deleted,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::debug!("Deleted {} executions", deleted);
        Ok(deleted)
    }

    async fn find_due_waiting(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM executions \
             WHERE finished = 0 AND wait_till IS NOT NULL AND wait_till <= ? \
             ORDER BY wait_till, id",
        )
        .bind(to_nanos(now)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    async fn claim_waiting(
        &self,
        id: ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let claimed = sqlx::query(
            "UPDATE executions SET wait_till = NULL, status = 'running' \
             WHERE id = ? AND finished = 0 AND wait_till IS NOT NULL AND wait_till <= ?",
        )
        .bind(id.to_string())
        .bind(to_nanos(now)?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }

        let row = sqlx::query(&format!("SELECT {} FROM executions WHERE id = ?", COLUMNS))
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let record = match decode_row(&row) {
            Ok(record) => record,
            Err(e) => {
                tx.rollback().await.map_err(db_err)?;
                return Err(e);
            }
        };
        tx.commit().await.map_err(db_err)?;
        Ok(Some(record))
    }

    async fn mark_retry_success(&self, original: ExecutionId, retry: ExecutionId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE executions SET retry_success_id = ? WHERE id = ? AND retry_success_id IS NULL",
        )
        .bind(retry.to_string())
        .bind(original.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM executions WHERE id = ?")
            .bind(original.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(original.to_string())),
        }
    }
}
