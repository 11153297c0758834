use crate::{ExecutionId, ExecutionRecord, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query over stored executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    /// Only executions started at or after this instant.
    #[serde(default)]
    pub started_after: Option<DateTime<Utc>>,
    /// Only executions that stopped strictly before this instant.
    #[serde(default)]
    pub delete_before: Option<DateTime<Utc>>,
    /// Equality predicates over summary fields, e.g. `{"workflowId": "..."}`.
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub ids: Option<Vec<ExecutionId>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Bulk deletion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFilter {
    #[serde(default)]
    pub delete_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub ids: Option<Vec<ExecutionId>>,
}

impl DeleteFilter {
    pub fn before(cutoff: DateTime<Utc>) -> Self {
        Self {
            delete_before: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn ids(ids: Vec<ExecutionId>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delete_before.is_none() && self.filters.is_empty() && self.ids.is_none()
    }
}

impl From<DeleteFilter> for ExecutionFilter {
    fn from(filter: DeleteFilter) -> Self {
        Self {
            started_after: None,
            delete_before: filter.delete_before,
            filters: filter.filters,
            ids: filter.ids,
            limit: None,
        }
    }
}

impl From<&DeleteFilter> for ExecutionFilter {
    fn from(filter: &DeleteFilter) -> Self {
        filter.clone().into()
    }
}

/// Summary fields a predicate may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    Id,
    WorkflowId,
    Mode,
    Status,
    Finished,
    RetryOf,
    RetrySuccessId,
    Waiting,
}

impl FilterField {
    pub fn parse(key: &str) -> Result<Self, StoreError> {
        match key {
            "id" => Ok(Self::Id),
            "workflowId" => Ok(Self::WorkflowId),
            "mode" => Ok(Self::Mode),
            "status" => Ok(Self::Status),
            "finished" => Ok(Self::Finished),
            "retryOf" => Ok(Self::RetryOf),
            "retrySuccessId" => Ok(Self::RetrySuccessId),
            "waiting" => Ok(Self::Waiting),
            other => Err(StoreError::InvalidFilter(format!("unknown field '{}'", other))),
        }
    }

    fn is_flag(&self) -> bool {
        matches!(self, Self::Finished | Self::Waiting)
    }

    fn is_optional(&self) -> bool {
        matches!(self, Self::RetryOf | Self::RetrySuccessId)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateValue {
    Null,
    Text(String),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: FilterField,
    pub value: PredicateValue,
}

impl Predicate {
    fn parse(key: &str, raw: &serde_json::Value) -> Result<Self, StoreError> {
        let field = FilterField::parse(key)?;
        let value = match raw {
            serde_json::Value::Bool(b) if field.is_flag() => PredicateValue::Flag(*b),
            serde_json::Value::String(s) if !field.is_flag() => PredicateValue::Text(s.clone()),
            serde_json::Value::Null if field.is_optional() => PredicateValue::Null,
            other => {
                return Err(StoreError::InvalidFilter(format!(
                    "unsupported value {} for '{}'",
                    other, key
                )))
            }
        };
        Ok(Self { field, value })
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        let text = |v: String| PredicateValue::Text(v);
        let optional = |v: Option<ExecutionId>| v.map(|id| text(id.to_string())).unwrap_or(PredicateValue::Null);
        let actual = match self.field {
            FilterField::Id => text(record.id.to_string()),
            FilterField::WorkflowId => text(record.workflow_id.to_string()),
            FilterField::Mode => text(record.mode.to_string()),
            FilterField::Status => text(record.status.to_string()),
            FilterField::Finished => PredicateValue::Flag(record.finished),
            FilterField::RetryOf => optional(record.retry_of),
            FilterField::RetrySuccessId => optional(record.retry_success_id),
            FilterField::Waiting => PredicateValue::Flag(record.wait_till.is_some()),
        };
        actual == self.value
    }
}

impl ExecutionFilter {
    pub fn predicates(&self) -> Result<Vec<Predicate>, StoreError> {
        self.filters
            .iter()
            .map(|(key, value)| Predicate::parse(key, value))
            .collect()
    }

    /// True when nothing narrows the result set.
    pub fn is_unfiltered(&self) -> bool {
        self.started_after.is_none()
            && self.delete_before.is_none()
            && self.filters.is_empty()
            && self.ids.is_none()
    }

    /// In-process evaluation. Predicates must already be parsed.
    pub fn matches(&self, record: &ExecutionRecord, predicates: &[Predicate]) -> bool {
        if let Some(after) = self.started_after {
            if record.started_at < after {
                return false;
            }
        }
        if let Some(cutoff) = self.delete_before {
            match record.stopped_at {
                Some(stopped) if stopped < cutoff => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        predicates.iter().all(|p| p.matches(record))
    }
}
