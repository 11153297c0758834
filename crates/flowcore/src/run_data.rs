//! Per-step input/output graph of one execution.
//!
//! This is the `data` field of an execution record. It is the part that gets
//! flattened before it is written to a store.

use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outputs keyed by port name.
pub type PortData = HashMap<String, Value>;

/// Pinned outputs keyed by step name. A pinned step is not executed.
pub type PinData = HashMap<String, PortData>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunExecutionData {
    #[serde(default)]
    pub start_data: StartData,
    #[serde(default)]
    pub result_data: ResultData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_data: Option<ResumeState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_node_filter: Option<Vec<String>>,
    /// Inputs handed to steps without incoming connections.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: PortData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultData {
    #[serde(default)]
    pub run_data: HashMap<String, Vec<TaskData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_data: Option<PinData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_executed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

/// Where a parked execution stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub waiting_node: String,
    pub wait_till: DateTime<Utc>,
}

/// One run of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    pub start_time: DateTime<Utc>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub data: PortData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl TaskData {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Failure payload of a run. Engine failures end up here rather than being
/// raised past the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            ..Self::new(message)
        }
    }

    pub fn canceled() -> Self {
        Self::new("Execution was canceled")
    }
}

impl RunExecutionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed(&self) -> bool {
        self.result_data.error.is_some()
    }

    pub fn record_task(&mut self, node: &str, task: TaskData) {
        self.result_data.last_node_executed = Some(node.to_string());
        self.result_data
            .run_data
            .entry(node.to_string())
            .or_default()
            .push(task);
    }

    /// Latest successful outputs of `node`, if it already ran.
    pub fn completed_outputs(&self, node: &str) -> Option<&PortData> {
        self.result_data
            .run_data
            .get(node)
            .and_then(|tasks| tasks.last())
            .filter(|task| task.succeeded())
            .map(|task| &task.data)
    }

    pub fn pinned_outputs(&self, node: &str) -> Option<&PortData> {
        self.result_data
            .pin_data
            .as_ref()
            .and_then(|pins| pins.get(node))
    }

    /// Drops the failure so a retry restarts at the failed steps while reusing
    /// every step that already succeeded.
    pub fn reset_for_retry(&mut self) {
        if let Some(error) = self.result_data.error.take() {
            if let Some(node) = error.node {
                self.result_data.run_data.remove(&node);
            }
        }
        self.result_data
            .run_data
            .retain(|_, tasks| tasks.last().map(TaskData::succeeded).unwrap_or(false));
        self.execution_data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(error: Option<RunError>) -> TaskData {
        TaskData {
            start_time: Utc::now(),
            execution_time_ms: 3,
            data: HashMap::from([("out".to_string(), Value::from("x"))]),
            error,
        }
    }

    #[test]
    fn reset_for_retry_keeps_only_successful_steps() {
        let mut data = RunExecutionData::new();
        data.record_task("fetch", task(None));
        data.record_task("parse", task(Some(RunError::at_node("bad json", "parse"))));
        data.result_data.error = Some(RunError::at_node("bad json", "parse"));

        data.reset_for_retry();

        assert!(!data.failed());
        assert!(data.completed_outputs("fetch").is_some());
        assert!(!data.result_data.run_data.contains_key("parse"));
    }

    #[test]
    fn failed_task_has_no_completed_outputs() {
        let mut data = RunExecutionData::new();
        data.record_task("parse", task(Some(RunError::new("boom"))));
        assert!(data.completed_outputs("parse").is_none());
        assert_eq!(data.result_data.last_node_executed.as_deref(), Some("parse"));
    }
}
