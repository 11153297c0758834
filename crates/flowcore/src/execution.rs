use crate::{PinData, RunError, RunExecutionData, TaskData, Workflow, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// How an execution was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Manual,
    Trigger,
    Webhook,
    Retry,
    Internal,
    Cli,
    Integrated,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Trigger => "trigger",
            Self::Webhook => "webhook",
            Self::Retry => "retry",
            Self::Internal => "internal",
            Self::Cli => "cli",
            Self::Integrated => "integrated",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "trigger" => Ok(Self::Trigger),
            "webhook" => Ok(Self::Webhook),
            "retry" => Ok(Self::Retry),
            "internal" => Ok(Self::Internal),
            "cli" => Ok(Self::Cli),
            "integrated" => Ok(Self::Integrated),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Success,
    Error,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Canceled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// The three disjoint states a record can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Active,
    Waiting,
    Terminal,
}

/// Durable representation of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_success_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
    pub data: RunExecutionData,
    pub workflow_data: Arc<Workflow>,
}

impl ExecutionRecord {
    /// A freshly accepted, running execution.
    pub fn new(
        id: ExecutionId,
        mode: ExecutionMode,
        workflow: Arc<Workflow>,
        data: RunExecutionData,
    ) -> Self {
        Self {
            id,
            mode,
            status: ExecutionStatus::Running,
            finished: false,
            started_at: Utc::now(),
            stopped_at: None,
            workflow_id: workflow.id,
            retry_of: None,
            retry_success_id: None,
            wait_till: None,
            data,
            workflow_data: workflow,
        }
    }

    pub fn state(&self) -> RecordState {
        if self.finished && self.stopped_at.is_some() {
            RecordState::Terminal
        } else if self.wait_till.is_some() {
            RecordState::Waiting
        } else {
            RecordState::Active
        }
    }

    /// Moves the record to its terminal state.
    pub fn finish(&mut self, status: ExecutionStatus, data: RunExecutionData) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished = true;
        self.stopped_at = Some(Utc::now());
        self.wait_till = None;
        self.data = data;
    }

    /// Parks the record until `wait_till`.
    pub fn park(&mut self, wait_till: DateTime<Utc>, data: RunExecutionData) {
        self.status = ExecutionStatus::Waiting;
        self.finished = false;
        self.stopped_at = None;
        self.wait_till = Some(wait_till);
        self.data = data;
    }

    pub fn failed(&self) -> bool {
        self.state() == RecordState::Terminal && self.status == ExecutionStatus::Error
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            finished: Some(self.finished),
            mode: self.mode,
            status: self.status,
            retry_of: self.retry_of,
            retry_success_id: self.retry_success_id,
            wait_till: self.wait_till,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            workflow_id: self.workflow_id,
            workflow_name: Some(self.workflow_data.name.clone()),
        }
    }
}

/// Outcome handed to completion waiters and pushed to UI sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub execution_id: ExecutionId,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
    pub data: RunExecutionData,
}

impl RunResult {
    pub fn error(&self) -> Option<&RunError> {
        self.data.result_data.error.as_ref()
    }
}

impl From<&ExecutionRecord> for RunResult {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id,
            mode: record.mode,
            status: record.status,
            finished: record.finished,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
            wait_till: record.wait_till,
            retry_of: record.retry_of,
            data: record.data.clone(),
        }
    }
}

/// Row of an execution listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_success_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_till: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionsListResponse {
    pub count: u64,
    pub results: Vec<ExecutionSummary>,
    pub estimated: bool,
}

/// Entry of the "currently running" listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentExecutionSummary {
    pub id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
    pub started_at: DateTime<Utc>,
    pub mode: ExecutionMode,
    pub workflow_id: WorkflowId,
}

/// How a submitter wants to be answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseMode {
    /// The caller waits for the run to finish, if at all.
    #[default]
    OnCompletion,
    /// The caller waits for the first response payload the run produces.
    FirstResponse,
}

/// Run request accepted from the HTTP or CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub execution_mode: ExecutionMode,
    pub workflow_data: Arc<Workflow>,
    #[serde(default)]
    pub run_data: Option<HashMap<String, Vec<TaskData>>>,
    #[serde(default)]
    pub pin_data: Option<PinData>,
    #[serde(default)]
    pub start_nodes: Option<Vec<String>>,
    #[serde(default)]
    pub destination_node: Option<String>,
    #[serde(default)]
    pub retry_of: Option<ExecutionId>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub response_mode: ResponseMode,
    /// Complete run data to continue from; set for retries.
    #[serde(default)]
    pub execution_data: Option<RunExecutionData>,
}

impl SubmitRequest {
    pub fn new(mode: ExecutionMode, workflow: Arc<Workflow>, user_id: impl Into<String>) -> Self {
        Self {
            execution_mode: mode,
            workflow_data: workflow,
            run_data: None,
            pin_data: None,
            start_nodes: None,
            destination_node: None,
            retry_of: None,
            session_id: None,
            user_id: user_id.into(),
            response_mode: ResponseMode::OnCompletion,
            execution_data: None,
        }
    }

    /// Run data the engine starts from.
    pub fn initial_data(&self) -> RunExecutionData {
        if let Some(data) = &self.execution_data {
            return data.clone();
        }
        let mut data = RunExecutionData::new();
        data.start_data.destination_node = self.destination_node.clone();
        data.start_data.run_node_filter = self.start_nodes.clone();
        if let Some(run_data) = &self.run_data {
            data.result_data.run_data = run_data.clone();
        }
        data.result_data.pin_data = self.pin_data.clone();
        data
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub execution_id: ExecutionId,
    pub waiting_for_webhook: bool,
}

/// First meaningful payload a run hands back to a webhook caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
}

impl WebhookResponse {
    pub fn json(data: serde_json::Value) -> Self {
        Self {
            data,
            headers: HashMap::new(),
            response_code: None,
        }
    }

    /// Fallback answer built from the run itself: the outputs of the last
    /// executed step, or the failure.
    pub fn from_run(result: &RunResult) -> Self {
        if let Some(error) = result.error() {
            return Self {
                data: serde_json::json!({ "message": error.message }),
                headers: HashMap::new(),
                response_code: Some(500),
            };
        }
        let data = result
            .data
            .result_data
            .last_node_executed
            .as_deref()
            .and_then(|node| result.data.completed_outputs(node))
            .map(|outputs| {
                serde_json::Value::Object(
                    outputs
                        .iter()
                        .map(|(port, value)| (port.clone(), value.to_plain_json()))
                        .collect(),
                )
            })
            .unwrap_or(serde_json::Value::Null);
        Self::json(data)
    }
}

/// Where a step hands its webhook response to.
pub trait ResponseSink: Send + Sync {
    /// Returns false when no waiter took the response.
    fn respond(&self, execution_id: ExecutionId, response: WebhookResponse) -> bool;
}

#[derive(Clone)]
pub struct ResponseSlot {
    execution_id: ExecutionId,
    sink: Option<Arc<dyn ResponseSink>>,
}

impl ResponseSlot {
    pub fn new(execution_id: ExecutionId, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            execution_id,
            sink: Some(sink),
        }
    }

    /// A slot that drops everything, for runs nobody waits on.
    pub fn detached(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            sink: None,
        }
    }

    pub fn send(&self, response: WebhookResponse) -> bool {
        match &self.sink {
            Some(sink) => sink.respond(self.execution_id, response),
            None => false,
        }
    }
}
