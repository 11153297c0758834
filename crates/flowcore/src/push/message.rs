use crate::{ExecutionId, ExecutionMode, RunResult, TaskData, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress notification for live subscribers.
///
/// Serialized as `{"type": ..., "data": ...}`. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum PushMessage {
    ExecutionStarted(ExecutionStarted),
    ExecutionFinished(ExecutionFinished),
    NodeExecuteBefore(NodeExecuteBefore),
    NodeExecuteAfter(NodeExecuteAfter),
    SendConsoleMessage(ConsoleMessage),
    ReloadNodeType(NodeTypeChange),
    RemoveNodeType(NodeTypeChange),
    TestWebhookReceived(TestWebhook),
    TestWebhookDeleted(TestWebhook),
}

impl PushMessage {
    /// Execution this message belongs to, for consumers that filter.
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            Self::ExecutionStarted(m) => Some(m.execution_id),
            Self::ExecutionFinished(m) => Some(m.execution_id),
            Self::NodeExecuteBefore(m) => Some(m.execution_id),
            Self::NodeExecuteAfter(m) => Some(m.execution_id),
            Self::TestWebhookReceived(m) | Self::TestWebhookDeleted(m) => Some(m.execution_id),
            Self::SendConsoleMessage(_) | Self::ReloadNodeType(_) | Self::RemoveNodeType(_) => {
                None
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStarted(_) => "executionStarted",
            Self::ExecutionFinished(_) => "executionFinished",
            Self::NodeExecuteBefore(_) => "nodeExecuteBefore",
            Self::NodeExecuteAfter(_) => "nodeExecuteAfter",
            Self::SendConsoleMessage(_) => "sendConsoleMessage",
            Self::ReloadNodeType(_) => "reloadNodeType",
            Self::RemoveNodeType(_) => "removeNodeType",
            Self::TestWebhookReceived(_) => "testWebhookReceived",
            Self::TestWebhookDeleted(_) => "testWebhookDeleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStarted {
    pub execution_id: ExecutionId,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFinished {
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
    pub data: RunResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecuteBefore {
    pub execution_id: ExecutionId,
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecuteAfter {
    pub execution_id: ExecutionId,
    pub node_name: String,
    pub data: TaskData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeChange {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestWebhook {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
}
