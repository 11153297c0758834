use super::{ConsoleMessage, NodeExecuteAfter, NodeExecuteBefore, PushBus, PushMessage};
use crate::{ExecutionId, TaskData};

/// Push sender bound to one execution.
///
/// Messages go to the session that started the execution, or to everyone
/// when there is no session.
#[derive(Clone)]
pub struct PushEmitter {
    execution_id: ExecutionId,
    session_id: Option<String>,
    bus: PushBus,
}

impl PushEmitter {
    pub fn new(execution_id: ExecutionId, session_id: Option<String>, bus: PushBus) -> Self {
        Self {
            execution_id,
            session_id,
            bus,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn send(&self, message: PushMessage) {
        match &self.session_id {
            Some(session) => self.bus.publish_to(session, message),
            None => self.bus.publish(message),
        }
    }

    pub fn node_before(&self, node_name: &str) {
        self.send(PushMessage::NodeExecuteBefore(NodeExecuteBefore {
            execution_id: self.execution_id,
            node_name: node_name.to_string(),
        }));
    }

    pub fn node_after(&self, node_name: &str, task: TaskData) {
        self.send(PushMessage::NodeExecuteAfter(NodeExecuteAfter {
            execution_id: self.execution_id,
            node_name: node_name.to_string(),
            data: task,
        }));
    }

    /// Console output from a step, shown in the UI's browser console.
    pub fn console(&self, source: impl Into<String>, message: impl Into<String>) {
        self.send(PushMessage::SendConsoleMessage(ConsoleMessage {
            source: source.into(),
            message: message.into(),
        }));
    }
}
