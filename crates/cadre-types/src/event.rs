use serde::{Deserialize, Serialize};

use crate::{
    AgentId, AgentRole, AgentStatus, CompletionReport, TaskId, TaskStatus, WorkspaceId,
};

/// Coordination event published on the workspace bus.
///
/// Every variant except `MessageReceived` is critical: it is retained in the
/// bounded replay log so late subscribers can reconstruct workspace state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentCreated {
        workspace_id: WorkspaceId,
        agent_id: AgentId,
        role: AgentRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<AgentId>,
    },
    AgentStatusChanged {
        workspace_id: WorkspaceId,
        agent_id: AgentId,
        role: AgentRole,
        status: AgentStatus,
    },
    TaskDelegated {
        workspace_id: WorkspaceId,
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskStatusChanged {
        workspace_id: WorkspaceId,
        task_id: TaskId,
        status: TaskStatus,
    },
    AgentCompleted {
        workspace_id: WorkspaceId,
        agent_id: AgentId,
        role: AgentRole,
        report: CompletionReport,
    },
    /// Ephemeral chatter (streamed chunks, parser warnings). Delivered live,
    /// never logged.
    MessageReceived {
        workspace_id: WorkspaceId,
        agent_id: AgentId,
        message: String,
    },
}

impl AgentEvent {
    /// Critical events survive in the replay log; ephemeral ones do not.
    pub fn is_critical(&self) -> bool {
        !matches!(self, AgentEvent::MessageReceived { .. })
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        match self {
            AgentEvent::AgentCreated { workspace_id, .. }
            | AgentEvent::AgentStatusChanged { workspace_id, .. }
            | AgentEvent::TaskDelegated { workspace_id, .. }
            | AgentEvent::TaskStatusChanged { workspace_id, .. }
            | AgentEvent::AgentCompleted { workspace_id, .. }
            | AgentEvent::MessageReceived { workspace_id, .. } => workspace_id,
        }
    }
}
