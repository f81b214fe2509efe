use serde::{Deserialize, Serialize};

use crate::{AgentId, TaskId};

/// Structured completion report produced by a worker when it finishes.
///
/// Workers that support tool calling submit this directly; for the rest it
/// is reconstructed from their final text output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub success: bool,
}

/// A tool invocation recorded on a conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Append-only conversation entry for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub agent_id: AgentId,
    pub index: u64,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}
