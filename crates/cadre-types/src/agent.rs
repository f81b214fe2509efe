use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, WorkspaceId};

/// Role an agent plays in the coordination loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Authors the task decomposition.
    Planner,
    /// Executes a single task end-to-end.
    Worker,
    /// Accepts or rejects a wave's output against acceptance criteria.
    Verifier,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Worker => "worker",
            AgentRole::Verifier => "verifier",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model tier requested for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    Smart,
    Fast,
}

/// Lifecycle status of an agent.
///
/// An agent reaches `Completed` or `Error` exactly once; both are terminal,
/// as is `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Completed,
    Error,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Error | AgentStatus::Cancelled
        )
    }
}

/// An agent owned by a workspace.
///
/// `parent_id` is a weak back-edge for lookup only; ownership is always by
/// workspace, and cascade deletion happens per workspace, never per parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub tier: AgentTier,
    pub workspace_id: WorkspaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, role: AgentRole, workspace_id: impl Into<WorkspaceId>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            name: name.into(),
            role,
            tier: AgentTier::Smart,
            workspace_id: workspace_id.into(),
            parent_id: None,
            status: AgentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: AgentId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_tier(mut self, tier: AgentTier) -> Self {
        self.tier = tier;
        self
    }
}
