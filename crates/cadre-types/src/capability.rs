use serde::{Deserialize, Serialize};

use crate::AgentRole;

/// Static capability matrix for one execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub name: String,
    pub supports_tool_calling: bool,
    pub supports_file_editing: bool,
    pub supports_terminal: bool,
    pub supports_streaming: bool,
    pub supports_interrupt: bool,
    pub supports_health_check: bool,
    /// Upper bound on concurrent requests the backend tolerates, counted
    /// across all roles.
    pub max_concurrent_agents: usize,
    /// Higher wins when several providers satisfy a role's requirements.
    pub priority: i32,
}

impl ProviderCapabilities {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supports_tool_calling: false,
            supports_file_editing: false,
            supports_terminal: false,
            supports_streaming: false,
            supports_interrupt: false,
            supports_health_check: false,
            max_concurrent_agents: 1,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent_agents: usize) -> Self {
        self.max_concurrent_agents = max_concurrent_agents;
        self
    }

    /// Union of two capability records: booleans OR, concurrency summed,
    /// priority maxed. Used for the router's synthetic record.
    pub fn union(&self, other: &ProviderCapabilities) -> ProviderCapabilities {
        ProviderCapabilities {
            name: self.name.clone(),
            supports_tool_calling: self.supports_tool_calling || other.supports_tool_calling,
            supports_file_editing: self.supports_file_editing || other.supports_file_editing,
            supports_terminal: self.supports_terminal || other.supports_terminal,
            supports_streaming: self.supports_streaming || other.supports_streaming,
            supports_interrupt: self.supports_interrupt || other.supports_interrupt,
            supports_health_check: self.supports_health_check || other.supports_health_check,
            max_concurrent_agents: self.max_concurrent_agents + other.max_concurrent_agents,
            priority: self.priority.max(other.priority),
        }
    }
}

/// Capabilities a role demands of its backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequirements {
    #[serde(default)]
    pub tool_calling: bool,
    #[serde(default)]
    pub file_editing: bool,
    #[serde(default)]
    pub terminal: bool,
}

impl RoleRequirements {
    /// Built-in requirement set for a role. Planners decompose via tool
    /// calls; workers edit files and run commands; verifiers only run
    /// verification commands.
    pub fn defaults_for(role: AgentRole) -> Self {
        match role {
            AgentRole::Planner => Self {
                tool_calling: true,
                file_editing: false,
                terminal: false,
            },
            AgentRole::Worker => Self {
                tool_calling: false,
                file_editing: true,
                terminal: true,
            },
            AgentRole::Verifier => Self {
                tool_calling: false,
                file_editing: false,
                terminal: true,
            },
        }
    }

    pub fn satisfied_by(&self, caps: &ProviderCapabilities) -> bool {
        (!self.tool_calling || caps.supports_tool_calling)
            && (!self.file_editing || caps.supports_file_editing)
            && (!self.terminal || caps.supports_terminal)
    }
}
