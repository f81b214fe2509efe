// In-memory entity stores
//
// Saves are atomic per record (one map insert under the store's lock); there
// are no cross-store transactions. Status consistency comes from the
// coordinator being the single writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use cadre_types::{
    AgentId, AgentRecord, AgentStatus, CompletionReport, ConversationTurn, TaskId, TaskRecord,
    TaskStatus, ToolCallRecord,
};

/// Store of agents, keyed by id.
#[derive(Clone, Default)]
pub struct AgentStore {
    inner: Arc<RwLock<HashMap<AgentId, AgentRecord>>>,
}

impl AgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Insert or update; `updated_at` is stamped on every save.
    pub fn save(&self, mut record: AgentRecord) -> AgentRecord {
        record.updated_at = Utc::now();
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record.clone());
        record
    }

    pub fn list_by_workspace(&self, workspace_id: &str) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|a| a.workspace_id == workspace_id)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        agents
    }

    pub fn list_by_status(&self, workspace_id: &str, status: AgentStatus) -> Vec<AgentRecord> {
        self.list_by_workspace(workspace_id)
            .into_iter()
            .filter(|a| a.status == status)
            .collect()
    }

    pub fn clear_workspace(&self, workspace_id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, a| a.workspace_id != workspace_id);
    }
}

/// Store of tasks, keyed by id.
#[derive(Clone, Default)]
pub struct TaskStore {
    inner: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn save(&self, mut record: TaskRecord) -> TaskRecord {
        record.updated_at = Utc::now();
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record.clone());
        record
    }

    pub fn list_by_workspace(&self, workspace_id: &str) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.workspace_id == workspace_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn list_by_status(&self, workspace_id: &str, status: TaskStatus) -> Vec<TaskRecord> {
        self.list_by_workspace(workspace_id)
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    pub fn list_by_assignee(&self, agent_id: &str) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.assigned_to.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Tasks that are `Pending` with every dependency `Completed`.
    pub fn find_ready_tasks(&self, workspace_id: &str) -> Vec<TaskRecord> {
        let tasks = self.list_by_workspace(workspace_id);
        let completed: std::collections::HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.depends_on.iter().all(|d| completed.contains(d.as_str()))
            })
            .cloned()
            .collect()
    }

    pub fn clear_workspace(&self, workspace_id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| t.workspace_id != workspace_id);
    }
}

/// Append-only conversation transcripts, keyed by agent.
#[derive(Clone, Default)]
pub struct ConversationStore {
    inner: Arc<RwLock<HashMap<AgentId, Vec<ConversationTurn>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn; the index is assigned monotonically per agent.
    pub fn append(
        &self,
        agent_id: &str,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) -> ConversationTurn {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let turns = inner.entry(agent_id.to_string()).or_default();
        let turn = ConversationTurn {
            agent_id: agent_id.to_string(),
            index: turns.len() as u64,
            content: content.into(),
            tool_calls,
        };
        turns.push(turn.clone());
        turn
    }

    pub fn turns(&self, agent_id: &str) -> Vec<ConversationTurn> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The last `n` turns, oldest first.
    pub fn tail(&self, agent_id: &str, n: usize) -> Vec<ConversationTurn> {
        let turns = self.turns(agent_id);
        let skip = turns.len().saturating_sub(n);
        turns.into_iter().skip(skip).collect()
    }

    pub fn clear_agents(&self, agent_ids: &[AgentId]) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for id in agent_ids {
            inner.remove(id);
        }
    }
}

/// Structured completion reports recorded by worker tool calls, keyed by
/// task. Checked before any text parsing: structured results take
/// precedence.
#[derive(Clone, Default)]
pub struct ReportLedger {
    inner: Arc<RwLock<HashMap<TaskId, CompletionReport>>>,
}

impl ReportLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: CompletionReport) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(report.task_id.clone(), report);
    }

    pub fn take(&self, task_id: &str) -> Option<CompletionReport> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
