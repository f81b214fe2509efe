use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, TaskId, WorkspaceId};

/// State of a task in the coordination loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up by a wave (or for dependencies).
    Pending,
    /// A worker is executing it.
    InProgress,
    /// Worker finished; awaiting a verifier verdict.
    ReviewRequired,
    /// Approved by the verifier (or completed without verification).
    Completed,
    /// Rejected by the verifier; will be reset for another wave.
    NeedsFix,
    /// Its worker died; excluded from further waves.
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Blocked | TaskStatus::Cancelled
        )
    }
}

/// Verifier verdict for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    NotApproved,
}

/// A unit of work produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    /// Tasks that must be `Completed` before this one is ready.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    pub workspace_id: WorkspaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
    pub status: TaskStatus,
    /// Non-null only while status is `Completed` or `NeedsFix`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        title: impl Into<String>,
        objective: impl Into<String>,
        workspace_id: impl Into<WorkspaceId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            title: title.into(),
            objective: objective.into(),
            scope: Vec::new(),
            acceptance_criteria: Vec::new(),
            verification_commands: Vec::new(),
            depends_on: Vec::new(),
            workspace_id: workspace_id.into(),
            assigned_to: None,
            status: TaskStatus::Pending,
            verdict: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row of the observer-facing task snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummaryRow {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub verdict: Option<Verdict>,
    pub assigned_to: Option<AgentId>,
}

/// Snapshot of all tasks in a workspace, retrievable even after a failed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub review_required: usize,
    pub completed: usize,
    pub needs_fix: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub rows: Vec<TaskSummaryRow>,
}

impl TaskSummary {
    pub fn from_tasks(tasks: &[TaskRecord]) -> Self {
        let mut summary = TaskSummary {
            total: tasks.len(),
            ..TaskSummary::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::ReviewRequired => summary.review_required += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::NeedsFix => summary.needs_fix += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
            summary.rows.push(TaskSummaryRow {
                task_id: task.id.clone(),
                title: task.title.clone(),
                status: task.status,
                verdict: task.verdict,
                assigned_to: task.assigned_to.clone(),
            });
        }
        summary
    }
}
