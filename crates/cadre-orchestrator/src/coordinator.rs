// Coordinator state machine
//
// Drives a workspace through planning, execution, and verification. Phase
// transitions are reactions to events observed on the bus, never direct
// calls from stages, which keeps the machine independent of stage ordering.
// The coordinator is the single writer of agent and task statuses.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cadre_core::{
    AgentStore, CadreError, ConversationStore, CoordinatorConfig, EventBus, ReportLedger, Result,
    TaskStore,
};
use cadre_types::{
    AgentEvent, AgentId, AgentRecord, AgentRole, AgentStatus, CompletionReport, TaskId,
    TaskStatus, TaskSummary, Verdict, WorkspaceId,
};

use crate::prompts::RolePrompts;
use crate::scheduler::TaskScheduler;
use crate::task_parser;

/// Coordination phase of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Planning,
    Ready,
    Executing,
    WaveComplete,
    Verifying,
    NeedsFix,
    Completed,
    Failed,
}

pub type PhaseObserver = Arc<dyn Fn(Phase) + Send + Sync>;

struct CoordinatorInner {
    workspace_id: WorkspaceId,
    config: CoordinatorConfig,
    agents: AgentStore,
    tasks: TaskStore,
    conversations: ConversationStore,
    reports: ReportLedger,
    /// Reports of the current wave, kept for the verifier prompt after the
    /// ledger entries are consumed.
    wave_reports: StdMutex<HashMap<TaskId, CompletionReport>>,
    bus: Arc<EventBus>,
    phase: StdRwLock<Phase>,
    phase_observer: StdRwLock<Option<PhaseObserver>>,
    request: StdRwLock<Option<String>>,
    planner_id: StdRwLock<Option<AgentId>>,
    /// Workers of the most recent `execute_next_wave` that have not yet
    /// reached a terminal status.
    wave: StdMutex<HashSet<AgentId>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        config: CoordinatorConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                workspace_id: workspace_id.into(),
                config,
                agents: AgentStore::new(),
                tasks: TaskStore::new(),
                conversations: ConversationStore::new(),
                reports: ReportLedger::new(),
                wave_reports: StdMutex::new(HashMap::new()),
                bus,
                phase: StdRwLock::new(Phase::Idle),
                phase_observer: StdRwLock::new(None),
                request: StdRwLock::new(None),
                planner_id: StdRwLock::new(None),
                wave: StdMutex::new(HashSet::new()),
                listener: StdMutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.inner.workspace_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn agents(&self) -> &AgentStore {
        &self.inner.agents
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.inner.conversations
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_phase_observer(&self, observer: PhaseObserver) {
        *self
            .inner
            .phase_observer
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// The request this workspace is coordinating; feeds the planner prompt.
    pub fn set_request(&self, request: impl Into<String>) {
        *self.inner.request.write().unwrap_or_else(|e| e.into_inner()) = Some(request.into());
    }

    pub fn planner_id(&self) -> Option<AgentId> {
        self.inner
            .planner_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Create the Planner agent, subscribe to the bus, and return the
    /// planner's id.
    pub fn initialize(&self) -> Result<AgentId> {
        {
            let mut listener = self
                .inner
                .listener
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if listener.is_none() {
                let inner = self.inner.clone();
                *listener = Some(tokio::spawn(listen(inner)));
            }
        }

        let planner = self.inner.agents.save(AgentRecord::new(
            "planner",
            AgentRole::Planner,
            self.inner.workspace_id.clone(),
        ));
        *self
            .inner
            .planner_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(planner.id.clone());

        self.inner.bus.emit(AgentEvent::AgentCreated {
            workspace_id: self.inner.workspace_id.clone(),
            agent_id: planner.id.clone(),
            role: AgentRole::Planner,
            parent_id: None,
        });

        Ok(planner.id)
    }

    /// Parse planner output into tasks, save them, and announce each one.
    /// Malformed blocks are skipped with a warning event; an empty list is a
    /// valid "no actionable work" outcome.
    pub fn register_tasks(&self, plan_text: &str) -> Result<Vec<TaskId>> {
        let mut plan = task_parser::parse_task_blocks(&self.inner.workspace_id, plan_text);
        plan.warnings
            .extend(TaskScheduler::sanitize(&mut plan.tasks));

        for warning in &plan.warnings {
            self.inner.bus.emit(AgentEvent::MessageReceived {
                workspace_id: self.inner.workspace_id.clone(),
                agent_id: self.planner_id().unwrap_or_default(),
                message: format!("plan warning: {}", warning),
            });
        }

        let mut ids = Vec::with_capacity(plan.tasks.len());
        for task in plan.tasks {
            let saved = self.inner.tasks.save(task);
            self.inner.bus.emit(AgentEvent::TaskStatusChanged {
                workspace_id: self.inner.workspace_id.clone(),
                task_id: saved.id.clone(),
                status: TaskStatus::Pending,
            });
            ids.push(saved.id);
        }
        Ok(ids)
    }

    /// Snapshot the ready set and spawn one Worker per ready task. Tasks
    /// that become ready mid-wave wait for the next wave.
    pub fn execute_next_wave(&self) -> Vec<(AgentId, TaskId)> {
        let ready = self.inner.tasks.find_ready_tasks(&self.inner.workspace_id);
        if ready.is_empty() {
            return Vec::new();
        }

        let parent = self.planner_id();
        let mut pairs = Vec::with_capacity(ready.len());

        for task in ready {
            let mut worker = AgentRecord::new(
                format!("worker-{}", short_id(&task.id)),
                AgentRole::Worker,
                self.inner.workspace_id.clone(),
            );
            if let Some(parent) = &parent {
                worker = worker.with_parent(parent.clone());
            }
            let worker = self.inner.agents.save(worker);

            {
                let mut wave = self.inner.wave.lock().unwrap_or_else(|e| e.into_inner());
                wave.insert(worker.id.clone());
            }

            self.inner.bus.emit(AgentEvent::AgentCreated {
                workspace_id: self.inner.workspace_id.clone(),
                agent_id: worker.id.clone(),
                role: AgentRole::Worker,
                parent_id: worker.parent_id.clone(),
            });

            let mut task = task;
            task.assigned_to = Some(worker.id.clone());
            task.status = TaskStatus::InProgress;
            task.verdict = None;
            let task = self.inner.tasks.save(task);

            self.inner.bus.emit(AgentEvent::TaskDelegated {
                workspace_id: self.inner.workspace_id.clone(),
                task_id: task.id.clone(),
                agent_id: worker.id.clone(),
            });
            self.inner.bus.emit(AgentEvent::TaskStatusChanged {
                workspace_id: self.inner.workspace_id.clone(),
                task_id: task.id.clone(),
                status: TaskStatus::InProgress,
            });

            pairs.push((worker.id, task.id));
        }

        tracing::info!(
            "wave of {} workers dispatched in workspace {}",
            pairs.len(),
            self.inner.workspace_id
        );
        pairs
    }

    /// Create one Verifier for the tasks awaiting review, or `None` when
    /// nothing needs verification.
    pub fn start_verification(&self) -> Option<AgentId> {
        let review = self
            .inner
            .tasks
            .list_by_status(&self.inner.workspace_id, TaskStatus::ReviewRequired);
        if review.is_empty() {
            return None;
        }

        let verifier = self.inner.agents.save(AgentRecord::new(
            "verifier",
            AgentRole::Verifier,
            self.inner.workspace_id.clone(),
        ));
        self.inner.bus.emit(AgentEvent::AgentCreated {
            workspace_id: self.inner.workspace_id.clone(),
            agent_id: verifier.id.clone(),
            role: AgentRole::Verifier,
            parent_id: None,
        });
        Some(verifier.id)
    }

    /// Assemble the role-specific prompt for an agent, or `None` when the
    /// agent has nothing to act on.
    pub fn build_agent_context(&self, agent_id: &str) -> Option<String> {
        let agent = self.inner.agents.get(agent_id)?;
        match agent.role {
            AgentRole::Planner => {
                let request = self
                    .inner
                    .request
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()?;
                Some(RolePrompts::planner(&request))
            }
            AgentRole::Worker => {
                let task = self.inner.tasks.list_by_assignee(agent_id).pop()?;
                let tail = self.inner.conversations.tail(agent_id, 3);
                Some(RolePrompts::worker(&task, &tail))
            }
            AgentRole::Verifier => {
                let review = self
                    .inner
                    .tasks
                    .list_by_status(&self.inner.workspace_id, TaskStatus::ReviewRequired);
                if review.is_empty() {
                    return None;
                }
                let reports = self
                    .inner
                    .wave_reports
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let pairs: Vec<_> = review
                    .into_iter()
                    .map(|task| {
                        let report = reports.get(&task.id).cloned();
                        (task, report)
                    })
                    .collect();
                Some(RolePrompts::verifier(&pairs))
            }
        }
    }

    pub fn task_summary(&self) -> TaskSummary {
        TaskSummary::from_tasks(&self.inner.tasks.list_by_workspace(&self.inner.workspace_id))
    }

    /// Record a structured completion report (the tool-call path).
    pub fn record_report(&self, report: CompletionReport) {
        self.inner.reports.record(report);
    }

    /// Consume the recorded report for a task, if a structured one arrived.
    pub fn take_report(&self, task_id: &str) -> Option<CompletionReport> {
        self.inner.reports.take(task_id)
    }

    pub fn wave_report(&self, task_id: &str) -> Option<CompletionReport> {
        self.inner
            .wave_reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    pub fn mark_agent_active(&self, agent_id: &str) -> Result<()> {
        self.set_agent_status(agent_id, AgentStatus::Active)
    }

    /// Terminal success for a non-worker agent.
    pub fn mark_agent_completed(&self, agent_id: &str) -> Result<()> {
        self.set_agent_status(agent_id, AgentStatus::Completed)
    }

    pub fn mark_agent_cancelled(&self, agent_id: &str) -> Result<()> {
        self.set_agent_status(agent_id, AgentStatus::Cancelled)
    }

    /// Worker success path: task moves to review, agent completes, the
    /// report is published.
    pub fn complete_worker(&self, agent_id: &str, task_id: &str, report: CompletionReport) -> Result<()> {
        {
            let mut reports = self
                .inner
                .wave_reports
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            reports.insert(task_id.to_string(), report.clone());
        }

        self.update_task_status(task_id, TaskStatus::ReviewRequired, None)?;
        self.set_agent_status(agent_id, AgentStatus::Completed)?;
        self.inner.bus.emit(AgentEvent::AgentCompleted {
            workspace_id: self.inner.workspace_id.clone(),
            agent_id: agent_id.to_string(),
            role: AgentRole::Worker,
            report,
        });
        Ok(())
    }

    /// Worker crash path: the task is excluded from the wave's review
    /// rather than failing the wave.
    pub fn fail_worker(&self, agent_id: &str, task_id: &str, reason: &str) -> Result<()> {
        tracing::warn!(
            "worker {} failed on task {}: {}",
            agent_id,
            task_id,
            reason
        );
        self.update_task_status(task_id, TaskStatus::Blocked, None)?;
        self.set_agent_status(agent_id, AgentStatus::Error)?;
        self.inner.bus.emit(AgentEvent::MessageReceived {
            workspace_id: self.inner.workspace_id.clone(),
            agent_id: agent_id.to_string(),
            message: format!("worker error: {}", reason),
        });

        // Dependents that can no longer become ready are blocked too.
        loop {
            let tasks = self.inner.tasks.list_by_workspace(&self.inner.workspace_id);
            let dependents = TaskScheduler::blocked_by_dead_deps(&tasks);
            if dependents.is_empty() {
                break;
            }
            for dependent in dependents {
                self.update_task_status(&dependent, TaskStatus::Blocked, None)?;
            }
        }
        Ok(())
    }

    /// Verifier terminal path; the report summarizes the wave's verdicts.
    pub fn complete_verifier(&self, agent_id: &str, report: CompletionReport) -> Result<()> {
        self.set_agent_status(agent_id, AgentStatus::Completed)?;
        self.inner.bus.emit(AgentEvent::AgentCompleted {
            workspace_id: self.inner.workspace_id.clone(),
            agent_id: agent_id.to_string(),
            role: AgentRole::Verifier,
            report,
        });
        Ok(())
    }

    pub fn mark_agent_error(&self, agent_id: &str) -> Result<()> {
        self.set_agent_status(agent_id, AgentStatus::Error)
    }

    /// Single-writer task status update; clears the verdict whenever the
    /// new status cannot carry one.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        verdict: Option<Verdict>,
    ) -> Result<()> {
        let mut task = self
            .inner
            .tasks
            .get(task_id)
            .ok_or_else(|| CadreError::NotFound(format!("task {}", task_id)))?;
        task.status = status;
        task.verdict = match status {
            TaskStatus::Completed | TaskStatus::NeedsFix => verdict.or(task.verdict),
            _ => None,
        };
        if status == TaskStatus::Pending {
            task.assigned_to = None;
        }
        self.inner.tasks.save(task);

        self.inner.bus.emit(AgentEvent::TaskStatusChanged {
            workspace_id: self.inner.workspace_id.clone(),
            task_id: task_id.to_string(),
            status,
        });
        Ok(())
    }

    fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut agent = self
            .inner
            .agents
            .get(agent_id)
            .ok_or_else(|| CadreError::NotFound(format!("agent {}", agent_id)))?;
        if agent.status.is_terminal() && agent.status != status {
            return Err(CadreError::Invariant(format!(
                "agent {} already terminal ({:?})",
                agent_id, agent.status
            )));
        }
        agent.status = status;
        let agent = self.inner.agents.save(agent);

        self.inner.bus.emit(AgentEvent::AgentStatusChanged {
            workspace_id: self.inner.workspace_id.clone(),
            agent_id: agent.id,
            role: agent.role,
            status,
        });
        Ok(())
    }

    /// Discard every entity of this workspace and return to `Idle`.
    pub fn reset(&self) {
        let agent_ids: Vec<AgentId> = self
            .inner
            .agents
            .list_by_workspace(&self.inner.workspace_id)
            .into_iter()
            .map(|a| a.id)
            .collect();
        self.inner.conversations.clear_agents(&agent_ids);
        self.inner.agents.clear_workspace(&self.inner.workspace_id);
        self.inner.tasks.clear_workspace(&self.inner.workspace_id);
        self.inner.reports.clear();
        self.inner
            .wave_reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner
            .wave
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self
            .inner
            .planner_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
        set_phase(&self.inner, Phase::Idle);
    }

    /// Stop the bus listener. Idempotent.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    pub fn mark_failed(&self) {
        set_phase(&self.inner, Phase::Failed);
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn set_phase(inner: &Arc<CoordinatorInner>, phase: Phase) {
    {
        let mut current = inner.phase.write().unwrap_or_else(|e| e.into_inner());
        if *current == phase {
            return;
        }
        tracing::debug!(
            "workspace {} phase {:?} -> {:?}",
            inner.workspace_id,
            *current,
            phase
        );
        *current = phase;
    }
    let observer = inner
        .phase_observer
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(observer) = observer {
        observer(phase);
    }
}

async fn listen(inner: Arc<CoordinatorInner>) {
    let mut sub = inner.bus.subscribe();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = sub.recv() => {
                let Some(event) = event else { break };
                if event.event.workspace_id() != &inner.workspace_id {
                    continue;
                }
                react(&inner, &event.event);
            }
        }
    }
}

fn react(inner: &Arc<CoordinatorInner>, event: &AgentEvent) {
    match event {
        AgentEvent::AgentStatusChanged {
            role: AgentRole::Planner,
            status: AgentStatus::Active,
            ..
        } => set_phase(inner, Phase::Planning),

        AgentEvent::TaskStatusChanged {
            status: TaskStatus::Pending,
            ..
        } => {
            let phase = *inner.phase.read().unwrap_or_else(|e| e.into_inner());
            if matches!(phase, Phase::Planning | Phase::NeedsFix | Phase::Verifying) {
                set_phase(inner, Phase::Ready);
            }
        }

        AgentEvent::TaskDelegated { .. } => set_phase(inner, Phase::Executing),

        AgentEvent::AgentCreated {
            role: AgentRole::Verifier,
            ..
        } => set_phase(inner, Phase::Verifying),

        AgentEvent::AgentCompleted {
            role: AgentRole::Worker,
            agent_id,
            ..
        } => worker_terminal(inner, agent_id),

        AgentEvent::AgentStatusChanged {
            role: AgentRole::Worker,
            agent_id,
            status: AgentStatus::Error | AgentStatus::Cancelled,
            ..
        } => worker_terminal(inner, agent_id),

        AgentEvent::AgentCompleted {
            role: AgentRole::Verifier,
            ..
        } => {
            let tasks = inner.tasks.list_by_workspace(&inner.workspace_id);
            if tasks.iter().any(|t| t.status == TaskStatus::NeedsFix) {
                set_phase(inner, Phase::NeedsFix);
            } else if !inner.tasks.find_ready_tasks(&inner.workspace_id).is_empty() {
                set_phase(inner, Phase::Ready);
            } else {
                set_phase(inner, Phase::Completed);
            }
        }

        AgentEvent::TaskStatusChanged {
            status: TaskStatus::Cancelled,
            ..
        } => {
            let tasks = inner.tasks.list_by_workspace(&inner.workspace_id);
            let all_settled = tasks
                .iter()
                .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled));
            if all_settled {
                set_phase(inner, Phase::Completed);
            }
        }

        _ => {}
    }
}

fn worker_terminal(inner: &Arc<CoordinatorInner>, agent_id: &str) {
    let wave_empty = {
        let mut wave = inner.wave.lock().unwrap_or_else(|e| e.into_inner());
        wave.remove(agent_id);
        wave.is_empty()
    };
    let phase = *inner.phase.read().unwrap_or_else(|e| e.into_inner());
    if wave_empty && phase == Phase::Executing {
        set_phase(inner, Phase::WaveComplete);
    }
}
