// Pipeline stages
//
// Planning, TaskRegistration, WorkerExecution, Verification. Provider
// errors become `Failed`; a "no tasks" parse is success-with-empty; a
// single crashed worker blocks its task without failing the wave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cadre_core::{CadreError, EventBus, Result};
use cadre_providers::ProviderRouter;
use cadre_types::{
    AgentEvent, AgentId, AgentRole, CompletionReport, StreamChunk, TaskId, TaskStatus, Verdict,
};

use crate::coordinator::Coordinator;
use crate::pipeline::{
    PipelineVerdict, Stage, StageContext, StageResult, StreamObserver, VerdictRecord,
};
use crate::report_parser;

async fn with_role_timeout<T>(
    role: AgentRole,
    duration: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(CadreError::Timeout(format!(
            "{} call exceeded {:?}",
            role, duration
        ))),
    }
}

/// Ask the Planner backend to decompose the request. Skipped on repeat
/// iterations: the plan is already in the context.
pub struct PlanningStage;

#[async_trait]
impl Stage for PlanningStage {
    fn name(&self) -> &'static str {
        "planning"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        if ctx.plan_output.is_some() {
            return StageResult::Continue;
        }

        let planner_id = ctx.planner_id.clone();
        if let Err(e) = ctx.coordinator.mark_agent_active(&planner_id) {
            return StageResult::Failed(e.to_string());
        }
        let Some(prompt) = ctx.coordinator.build_agent_context(&planner_id) else {
            return StageResult::Failed("planner context unavailable".to_string());
        };

        let timeout = ctx.config.role_timeouts.planner;
        match with_role_timeout(
            AgentRole::Planner,
            timeout,
            ctx.router.run(AgentRole::Planner, &planner_id, &prompt),
        )
        .await
        {
            Ok(text) => {
                ctx.coordinator
                    .conversations()
                    .append(&planner_id, text.clone(), Vec::new());
                if let Err(e) = ctx.coordinator.mark_agent_completed(&planner_id) {
                    return StageResult::Failed(e.to_string());
                }
                ctx.plan_output = Some(text);
                StageResult::Continue
            }
            Err(e) => {
                let _ = ctx.coordinator.mark_agent_error(&planner_id);
                StageResult::Failed(format!("planning failed: {}", e))
            }
        }
    }
}

/// Turn the plan text into task records. An empty parse ends the run as
/// `NoTasks`; repeat iterations keep the already-registered tasks.
pub struct TaskRegistrationStage;

#[async_trait]
impl Stage for TaskRegistrationStage {
    fn name(&self) -> &'static str {
        "task_registration"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        if !ctx.task_ids.is_empty() {
            return StageResult::Continue;
        }

        let plan = ctx.plan_output.clone().unwrap_or_default();
        match ctx.coordinator.register_tasks(&plan) {
            Ok(ids) if ids.is_empty() => StageResult::Done(PipelineVerdict::NoTasks(plan)),
            Ok(ids) => {
                ctx.task_ids = ids;
                StageResult::Continue
            }
            Err(e) => StageResult::Failed(e.to_string()),
        }
    }
}

/// Run waves of workers until no task is ready. Concurrency is bounded by
/// the provider pool's summed `max_concurrent_agents`; each provider's own
/// permit pool additionally caps its share.
pub struct WorkerExecutionStage;

#[async_trait]
impl Stage for WorkerExecutionStage {
    fn name(&self) -> &'static str {
        "worker_execution"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        loop {
            if ctx.cancel.is_cancelled() {
                return StageResult::Failed("cancelled".to_string());
            }

            // Fail before any worker agent exists when no backend can take
            // the role at all.
            let workspace_id = ctx.coordinator.workspace_id().to_string();
            if !ctx
                .coordinator
                .tasks()
                .find_ready_tasks(&workspace_id)
                .is_empty()
            {
                if let Err(e) = ctx.router.select(AgentRole::Worker) {
                    return StageResult::Failed(e.to_string());
                }
            }

            let wave = ctx.coordinator.execute_next_wave();
            if wave.is_empty() {
                return StageResult::Continue;
            }

            let limit = ctx.router.capabilities().max_concurrent_agents.max(1);
            let gate = Arc::new(Semaphore::new(limit));
            let mut join_set: JoinSet<()> = JoinSet::new();

            for (agent_id, task_id) in wave {
                let gate = gate.clone();
                let worker = WorkerRun {
                    coordinator: ctx.coordinator.clone(),
                    router: ctx.router.clone(),
                    bus: ctx.bus.clone(),
                    observer: ctx.stream_observer.clone(),
                    timeout: ctx.config.role_timeouts.worker,
                    cancel: ctx.cancel.clone(),
                };
                join_set.spawn(async move {
                    let Ok(_permit) = gate.acquire_owned().await else {
                        return;
                    };
                    worker.run(agent_id, task_id).await;
                });
            }

            // Wave semantics: wait for every spawned worker to terminate
            // before considering the next ready set.
            while join_set.join_next().await.is_some() {}
        }
    }
}

struct WorkerRun {
    coordinator: Coordinator,
    router: Arc<ProviderRouter>,
    bus: Arc<EventBus>,
    observer: Option<StreamObserver>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl WorkerRun {
    async fn run(&self, agent_id: AgentId, task_id: TaskId) {
        if let Err(e) = self.coordinator.mark_agent_active(&agent_id) {
            tracing::warn!("worker {} could not activate: {}", agent_id, e);
            return;
        }
        let Some(prompt) = self.coordinator.build_agent_context(&agent_id) else {
            let _ = self
                .coordinator
                .fail_worker(&agent_id, &task_id, "worker context unavailable");
            return;
        };

        let workspace_id = self.coordinator.workspace_id().to_string();
        let on_chunk = {
            let bus = self.bus.clone();
            let observer = self.observer.clone();
            let agent_id = agent_id.clone();
            move |chunk: StreamChunk| {
                let text = chunk.text();
                if let Some(observer) = &observer {
                    observer(&agent_id, text);
                }
                bus.try_emit(AgentEvent::MessageReceived {
                    workspace_id: workspace_id.clone(),
                    agent_id: agent_id.clone(),
                    message: text.to_string(),
                });
            }
        };

        let call = self
            .router
            .run_streaming(AgentRole::Worker, &agent_id, &prompt, &on_chunk);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = self.router.interrupt(AgentRole::Worker, &agent_id).await;
                let _ = self.coordinator.mark_agent_cancelled(&agent_id);
                let _ = self
                    .coordinator
                    .update_task_status(&task_id, TaskStatus::Cancelled, None);
                return;
            }
            outcome = tokio::time::timeout(self.timeout, call) => outcome,
        };

        match outcome {
            Ok(Ok(text)) => {
                self.coordinator
                    .conversations()
                    .append(&agent_id, text.clone(), Vec::new());
                // Structured results take precedence; text parsing is the
                // fallback.
                let report = self.coordinator.take_report(&task_id).unwrap_or_else(|| {
                    report_parser::parse_worker_report(&agent_id, &task_id, &text)
                });
                if let Err(e) = self.coordinator.complete_worker(&agent_id, &task_id, report) {
                    tracing::warn!("worker {} completion not recorded: {}", agent_id, e);
                }
            }
            Ok(Err(e)) => {
                let _ = self
                    .coordinator
                    .fail_worker(&agent_id, &task_id, &e.to_string());
            }
            Err(_) => {
                let _ = self.router.interrupt(AgentRole::Worker, &agent_id).await;
                let _ = self.coordinator.fail_worker(
                    &agent_id,
                    &task_id,
                    &format!("worker timed out after {:?}", self.timeout),
                );
            }
        }
    }
}

/// Batched review of everything awaiting verification. Rejected tasks are
/// reset to `Pending` and the pipeline repeats; a clean review (or more
/// ready dependency work) decides between `Continue` and another pass.
pub struct VerificationStage;

#[async_trait]
impl Stage for VerificationStage {
    fn name(&self) -> &'static str {
        "verification"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageResult {
        let workspace_id = ctx.coordinator.workspace_id().to_string();
        let review = ctx
            .coordinator
            .tasks()
            .list_by_status(&workspace_id, TaskStatus::ReviewRequired);
        if review.is_empty() {
            return StageResult::Continue;
        }

        if let Err(e) = ctx.router.select(AgentRole::Verifier) {
            return StageResult::Failed(e.to_string());
        }

        let Some(verifier_id) = ctx.coordinator.start_verification() else {
            return StageResult::Continue;
        };
        if let Err(e) = ctx.coordinator.mark_agent_active(&verifier_id) {
            return StageResult::Failed(e.to_string());
        }
        let Some(prompt) = ctx.coordinator.build_agent_context(&verifier_id) else {
            return StageResult::Failed("verifier context unavailable".to_string());
        };

        let timeout = ctx.config.role_timeouts.verifier;
        let text = match with_role_timeout(
            AgentRole::Verifier,
            timeout,
            ctx.router.run(AgentRole::Verifier, &verifier_id, &prompt),
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                let _ = ctx.coordinator.mark_agent_error(&verifier_id);
                return StageResult::Failed(format!("verification failed: {}", e));
            }
        };
        ctx.coordinator
            .conversations()
            .append(&verifier_id, text.clone(), Vec::new());

        let verdicts = report_parser::parse_verifier_verdicts(&text, &review);
        let mut rejected: Vec<TaskId> = Vec::new();

        for task in &review {
            let verdict = verdicts
                .get(&task.id)
                .map(|(verdict, _)| *verdict)
                .unwrap_or(Verdict::NotApproved);
            ctx.verdict_history.push(VerdictRecord {
                iteration: ctx.iteration,
                task_id: task.id.clone(),
                verdict,
            });

            let (status, verdict) = match verdict {
                Verdict::Approved => (TaskStatus::Completed, Verdict::Approved),
                Verdict::NotApproved => {
                    rejected.push(task.id.clone());
                    (TaskStatus::NeedsFix, Verdict::NotApproved)
                }
            };
            if let Err(e) = ctx
                .coordinator
                .update_task_status(&task.id, status, Some(verdict))
            {
                return StageResult::Failed(e.to_string());
            }
        }

        let report = CompletionReport {
            agent_id: verifier_id.clone(),
            task_id: review[0].id.clone(),
            summary: format!(
                "{} approved, {} rejected",
                review.len() - rejected.len(),
                rejected.len()
            ),
            files_modified: Vec::new(),
            success: rejected.is_empty(),
        };
        if let Err(e) = ctx.coordinator.complete_verifier(&verifier_id, report) {
            return StageResult::Failed(e.to_string());
        }

        if !rejected.is_empty() {
            // Rejected tasks go back into the pool for the next wave.
            for task_id in &rejected {
                if let Err(e) = ctx
                    .coordinator
                    .update_task_status(task_id, TaskStatus::Pending, None)
                {
                    return StageResult::Failed(e.to_string());
                }
            }
            return StageResult::RepeatPipeline;
        }

        // Approvals may have unlocked dependency work.
        if !ctx
            .coordinator
            .tasks()
            .find_ready_tasks(&workspace_id)
            .is_empty()
        {
            return StageResult::RepeatPipeline;
        }

        StageResult::Continue
    }
}

/// The standard stage list.
pub fn default_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(PlanningStage),
        Arc::new(TaskRegistrationStage),
        Arc::new(WorkerExecutionStage),
        Arc::new(VerificationStage),
    ]
}
