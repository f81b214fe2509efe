// Orchestrator facade
//
// The single external entry point: wires the bus, coordinator, router,
// tools, and pipeline into one `execute(request) -> OrchestratorResult`
// call. The facade never returns an error; every failure folds into the
// `Failed` variant after surfacing on the bus.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio_util::sync::CancellationToken;

use cadre_core::{CadreError, CoordinatorConfig, EventBus, Result};
use cadre_providers::ProviderRouter;
use cadre_tools::{CompletionReportTool, ToolRegistry};
use cadre_types::{AgentEvent, TaskSummary};

use crate::coordinator::{Coordinator, PhaseObserver};
use crate::pipeline::{
    PipelineExecutor, PipelineOutcome, StageContext, StreamObserver, VerdictRecord,
};
use crate::stages::default_stages;

/// Terminal result of one coordination run.
#[derive(Debug, Clone)]
pub enum OrchestratorResult {
    Success(TaskSummary),
    /// The planner produced no actionable work; carries the plan text.
    NoTasks(String),
    MaxIterationsReached(u32, TaskSummary),
    Failed(String),
}

impl OrchestratorResult {
    /// Numeric code for CLI adapters.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorResult::Success(_) | OrchestratorResult::NoTasks(_) => 0,
            OrchestratorResult::Failed(_) => 1,
            OrchestratorResult::MaxIterationsReached(_, _) => 2,
        }
    }
}

/// Optional observer hooks for one run.
#[derive(Default, Clone)]
pub struct ExecuteOptions {
    pub phase_observer: Option<PhaseObserver>,
    pub stream_observer: Option<StreamObserver>,
}

pub struct Orchestrator {
    config: CoordinatorConfig,
    router: Arc<ProviderRouter>,
    tools: ToolRegistry,
    bus: Arc<EventBus>,
    current_cancel: StdMutex<Option<CancellationToken>>,
    last_coordinator: StdMutex<Option<Coordinator>>,
    last_verdicts: StdMutex<Vec<VerdictRecord>>,
}

impl Orchestrator {
    pub fn new(config: CoordinatorConfig, router: Arc<ProviderRouter>) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new(config.replay_size, config.max_log_size));
        for (role, requirements) in &config.per_role_requirements {
            router.set_requirements(*role, *requirements);
        }
        Ok(Self {
            config,
            router,
            tools: ToolRegistry::new(),
            bus,
            current_cancel: StdMutex::new(None),
            last_coordinator: StdMutex::new(None),
            last_verdicts: StdMutex::new(Vec::new()),
        })
    }

    /// The workspace event bus; subscribe here for live events and replay.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Tool registry handed to provider backends. Always carries the
    /// structured completion-report tool for the active run.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Snapshot of the most recent run's tasks; available after `Failed`
    /// results too.
    pub fn task_summary(&self) -> TaskSummary {
        self.last_coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.task_summary())
            .unwrap_or_default()
    }

    /// Verifier decisions of the most recent run, across iterations.
    pub fn verdict_history(&self) -> Vec<VerdictRecord> {
        self.last_verdicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel the in-flight run, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(token) = self
            .current_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            token.cancel();
        }
    }

    /// Run one coordination session end to end.
    pub async fn execute(&self, request: &str, options: ExecuteOptions) -> OrchestratorResult {
        match self.execute_inner(request, options).await {
            Ok(result) => result,
            Err(e) => {
                let message = match &e {
                    CadreError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                // Dashboards see the cause before the result exists.
                self.bus.emit(AgentEvent::MessageReceived {
                    workspace_id: self.current_workspace_id(),
                    agent_id: "orchestrator".to_string(),
                    message: format!("run failed: {}", message),
                });
                OrchestratorResult::Failed(message)
            }
        }
    }

    async fn execute_inner(
        &self,
        request: &str,
        options: ExecuteOptions,
    ) -> Result<OrchestratorResult> {
        let workspace_id = format!("ws-{}", cadre_types::new_id());
        let coordinator =
            Coordinator::new(workspace_id, self.config.clone(), self.bus.clone());
        if let Some(observer) = options.phase_observer {
            coordinator.set_phase_observer(observer);
        }

        {
            let reporter = coordinator.clone();
            self.tools
                .register(Arc::new(CompletionReportTool::new(move |report| {
                    reporter.record_report(report);
                })))
                .await;
        }

        let planner_id = coordinator.initialize()?;
        coordinator.set_request(request);
        *self
            .last_coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(coordinator.clone());

        let cancel = CancellationToken::new();
        *self
            .current_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());

        let mut ctx = StageContext {
            request: request.to_string(),
            config: self.config.clone(),
            coordinator: coordinator.clone(),
            router: self.router.clone(),
            bus: self.bus.clone(),
            planner_id,
            plan_output: None,
            task_ids: Vec::new(),
            verdict_history: Vec::new(),
            iteration: 0,
            stream_observer: options.stream_observer,
            cancel,
        };

        let executor = PipelineExecutor::new(default_stages(), self.config.max_iterations);
        let outcome = executor.run(&mut ctx).await;

        *self
            .last_verdicts
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = ctx.verdict_history.clone();

        let summary = coordinator.task_summary();
        let result = match outcome {
            PipelineOutcome::Completed => OrchestratorResult::Success(summary),
            PipelineOutcome::NoTasks(plan) => OrchestratorResult::NoTasks(plan),
            PipelineOutcome::MaxIterationsReached(n) => {
                OrchestratorResult::MaxIterationsReached(n, summary)
            }
            PipelineOutcome::Failed(message) => {
                self.bus.emit(AgentEvent::MessageReceived {
                    workspace_id: coordinator.workspace_id().to_string(),
                    agent_id: "orchestrator".to_string(),
                    message: format!("run failed: {}", message),
                });
                coordinator.mark_failed();
                OrchestratorResult::Failed(message)
            }
        };

        // Give in-flight bus reactions a beat, then stop the listener.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        coordinator.shutdown();
        *self
            .current_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        Ok(result)
    }

    fn current_workspace_id(&self) -> String {
        self.last_coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.workspace_id().to_string())
            .unwrap_or_else(|| "ws-none".to_string())
    }

    /// Tear down providers, sessions, and pooled backend processes.
    pub async fn shutdown(&self) {
        self.cancel();
        if let Some(coordinator) = self
            .last_coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            coordinator.shutdown();
        }
        if let Err(e) = self.router.shutdown_all().await {
            tracing::warn!("provider shutdown error: {}", e);
        }
        cadre_runtime::teardown_all_pools().await;
    }
}
