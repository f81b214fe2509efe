// Pipeline executor
//
// Sequences stages with Continue/Repeat/Done/Fail control flow under a
// bounded iteration budget. Deterministic given the same stage list and
// inputs; all cross-stage data travels through the context.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cadre_core::{CoordinatorConfig, EventBus};
use cadre_providers::ProviderRouter;
use cadre_types::{AgentId, TaskId, Verdict};

use crate::coordinator::Coordinator;

/// What a stage tells the executor to do next.
#[derive(Debug)]
pub enum StageResult {
    /// Proceed to the next stage.
    Continue,
    /// Succeed immediately with this verdict, skipping remaining stages.
    SkipRemaining(PipelineVerdict),
    /// Restart from stage 0, consuming one iteration.
    RepeatPipeline,
    /// Terminate the pipeline with this verdict.
    Done(PipelineVerdict),
    /// Terminate the pipeline with an error.
    Failed(String),
}

/// Successful terminal verdicts a stage can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineVerdict {
    Completed,
    /// The plan contained no actionable work; carries the plan text.
    NoTasks(String),
}

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    NoTasks(String),
    MaxIterationsReached(u32),
    Failed(String),
}

impl From<PipelineVerdict> for PipelineOutcome {
    fn from(verdict: PipelineVerdict) -> Self {
        match verdict {
            PipelineVerdict::Completed => PipelineOutcome::Completed,
            PipelineVerdict::NoTasks(plan) => PipelineOutcome::NoTasks(plan),
        }
    }
}

/// One verifier decision, kept for observers across iterations.
#[derive(Debug, Clone)]
pub struct VerdictRecord {
    pub iteration: u32,
    pub task_id: TaskId,
    pub verdict: Verdict,
}

/// Callback receiving per-agent streamed chunks.
pub type StreamObserver = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Shared state the stages read and write.
pub struct StageContext {
    pub request: String,
    pub config: CoordinatorConfig,
    pub coordinator: Coordinator,
    pub router: Arc<ProviderRouter>,
    pub bus: Arc<EventBus>,
    pub planner_id: AgentId,
    pub plan_output: Option<String>,
    pub task_ids: Vec<TaskId>,
    pub verdict_history: Vec<VerdictRecord>,
    pub iteration: u32,
    pub stream_observer: Option<StreamObserver>,
    pub cancel: CancellationToken,
}

/// A reusable unit of pipeline logic.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &mut StageContext) -> StageResult;
}

pub struct PipelineExecutor {
    stages: Vec<Arc<dyn Stage>>,
    max_iterations: u32,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Arc<dyn Stage>>, max_iterations: u32) -> Self {
        Self {
            stages,
            max_iterations: max_iterations.max(1),
        }
    }

    pub async fn run(&self, ctx: &mut StageContext) -> PipelineOutcome {
        for iteration in 1..=self.max_iterations {
            ctx.iteration = iteration;
            tracing::debug!("pipeline iteration {}/{}", iteration, self.max_iterations);

            let mut repeat = false;
            for stage in &self.stages {
                if ctx.cancel.is_cancelled() {
                    return PipelineOutcome::Failed("cancelled".to_string());
                }
                tracing::debug!("running stage {}", stage.name());
                match stage.run(ctx).await {
                    StageResult::Continue => {}
                    StageResult::SkipRemaining(verdict) => return verdict.into(),
                    StageResult::Done(verdict) => return verdict.into(),
                    StageResult::Failed(message) => {
                        tracing::warn!("stage {} failed: {}", stage.name(), message);
                        return PipelineOutcome::Failed(message);
                    }
                    StageResult::RepeatPipeline => {
                        if iteration == self.max_iterations {
                            return PipelineOutcome::MaxIterationsReached(self.max_iterations);
                        }
                        repeat = true;
                        break;
                    }
                }
            }

            if !repeat {
                return PipelineOutcome::Completed;
            }
        }
        PipelineOutcome::MaxIterationsReached(self.max_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> StageContext {
        let bus = Arc::new(EventBus::new(8, 64));
        let coordinator = Coordinator::new("ws-pipe", CoordinatorConfig::default(), bus.clone());
        StageContext {
            request: "test".to_string(),
            config: CoordinatorConfig::default(),
            coordinator,
            router: Arc::new(ProviderRouter::new()),
            bus,
            planner_id: "planner".to_string(),
            plan_output: None,
            task_ids: Vec::new(),
            verdict_history: Vec::new(),
            iteration: 0,
            stream_observer: None,
            cancel: CancellationToken::new(),
        }
    }

    struct Scripted {
        name: &'static str,
        calls: Arc<AtomicU32>,
        behavior: Box<dyn Fn(u32) -> StageResult + Send + Sync>,
    }

    #[async_trait]
    impl Stage for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn run(&self, _ctx: &mut StageContext) -> StageResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behavior)(call)
        }
    }

    fn stage(
        name: &'static str,
        behavior: impl Fn(u32) -> StageResult + Send + Sync + 'static,
    ) -> (Arc<AtomicU32>, Arc<dyn Stage>) {
        let calls = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(Scripted {
            name,
            calls: calls.clone(),
            behavior: Box::new(behavior),
        });
        (calls, stage)
    }

    #[tokio::test]
    async fn all_continue_means_success() {
        let (a_calls, a) = stage("a", |_| StageResult::Continue);
        let (b_calls, b) = stage("b", |_| StageResult::Continue);
        let executor = PipelineExecutor::new(vec![a, b], 3);

        let outcome = executor.run(&mut context()).await;
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn done_short_circuits() {
        let (_, a) = stage("a", |_| {
            StageResult::Done(PipelineVerdict::NoTasks("empty plan".to_string()))
        });
        let (b_calls, b) = stage("b", |_| StageResult::Continue);
        let executor = PipelineExecutor::new(vec![a, b], 3);

        let outcome = executor.run(&mut context()).await;
        assert_eq!(outcome, PipelineOutcome::NoTasks("empty plan".to_string()));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeat_restarts_from_stage_zero() {
        let (a_calls, a) = stage("a", |_| StageResult::Continue);
        let (_, b) = stage("b", |call| {
            if call == 0 {
                StageResult::RepeatPipeline
            } else {
                StageResult::Continue
            }
        });
        let executor = PipelineExecutor::new(vec![a, b], 3);

        let outcome = executor.run(&mut context()).await;
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeat_on_final_iteration_is_max_iterations_reached() {
        let (calls, a) = stage("a", |_| StageResult::RepeatPipeline);
        let executor = PipelineExecutor::new(vec![a], 3);

        let outcome = executor.run(&mut context()).await;
        assert_eq!(outcome, PipelineOutcome::MaxIterationsReached(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_stage_fails_the_pipeline() {
        let (_, a) = stage("a", |_| StageResult::Failed("boom".to_string()));
        let executor = PipelineExecutor::new(vec![a], 3);

        let outcome = executor.run(&mut context()).await;
        assert_eq!(outcome, PipelineOutcome::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn cancellation_fails_between_stages() {
        let (_, a) = stage("a", |_| StageResult::Continue);
        let executor = PipelineExecutor::new(vec![a], 3);

        let mut ctx = context();
        ctx.cancel.cancel();
        let outcome = executor.run(&mut ctx).await;
        assert_eq!(outcome, PipelineOutcome::Failed("cancelled".to_string()));
    }

    #[tokio::test]
    async fn iteration_counter_is_visible_to_stages() {
        let (_, a) = stage("a", |_| StageResult::Continue);
        let executor = PipelineExecutor::new(vec![a], 2);
        let mut ctx = context();
        let outcome = executor.run(&mut ctx).await;
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(ctx.iteration, 1);
    }
}
