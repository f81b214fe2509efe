pub mod coordinator;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod report_parser;
pub mod scheduler;
pub mod stages;
pub mod task_parser;

pub use coordinator::{Coordinator, Phase, PhaseObserver};
pub use orchestrator::{ExecuteOptions, Orchestrator, OrchestratorResult};
pub use pipeline::{
    PipelineExecutor, PipelineOutcome, PipelineVerdict, Stage, StageContext, StageResult,
    StreamObserver, VerdictRecord,
};
pub use report_parser::{parse_verifier_verdicts, parse_worker_report};
pub use scheduler::TaskScheduler;
pub use stages::{
    default_stages, PlanningStage, TaskRegistrationStage, VerificationStage, WorkerExecutionStage,
};
pub use task_parser::{parse_task_blocks, ParsedPlan};
