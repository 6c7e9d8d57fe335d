//! Orchestration layer.
//!
//! This module provides the scheduler that layers tasks into batches, the
//! stage units that execute them, the supervisor that prioritizes,
//! delegates, quality-gates and escalates, and the engine that drives a
//! run end to end.

mod engine;
mod escalation;
mod quality;
mod scheduler;
mod stage;
mod supervisor;

pub use engine::{
    EngineConfig, ExecutionEngine, ExecutionReport, RunPlan, StageTiming,
    DEFAULT_STAGE_TIMEOUT_SECS,
};
pub use escalation::{
    analyze_failure, choose_strategy, classify_root_cause, Escalation, EscalationKind,
    FailureAnalysis, ResolutionStatus, ResolutionStrategy, RootCause, Severity,
};
pub use quality::{
    ConstantScorer, QualityAssessment, QualityScorer, QualityThresholds,
    DEFAULT_QUALITY_THRESHOLD, FALLBACK_SCORE,
};
pub use scheduler::{Batch, ExecutionOrder, ScheduledTask, Scheduler};
pub use stage::{
    CommandInvoker, EchoInvoker, FnStage, Invoker, ResponseSchema, RunContextView, StageAdapter,
    StageHook, StageOutput, StageRegistry, StageUnit,
};
pub use supervisor::{
    DecisionAction, DecisionLog, DecisionRecord, SupervisorDecisionLayer, SupervisorStats,
};
