//! Resilient multi-worker orchestration runtime.
//!
//! Dispatches actions to named workers, isolates failing workers with
//! per-worker circuit breakers, orders work by priority and dependency,
//! decides when a worker needs more capacity, reconciles competing answers
//! by weighted vote, and tracks worker liveness to drive recovery.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Worker registry and concurrent workflow execution.
//! - [`CircuitBreaker`] — Per-worker call gate with jittered exponential backoff.
//! - [`HealthMonitor`] — Liveness tracking and recovery-action selection.
//! - [`LoadController`] — Sliding-window load scoring with anti-flapping scale-out.
//! - [`ConsensusResolver`] — Weighted plurality voting over proposals.
//! - [`PriorityScheduler`] — Dependency-aware priority ordering.
//! - [`WardenConfig`] — TOML configuration for every component.

/// Circuit breaker state machine and backoff policy.
pub mod breaker;
/// Runtime configuration.
pub mod config;
/// Weighted plurality voting.
pub mod consensus;
/// Orchestration engine and workflow execution.
pub mod engine;
/// Worker health monitoring.
pub mod health;
/// Load scoring and scale-out decisions.
pub mod load;
/// Dependency-aware priority scheduler.
pub mod scheduler;
mod table;
/// Workflow, result and status types.
pub mod types;
/// Workers, actions and the worker registry.
pub mod worker;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, Dispatch};
pub use config::{OrchestratorConfig, WardenConfig};
pub use consensus::{ConsensusOutcome, ConsensusResolver, Proposal};
pub use engine::{plan_workflow, Orchestrator};
pub use health::{HealthConfig, HealthMonitor, HealthStatus, HealthTag, RecoveryAction};
pub use load::{LoadConfig, LoadController, MetricType};
pub use scheduler::{ExecutionPlan, PriorityScheduler, WorkItem};
pub use types::{
    OrchestratorStatus, RuntimeEvent, StepError, StepOutcome, WorkerReport, WorkflowResult,
    WorkflowStatus, WorkflowStep, WorkflowWarning,
};
pub use worker::{action_fn, blocking_action, Action, Worker, WorkerRegistry};
