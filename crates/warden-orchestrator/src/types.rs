use crate::breaker::CircuitState;
use crate::consensus::ConsensusOutcome;
use crate::health::RecoveryAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One step of a workflow: a call to `worker.action(args)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,
    /// Registered worker to call.
    pub worker: String,
    /// Action on that worker.
    pub action: String,
    /// Arguments passed to the action.
    #[serde(default)]
    pub args: Value,
    /// Ids of steps that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lower values are dispatched first.
    #[serde(default)]
    pub priority: i64,
    /// Logical task label. Successful steps sharing a label are reconciled
    /// by consensus.
    #[serde(default)]
    pub task: Option<String>,
    /// Vote weight of this step's result in its consensus round.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl WorkflowStep {
    /// A step with no arguments, dependencies or task label.
    pub fn new(id: impl Into<String>, worker: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker: worker.into(),
            action: action.into(),
            args: Value::Null,
            depends_on: Vec::new(),
            priority: 0,
            task: None,
            weight: default_weight(),
        }
    }

    /// Set the action arguments.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Replace the dependency list.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the consensus task label.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Set the consensus vote weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Why a step produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// The worker's circuit was open; the action was not invoked.
    CircuitOpen {
        /// Backoff left when the step was rejected.
        remaining_ms: u64,
    },
    /// The action ran and failed (or panicked).
    Worker {
        /// Error reported by the action.
        message: String,
    },
    /// A dependency did not succeed, so the step was never attempted.
    DependencyFailed {
        /// First dependency found not to have succeeded.
        dependency: String,
    },
    /// The caller's deadline passed before the step completed.
    DeadlineExceeded,
    /// The step was never dispatched.
    NotRun,
}

impl StepError {
    /// Whether the step was skipped rather than attempted and failed.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            StepError::DependencyFailed { .. } | StepError::DeadlineExceeded | StepError::NotRun
        )
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepError::CircuitOpen { remaining_ms } => {
                write!(f, "circuit open, retry in {remaining_ms}ms")
            }
            StepError::Worker { message } => write!(f, "worker error: {message}"),
            StepError::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' failed")
            }
            StepError::DeadlineExceeded => write!(f, "deadline exceeded"),
            StepError::NotRun => write!(f, "not run"),
        }
    }
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Id of the step.
    pub step_id: String,
    /// Worker the step targeted.
    pub worker: String,
    /// Action the step targeted.
    pub action: String,
    /// Action output, or why there is none.
    pub result: Result<Value, StepError>,
    /// Dispatch latency, for steps that invoked their action.
    pub latency_ms: Option<u64>,
}

impl StepOutcome {
    pub(crate) fn skipped(step: &WorkflowStep, error: StepError) -> Self {
        Self {
            step_id: step.id.clone(),
            worker: step.worker.clone(),
            action: step.action.clone(),
            result: Err(error),
            latency_ms: None,
        }
    }

    /// Whether the action ran and succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Action output, if the step succeeded.
    pub fn output(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    /// Why the step produced no output, if it did not succeed.
    pub fn error(&self) -> Option<&StepError> {
        self.result.as_ref().err()
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Every step succeeded.
    Succeeded,
    /// Some steps succeeded and some did not.
    PartiallyFailed,
    /// No step succeeded.
    Failed,
    /// The deadline passed before every step completed.
    TimedOut,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Succeeded => write!(f, "succeeded"),
            WorkflowStatus::PartiallyFailed => write!(f, "partially_failed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Non-fatal conditions observed while running a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowWarning {
    /// A dependency cycle was found; these steps were ordered by name.
    SchedulingCycle {
        /// Steps placed by the name-order fallback.
        steps: Vec<String>,
    },
}

/// Aggregated report of one workflow run. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Identifier of this run.
    pub run_id: Uuid,
    /// When the workflow was submitted.
    pub started_at: DateTime<Utc>,
    /// When aggregation finished.
    pub finished_at: DateTime<Utc>,
    /// Overall status.
    pub status: WorkflowStatus,
    /// Step ids in dispatch order.
    pub order: Vec<String>,
    /// Outcome of every step, keyed by id.
    pub steps: BTreeMap<String, StepOutcome>,
    /// Consensus per task label.
    pub consensus: BTreeMap<String, ConsensusOutcome>,
    /// Non-fatal conditions, such as a scheduling cycle.
    pub warnings: Vec<WorkflowWarning>,
    /// One-line human-readable summary.
    pub summary: String,
}

impl WorkflowResult {
    /// Outcome of step `id`.
    pub fn step(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.get(id)
    }

    /// Number of steps that succeeded.
    pub fn succeeded(&self) -> usize {
        self.steps.values().filter(|s| s.is_success()).count()
    }

    /// Number of steps that ran and failed.
    pub fn failed(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.error().is_some_and(|e| !e.is_skip()))
            .count()
    }

    /// Number of steps that never ran.
    pub fn skipped(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.error().is_some_and(StepError::is_skip))
            .count()
    }

    /// Whether every step succeeded.
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}

/// Notifications pushed to [`crate::Orchestrator::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// The worker's weighted load crossed the scale threshold.
    ScaleOut {
        /// Worker that needs capacity.
        worker: String,
        /// Weighted load at the time of the decision.
        load: f64,
    },
    /// Health sweep flagged the worker; `action` is the chosen recovery.
    WorkerFailed {
        /// Worker that failed the sweep.
        worker: String,
        /// Recovery the embedding application should carry out.
        action: RecoveryAction,
    },
    /// The worker's circuit just opened.
    CircuitOpened {
        /// Worker whose circuit opened.
        worker: String,
        /// Backoff before a recovery probe is admitted.
        retry_after_ms: u64,
    },
}

/// Per-worker line of [`OrchestratorStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Worker name.
    pub name: String,
    /// State of the worker's circuit.
    pub circuit_state: CircuitState,
    /// Remaining backoff while the circuit is open.
    pub retry_after_ms: Option<u64>,
    /// Liveness verdict of the health monitor.
    pub is_alive: bool,
    /// Current weighted load.
    pub weighted_load: f64,
    /// Decaying error count.
    pub error_count: u32,
}

/// Best-effort view of every registered worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// One report per registered worker, sorted by name.
    pub workers: Vec<WorkerReport>,
}

impl OrchestratorStatus {
    /// Report for `name`, if registered.
    pub fn worker(&self, name: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.name == name)
    }
}
