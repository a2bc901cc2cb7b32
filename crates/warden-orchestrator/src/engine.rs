use crate::breaker::{saturating_millis, CircuitBreaker, CircuitState, Dispatch};
use crate::config::WardenConfig;
use crate::consensus::{ConsensusOutcome, ConsensusResolver, Proposal};
use crate::health::{HealthMonitor, RecoveryAction};
use crate::load::{LoadController, MetricType};
use crate::scheduler::{ExecutionPlan, PriorityScheduler, WorkItem};
use crate::types::{
    OrchestratorStatus, RuntimeEvent, StepError, StepOutcome, WorkerReport, WorkflowResult,
    WorkflowStatus, WorkflowStep, WorkflowWarning,
};
use crate::worker::{Action, Worker, WorkerRegistry};
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_core::{Clock, SystemClock, WardenError, WardenResult};

/// State shared by the orchestrator and every in-flight step.
///
/// Each table locks per key, so steps for distinct workers never contend.
struct Runtime {
    config: WardenConfig,
    clock: Arc<dyn Clock>,
    registry: WorkerRegistry,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    health: HealthMonitor,
    load: LoadController,
    consensus: ConsensusResolver,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RuntimeEvent>>>,
}

impl Runtime {
    fn breaker(&self, worker: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(worker).cloned()
    }

    /// Run `record` only while `breaker` still belongs to the registered
    /// `worker`. Holding the table read lock orders it against deregistration.
    fn record_if_current(
        &self,
        worker: &str,
        breaker: &Arc<CircuitBreaker>,
        record: impl FnOnce(),
    ) {
        let breakers = self.breakers.read();
        if breakers.get(worker).is_some_and(|b| Arc::ptr_eq(b, breaker)) {
            record();
        } else {
            debug!(worker = %worker, "Discarding samples from a replaced registration");
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        debug!(event = ?event, "Runtime event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn check_scale(&self, worker: &str) {
        if self.load.should_scale(worker) {
            let load = self.load.calculate_weighted_load(worker);
            self.emit(RuntimeEvent::ScaleOut {
                worker: worker.to_string(),
                load,
            });
        }
    }
}

/// A step with its worker resolved, ready to spawn.
struct Dispatchable {
    step_id: String,
    worker: String,
    action_name: String,
    action: Arc<dyn Action>,
    breaker: Arc<CircuitBreaker>,
    args: Value,
}

/// The orchestration runtime.
///
/// Owns the worker registry and one circuit breaker per worker, runs
/// workflows concurrently in dependency order, and feeds every completion
/// into health and load tracking. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<Runtime>,
}

impl Orchestrator {
    /// Create an orchestrator on the system clock.
    pub fn new(config: WardenConfig) -> WardenResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an orchestrator reading time from `clock`.
    pub fn with_clock(config: WardenConfig, clock: Arc<dyn Clock>) -> WardenResult<Self> {
        config.validate()?;
        let health = HealthMonitor::new(config.health.clone(), Arc::clone(&clock));
        let load = LoadController::new(config.load.clone(), Arc::clone(&clock));
        Ok(Self {
            runtime: Arc::new(Runtime {
                config,
                clock,
                registry: WorkerRegistry::new(),
                breakers: RwLock::new(HashMap::new()),
                health,
                load,
                consensus: ConsensusResolver::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Configuration the orchestrator was built with.
    pub fn config(&self) -> &WardenConfig {
        &self.runtime.config
    }

    /// Health monitor fed by every dispatch.
    pub fn health(&self) -> &HealthMonitor {
        &self.runtime.health
    }

    /// Load controller fed by every dispatch.
    pub fn load(&self) -> &LoadController {
        &self.runtime.load
    }

    /// Circuit breaker of a registered worker.
    pub fn breaker(&self, worker: &str) -> Option<Arc<CircuitBreaker>> {
        self.runtime.breaker(worker)
    }

    /// Registered worker names, sorted.
    pub fn worker_names(&self) -> Vec<String> {
        self.runtime.registry.names()
    }

    /// Register a worker and give it a closed circuit breaker.
    ///
    /// The breaker table stays write-locked until the worker is published,
    /// so a registered worker always has a breaker.
    pub fn register_worker(&self, worker: Worker) -> WardenResult<()> {
        let mut breakers = self.runtime.breakers.write();
        let registered = self.runtime.registry.register(worker)?;
        let name = registered.name().to_string();
        breakers.insert(
            name.clone(),
            Arc::new(CircuitBreaker::new(
                name,
                self.runtime.config.breaker.clone(),
                Arc::clone(&self.runtime.clock),
            )),
        );
        Ok(())
    }

    /// Remove a worker together with its breaker, health and load state.
    ///
    /// Calls still in flight for the removed worker record nothing when they
    /// finish, even if a worker of the same name is registered meanwhile.
    pub fn deregister_worker(&self, name: &str) -> bool {
        let mut breakers = self.runtime.breakers.write();
        let removed = self.runtime.registry.deregister(name).is_some();
        if removed {
            breakers.remove(name);
            self.runtime.health.remove(name);
            self.runtime.load.remove(name);
        }
        removed
    }

    /// Receive [`RuntimeEvent`]s from now on. Dropped receivers are pruned.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RuntimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.subscribers.lock().push(tx);
        rx
    }

    /// Feed an externally measured sample (CPU, memory) for a worker and
    /// evaluate scale-out.
    pub fn record_metric(&self, worker: &str, metric: MetricType, value: f64) -> WardenResult<()> {
        if self.runtime.registry.get(worker).is_none() {
            return Err(WardenError::UnknownWorker(worker.to_string()));
        }
        if !value.is_finite() {
            return Err(WardenError::Orchestrator(format!(
                "{metric} sample for '{worker}' is not a finite number"
            )));
        }
        self.runtime.load.add_metric(worker, value, metric);
        self.runtime.check_scale(worker);
        Ok(())
    }

    /// Run failure detection and pick a recovery action per failed worker.
    ///
    /// Carrying the action out is up to the caller; `apoptosis` maps to
    /// [`Orchestrator::deregister_worker`].
    pub fn sweep_health(&self) -> Vec<(String, RecoveryAction)> {
        self.runtime
            .health
            .detect_failures()
            .into_iter()
            .filter_map(|name| {
                let action = self.runtime.health.get_recovery_action(&name)?;
                warn!(worker = %name, action = %action, "Recovery action selected");
                self.runtime.emit(RuntimeEvent::WorkerFailed {
                    worker: name.clone(),
                    action,
                });
                Some((name, action))
            })
            .collect()
    }

    /// Best-effort snapshot of every registered worker. Never fails.
    pub fn get_status(&self) -> OrchestratorStatus {
        let workers = self
            .runtime
            .registry
            .names()
            .into_iter()
            .map(|name| {
                let breaker = self.runtime.breaker(&name).map(|b| b.snapshot());
                let health = self.runtime.health.get_status(&name);
                WorkerReport {
                    circuit_state: breaker
                        .as_ref()
                        .map_or(CircuitState::Closed, |b| b.state),
                    retry_after_ms: breaker.and_then(|b| b.retry_after_ms),
                    is_alive: health.as_ref().map_or(true, |h| h.is_alive),
                    error_count: health.map_or(0, |h| h.error_count),
                    weighted_load: self.runtime.load.calculate_weighted_load(&name),
                    name,
                }
            })
            .collect();
        OrchestratorStatus { workers }
    }

    /// Run a workflow under the configured default deadline, if any.
    pub async fn submit_workflow(&self, steps: Vec<WorkflowStep>) -> WardenResult<WorkflowResult> {
        let deadline = self.runtime.config.orchestrator.deadline();
        self.execute(steps, deadline).await
    }

    /// Run a workflow, giving up on aggregation once `deadline` passes.
    ///
    /// Calls still in flight at the deadline keep running and still update
    /// breaker, health and load state, but their results are discarded.
    pub async fn submit_workflow_with_deadline(
        &self,
        steps: Vec<WorkflowStep>,
        deadline: Duration,
    ) -> WardenResult<WorkflowResult> {
        self.execute(steps, Some(deadline)).await
    }

    async fn execute(
        &self,
        steps: Vec<WorkflowStep>,
        deadline: Option<Duration>,
    ) -> WardenResult<WorkflowResult> {
        let plan = plan_workflow(&steps)?;

        let mut dispatchable: HashMap<String, Dispatchable> = HashMap::with_capacity(steps.len());
        for step in &steps {
            let action = self.runtime.registry.resolve(&step.worker, &step.action)?;
            let breaker = self
                .runtime
                .breaker(&step.worker)
                .ok_or_else(|| WardenError::UnknownWorker(step.worker.clone()))?;
            dispatchable.insert(
                step.id.clone(),
                Dispatchable {
                    step_id: step.id.clone(),
                    worker: step.worker.clone(),
                    action_name: step.action.clone(),
                    action,
                    breaker,
                    args: step.args.clone(),
                },
            );
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        // A deadline too far out to represent is no deadline.
        let deadline_at = deadline.and_then(|d| tokio::time::Instant::now().checked_add(d));

        info!(
            run_id = %run_id,
            steps = steps.len(),
            deadline_ms = deadline.map(saturating_millis),
            "Workflow submitted"
        );

        let mut warnings = Vec::new();
        if plan.has_cycle() {
            warn!(
                run_id = %run_id,
                steps = ?plan.cycle_fallback,
                "Dependency cycle in workflow, dispatching in fallback order"
            );
            warnings.push(WorkflowWarning::SchedulingCycle {
                steps: plan.cycle_fallback.clone(),
            });
        }

        let by_id: HashMap<&str, &WorkflowStep> =
            steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let waits_on = effective_dependencies(&steps, &plan);

        let mut pending: Vec<&str> = plan.order.iter().map(String::as_str).collect();
        let mut outcomes: HashMap<String, StepOutcome> = HashMap::with_capacity(steps.len());
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
        let mut timed_out = false;

        loop {
            // Dependencies always sit earlier in `pending`, so one ordered
            // pass settles every cascade of skipped steps.
            let mut blocked = Vec::with_capacity(pending.len());
            for id in pending.drain(..) {
                let deps = waits_on.get(id).map(Vec::as_slice).unwrap_or_default();
                match readiness(deps, &outcomes) {
                    Readiness::Blocked => blocked.push(id),
                    Readiness::DependencyFailed(dependency) => {
                        warn!(
                            run_id = %run_id,
                            step = %id,
                            dependency = %dependency,
                            "Skipping step, dependency failed"
                        );
                        if let Some(step) = by_id.get(id) {
                            outcomes.insert(
                                id.to_string(),
                                StepOutcome::skipped(
                                    step,
                                    StepError::DependencyFailed {
                                        dependency: dependency.to_string(),
                                    },
                                ),
                            );
                        }
                    }
                    Readiness::Ready => {
                        if let Some(step) = dispatchable.remove(id) {
                            debug!(run_id = %run_id, step = %id, worker = %step.worker, "Dispatching step");
                            in_flight.insert(id.to_string());
                            join_set.spawn(dispatch_step(Arc::clone(&self.runtime), step));
                        }
                    }
                }
            }
            pending = blocked;

            if join_set.is_empty() {
                break;
            }

            let joined = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, join_set.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => join_set.join_next().await,
            };

            match joined {
                Some(Ok(outcome)) => {
                    in_flight.remove(&outcome.step_id);
                    outcomes.insert(outcome.step_id.clone(), outcome);
                }
                Some(Err(e)) => {
                    error!(run_id = %run_id, error = %e, "Step task did not complete");
                }
                None => break,
            }
        }

        if timed_out {
            warn!(
                run_id = %run_id,
                in_flight = in_flight.len(),
                not_dispatched = pending.len(),
                "Workflow deadline exceeded, discarding outstanding results"
            );
            join_set.detach_all();
        }

        for id in &plan.order {
            if outcomes.contains_key(id) {
                continue;
            }
            let error = if timed_out {
                StepError::DeadlineExceeded
            } else if in_flight.contains(id) {
                StepError::Worker {
                    message: "step task did not complete".into(),
                }
            } else {
                StepError::NotRun
            };
            if let Some(step) = by_id.get(id.as_str()) {
                outcomes.insert(id.clone(), StepOutcome::skipped(step, error));
            }
        }

        let consensus = self.reconcile(&plan.order, &by_id, &outcomes);

        let total = outcomes.len();
        let succeeded = outcomes.values().filter(|o| o.is_success()).count();
        let status = if timed_out {
            WorkflowStatus::TimedOut
        } else if succeeded == total {
            WorkflowStatus::Succeeded
        } else if succeeded == 0 {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::PartiallyFailed
        };

        let mut result = WorkflowResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            order: plan.order,
            steps: outcomes.into_iter().collect(),
            consensus,
            warnings,
            summary: String::new(),
        };
        result.summary = summarize(&result);

        info!(
            run_id = %run_id,
            status = %result.status,
            duration_ms = saturating_millis(start.elapsed()),
            summary = %result.summary,
            "Workflow finished"
        );

        Ok(result)
    }

    /// One consensus round per task label over the successful steps carrying it.
    fn reconcile(
        &self,
        order: &[String],
        by_id: &HashMap<&str, &WorkflowStep>,
        outcomes: &HashMap<String, StepOutcome>,
    ) -> BTreeMap<String, ConsensusOutcome> {
        let mut rounds: BTreeMap<&str, Vec<Proposal>> = BTreeMap::new();
        for id in order {
            let (Some(step), Some(outcome)) = (by_id.get(id.as_str()), outcomes.get(id)) else {
                continue;
            };
            let (Some(task), Ok(value)) = (step.task.as_deref(), &outcome.result) else {
                continue;
            };
            rounds.entry(task).or_default().push(
                Proposal::new(step.worker.clone(), proposal_content(value)).with_weight(step.weight),
            );
        }

        rounds
            .into_iter()
            .filter_map(|(task, proposals)| {
                let outcome = self.runtime.consensus.resolve(&proposals)?;
                info!(
                    task = %task,
                    winner = %outcome.winner,
                    proposals = proposals.len(),
                    agreement = outcome.agreement,
                    "Consensus reached"
                );
                Some((task.to_string(), outcome))
            })
            .collect()
    }
}

/// Validate a workflow's structure and compute its dispatch order.
///
/// Checks everything that does not need registered workers: the workflow is
/// non-empty, step ids are unique and non-blank, and every dependency names
/// another step of the same workflow.
pub fn plan_workflow(steps: &[WorkflowStep]) -> WardenResult<ExecutionPlan> {
    if steps.is_empty() {
        return Err(WardenError::InvalidWorkflow("workflow has no steps".into()));
    }

    let mut ids: HashSet<&str> = HashSet::with_capacity(steps.len());
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(WardenError::InvalidWorkflow(
                "step id must not be empty".into(),
            ));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(WardenError::InvalidWorkflow(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    let mut scheduler = PriorityScheduler::new();
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(WardenError::InvalidWorkflow(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                )));
            }
        }
        scheduler.add_item(
            WorkItem::new(step.id.clone(), step.priority)
                .with_dependencies(step.depends_on.iter().cloned()),
        )?;
    }

    Ok(scheduler.plan())
}

/// Dependencies each step actually waits for: only those placed before it.
/// For acyclic workflows that is all of them.
fn effective_dependencies<'a>(
    steps: &'a [WorkflowStep],
    plan: &ExecutionPlan,
) -> HashMap<&'a str, Vec<&'a str>> {
    let position: HashMap<&str, usize> = plan
        .order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    steps
        .iter()
        .map(|step| {
            let own = position.get(step.id.as_str()).copied().unwrap_or(usize::MAX);
            let deps = step
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| position.get(dep).is_some_and(|&p| p < own))
                .collect();
            (step.id.as_str(), deps)
        })
        .collect()
}

enum Readiness<'a> {
    Ready,
    Blocked,
    DependencyFailed(&'a str),
}

fn readiness<'a>(deps: &[&'a str], outcomes: &HashMap<String, StepOutcome>) -> Readiness<'a> {
    let mut blocked = false;
    for &dep in deps {
        match outcomes.get(dep) {
            Some(outcome) if !outcome.is_success() => return Readiness::DependencyFailed(dep),
            Some(_) => {}
            None => blocked = true,
        }
    }
    if blocked {
        Readiness::Blocked
    } else {
        Readiness::Ready
    }
}

/// Gate, invoke and record one step.
async fn dispatch_step(runtime: Arc<Runtime>, step: Dispatchable) -> StepOutcome {
    let mut latency_ms = None;

    let dispatch = match step.breaker.try_acquire() {
        Err(remaining) => {
            warn!(
                step = %step.step_id,
                worker = %step.worker,
                remaining_ms = saturating_millis(remaining),
                "Step rejected, circuit open"
            );
            Dispatch::CircuitOpen { remaining }
        }
        Ok(()) => {
            let started = runtime.clock.now();
            let invoked = AssertUnwindSafe(step.action.invoke(step.args))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(WardenError::Worker(format!(
                        "action panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            let latency = runtime.clock.now().saturating_duration_since(started);
            latency_ms = Some(saturating_millis(latency));

            let failed = invoked.is_err();
            if failed {
                if step.breaker.on_failure() {
                    runtime.emit(RuntimeEvent::CircuitOpened {
                        worker: step.worker.clone(),
                        retry_after_ms: step
                            .breaker
                            .remaining_open()
                            .map_or(0, saturating_millis),
                    });
                }
            } else {
                step.breaker.on_success();
            }

            runtime.record_if_current(&step.worker, &step.breaker, || {
                runtime.health.update_health(&step.worker, latency, failed);
                runtime.load.add_metric(
                    &step.worker,
                    runtime.config.load.normalize_latency(latency),
                    MetricType::Latency,
                );
                runtime.check_scale(&step.worker);
            });

            match invoked {
                Ok(value) => Dispatch::Ok(value),
                Err(err) => Dispatch::Failed(err),
            }
        }
    };

    let result = match dispatch {
        Dispatch::Ok(value) => Ok(value),
        Dispatch::CircuitOpen { remaining } => Err(StepError::CircuitOpen {
            remaining_ms: saturating_millis(remaining),
        }),
        Dispatch::Failed(err) => {
            let message = match err {
                WardenError::Worker(message) => message,
                other => other.to_string(),
            };
            error!(
                step = %step.step_id,
                worker = %step.worker,
                action = %step.action_name,
                error = %message,
                "Step failed"
            );
            Err(StepError::Worker { message })
        }
    };

    StepOutcome {
        step_id: step.step_id,
        worker: step.worker,
        action: step.action_name,
        result,
        latency_ms,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn proposal_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn summarize(result: &WorkflowResult) -> String {
    let mut summary = format!(
        "{}/{} steps succeeded, {} failed, {} skipped",
        result.succeeded(),
        result.steps.len(),
        result.failed(),
        result.skipped()
    );
    if result.status == WorkflowStatus::TimedOut {
        summary.push_str("; deadline exceeded");
    }
    if !result.warnings.is_empty() {
        summary.push_str("; dependency cycle resolved by name order");
    }
    if !result.consensus.is_empty() {
        summary.push_str(&format!("; consensus on {} task(s)", result.consensus.len()));
    }
    summary
}
