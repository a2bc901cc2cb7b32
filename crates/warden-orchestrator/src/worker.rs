use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use warden_core::{WardenError, WardenResult};

/// A callable capability exposed by a worker.
///
/// Every action is dispatched as a future, whether the underlying work is
/// asynchronous or blocking (see [`blocking_action`]).
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action with `args`.
    async fn invoke(&self, args: Value) -> WardenResult<Value>;
}

struct AsyncFnAction<F>(F);

#[async_trait]
impl<F, Fut> Action for AsyncFnAction<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = WardenResult<Value>> + Send,
{
    async fn invoke(&self, args: Value) -> WardenResult<Value> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WardenResult<Value>> + Send + 'static,
{
    Arc::new(AsyncFnAction(f))
}

struct BlockingAction<F>(Arc<F>);

#[async_trait]
impl<F> Action for BlockingAction<F>
where
    F: Fn(Value) -> WardenResult<Value> + Send + Sync + 'static,
{
    async fn invoke(&self, args: Value) -> WardenResult<Value> {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f(args))
            .await
            .map_err(|e| WardenError::Worker(format!("blocking action did not complete: {e}")))?
    }
}

/// Wrap a blocking closure as an [`Action`]; it runs on tokio's blocking pool.
pub fn blocking_action<F>(f: F) -> Arc<dyn Action>
where
    F: Fn(Value) -> WardenResult<Value> + Send + Sync + 'static,
{
    Arc::new(BlockingAction(Arc::new(f)))
}

/// A named unit exposing a fixed table of actions.
pub struct Worker {
    name: String,
    actions: HashMap<String, Arc<dyn Action>>,
}

impl Worker {
    /// Start an empty worker named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: HashMap::new(),
        }
    }

    /// Add (or replace) an action.
    pub fn with_action(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.actions.insert(name.into(), action);
        self
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an action.
    pub fn action(&self, name: &str) -> Option<&Arc<dyn Action>> {
        self.actions.get(name)
    }

    /// Whether the worker exposes `name`.
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Action names, sorted.
    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn validate(&self) -> WardenResult<()> {
        if self.name.trim().is_empty() {
            return Err(WardenError::Orchestrator(
                "worker name must not be empty".into(),
            ));
        }
        if self.actions.is_empty() {
            return Err(WardenError::Orchestrator(format!(
                "worker '{}' exposes no actions",
                self.name
            )));
        }
        if let Some(blank) = self.actions.keys().find(|a| a.trim().is_empty()) {
            return Err(WardenError::Orchestrator(format!(
                "worker '{}' has an action with a blank name ({blank:?})",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("actions", &self.action_names())
            .finish()
    }
}

/// The `name -> Worker` table. Workers are shared, never copied.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<Worker>>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, validating its capability table up front.
    pub fn register(&self, worker: Worker) -> WardenResult<Arc<Worker>> {
        worker.validate()?;
        let mut workers = self.workers.write();
        if workers.contains_key(worker.name()) {
            return Err(WardenError::DuplicateWorker(worker.name().to_string()));
        }
        info!(worker = %worker.name(), actions = ?worker.action_names(), "Registered worker");
        let worker = Arc::new(worker);
        workers.insert(worker.name().to_string(), Arc::clone(&worker));
        Ok(worker)
    }

    /// Remove a worker, returning it if it was registered.
    pub fn deregister(&self, name: &str) -> Option<Arc<Worker>> {
        let removed = self.workers.write().remove(name);
        if removed.is_some() {
            info!(worker = %name, "Deregistered worker");
        }
        removed
    }

    /// Look up a worker by name.
    pub fn get(&self, name: &str) -> Option<Arc<Worker>> {
        self.workers.read().get(name).cloned()
    }

    /// Resolve `worker.action`, failing with the precise precondition error.
    pub fn resolve(&self, worker: &str, action: &str) -> WardenResult<Arc<dyn Action>> {
        let entry = self
            .get(worker)
            .ok_or_else(|| WardenError::UnknownWorker(worker.to_string()))?;
        entry
            .action(action)
            .cloned()
            .ok_or_else(|| WardenError::UnknownAction {
                worker: worker.to_string(),
                action: action.to_string(),
            })
    }

    /// Registered worker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}
