//! Execution layer: work registry, target workers, routing and dispatch
//!
//! Task steps reach workers only through [`ExecutionLayer`]. It stores every
//! [`WorkUnit`] it creates, keeps the worker behind each target id, asks the
//! [`Router`] for a target when a step names none, and runs work with optional
//! fixed-delay retry or as a bounded-concurrency batch.

use super::retry::{retry_with_delay, RetryPolicy};
use super::router::{Router, TargetProfile};
use super::work::{WorkOutcome, WorkUnit, Worker, WorkerFactory};
use crate::config::ExecutionConfig;
use crate::error::{Result, StepflowError};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Prefix of targets created from agent-type factories
pub const AGENT_TARGET_PREFIX: &str = "agent:";

/// Dispatches delegated work to execution targets
pub struct ExecutionLayer {
    config: ExecutionConfig,
    router: Router,
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
    factories: RwLock<HashMap<String, Arc<dyn WorkerFactory>>>,
    work: DashMap<String, WorkUnit>,
}

impl Default for ExecutionLayer {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

impl std::fmt::Debug for ExecutionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLayer")
            .field("config", &self.config)
            .field("targets", &self.router.target_ids())
            .field("work_units", &self.work.len())
            .finish()
    }
}

/// Keeps the router's in-flight count accurate even if a worker panics
struct InFlight<'a> {
    router: &'a Router,
    target: &'a str,
}

impl<'a> InFlight<'a> {
    fn start(router: &'a Router, target: &'a str) -> Self {
        router.begin(target);
        Self { router, target }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.router.finish(self.target);
    }
}

impl ExecutionLayer {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            router: Router::new(config.routing_strategy),
            config,
            workers: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            work: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Register a worker as a routable target
    pub fn register_target(&self, profile: TargetProfile, worker: Arc<dyn Worker>) {
        info!(target_id = %profile.id, "Registering execution target");
        self.workers.write().insert(profile.id.clone(), worker);
        self.router.register(profile);
    }

    /// Register a worker under a plain target id
    pub fn register_worker(&self, id: impl Into<String>, worker: Arc<dyn Worker>) {
        self.register_target(TargetProfile::new(id), worker);
    }

    /// Register a factory for an agent type
    ///
    /// Registering the same type twice fails.
    pub fn register_agent_type(
        &self,
        agent_type: impl Into<String>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<()> {
        let agent_type = agent_type.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&agent_type) {
            return Err(StepflowError::DuplicateRegistration(format!(
                "agent type '{}'",
                agent_type
            )));
        }
        factories.insert(agent_type, factory);
        Ok(())
    }

    /// Target id for an agent type, creating its worker on first use
    ///
    /// Agent workers are addressable as `agent:<type>` but are not added to
    /// the router's pool.
    pub fn resolve_agent_type(&self, agent_type: &str) -> Result<String> {
        let target = format!("{}{}", AGENT_TARGET_PREFIX, agent_type);
        if self.workers.read().contains_key(&target) {
            return Ok(target);
        }

        let factory = self
            .factories
            .read()
            .get(agent_type)
            .cloned()
            .ok_or_else(|| StepflowError::TargetNotFound(target.clone()))?;

        let worker = factory.create(agent_type)?;
        debug!(agent_type = %agent_type, target = %target, "Created agent worker");
        self.workers.write().entry(target.clone()).or_insert(worker);
        Ok(target)
    }

    /// Whether a target id has a worker
    pub fn has_target(&self, target: &str) -> bool {
        self.workers.read().contains_key(target)
    }

    /// Create and store a work unit, returning its id
    pub fn create_work(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input: Value,
    ) -> String {
        self.submit(WorkUnit::new(name, description).with_input(input))
    }

    /// Store a prepared work unit, returning its id
    pub fn submit(&self, work: WorkUnit) -> String {
        let id = work.id.clone();
        debug!(work_id = %id, name = %work.name, "Work unit created");
        self.work.insert(id.clone(), work);
        id
    }

    /// Snapshot of a stored work unit
    pub fn get_work(&self, work_id: &str) -> Option<WorkUnit> {
        self.work.get(work_id).map(|entry| entry.value().clone())
    }

    /// Ask the router for a target for a stored work unit
    pub fn select_target(&self, work_id: &str) -> Result<String> {
        let work = self
            .get_work(work_id)
            .ok_or_else(|| StepflowError::WorkNotFound(work_id.to_string()))?;
        self.router.select(&work)
    }

    /// Run a work unit once on `target`
    ///
    /// Worker failures come back as a failed [`WorkOutcome`]; missing work
    /// units or targets are errors.
    pub async fn run(
        &self,
        work_id: &str,
        target: &str,
        workflow_id: Option<&str>,
    ) -> Result<WorkOutcome> {
        let worker = self
            .workers
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| StepflowError::TargetNotFound(target.to_string()))?;

        let snapshot = {
            let mut entry = self
                .work
                .get_mut(work_id)
                .ok_or_else(|| StepflowError::WorkNotFound(work_id.to_string()))?;
            entry.mark_running(target, workflow_id);
            entry.value().clone()
        };

        debug!(
            work_id = %work_id,
            target = %target,
            attempt = snapshot.attempts,
            "Running work unit"
        );

        let result = {
            let _in_flight = InFlight::start(&self.router, target);
            worker.perform(&snapshot).await
        };

        let outcome = match result {
            Ok(output) => WorkOutcome::completed(work_id, output),
            Err(e) => {
                warn!(work_id = %work_id, target = %target, error = %e, "Work unit failed");
                WorkOutcome::failed(work_id, e.to_string())
            }
        };

        if let Some(mut entry) = self.work.get_mut(work_id) {
            match (&outcome.output, &outcome.error) {
                (Some(output), _) => entry.mark_completed(output.clone()),
                (None, Some(error)) => entry.mark_failed(error.clone()),
                (None, None) => entry.mark_failed("worker returned no output"),
            }
        }

        Ok(outcome)
    }

    /// Run with fixed-delay retry: up to `max_retries + 1` attempts
    pub async fn run_with_retry(
        &self,
        work_id: &str,
        target: &str,
        workflow_id: Option<&str>,
        policy: &RetryPolicy,
    ) -> Result<WorkOutcome> {
        let result = retry_with_delay(policy, "run_work", move |_| async move {
            let outcome = self.run(work_id, target, workflow_id).await?;
            if outcome.is_completed() {
                Ok(outcome)
            } else {
                Err(StepflowError::Worker(
                    outcome.error.unwrap_or_else(|| "unknown error".to_string()),
                ))
            }
        })
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(StepflowError::Worker(error)) => Ok(WorkOutcome::failed(work_id, error)),
            Err(e) => Err(e),
        }
    }

    /// [`run_batch`](Self::run_batch) limited by the configured `max_concurrent`
    pub async fn run_batch_default(
        &self,
        items: Vec<(String, String)>,
        workflow_id: Option<&str>,
    ) -> Vec<WorkOutcome> {
        self.run_batch(items, self.config.max_concurrent, workflow_id)
            .await
    }

    /// Run many work units with at most `max_concurrent` in flight
    ///
    /// Results are returned in input order. A limit of 0 is treated as 1.
    pub async fn run_batch(
        &self,
        items: Vec<(String, String)>,
        max_concurrent: usize,
        workflow_id: Option<&str>,
    ) -> Vec<WorkOutcome> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        let runs = items.into_iter().map(move |(work_id, target)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => return WorkOutcome::failed(work_id, e.to_string()),
                };
                match self.run(&work_id, &target, workflow_id).await {
                    Ok(outcome) => outcome,
                    Err(e) => WorkOutcome::failed(work_id, e.to_string()),
                }
            }
        });

        join_all(runs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::work::{EchoWorker, WorkStatus};
    use crate::testing::{CountingWorker, FailingWorker, FlakyWorker, SlowWorker};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_records_outcome() {
        let layer = ExecutionLayer::default();
        layer.register_worker("echo", Arc::new(EchoWorker));

        let work_id = layer.create_work("greet", "hello there", json!({"k": 1}));
        let outcome = layer.run(&work_id, "echo", Some("wf-1")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.output, Some(json!("hello there")));

        let work = layer.get_work(&work_id).unwrap();
        assert_eq!(work.status, WorkStatus::Completed);
        assert_eq!(work.target.as_deref(), Some("echo"));
        assert_eq!(work.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(work.attempts, 1);
        assert_eq!(layer.router().in_flight("echo"), 0);
    }

    #[tokio::test]
    async fn test_run_failure_is_an_outcome() {
        let layer = ExecutionLayer::default();
        layer.register_worker("bad", Arc::new(FailingWorker::new("disk full")));

        let work_id = layer.create_work("w", "d", Value::Null);
        let outcome = layer.run(&work_id, "bad", None).await.unwrap();

        assert_eq!(outcome.status, WorkStatus::Failed);
        assert!(outcome.error.unwrap().contains("disk full"));
        assert_eq!(layer.get_work(&work_id).unwrap().status, WorkStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_unknown_work_or_target() {
        let layer = ExecutionLayer::default();
        layer.register_worker("echo", Arc::new(EchoWorker));
        let work_id = layer.create_work("w", "d", Value::Null);

        assert!(matches!(
            layer.run("missing", "echo", None).await,
            Err(StepflowError::WorkNotFound(_))
        ));
        assert!(matches!(
            layer.run(&work_id, "ghost", None).await,
            Err(StepflowError::TargetNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_flaky_worker() {
        let layer = ExecutionLayer::default();
        let flaky = Arc::new(FlakyWorker::new(2));
        layer.register_worker("flaky", flaky.clone());

        let work_id = layer.create_work("w", "eventually", Value::Null);
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        let outcome = layer
            .run_with_retry(&work_id, "flaky", None, &policy)
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert_eq!(flaky.attempts(), 3);
        assert_eq!(layer.get_work(&work_id).unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_exhausted() {
        let layer = ExecutionLayer::default();
        layer.register_worker("bad", Arc::new(FailingWorker::new("nope")));

        let work_id = layer.create_work("w", "d", Value::Null);
        let policy = RetryPolicy::new(1, Duration::from_millis(10));
        let outcome = layer
            .run_with_retry(&work_id, "bad", None, &policy)
            .await
            .unwrap();

        assert_eq!(outcome.status, WorkStatus::Failed);
        assert!(outcome.error.unwrap().contains("nope"));
        assert_eq!(layer.get_work(&work_id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_run_batch_preserves_order_and_limit() {
        let layer = ExecutionLayer::default();
        let slow = Arc::new(SlowWorker::new(Duration::from_millis(20)));
        layer.register_worker("slow", slow.clone());

        let items: Vec<_> = (0..6)
            .map(|i| {
                let id = layer.create_work(format!("w{}", i), format!("job {}", i), Value::Null);
                (id, "slow".to_string())
            })
            .collect();
        let ids: Vec<_> = items.iter().map(|(id, _)| id.clone()).collect();

        let outcomes = layer.run_batch(items, 2, None).await;

        assert_eq!(outcomes.len(), 6);
        for (outcome, id) in outcomes.iter().zip(&ids) {
            assert_eq!(&outcome.work_id, id);
            assert!(outcome.is_completed());
        }
        assert_eq!(outcomes[3].output, Some(json!("job 3")));
        assert!(slow.max_concurrent() <= 2);
    }

    #[tokio::test]
    async fn test_run_batch_zero_limit_runs_serially() {
        let layer = ExecutionLayer::default();
        let slow = Arc::new(SlowWorker::new(Duration::from_millis(5)));
        layer.register_worker("slow", slow.clone());

        let items: Vec<_> = (0..3)
            .map(|i| (layer.create_work("w", format!("{}", i), Value::Null), "slow".to_string()))
            .collect();
        let outcomes = layer.run_batch(items, 0, None).await;

        assert!(outcomes.iter().all(WorkOutcome::is_completed));
        assert_eq!(slow.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_run_batch_default_uses_configured_limit() {
        let layer = ExecutionLayer::new(ExecutionConfig {
            max_concurrent: 1,
            ..ExecutionConfig::default()
        });
        let slow = Arc::new(SlowWorker::new(Duration::from_millis(10)));
        layer.register_worker("slow", slow.clone());

        let items: Vec<_> = (0..4)
            .map(|i| (layer.create_work("w", format!("{}", i), Value::Null), "slow".to_string()))
            .collect();
        let outcomes = layer.run_batch_default(items, Some("wf-1")).await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(WorkOutcome::is_completed));
        assert_eq!(slow.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_select_target_uses_router() {
        let layer = ExecutionLayer::default();
        assert!(matches!(
            layer.select_target(&layer.create_work("w", "d", Value::Null)),
            Err(StepflowError::NoTargetAvailable(_))
        ));

        layer.register_worker("a", Arc::new(EchoWorker));
        let work_id = layer.create_work("w", "d", Value::Null);
        assert_eq!(layer.select_target(&work_id).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_agent_type_factory_is_lazy() {
        let layer = ExecutionLayer::default();
        let counter = Arc::new(CountingWorker::new());
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let factory_worker = counter.clone();
        let factory_created = created.clone();
        let factory = move |_agent_type: &str| -> Result<Arc<dyn Worker>> {
            factory_created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(factory_worker.clone() as Arc<dyn Worker>)
        };
        layer.register_agent_type("reviewer", Arc::new(factory)).unwrap();
        assert!(layer
            .register_agent_type("reviewer", Arc::new(|_: &str| -> Result<Arc<dyn Worker>> {
                Ok(Arc::new(EchoWorker))
            }))
            .is_err());

        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 0);
        let target = layer.resolve_agent_type("reviewer").unwrap();
        assert_eq!(target, "agent:reviewer");
        layer.resolve_agent_type("reviewer").unwrap();
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);

        let work_id = layer.create_work("w", "d", Value::Null);
        layer.run(&work_id, &target, None).await.unwrap();
        assert_eq!(counter.count(), 1);

        // agent workers are not in the routing pool
        assert!(layer.router().target_ids().is_empty());
        assert!(matches!(
            layer.resolve_agent_type("unknown"),
            Err(StepflowError::TargetNotFound(_))
        ));
    }
}
