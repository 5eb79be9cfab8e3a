//! The dependency scheduler: drains a task graph to completion under a
//! concurrency bound.
//!
//! Each loop iteration collects ready tasks into the priority queue,
//! dispatches while capacity allows, then waits for at least one running
//! task to finish. Dispatch runs on the worker under a timeout with an
//! explicit bounded retry loop; failures consult the recovery policy before
//! retrying.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointSnapshot, CheckpointStore, TaskBuckets};
use crate::config::{ErrorPolicy, PipelineConfig};
use crate::dag::graph::TaskGraph;
use crate::dag::queue::ReadyQueue;
use crate::dag::state::{ExecutionTimer, SchedulerReport, TaskEvent, TaskOutcome};
use crate::errors::SchedulerError;
use crate::recovery::classify;
use crate::task::{Task, TaskId, TaskStatus};
use crate::worker::Worker;

/// Delay before re-polling worker availability when queued work has no
/// available worker and nothing is running.
const WORKER_POLL_DELAY: Duration = Duration::from_millis(25);

/// Scheduler tuning, extracted from the pipeline configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running tasks.
    pub max_concurrent: usize,
    /// Per-dispatch timeout.
    pub task_timeout: Duration,
    /// Retry budget per task.
    pub max_retries: u32,
    /// Upper bound on scheduling loop iterations.
    pub max_iterations: usize,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Failure handling policy.
    pub error_policy: ErrorPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_pipeline(&PipelineConfig::default())
    }
}

impl SchedulerConfig {
    /// Extract scheduler settings from a pipeline configuration.
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_tasks,
            task_timeout: config.task_timeout,
            max_retries: config.max_retries,
            max_iterations: config.max_iterations,
            retry_base_delay: config.retry_base_delay,
            error_policy: config.error_policy,
        }
    }

    /// Set the concurrency bound.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the per-dispatch timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the iteration bound.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Set the backoff base delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Set the error handling policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// Identifies the pipeline run a periodic snapshot belongs to.
#[derive(Debug, Clone)]
struct SnapshotTag {
    pipeline_id: String,
    phase: String,
    interval: Duration,
}

enum DispatchOutcome {
    Success {
        output: serde_json::Value,
        retries: u32,
        attempts: u32,
    },
    Failure {
        error: anyhow::Error,
        retries: u32,
        attempts: u32,
    },
}

struct DispatchResult {
    task_id: TaskId,
    worker_id: String,
    duration: Duration,
    outcome: DispatchOutcome,
}

/// The dependency scheduler. Owns the task graph, the ready queue, and the
/// running set for one pipeline run; workers and the optional checkpoint
/// store are injected at construction.
pub struct TaskScheduler {
    graph: TaskGraph,
    queue: ReadyQueue,
    config: SchedulerConfig,
    workers: Vec<Arc<dyn Worker>>,
    /// Scheduler-tracked dispatches per worker id.
    in_flight: HashMap<String, usize>,
    running: HashSet<TaskId>,
    store: Option<Arc<CheckpointStore>>,
    snapshot_tag: Option<SnapshotTag>,
    last_snapshot: Option<Instant>,
    started_at: chrono::DateTime<chrono::Utc>,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<TaskEvent>>,
}

impl TaskScheduler {
    /// Create a scheduler over the given worker pool.
    pub fn new(workers: Vec<Arc<dyn Worker>>, config: SchedulerConfig) -> Self {
        Self {
            graph: TaskGraph::new(),
            queue: ReadyQueue::new(),
            config,
            workers,
            in_flight: HashMap::new(),
            running: HashSet::new(),
            store: None,
            snapshot_tag: None,
            last_snapshot: None,
            started_at: chrono::Utc::now(),
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Enable periodic snapshots into the given store, tagged with the
    /// pipeline id and phase label of the surrounding run.
    pub fn with_checkpoint_store(
        mut self,
        store: Arc<CheckpointStore>,
        interval: Duration,
        pipeline_id: &str,
        phase: &str,
    ) -> Self {
        self.store = Some(store);
        self.snapshot_tag = Some(SnapshotTag {
            pipeline_id: pipeline_id.to_string(),
            phase: phase.to_string(),
            interval,
        });
        self
    }

    /// Observe a pipeline-level cancellation token before each dispatch.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<TaskEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register a task and its declared dependencies.
    pub fn admit(&mut self, task: Task) -> Result<(), SchedulerError> {
        self.graph.admit(task)
    }

    /// Get an admitted task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.graph.get(id)
    }

    /// Number of admitted tasks.
    pub fn task_count(&self) -> usize {
        self.graph.total_admitted()
    }

    /// Drain the graph to completion or deadlock.
    pub async fn run(&mut self) -> Result<SchedulerReport, SchedulerError> {
        let timer = ExecutionTimer::start();
        self.started_at = chrono::Utc::now();
        let mut report = SchedulerReport::new(self.graph.total_admitted());
        let (done_tx, mut done_rx) = mpsc::channel::<DispatchResult>(64);
        let mut iterations = 0usize;

        while !self.graph.all_terminal() {
            iterations += 1;
            if iterations > self.config.max_iterations {
                return Err(SchedulerError::IterationLimitExceeded {
                    limit: self.config.max_iterations,
                });
            }
            if self.cancel.is_cancelled() {
                self.abandon_remaining(&mut report);
                break;
            }

            // (1) Collect ready tasks into the priority queue.
            for id in self.graph.ready_tasks() {
                let priority = self.graph.get(&id).map(|t| t.priority).unwrap_or_default();
                if let Some(task) = self.graph.get_mut(&id) {
                    task.mark_queued();
                }
                self.queue.push(id, priority);
            }

            // (2)(3) Dispatch while the concurrency budget allows. A head
            // task with no available worker is deferred one tier lower
            // rather than blocking the queue.
            let mut deferred = Vec::new();
            while self.running.len() < self.config.max_concurrent && !self.queue.is_empty() {
                if self.cancel.is_cancelled() {
                    break;
                }
                let Some((task_id, priority)) = self.queue.pop() else {
                    break;
                };
                let Some(task) = self.graph.get(&task_id) else {
                    continue;
                };
                match self.select_worker(task) {
                    Some(worker) => self.dispatch(&task_id, worker, &done_tx).await,
                    None => deferred.push((task_id, priority)),
                }
            }
            for (task_id, priority) in deferred {
                self.queue.push_demoted(task_id, priority);
            }

            if self.running.is_empty() {
                // (4) Nothing running. Either nothing can ever become ready
                // (deadlock) or every worker for the queued work is
                // unavailable right now.
                if self.queue.is_empty() {
                    if !self.graph.all_terminal() {
                        return Err(SchedulerError::Deadlock {
                            remaining: self.graph.unfinished(),
                        });
                    }
                } else {
                    tokio::time::sleep(WORKER_POLL_DELAY).await;
                }
                continue;
            }

            // (5) Wait for at least one running task, then drain whatever
            // else already finished.
            if let Some(result) = done_rx.recv().await {
                self.apply_completion(result, &mut report).await?;
                while let Ok(result) = done_rx.try_recv() {
                    self.apply_completion(result, &mut report).await?;
                }
            }
            self.maybe_snapshot().await;
        }

        report.duration = timer.elapsed();
        Ok(report)
    }

    /// Select a worker for the task: the pre-assigned one if available and
    /// capable, otherwise the first capable worker under its load cap.
    fn select_worker(&self, task: &Task) -> Option<Arc<dyn Worker>> {
        let available = |worker: &Arc<dyn Worker>| {
            let tracked = self.in_flight.get(worker.id()).copied().unwrap_or(0);
            let load = tracked.max(worker.current_load());
            worker.status().is_available() && load < worker.max_load()
        };

        if let Some(preferred) = &task.assigned_worker
            && let Some(worker) = self.workers.iter().find(|w| w.id() == preferred)
            && available(worker)
            && worker.can_handle(task)
        {
            return Some(worker.clone());
        }

        self.workers
            .iter()
            .find(|w| w.can_handle(task) && available(w))
            .cloned()
    }

    async fn dispatch(
        &mut self,
        task_id: &str,
        worker: Arc<dyn Worker>,
        done_tx: &mpsc::Sender<DispatchResult>,
    ) {
        if let Some(task) = self.graph.get_mut(task_id) {
            task.mark_running();
        }
        self.running.insert(task_id.to_string());
        *self.in_flight.entry(worker.id().to_string()).or_insert(0) += 1;

        let task = self
            .graph
            .get(task_id)
            .cloned()
            .expect("dispatched task exists");
        debug!(task = %task.id, worker = %worker.id(), "dispatching task");
        self.emit(TaskEvent::Started {
            task: task.id.clone(),
            worker: worker.id().to_string(),
        })
        .await;

        let done_tx = done_tx.clone();
        let worker_id = worker.id().to_string();
        let timeout = self.config.task_timeout;
        let max_retries = self.config.max_retries;
        let base_delay = self.config.retry_base_delay;
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome =
                execute_with_retry(worker, &task, timeout, max_retries, base_delay, event_tx)
                    .await;
            done_tx
                .send(DispatchResult {
                    task_id: task.id,
                    worker_id,
                    duration: started.elapsed(),
                    outcome,
                })
                .await
                .ok();
        });
    }

    async fn apply_completion(
        &mut self,
        result: DispatchResult,
        report: &mut SchedulerReport,
    ) -> Result<(), SchedulerError> {
        // Completion is observed exactly once per dispatch.
        if !self.running.remove(&result.task_id) {
            return Ok(());
        }
        if let Some(load) = self.in_flight.get_mut(&result.worker_id) {
            *load = load.saturating_sub(1);
        }

        match result.outcome {
            DispatchOutcome::Success {
                output,
                retries,
                attempts,
            } => {
                if let Some(task) = self.graph.get_mut(&result.task_id) {
                    task.mark_completed(output.clone(), retries);
                }
                debug!(task = %result.task_id, attempts, "task completed");
                report.add_outcome(TaskOutcome::success(
                    &result.task_id,
                    attempts,
                    output,
                    result.duration,
                ));
                self.emit(TaskEvent::Completed {
                    task: result.task_id,
                    attempts,
                })
                .await;
                Ok(())
            }
            DispatchOutcome::Failure {
                error,
                retries,
                attempts,
            } => {
                if let Some(task) = self.graph.get_mut(&result.task_id) {
                    task.mark_failed(retries);
                }
                let message = format!("{error:#}");
                warn!(task = %result.task_id, attempts, error = %message, "task failed");
                report.add_outcome(TaskOutcome::failure(
                    &result.task_id,
                    attempts,
                    &message,
                    result.duration,
                ));
                self.emit(TaskEvent::Failed {
                    task: result.task_id.clone(),
                    error: message.clone(),
                })
                .await;

                let skipped = self.graph.skip_dependents(&result.task_id);
                for id in &skipped {
                    report.mark_skipped(id);
                }
                if !skipped.is_empty() {
                    self.emit(TaskEvent::Skipped {
                        tasks: skipped.clone(),
                    })
                    .await;
                }

                if self.config.error_policy == ErrorPolicy::ContinueOnError {
                    Ok(())
                } else {
                    Err(SchedulerError::TaskFailed {
                        task_id: result.task_id,
                        attempts,
                        message,
                        skipped,
                    })
                }
            }
        }
    }

    /// Mark every unfinished task cancelled after a pipeline-level cancel.
    fn abandon_remaining(&mut self, report: &mut SchedulerReport) {
        let cancelled = self.graph.cancel_remaining();
        debug!(count = cancelled.len(), "cancelling remaining tasks");
        for id in &cancelled {
            report.mark_cancelled(id);
        }
    }

    /// Write a periodic snapshot when the configured interval has elapsed.
    /// Failures are logged, never fatal to the run.
    async fn maybe_snapshot(&mut self) {
        let (Some(store), Some(tag)) = (self.store.clone(), self.snapshot_tag.clone()) else {
            return;
        };
        if self
            .last_snapshot
            .is_some_and(|last| last.elapsed() < tag.interval)
        {
            return;
        }

        let progress = self.graph.completion_percentage().round() as u8;
        let snapshot = CheckpointSnapshot::new(&tag.pipeline_id, &tag.phase, "running", progress)
            .with_tasks(self.task_buckets())
            .with_metrics(
                self.started_at,
                chrono::Utc::now()
                    .signed_duration_since(self.started_at)
                    .to_std()
                    .unwrap_or_default(),
            );

        match store.save(snapshot).await {
            Ok(checkpoint_id) => {
                self.last_snapshot = Some(Instant::now());
                debug!(checkpoint = %checkpoint_id, "periodic snapshot saved");
                self.emit(TaskEvent::SnapshotSaved { checkpoint_id }).await;
            }
            Err(error) => warn!(%error, "periodic snapshot failed"),
        }
    }

    /// Bucket task ids by coarse status for a snapshot.
    pub fn task_buckets(&self) -> TaskBuckets {
        let mut pending = self.graph.ids_with_status(TaskStatus::Pending);
        pending.extend(self.graph.ids_with_status(TaskStatus::Queued));
        let mut failed = self.graph.ids_with_status(TaskStatus::Failed);
        failed.extend(self.graph.ids_with_status(TaskStatus::Skipped));
        failed.extend(self.graph.ids_with_status(TaskStatus::Cancelled));

        TaskBuckets {
            completed: self.graph.ids_with_status(TaskStatus::Completed),
            in_progress: self.graph.ids_with_status(TaskStatus::Running),
            pending,
            failed,
        }
    }

    async fn emit(&self, event: TaskEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Execute a task on one worker with an explicit bounded retry loop.
///
/// Retries stay on the same worker; the recovery policy decides
/// retryability, and backoff doubles per attempt from the base delay.
async fn execute_with_retry(
    worker: Arc<dyn Worker>,
    task: &Task,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
    event_tx: Option<mpsc::Sender<TaskEvent>>,
) -> DispatchOutcome {
    let mut retries = 0u32;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match tokio::time::timeout(timeout, worker.execute(task)).await {
            Ok(Ok(output)) => {
                return DispatchOutcome::Success {
                    output,
                    retries,
                    attempts,
                };
            }
            Ok(Err(error)) => error,
            Err(_) => anyhow::Error::new(SchedulerError::TaskTimeout {
                task_id: task.id.clone(),
                timeout,
            }),
        };

        let classification = classify(&error);
        if classification.retryable && retries < max_retries {
            retries += 1;
            let delay = backoff_delay(base_delay, retries);
            warn!(
                task = %task.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task attempt failed; retrying"
            );
            if let Some(tx) = &event_tx {
                tx.send(TaskEvent::Retrying {
                    task: task.id.clone(),
                    attempt: retries,
                    delay_ms: delay.as_millis() as u64,
                })
                .await
                .ok();
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        return DispatchOutcome::Failure {
            error,
            retries,
            attempts,
        };
    }
}

/// Exponential backoff: base × 2^(retry-1), capped to avoid overflow.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 1u32 << (retry.saturating_sub(1)).min(10);
    base.saturating_mul(factor)
}
