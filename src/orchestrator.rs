//! Concurrent conversion tasks: queue, bounded execution, retry, progress.
//!
//! ## Life cycle
//!
//! ```text
//!             submit
//!               │
//!   cancel ◀── pending ◀──────────────┐
//!     │         │ claimed by a worker │ retryable failure,
//!     ▼         ▼                     │ retry_count < max_retries
//! cancelled   running ──▶ failed ─────┘
//!               │           │
//!               ▼           ▼ (final)
//!           completed     failed
//! ```
//!
//! [`TaskOrchestrator::run_all`] drains the queue in rounds. Each round runs
//! every pending task through `buffer_unordered(max_concurrent_tasks)`;
//! tasks re-queued by a failure are picked up by the next round. Workers
//! never touch callbacks: they report outcomes over a channel to a single
//! aggregator that applies the transition, notifies callbacks and
//! broadcasts the event.
//!
//! A worker claims its task (pending → running) under the table lock, so a
//! task is either cancelled or started, never both. Running tasks are not
//! preempted; a task exceeding `task_timeout_secs` counts as a failed
//! attempt.

use crate::config::{GenerationConfig, OrchestratorConfig};
use crate::error::Csv2DocxError;
use crate::generate::{convert_file, GenerationStats};
use crate::progress::{dispatch, ProgressCallback, TaskEvent, TaskEventKind};
use crate::template::TemplateRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the event broadcast buffer; slow subscribers lose the oldest.
const EVENT_BUFFER: usize = 256;

// ── Task model ───────────────────────────────────────────────────────────

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// No further transition will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        })
    }
}

/// Progress of an attempt that has been dispatched to a worker.
pub const PROGRESS_STARTED: f32 = 10.0;
/// Progress of a completed task.
pub const PROGRESS_DONE: f32 = 100.0;

/// One source → document conversion and its current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionTask {
    pub id: TaskId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub template: String,
    pub status: TaskStatus,
    /// Percentage, 0 to 100. Back to 0 whenever an attempt fails.
    pub progress: f32,
    /// Failed attempts that were re-queued.
    pub retry_count: u32,
    /// Message of the most recent failure.
    pub error: Option<String>,
    pub stats: Option<GenerationStats>,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ConversionTask {
    pub fn new(source: PathBuf, destination: PathBuf, template: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            source,
            destination,
            template: template.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            error: None,
            stats: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock time of the last attempt, once it has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Counts over every task the orchestrator knows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed as a percentage of completed + failed; 0 when none finished.
    pub success_rate: f64,
}

// ── Task execution seam ──────────────────────────────────────────────────

/// Executes one attempt of a task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ConversionTask) -> Result<GenerationStats, Csv2DocxError>;
}

/// Runs tasks with [`convert_file`] against a template registry.
#[derive(Debug, Clone)]
pub struct FileTaskRunner {
    registry: Arc<TemplateRegistry>,
    config: GenerationConfig,
}

impl FileTaskRunner {
    pub fn new(registry: Arc<TemplateRegistry>, config: GenerationConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl TaskRunner for FileTaskRunner {
    async fn run(&self, task: &ConversionTask) -> Result<GenerationStats, Csv2DocxError> {
        convert_file(
            &task.source,
            &task.destination,
            &task.template,
            &self.registry,
            &self.config,
        )
        .await
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, ConversionTask>,
    order: Vec<TaskId>,
}

/// Worker → aggregator messages.
enum WorkerReport {
    Started(ConversionTask),
    Finished { id: TaskId, outcome: Outcome },
}

enum Outcome {
    Completed(GenerationStats),
    Failed { message: String, retryable: bool },
}

/// Schedules [`ConversionTask`]s over a bounded pool.
pub struct TaskOrchestrator {
    runner: Arc<dyn TaskRunner>,
    config: OrchestratorConfig,
    table: Mutex<TaskTable>,
    callbacks: RwLock<Vec<ProgressCallback>>,
    events: broadcast::Sender<TaskEvent>,
}

impl fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("config", &self.config)
            .field("tasks", &self.table().order.len())
            .finish()
    }
}

impl TaskOrchestrator {
    /// Orchestrator converting files with `registry` templates.
    pub fn new(
        registry: Arc<TemplateRegistry>,
        generation: GenerationConfig,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_runner(Arc::new(FileTaskRunner::new(registry, generation)), config)
    }

    /// Orchestrator with a custom attempt executor.
    pub fn with_runner(runner: Arc<dyn TaskRunner>, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            runner,
            config,
            table: Mutex::new(TaskTable::default()),
            callbacks: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn callbacks(&self) -> Vec<ProgressCallback> {
        match self.callbacks.read() {
            Ok(cbs) => cbs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn add_progress_callback(&self, callback: ProgressCallback) {
        match self.callbacks.write() {
            Ok(mut cbs) => cbs.push(callback),
            Err(poisoned) => poisoned.into_inner().push(callback),
        }
    }

    /// Stream of every task event from now on.
    pub fn subscribe(&self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move { event.ok() })
    }

    fn notify(&self, task: &ConversionTask, kind: TaskEventKind) {
        let event = TaskEvent::new(task, kind);
        dispatch(&self.callbacks(), task, &event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Queue a conversion of `source` into `destination` with `template`.
    pub fn submit(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        template: impl Into<String>,
    ) -> TaskId {
        let task = ConversionTask::new(source.into(), destination.into(), template);
        let id = task.id;
        info!(
            task_id = %id,
            source = %task.source.display(),
            destination = %task.destination.display(),
            template = %task.template,
            "task submitted"
        );
        {
            let mut table = self.table();
            table.order.push(id);
            table.tasks.insert(id, task.clone());
        }
        self.notify(&task, TaskEventKind::Submitted);
        id
    }

    /// Snapshot of one task.
    pub fn query(&self, id: TaskId) -> Option<ConversionTask> {
        self.table().tasks.get(&id).cloned()
    }

    /// Every task in submission order.
    pub fn tasks(&self) -> Vec<ConversionTask> {
        let table = self.table();
        table
            .order
            .iter()
            .filter_map(|id| table.tasks.get(id).cloned())
            .collect()
    }

    /// Cancel a task that has not started. Returns whether it was cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let snapshot = {
            let mut table = self.table();
            match table.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Cancelled;
                    task.finished_at = Some(Utc::now());
                    task.clone()
                }
                _ => return false,
            }
        };
        info!(task_id = %id, "task cancelled");
        self.notify(&snapshot, TaskEventKind::Cancelled);
        true
    }

    /// Cancel every pending task. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let pending: Vec<TaskId> = self
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id)
            .collect();
        let cancelled = pending.into_iter().filter(|id| self.cancel(*id)).count();
        info!(cancelled, "orchestrator shut down");
        cancelled
    }

    pub fn summary(&self) -> BatchSummary {
        let table = self.table();
        let mut s = BatchSummary {
            total: table.tasks.len(),
            ..Default::default()
        };
        for task in table.tasks.values() {
            match task.status {
                TaskStatus::Pending => s.pending += 1,
                TaskStatus::Running => s.running += 1,
                TaskStatus::Completed => s.completed += 1,
                TaskStatus::Failed => s.failed += 1,
                TaskStatus::Cancelled => s.cancelled += 1,
            }
        }
        let finished = s.completed + s.failed;
        if finished > 0 {
            s.success_rate = s.completed as f64 / finished as f64 * 100.0;
        }
        s
    }

    fn pending_ids(&self) -> Vec<TaskId> {
        let table = self.table();
        table
            .order
            .iter()
            .copied()
            .filter(|id| {
                table
                    .tasks
                    .get(id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .collect()
    }

    /// Run until no task is pending and return every task's final state.
    pub async fn run_all(&self) -> HashMap<TaskId, ConversionTask> {
        let mut round = 0u32;
        loop {
            let batch = self.pending_ids();
            if batch.is_empty() {
                break;
            }
            round += 1;
            info!(
                round,
                tasks = batch.len(),
                concurrency = self.config.max_concurrent_tasks,
                "running task round"
            );

            let (tx, mut rx) = mpsc::unbounded_channel::<WorkerReport>();
            let concurrency = self.config.max_concurrent_tasks.max(1);
            let workers = async move {
                stream::iter(batch)
                    .map(|id| {
                        let tx = tx.clone();
                        async move { self.execute(id, tx).await }
                    })
                    .buffer_unordered(concurrency)
                    .collect::<Vec<()>>()
                    .await;
            };
            let aggregator = async {
                while let Some(report) = rx.recv().await {
                    self.apply(report);
                }
            };
            tokio::join!(workers, aggregator);
        }

        let summary = self.summary();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "all tasks finished"
        );
        self.table().tasks.clone()
    }

    /// One attempt of one task, on a worker.
    async fn execute(&self, id: TaskId, tx: mpsc::UnboundedSender<WorkerReport>) {
        let task = {
            let mut table = self.table();
            match table.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Running;
                    task.progress = PROGRESS_STARTED;
                    task.started_at = Some(Utc::now());
                    task.finished_at = None;
                    task.clone()
                }
                _ => {
                    debug!(task_id = %id, "task no longer pending, skipped");
                    return;
                }
            }
        };
        let _ = tx.send(WorkerReport::Started(task.clone()));

        if task.retry_count > 0 && self.config.retry_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        }

        let secs = self.config.task_timeout_secs;
        let attempt = AssertUnwindSafe(self.runner.run(&task)).catch_unwind();
        let outcome = match tokio::time::timeout(Duration::from_secs(secs), attempt).await {
            Ok(Ok(Ok(stats))) => Outcome::Completed(stats),
            Ok(Ok(Err(e))) => Outcome::Failed {
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
            Ok(Err(panic)) => Outcome::Failed {
                message: format!("task panicked: {}", panic_message(panic.as_ref())),
                retryable: true,
            },
            Err(_) => Outcome::Failed {
                message: Csv2DocxError::TaskTimeout { secs }.to_string(),
                retryable: true,
            },
        };
        let _ = tx.send(WorkerReport::Finished { id, outcome });
    }

    /// Apply a worker report; runs only on the aggregator.
    fn apply(&self, report: WorkerReport) {
        match report {
            WorkerReport::Started(task) => {
                info!(task_id = %task.id, attempt = task.retry_count + 1, "task started");
                let attempt = task.retry_count + 1;
                self.notify(&task, TaskEventKind::Started { attempt });
            }
            WorkerReport::Finished { id, outcome } => {
                let (snapshot, kind) = {
                    let mut table = self.table();
                    let Some(task) = table.tasks.get_mut(&id) else {
                        return;
                    };
                    task.finished_at = Some(Utc::now());
                    let kind = match outcome {
                        Outcome::Completed(stats) => {
                            task.status = TaskStatus::Completed;
                            task.progress = PROGRESS_DONE;
                            task.error = None;
                            task.stats = Some(stats.clone());
                            TaskEventKind::Completed { stats }
                        }
                        Outcome::Failed { message, retryable } => {
                            task.error = Some(message.clone());
                            task.progress = 0.0;
                            let will_retry =
                                retryable && task.retry_count < self.config.max_retries;
                            if will_retry {
                                task.retry_count += 1;
                                task.status = TaskStatus::Pending;
                            } else {
                                task.status = TaskStatus::Failed;
                            }
                            TaskEventKind::Failed {
                                error: message,
                                will_retry,
                            }
                        }
                    };
                    (task.clone(), kind)
                };

                match &kind {
                    TaskEventKind::Completed { .. } => {
                        info!(task_id = %id, "task completed")
                    }
                    TaskEventKind::Failed {
                        error,
                        will_retry: true,
                    } => warn!(
                        task_id = %id,
                        retry = snapshot.retry_count,
                        max_retries = self.config.max_retries,
                        %error,
                        "task failed, re-queued"
                    ),
                    TaskEventKind::Failed { error, .. } => {
                        error!(task_id = %id, %error, "task failed")
                    }
                    _ => {}
                }
                self.notify(&snapshot, kind);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
