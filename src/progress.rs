//! Progress reporting for orchestrated conversion tasks.
//!
//! Every state transition of a task produces one [`TaskEvent`]. Events reach
//! callers two ways:
//!
//! * registered [`TaskProgressCallback`]s, invoked synchronously by the
//!   orchestrator's single event aggregator (or by `submit`/`cancel` for the
//!   transitions those perform), and
//! * [`crate::orchestrator::TaskOrchestrator::subscribe`], a broadcast stream
//!   of the same events.
//!
//! A callback that panics is caught and logged; it never changes task state.
//!
//! # Example
//!
//! ```rust
//! use csv2docx::{ConversionTask, TaskProgressCallback};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountFailures(AtomicUsize);
//!
//! impl TaskProgressCallback for CountFailures {
//!     fn on_task_failed(&self, task: &ConversionTask, will_retry: bool) {
//!         if !will_retry {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!             eprintln!("{} failed: {:?}", task.id, task.error);
//!         }
//!     }
//! }
//! ```

use crate::generate::GenerationStats;
use crate::orchestrator::{ConversionTask, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receives task life-cycle notifications.
///
/// All methods default to no-ops. Each receives a snapshot of the task taken
/// right after the transition.
pub trait TaskProgressCallback: Send + Sync {
    /// The task was queued.
    fn on_task_submitted(&self, task: &ConversionTask) {
        let _ = task;
    }

    /// An attempt started; `task.retry_count` is the number of earlier
    /// failed attempts.
    fn on_task_started(&self, task: &ConversionTask) {
        let _ = task;
    }

    fn on_task_completed(&self, task: &ConversionTask) {
        let _ = task;
    }

    /// An attempt failed. With `will_retry` the task is back in the queue,
    /// otherwise the failure is final.
    fn on_task_failed(&self, task: &ConversionTask, will_retry: bool) {
        let _ = (task, will_retry);
    }

    fn on_task_cancelled(&self, task: &ConversionTask) {
        let _ = task;
    }
}

/// Callback that ignores every event.
pub struct NoopTaskProgress;

impl TaskProgressCallback for NoopTaskProgress {}

/// Shared callback handle.
pub type ProgressCallback = Arc<dyn TaskProgressCallback>;

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEventKind {
    Submitted,
    Started { attempt: u32 },
    Completed { stats: GenerationStats },
    Failed { error: String, will_retry: bool },
    Cancelled,
}

/// One task state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    /// Status after the transition.
    pub status: TaskStatus,
    /// Task progress after the transition.
    pub progress: f32,
    pub kind: TaskEventKind,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task: &ConversionTask, kind: TaskEventKind) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            kind,
            at: Utc::now(),
        }
    }
}

/// Deliver `event` to every callback, isolating panics.
pub(crate) fn dispatch(callbacks: &[ProgressCallback], task: &ConversionTask, event: &TaskEvent) {
    for cb in callbacks {
        let delivered = catch_unwind(AssertUnwindSafe(|| match &event.kind {
            TaskEventKind::Submitted => cb.on_task_submitted(task),
            TaskEventKind::Started { .. } => cb.on_task_started(task),
            TaskEventKind::Completed { .. } => cb.on_task_completed(task),
            TaskEventKind::Failed { will_retry, .. } => cb.on_task_failed(task, *will_retry),
            TaskEventKind::Cancelled => cb.on_task_cancelled(task),
        }));
        if delivered.is_err() {
            warn!(task_id = %task.id, "progress callback panicked; event dropped for it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task() -> ConversionTask {
        ConversionTask::new(PathBuf::from("in.csv"), PathBuf::from("out.docx"), "weekly")
    }

    #[derive(Default)]
    struct Tracking {
        submitted: AtomicUsize,
        failed_final: AtomicUsize,
        failed_retry: AtomicUsize,
    }

    impl TaskProgressCallback for Tracking {
        fn on_task_submitted(&self, _task: &ConversionTask) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_task_failed(&self, _task: &ConversionTask, will_retry: bool) {
            if will_retry {
                self.failed_retry.fetch_add(1, Ordering::SeqCst);
            } else {
                self.failed_final.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Panicking;

    impl TaskProgressCallback for Panicking {
        fn on_task_submitted(&self, _task: &ConversionTask) {
            panic!("callback bug");
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let t = task();
        let cb = NoopTaskProgress;
        cb.on_task_submitted(&t);
        cb.on_task_started(&t);
        cb.on_task_completed(&t);
        cb.on_task_failed(&t, true);
        cb.on_task_cancelled(&t);
    }

    #[test]
    fn dispatch_routes_by_kind() {
        let t = task();
        let tracker = Arc::new(Tracking::default());
        let callbacks: Vec<ProgressCallback> = vec![tracker.clone()];

        dispatch(&callbacks, &t, &TaskEvent::new(&t, TaskEventKind::Submitted));
        let failed = |will_retry| {
            TaskEvent::new(
                &t,
                TaskEventKind::Failed {
                    error: "boom".into(),
                    will_retry,
                },
            )
        };
        dispatch(&callbacks, &t, &failed(true));
        dispatch(&callbacks, &t, &failed(false));

        assert_eq!(tracker.submitted.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failed_retry.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failed_final.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let t = task();
        let tracker = Arc::new(Tracking::default());
        let callbacks: Vec<ProgressCallback> = vec![Arc::new(Panicking), tracker.clone()];
        dispatch(&callbacks, &t, &TaskEvent::new(&t, TaskEventKind::Submitted));
        assert_eq!(tracker.submitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let t = task();
        let event = TaskEvent::new(&t, TaskEventKind::Started { attempt: 2 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["kind"], "started");
        assert_eq!(json["kind"]["attempt"], 2);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0.0);
    }
}
