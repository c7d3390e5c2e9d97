use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{Error, Result};

pub type TaskId = Uuid;

/// One unit of work. Built once at submission and never mutated afterwards;
/// the execution unit consumes it by value.
#[derive(Debug)]
pub struct TaskEnvelope {
    /// Identifier
    id: TaskId,

    /// Registry key of the handler that runs this task
    kind: String,

    /// Handler input
    payload: Value,

    /// Instant when this task was submitted
    submitted_at: Instant,
}

impl TaskEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            submitted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub(crate) fn into_payload(self) -> Value {
        self.payload
    }
}

/// Outcome of a task, correlated to its envelope by `task_id`.
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: TaskId,

    pub outcome: Result<Value>,

    /// Wall-clock time from assignment to completion. Zero for tasks that
    /// never reached a unit.
    pub duration: Duration,

    /// Time spent waiting between submission and assignment
    pub queue_wait: Duration,
}

impl TaskReport {
    pub(crate) fn unassigned(task_id: TaskId, error: Error, queue_wait: Duration) -> Self {
        Self {
            task_id,
            outcome: Err(error),
            duration: Duration::ZERO,
            queue_wait,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<Value> {
        self.outcome
    }
}

/// Resolves to the [`TaskReport`] of a submitted task.
///
/// Dropping the handle does not cancel the task; use
/// [`Client::cancel`](crate::Client::cancel) with [`TaskHandle::id`].
#[pin_project]
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    #[pin]
    rx: oneshot::Receiver<TaskReport>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<TaskReport>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = TaskReport;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let id = *this.id;
        // The pool resolves every handle before dropping its sender, so a
        // closed channel means the coordinator itself went away.
        this.rx.poll(cx).map(move |report| {
            report.unwrap_or_else(|_| TaskReport::unassigned(id, Error::PoolShutdown, Duration::ZERO))
        })
    }
}
